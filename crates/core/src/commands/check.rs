//! `check` subcommand
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use derive_setters::Setters;
use itertools::Itertools;
use log::{debug, error, info};
use rayon::{
    iter::{IntoParallelIterator, ParallelIterator},
    ThreadPoolBuilder,
};
use serde_derive::{Deserialize, Serialize};

use crate::{
    block::{BlockId, VolumeId},
    crypto::{hasher::hash, CryptoKey},
    error::{CommandErrorKind, VaultErrorKind},
    index::catalog::{VolumeRecord, VolumeState},
    progress::ProgressBars,
    repofile::{FilesetVersion, VolumeFile},
    repository::Repository,
    VaultResult,
};

#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[derive(Clone, Copy, Default, Debug, Deserialize, Serialize, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into)]
#[non_exhaustive]
/// Options for the `check` command
pub struct CheckOptions {
    /// Download every volume and verify all contained blocks
    #[cfg_attr(feature = "clap", clap(long))]
    pub read_data: bool,

    /// Number of threads reading volumes (0 = one per core)
    #[cfg_attr(feature = "clap", clap(long, value_name = "N", default_value = "0"))]
    pub threads: usize,
}

/// A problem found by [`check`](crate::Repository::check)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, displaydoc::Display)]
#[non_exhaustive]
pub enum CheckIssue {
    /// file {path:?} of fileset {version} references block {id} which is not committed
    MissingBlock {
        version: FilesetVersion,
        path: PathBuf,
        id: BlockId,
    },
    /// block {id} is stored in volume {volume} which is not in the catalog
    VolumeNotInCatalog { id: BlockId, volume: VolumeId },
    /// block {id} is not listed in the manifest of volume {volume}
    BlockNotInManifest { id: BlockId, volume: VolumeId },
    /// block {id} has {stored} references, but {actual} filesets use it
    RefcountMismatch { id: BlockId, stored: u64, actual: u64 },
    /// fileset {version} is published as object {object}, which is missing in the transport
    FilesetObjectMissing {
        version: FilesetVersion,
        object: VolumeId,
    },
    /// volume {0} is in the catalog but missing in the transport
    VolumeMissing(VolumeId),
    /// volume {volume} has size {actual}, the catalog says {expected}
    VolumeSizeMismatch {
        volume: VolumeId,
        expected: u64,
        actual: u64,
    },
    /// volume {volume} could not be downloaded: {reason}
    VolumeUnreadable { volume: VolumeId, reason: String },
    /// volume {volume} is damaged: {reason}
    VolumeDamaged { volume: VolumeId, reason: String },
    /// manifest of volume {0} does not match the catalog
    ManifestMismatch(VolumeId),
    /// block {id} in volume {volume} is corrupted: {reason}
    BlockCorrupted {
        volume: VolumeId,
        id: BlockId,
        reason: String,
    },
}

/// The result of a check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    /// All problems found, structural ones first
    pub issues: Vec<CheckIssue>,
    /// Number of filesets checked
    pub filesets_checked: usize,
    /// Number of committed blocks checked
    pub blocks_checked: usize,
    /// Number of volumes downloaded and verified
    pub volumes_read: usize,
}

impl CheckReport {
    /// Whether no problem was found
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }

    fn report(&mut self, issue: CheckIssue) {
        error!("{issue}");
        self.issues.push(issue);
    }
}

/// Runs the check
///
/// # Errors
///
/// * If the transport could not list its volumes
/// * If `read_data` is set and the repository state could not be saved
///
/// Problems of the repository itself are not errors but part of the [`CheckReport`].
pub(crate) fn check_repository<C: CryptoKey, P: ProgressBars>(
    repo: &Repository<C, P>,
    opts: CheckOptions,
) -> VaultResult<CheckReport> {
    let mut report = CheckReport::default();

    let p = repo.pb.progress_spinner("checking filesets and index...");
    check_index(repo, &mut report)?;
    p.finish();

    let records = repo.volumes.snapshot();
    let p = repo.pb.progress_spinner("listing volumes...");
    let present: BTreeMap<_, _> = repo
        .transport
        .list()
        .map_err(VaultErrorKind::Transport)?
        .into_iter()
        .collect();
    p.finish();
    for (version, object) in repo.filesets.objects() {
        if !present.contains_key(&object) {
            report.report(CheckIssue::FilesetObjectMissing { version, object });
        }
    }
    let mut readable = Vec::new();
    for record in records {
        let id = record.volume.id;
        match present.get(&id) {
            None => report.report(CheckIssue::VolumeMissing(id)),
            Some(&actual) => {
                if let Some(expected) = record.volume.size.map(u64::from) {
                    if expected != actual {
                        report.report(CheckIssue::VolumeSizeMismatch {
                            volume: id,
                            expected,
                            actual,
                        });
                    }
                }
                readable.push(record);
            }
        }
    }

    if opts.read_data {
        let _guard = repo.writer_guard()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(opts.threads)
            .build()
            .map_err(CommandErrorKind::FromRayonError)?;
        let p = repo.pb.progress_counter("reading volumes...");
        p.set_length(readable.len() as u64);
        let issues = Mutex::new(Vec::new());
        pool.install(|| {
            readable.into_par_iter().for_each(|record| {
                let found = check_volume(repo, &record);
                if found.is_empty() {
                    if let Err(err) = repo
                        .volumes
                        .set_state(&record.volume.id, VolumeState::Verified)
                    {
                        debug!("volume {} vanished during check: {err}", record.volume.id);
                    }
                }
                issues
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((record.volume.id, found));
                p.inc(1);
            });
        });
        p.finish();

        let issues = issues.into_inner().unwrap_or_else(PoisonError::into_inner);
        report.volumes_read = issues.len();
        for issue in issues
            .into_iter()
            .sorted_unstable_by_key(|(id, _)| *id)
            .flat_map(|(_, found)| found)
        {
            report.report(issue);
        }
        repo.persist()?;
    }

    if report.is_ok() {
        info!(
            "no errors found: {} filesets, {} blocks, {} volumes read",
            report.filesets_checked, report.blocks_checked, report.volumes_read
        );
    } else {
        info!("found {} problems", report.issues.len());
    }
    Ok(report)
}

/// Checks filesets, dedup index and catalog against each other
fn check_index<C: CryptoKey, P>(
    repo: &Repository<C, P>,
    report: &mut CheckReport,
) -> VaultResult<()> {
    let mut used: BTreeMap<BlockId, u64> = BTreeMap::new();
    for version in repo.filesets.list_versions() {
        let fileset = repo.filesets.get(version)?;
        let mut reported = BTreeSet::new();
        for file in &fileset.files {
            for id in &file.content {
                if repo.dedup.refcount(id).is_none() && reported.insert(*id) {
                    report.report(CheckIssue::MissingBlock {
                        version,
                        path: file.path.clone(),
                        id: *id,
                    });
                }
            }
        }
        for id in fileset.distinct_blocks() {
            *used.entry(id).or_default() += 1;
        }
        report.filesets_checked += 1;
    }

    let manifests: BTreeMap<VolumeId, BTreeSet<BlockId>> = repo
        .volumes
        .snapshot()
        .into_iter()
        .map(|record| {
            let ids = record.volume.blocks.iter().map(|block| block.id).collect();
            (record.volume.id, ids)
        })
        .collect();

    for entry in repo.dedup.snapshot() {
        let id = entry.id;
        let volume = entry.location.volume;
        match manifests.get(&volume) {
            None => report.report(CheckIssue::VolumeNotInCatalog { id, volume }),
            Some(ids) if !ids.contains(&id) => {
                report.report(CheckIssue::BlockNotInManifest { id, volume });
            }
            Some(_) => {}
        }
        let actual = used.get(&id).copied().unwrap_or_default();
        if entry.refcount != actual {
            report.report(CheckIssue::RefcountMismatch {
                id,
                stored: entry.refcount,
                actual,
            });
        }
        report.blocks_checked += 1;
    }
    Ok(())
}

/// Downloads one volume and verifies all of its blocks
fn check_volume<C: CryptoKey, P>(repo: &Repository<C, P>, record: &VolumeRecord) -> Vec<CheckIssue> {
    let volume = record.volume.id;
    let data = match repo.transport.download(&volume) {
        Ok(data) => data,
        Err(err) => {
            return vec![CheckIssue::VolumeUnreadable {
                volume,
                reason: err.to_string(),
            }]
        }
    };
    if VolumeId::from(hash(&data)) != volume {
        return vec![CheckIssue::VolumeDamaged {
            volume,
            reason: "content does not match the volume id".to_string(),
        }];
    }
    let file = match VolumeFile::from_bytes(data) {
        Ok(file) => file,
        Err(err) => {
            return vec![CheckIssue::VolumeDamaged {
                volume,
                reason: err.to_string(),
            }]
        }
    };

    let mut issues = Vec::new();
    if file.blocks() != record.volume.blocks.as_slice() {
        issues.push(CheckIssue::ManifestMismatch(volume));
    }
    for block in file.blocks() {
        let res = file
            .block_data(block)
            .and_then(|encoded| repo.codec.decode(&encoded, block.uncompressed_length));
        let reason = match res {
            Ok(raw) if BlockId::from(hash(&raw)) == block.id => continue,
            Ok(raw) => format!("content hashes to {}", hash(&raw)),
            Err(err) => err.to_string(),
        };
        issues.push(CheckIssue::BlockCorrupted {
            volume,
            id: block.id,
            reason,
        });
    }
    debug!("volume {volume}: {} blocks read", file.blocks().len());
    issues
}
