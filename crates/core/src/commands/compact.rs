//! `compact` subcommand
use std::collections::{BTreeMap, BTreeSet};

use bytesize::ByteSize;
use derive_setters::Setters;
use log::{debug, info, warn};
use serde_derive::{Deserialize, Serialize};

use crate::{
    block::{
        packer::VolumeFormat,
        repopacker::{FileWriterHandle, Repacker, UploadMode, Uploads},
        volume_sizer::FixedVolumeSizer,
        BlockId, VolumeId,
    },
    cancel::CancelToken,
    crypto::{hasher::hash, CryptoKey},
    error::{RestoreErrorKind, VaultErrorKind},
    index::catalog::{VolumeRecord, VolumeState},
    progress::ProgressBars,
    repofile::VolumeFile,
    repository::Repository,
    VaultResult,
};

#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into)]
#[non_exhaustive]
/// Options for the `compact` command
pub struct CompactOptions {
    /// Repack volumes with more than this percentage of unused bytes
    #[cfg_attr(
        feature = "clap",
        clap(long, value_name = "PERCENT", default_value = "25")
    )]
    pub max_unused_percent: u8,

    /// Only compute what would be done
    #[cfg_attr(feature = "clap", clap(long, short = 'n'))]
    pub dry_run: bool,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self {
            max_unused_percent: 25,
            dry_run: false,
        }
    }
}

/// Statistics of a compaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactStats {
    /// Volumes without any used block which were deleted
    pub volumes_deleted: u64,
    /// Sparse volumes whose used blocks were copied and which were deleted then
    pub volumes_repacked: u64,
    /// New volumes written by repacking
    pub volumes_written: u64,
    /// Unused blocks dropped from the index
    pub blocks_removed: u64,
    /// Used blocks copied to new volumes
    pub blocks_repacked: u64,
    /// Size of all deleted volumes
    pub bytes_freed: u64,
    /// Size of all new volumes
    pub bytes_written: u64,
}

/// What happens to a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Keep,
    Delete,
    Repack,
}

/// A volume together with its used blocks
#[derive(Debug)]
struct VolumePlan {
    record: VolumeRecord,
    used: BTreeSet<BlockId>,
    decision: Decision,
}

impl VolumePlan {
    fn new<C: CryptoKey, P>(repo: &Repository<C, P>, record: VolumeRecord, opts: CompactOptions) -> Self {
        let id = record.volume.id;
        // a block is used here if the index points to this volume and a fileset needs it
        let used: BTreeSet<_> = record
            .volume
            .blocks
            .iter()
            .filter(|block| {
                repo.dedup
                    .lookup(&block.id)
                    .is_some_and(|location| location.volume == id)
                    && repo.dedup.refcount(&block.id).is_some_and(|count| count > 0)
            })
            .map(|block| block.id)
            .collect();

        let total = record.volume.payload_size();
        let unused: u64 = record
            .volume
            .blocks
            .iter()
            .filter(|block| !used.contains(&block.id))
            .map(|block| u64::from(block.length))
            .sum();

        let decision = if used.is_empty() {
            Decision::Delete
        } else if unused * 100 > u64::from(opts.max_unused_percent) * total {
            Decision::Repack
        } else {
            Decision::Keep
        };
        Self {
            record,
            used,
            decision,
        }
    }

    fn size(&self) -> u64 {
        self.record
            .volume
            .size
            .map_or_else(|| self.record.volume.payload_size(), u64::from)
    }
}

/// Reclaims space of unreferenced blocks.
///
/// Volumes without used blocks are deleted. Used blocks of sparse volumes are
/// copied into new volumes first. The index is persisted before any volume is
/// deleted, so a crash only leaves unreferenced volumes behind.
///
/// # Errors
///
/// * [`CommandErrorKind::WriterBusy`](crate::error::CommandErrorKind::WriterBusy) - If another writer is active
/// * If a volume could not be read or a block in it is corrupted
/// * If a new volume could not be uploaded
/// * If the repository state could not be saved
pub(crate) fn compact<C: CryptoKey, P: ProgressBars>(
    repo: &Repository<C, P>,
    opts: CompactOptions,
) -> VaultResult<CompactStats> {
    let _guard = repo.writer_guard()?;

    let plans: Vec<_> = repo
        .volumes
        .snapshot()
        .into_iter()
        .map(|record| VolumePlan::new(repo, record, opts))
        .filter(|plan| plan.decision != Decision::Keep)
        .collect();

    let mut stats = CompactStats::default();
    for plan in &plans {
        match plan.decision {
            Decision::Delete => stats.volumes_deleted += 1,
            Decision::Repack => {
                stats.volumes_repacked += 1;
                stats.blocks_repacked += plan.used.len() as u64;
            }
            Decision::Keep => {}
        }
        stats.bytes_freed += plan.size();
    }
    let affected: BTreeSet<VolumeId> = plans.iter().map(|plan| plan.record.volume.id).collect();
    let unused: Vec<BlockId> = repo
        .dedup
        .unreferenced()
        .into_iter()
        .filter(|(_, location)| affected.contains(&location.volume))
        .map(|(id, _)| id)
        .collect();
    stats.blocks_removed = unused.len() as u64;

    info!(
        "{} volumes to delete, {} to repack, {} freed",
        stats.volumes_deleted,
        stats.volumes_repacked,
        ByteSize(stats.bytes_freed)
    );
    if opts.dry_run || plans.is_empty() {
        return Ok(stats);
    }

    let uploads = Uploads::default();
    let repacked = repack(repo, &plans, &uploads);
    for volume in uploads.take() {
        stats.volumes_written += 1;
        stats.bytes_written += volume.size.map_or(0, u64::from);
        repo.volumes.register(volume);
    }
    if let Err(err) = repacked {
        // relocated blocks now live in the new volumes, which must not get lost
        repo.persist()?;
        return Err(err);
    }

    for id in &unused {
        if !repo.dedup.remove(id) {
            debug!("block {id} got referenced again, keeping it");
        }
    }
    for plan in &plans {
        repo.volumes
            .set_state(&plan.record.volume.id, VolumeState::Deleting)?;
    }
    repo.persist()?;

    let p = repo.pb.progress_counter("deleting volumes...");
    p.set_length(plans.len() as u64);
    for plan in &plans {
        let id = plan.record.volume.id;
        match repo.transport.delete(&id) {
            Ok(()) => {
                _ = repo.volumes.remove(&id);
            }
            Err(err) => warn!("could not delete volume {id}, will retry next time: {err}"),
        }
        p.inc(1);
    }
    p.finish();
    repo.persist()?;

    info!(
        "compaction done: {} volumes written, {} blocks removed",
        stats.volumes_written, stats.blocks_removed
    );
    Ok(stats)
}

/// Copies the used blocks of all volumes to repack into new volumes
fn repack<C: CryptoKey, P: ProgressBars>(
    repo: &Repository<C, P>,
    plans: &[VolumePlan],
    uploads: &Uploads,
) -> VaultResult<()> {
    let to_repack: Vec<_> = plans
        .iter()
        .filter(|plan| plan.decision == Decision::Repack)
        .collect();
    if to_repack.is_empty() {
        return Ok(());
    }

    let format = VolumeFormat {
        compression: repo.codec.compression(),
        encryption: C::KIND,
        block_size: repo.config.block_size,
    };
    let mut repacker = Repacker::new(
        format,
        FixedVolumeSizer::from_config(&repo.config),
        FileWriterHandle::new(
            repo.transport.clone(),
            repo.dedup.clone(),
            uploads.clone(),
            UploadMode::Relocate,
            CancelToken::default(),
        ),
    );

    let p = repo.pb.progress_counter("repacking volumes...");
    p.set_length(to_repack.len() as u64);
    let res = to_repack
        .iter()
        .try_for_each(|plan| -> VaultResult<()> {
            let volume = plan.record.volume.id;
            let file = VolumeFile::from_bytes(
                repo.transport
                    .download(&volume)
                    .map_err(VaultErrorKind::Transport)?,
            )?;
            let blocks: BTreeMap<_, _> = file
                .blocks()
                .iter()
                .filter(|block| plan.used.contains(&block.id))
                .map(|block| (block.id, *block))
                .collect();
            for block in blocks.values() {
                let encoded = file.block_data(block)?;
                let raw = repo.codec.decode(&encoded, block.uncompressed_length)?;
                let actual = BlockId::from(hash(&raw));
                if actual != block.id {
                    return Err(RestoreErrorKind::FingerprintMismatch {
                        id: block.id,
                        volume,
                        actual,
                    }
                    .into());
                }
                repacker.add_raw(&encoded, block)?;
            }
            debug!("repacked {} blocks of volume {volume}", blocks.len());
            p.inc(1);
            Ok(())
        });
    p.finish();

    match (res, repacker.finalize()) {
        (Err(err), _) | (Ok(()), Err(err)) => Err(err),
        (Ok(()), Ok(_)) => Ok(()),
    }
}
