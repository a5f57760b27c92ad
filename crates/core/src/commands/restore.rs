//! `restore` subcommand

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{Seek, SeekFrom, Write},
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};

use dashmap::DashMap;
use derive_setters::Setters;
use filetime::{set_file_mtime, FileTime};
use log::{debug, error, info, warn};
use rayon::{
    iter::{IntoParallelIterator, IntoParallelRefIterator, ParallelIterator},
    ThreadPoolBuilder,
};

use crate::{
    block::{BlockId, VolumeId, VolumeLocation},
    cancel::CancelToken,
    crypto::{
        hasher::{hash, hash_reader},
        CryptoKey,
    },
    error::{CommandErrorKind, RestoreErrorKind, VaultError},
    progress::{Progress, ProgressBars},
    repofile::{FileEntry, FilesetVersion, VolumeFile},
    repository::Repository,
    VaultResult,
};

#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[derive(Debug, Clone, Default, Setters)]
#[setters(into)]
#[non_exhaustive]
/// Options for the `restore` command
pub struct RestoreOptions {
    /// Only restore files at or below these paths of the fileset
    #[cfg_attr(feature = "clap", clap(long = "path", value_name = "PATH"))]
    pub paths: Vec<PathBuf>,

    /// Don't restore anything if a single file fails
    #[cfg_attr(feature = "clap", clap(long))]
    pub all_or_nothing: bool,

    /// Don't re-read restored files to compare their digest
    #[cfg_attr(feature = "clap", clap(long))]
    pub no_digest_check: bool,

    /// Number of threads fetching and decoding volumes (0 = one per core)
    #[cfg_attr(feature = "clap", clap(long, value_name = "N", default_value = "0"))]
    pub threads: usize,
}

/// A file which could not be restored
#[derive(Debug)]
pub struct FailedFile {
    /// The path within the fileset
    pub path: PathBuf,
    /// Why it failed
    pub error: VaultError,
}

/// The result of a restore
#[derive(Debug, Default)]
pub struct RestoreSummary {
    /// The restored fileset
    pub version: FilesetVersion,
    /// Paths of the restored files within the fileset
    pub restored: Vec<PathBuf>,
    /// Files which could not be restored; nothing was written for them
    pub failed: Vec<FailedFile>,
    /// Bytes written to the destination
    pub bytes_written: u64,
    /// Number of volumes downloaded
    pub volumes_fetched: u64,
}

impl RestoreSummary {
    /// Whether every selected file was restored
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One file being restored into a temporary sibling of its destination.
#[derive(Debug)]
struct Target<'a> {
    entry: &'a FileEntry,
    dest: PathBuf,
    temp: PathBuf,
    file: Mutex<Option<File>>,
    written: AtomicU64,
}

/// A block needed by some files, with its position within each of them.
#[derive(Debug)]
struct PlannedBlock {
    id: BlockId,
    location: VolumeLocation,
    targets: Vec<(usize, u64)>,
}

type Failures = DashMap<usize, VaultError>;

fn fail(failed: &Failures, idx: usize, err: impl Into<VaultError>) {
    _ = failed.entry(idx).or_insert_with(|| err.into());
}

/// The destination of a fileset path; only normal components are kept.
fn dest_path(dest: &Path, path: &Path) -> PathBuf {
    dest.join(
        path.components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect::<PathBuf>(),
    )
}

fn temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map_or_else(|| "file".into(), |name| name.to_string_lossy());
    dest.with_file_name(format!(".{name}.blockvault-restore"))
}

fn destination_io(path: &Path) -> impl FnOnce(std::io::Error) -> RestoreErrorKind + '_ {
    move |source| RestoreErrorKind::DestinationIo {
        path: path.to_path_buf(),
        source,
    }
}

/// Removes all temporary files if `cancel` fired.
fn stop_if_cancelled(targets: &[Target<'_>], cancel: &CancelToken) -> VaultResult<()> {
    if cancel.is_cancelled() {
        for target in targets {
            remove_temp(target);
        }
        warn!("restore cancelled, nothing was restored");
        return Err(CommandErrorKind::Cancelled.into());
    }
    Ok(())
}

/// Restore the selected files of a fileset into `dest`.
///
/// # Errors
///
/// * [`FilesetErrorKind::VersionNotFound`](crate::error::FilesetErrorKind::VersionNotFound) - If there is no such fileset
/// * [`CommandErrorKind::Cancelled`] - If `cancel` fired before the files were moved into place
/// * If `all_or_nothing` is set, the error of the first failed file
///
/// # Returns
///
/// The summary listing restored and failed files
#[allow(clippy::too_many_lines)]
pub(crate) fn restore<C: CryptoKey, P: ProgressBars>(
    repo: &Repository<C, P>,
    version: FilesetVersion,
    dest: &Path,
    opts: &RestoreOptions,
    cancel: &CancelToken,
) -> VaultResult<RestoreSummary> {
    cancel.check()?;
    let fileset = repo.filesets.get(version)?;
    let selected: Vec<&FileEntry> = fileset
        .files
        .iter()
        .filter(|entry| {
            opts.paths.is_empty() || opts.paths.iter().any(|sel| entry.path.starts_with(sel))
        })
        .collect();
    info!(
        "restoring {} files of fileset {version} to {}",
        selected.len(),
        dest.display()
    );

    let failed = Failures::new();
    let block_size = u64::from(repo.config.block_size);

    // prepare destination files and collect the needed blocks grouped by volume
    let mut plan: BTreeMap<VolumeId, BTreeMap<BlockId, PlannedBlock>> = BTreeMap::new();
    let targets: Vec<Target<'_>> = selected
        .iter()
        .copied()
        .enumerate()
        .map(|(idx, entry)| {
            let dest = dest_path(dest, &entry.path);
            let temp = temp_path(&dest);
            let file = dest
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|()| File::create(&temp))
                .map_err(destination_io(&dest));
            let file = match file {
                Ok(file) => Some(file),
                Err(err) => {
                    fail(&failed, idx, err);
                    None
                }
            };

            for (pos, id) in entry.content.iter().enumerate() {
                let Some(location) = repo.dedup.lookup(id) else {
                    fail(&failed, idx, RestoreErrorKind::BlockNotIndexed(*id));
                    continue;
                };
                plan.entry(location.volume)
                    .or_default()
                    .entry(*id)
                    .or_insert_with(|| PlannedBlock {
                        id: *id,
                        location,
                        targets: Vec::new(),
                    })
                    .targets
                    .push((idx, pos as u64 * block_size));
            }

            Target {
                entry,
                dest,
                temp,
                file: Mutex::new(file),
                written: AtomicU64::new(0),
            }
        })
        .collect();

    let p = repo.pb.progress_bytes("restoring file contents...");
    p.set_length(selected.iter().map(|entry| entry.meta.size).sum());
    let volumes_fetched = AtomicU64::new(0);

    let pool = ThreadPoolBuilder::new()
        .num_threads(opts.threads)
        .build()
        .map_err(CommandErrorKind::FromRayonError)?;
    pool.install(|| {
        plan.into_par_iter().for_each(|(volume, blocks)| {
            let blocks: Vec<_> = blocks.into_values().collect();
            let all_failed = |blocks: &[PlannedBlock]| {
                blocks
                    .iter()
                    .flat_map(|block| &block.targets)
                    .all(|(idx, _)| failed.contains_key(idx))
            };
            if cancel.is_cancelled() || all_failed(&blocks) {
                return;
            }

            let data = match repo.transport.download(&volume) {
                Ok(data) => data,
                Err(err) => {
                    error!("cannot fetch volume {volume}: {err}");
                    for (idx, _) in blocks.iter().flat_map(|block| &block.targets) {
                        fail(
                            &failed,
                            *idx,
                            RestoreErrorKind::VolumeUnavailable {
                                volume,
                                reason: err.to_string(),
                            },
                        );
                    }
                    return;
                }
            };
            _ = volumes_fetched.fetch_add(1, Ordering::Relaxed);

            let volume_file = match VolumeFile::from_bytes(data) {
                Ok(volume_file) => volume_file,
                Err(err) => {
                    error!("volume {volume} is damaged: {err}");
                    for (idx, _) in blocks.iter().flat_map(|block| &block.targets) {
                        fail(
                            &failed,
                            *idx,
                            RestoreErrorKind::VolumeDamaged {
                                volume,
                                reason: err.to_string(),
                            },
                        );
                    }
                    return;
                }
            };

            blocks.par_iter().for_each(|block| {
                if cancel.is_cancelled() {
                    return;
                }
                match read_block(repo, &volume_file, volume, block) {
                    Ok(data) => write_block(&targets, &failed, block, &data, &p),
                    Err(err) => {
                        error!("{err}");
                        for (idx, _) in &block.targets {
                            fail(&failed, *idx, read_block_error(&err, block, volume));
                        }
                    }
                }
            });
        });
    });
    p.finish();
    stop_if_cancelled(&targets, cancel)?;

    // check length and digest of every file which got all its blocks
    let verified: Vec<usize> = pool.install(|| {
        (0..targets.len())
            .into_par_iter()
            .filter(|idx| !failed.contains_key(idx))
            .filter_map(|idx| match verify(&targets[idx], opts) {
                Ok(()) => Some(idx),
                Err(err) => {
                    fail(&failed, idx, err);
                    None
                }
            })
            .collect()
    });
    stop_if_cancelled(&targets, cancel)?;

    if opts.all_or_nothing && !failed.is_empty() {
        for target in &targets {
            remove_temp(target);
        }
        let count = failed.len();
        let first = (0..targets.len())
            .find_map(|idx| failed.remove(&idx))
            .map(|(_, err)| err);
        warn!("{count} file(s) failed, nothing was restored");
        if let Some(err) = first {
            return Err(err);
        }
    }

    let mut summary = RestoreSummary {
        version,
        volumes_fetched: volumes_fetched.load(Ordering::Relaxed),
        ..Default::default()
    };
    for idx in verified {
        let target = &targets[idx];
        match finish(target) {
            Ok(()) => {
                summary.bytes_written += target.written.load(Ordering::Relaxed);
                summary.restored.push(target.entry.path.clone());
            }
            Err(err) => fail(&failed, idx, err),
        }
    }

    for (idx, target) in targets.iter().enumerate() {
        if let Some((_, error)) = failed.remove(&idx) {
            remove_temp(target);
            summary.failed.push(FailedFile {
                path: target.entry.path.clone(),
                error,
            });
        }
    }

    if summary.is_complete() {
        info!(
            "restored {} files, {} bytes",
            summary.restored.len(),
            summary.bytes_written
        );
    } else {
        warn!(
            "restored {} files, {} files failed",
            summary.restored.len(),
            summary.failed.len()
        );
    }
    Ok(summary)
}

/// Extract, decode and verify one block of a downloaded volume.
fn read_block<C: CryptoKey, P>(
    repo: &Repository<C, P>,
    volume_file: &VolumeFile,
    volume: VolumeId,
    block: &PlannedBlock,
) -> VaultResult<Vec<u8>> {
    let encoded = volume_file.block_data(&block.location.to_index_block(block.id))?;
    let data = repo
        .codec
        .decode(&encoded, block.location.uncompressed_length)?;
    let actual = BlockId::from(hash(&data));
    if actual != block.id {
        return Err(RestoreErrorKind::FingerprintMismatch {
            id: block.id,
            volume,
            actual,
        }
        .into());
    }
    Ok(data)
}

/// The per-file error for a block which could not be read.
fn read_block_error(err: &VaultError, block: &PlannedBlock, volume: VolumeId) -> RestoreErrorKind {
    match err.kind() {
        crate::error::VaultErrorKind::Restore(RestoreErrorKind::FingerprintMismatch {
            actual,
            ..
        }) => RestoreErrorKind::FingerprintMismatch {
            id: block.id,
            volume,
            actual: *actual,
        },
        _ => RestoreErrorKind::BlockUndecodable {
            id: block.id,
            reason: err.to_string(),
        },
    }
}

fn write_block(
    targets: &[Target<'_>],
    failed: &Failures,
    block: &PlannedBlock,
    data: &[u8],
    p: &Progress,
) {
    for (idx, offset) in &block.targets {
        if failed.contains_key(idx) {
            continue;
        }
        let target = &targets[*idx];
        let mut file = target.file.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(file) = file.as_mut() else {
            continue;
        };
        let res = file
            .seek(SeekFrom::Start(*offset))
            .and_then(|_| file.write_all(data));
        match res {
            Ok(()) => {
                _ = target
                    .written
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                p.inc(data.len() as u64);
            }
            Err(err) => fail(failed, *idx, destination_io(&target.temp)(err)),
        }
    }
}

fn verify(target: &Target<'_>, opts: &RestoreOptions) -> VaultResult<()> {
    let file = target
        .file
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(file) = file {
        file.sync_all().map_err(destination_io(&target.temp))?;
    }

    let expected = target.entry.meta.size;
    let actual = target.written.load(Ordering::Relaxed);
    if actual != expected {
        return Err(RestoreErrorKind::LengthMismatch {
            path: target.entry.path.clone(),
            expected,
            actual,
        }
        .into());
    }

    if let (false, Some(digest)) = (opts.no_digest_check, target.entry.meta.digest) {
        let file = File::open(&target.temp).map_err(destination_io(&target.temp))?;
        if hash_reader(file).map_err(destination_io(&target.temp))? != digest {
            return Err(RestoreErrorKind::FileDigestMismatch(target.entry.path.clone()).into());
        }
    }
    Ok(())
}

/// Move the verified file into place and apply its metadata.
fn finish(target: &Target<'_>) -> VaultResult<()> {
    fs::rename(&target.temp, &target.dest).map_err(destination_io(&target.dest))?;
    debug!("restored {}", target.dest.display());

    let meta = &target.entry.meta;
    if let Some(mtime) = meta.mtime {
        let mtime = FileTime::from_system_time(mtime.into());
        if let Err(err) = set_file_mtime(&target.dest, mtime) {
            warn!("restore {:?}: setting file times failed: {err}", target.dest);
        }
    }
    if let Some(mode) = meta.mode {
        if let Err(err) = set_mode(&target.dest, mode) {
            warn!("restore {:?}: chmod failed: {err}", target.dest);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

fn remove_temp(target: &Target<'_>) {
    drop(
        target
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(),
    );
    if target.temp.exists() {
        if let Err(err) = fs::remove_file(&target.temp) {
            warn!("cannot remove {:?}: {err}", target.temp);
        }
    }
}
