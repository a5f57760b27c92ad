//! `backup` subcommand
use std::path::PathBuf;

use derive_setters::Setters;
use log::info;
use serde_derive::{Deserialize, Serialize};

use crate::{
    archiver::Archiver,
    cancel::CancelToken,
    crypto::CryptoKey,
    progress::ProgressBars,
    repofile::{Fileset, FilesetSummary, FilesetVersion, SkippedFile},
    repository::Repository,
    VaultResult,
};

/// The phases of a backup run. A run only moves forward; any error moves it to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum RunPhase {
    /// Walking the sources
    Scanning,
    /// Reading files, fingerprinting blocks and packing novel ones
    Hashing,
    /// Sealing the last volume and waiting for all uploads
    Sealing,
    /// Checking every block is stored and writing the fileset
    Committing,
    /// The fileset is committed
    Done,
    /// The run was rolled back
    Failed,
}

#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[derive(Clone, Copy, Default, Debug, Deserialize, Serialize, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into)]
#[non_exhaustive]
/// Options for the `backup` command.
pub struct BackupOptions {
    /// Number of threads reading and hashing files (0 = one per core)
    #[cfg_attr(feature = "clap", clap(long, value_name = "N", default_value = "0"))]
    pub threads: usize,

    /// Read every file, even if size and modification time match the latest fileset
    #[cfg_attr(feature = "clap", clap(long))]
    pub force: bool,
}

/// The result of a successful backup run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupSummary {
    /// The version of the new fileset
    pub version: FilesetVersion,
    /// The statistics of the run
    pub summary: FilesetSummary,
    /// Files which could not be backed up, with the reason
    pub skipped: Vec<SkippedFile>,
}

impl From<&Fileset> for BackupSummary {
    fn from(fileset: &Fileset) -> Self {
        Self {
            version: fileset.version,
            summary: fileset.summary.clone(),
            skipped: fileset.skipped.clone(),
        }
    }
}

/// Backup the given sources into a new fileset and persist the repository state.
///
/// # Errors
///
/// * [`CommandErrorKind::WriterBusy`](crate::error::CommandErrorKind::WriterBusy) - If another writer is active
/// * If the run failed; it is rolled back then
/// * If the repository state could not be saved
pub(crate) fn backup<C: CryptoKey, P: ProgressBars>(
    repo: &Repository<C, P>,
    opts: &BackupOptions,
    sources: &[PathBuf],
    cancel: CancelToken,
) -> VaultResult<BackupSummary> {
    let _guard = repo.writer_guard()?;
    info!(
        "starting to backup {} source(s) to {} ...",
        sources.len(),
        repo.transport.location()
    );

    let archiver = Archiver::new(
        &repo.transport,
        &repo.dedup,
        &repo.filesets,
        &repo.volumes,
        &repo.config,
        repo.codec,
        cancel,
        opts,
    );
    let p = repo.pb.progress_bytes("backing up...");
    let version = archiver.archive(sources, &p)?;
    repo.persist()?;

    let fileset = repo.filesets.get(version)?;
    let summary = BackupSummary::from(&*fileset);
    info!(
        "fileset {version}: {} files ({} unchanged), {} new blocks, {} volumes",
        summary.summary.files_processed,
        summary.summary.files_unchanged,
        summary.summary.blocks_new,
        summary.summary.volumes_written
    );
    Ok(summary)
}
