use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use serde_derive::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::{block::BlockId, id::Id};

/// The version number of a committed fileset. Versions start at 1 and are never reused.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
#[serde(transparent)]
pub struct FilesetVersion(pub u64);

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
/// Metadata of a backed up file
pub struct FileMetadata {
    /// Length of the file in bytes
    pub size: u64,
    /// Modification time
    pub mtime: Option<DateTime<Local>>,
    /// Unix permission bits
    pub mode: Option<u32>,
    /// SHA-256 of the whole file content
    pub digest: Option<Id>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// A file within a fileset
pub struct FileEntry {
    /// Path relative to the backup root, `/` separated
    pub path: PathBuf,
    /// The metadata of the file
    pub meta: FileMetadata,
    /// The blocks whose concatenation is the file content
    pub content: Vec<BlockId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// A file which could not be backed up
pub struct SkippedFile {
    /// Path relative to the backup root
    pub path: PathBuf,
    /// Why the file was skipped
    pub reason: String,
}

/// Statistics of the run that created a fileset
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
#[non_exhaustive]
pub struct FilesetSummary {
    /// Files recorded in the fileset
    pub files_processed: u64,
    /// Files which could not be read
    pub files_skipped: u64,
    /// Files taken over from the parent fileset without reading them
    pub files_unchanged: u64,
    /// Total size of all recorded files
    pub bytes_processed: u64,
    /// Blocks read
    pub blocks_processed: u64,
    /// Blocks which were not yet stored in the repository
    pub blocks_new: u64,
    /// Total raw bytes added by this run
    pub data_added: u64,
    /// Total bytes added to the repository by this run, after compression and encryption
    pub data_added_stored: u64,
    /// Number of volumes uploaded by this run
    pub volumes_written: u64,
    /// Start time of the run
    pub backup_start: DateTime<Local>,
    /// The time that the run has been finished
    pub backup_end: DateTime<Local>,
    /// Total duration of the run in seconds
    pub backup_duration: f64,
}

impl Default for FilesetSummary {
    fn default() -> Self {
        Self {
            files_processed: 0,
            files_skipped: 0,
            files_unchanged: 0,
            bytes_processed: 0,
            blocks_processed: 0,
            blocks_new: 0,
            data_added: 0,
            data_added_stored: 0,
            volumes_written: 0,
            backup_start: Local::now(),
            backup_end: Local::now(),
            backup_duration: 0.0,
        }
    }
}

impl FilesetSummary {
    /// Set the end time and the duration
    pub(crate) fn finalize(&mut self, end: DateTime<Local>) {
        self.backup_end = end;
        self.backup_duration = (end - self.backup_start)
            .to_std()
            .map_or(0.0, |duration| duration.as_secs_f64());
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// An immutable snapshot of one backup run
pub struct Fileset {
    /// The version of this fileset
    pub version: FilesetVersion,
    /// When the fileset was committed
    pub time: DateTime<Local>,
    /// The source paths given to the run
    pub paths: Vec<PathBuf>,
    /// All files, sorted by path
    pub files: Vec<FileEntry>,
    /// Files which could not be backed up
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedFile>,
    /// Statistics of the run
    pub summary: FilesetSummary,
}

impl Fileset {
    /// Find a file by its path
    #[must_use]
    pub fn file(&self, path: impl AsRef<Path>) -> Option<&FileEntry> {
        let path = path.as_ref();
        self.files
            .binary_search_by(|entry| entry.path.as_path().cmp(path))
            .ok()
            .map(|idx| &self.files[idx])
    }

    /// Every block referenced by this fileset, each once
    #[must_use]
    pub fn distinct_blocks(&self) -> BTreeSet<BlockId> {
        self.files
            .iter()
            .flat_map(|entry| entry.content.iter().copied())
            .collect()
    }

    /// Total size of all files
    #[must_use]
    pub fn size(&self) -> u64 {
        self.files.iter().map(|entry| entry.meta.size).sum()
    }
}
