use std::{
    fs::{File, Metadata},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Local};
use log::trace;

use crate::{
    archiver::source::SourceEntry,
    block::{repopacker::VolumePacker, BlockId, RunId},
    cancel::CancelToken,
    chunker::BlockHasher,
    crypto::hasher::StreamHasher,
    error::ErrorCategory,
    index::dedup::{DedupIndex, ReserveOutcome},
    progress::Progress,
    repofile::{FileEntry, FileMetadata, Fileset},
    VaultResult,
};

/// What became of one source file.
#[derive(Debug)]
pub(crate) enum FileOutcome {
    /// All blocks were hashed and the novel ones handed to the packer
    Stored {
        meta: FileMetadata,
        content: Vec<BlockId>,
    },
    /// The file could not be read; the run continues without it
    Skipped(String),
}

/// The `FileArchiver` is responsible for archiving files.
/// It will read the file, cut it into blocks and send novel blocks to the packer.
///
/// A file whose size and modification time equal those recorded in the parent
/// fileset is not read; its recorded content is taken over if all of its
/// blocks are still committed.
pub(crate) struct FileArchiver<'a> {
    hasher: BlockHasher,
    dedup: &'a DedupIndex,
    packer: &'a VolumePacker,
    parent: Option<&'a Fileset>,
    run: RunId,
    cancel: &'a CancelToken,
    blocks_processed: AtomicU64,
    blocks_new: AtomicU64,
    files_unchanged: AtomicU64,
}

impl<'a> FileArchiver<'a> {
    pub(crate) fn new(
        hasher: BlockHasher,
        dedup: &'a DedupIndex,
        packer: &'a VolumePacker,
        parent: Option<&'a Fileset>,
        run: RunId,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            hasher,
            dedup,
            packer,
            parent,
            run,
            cancel,
            blocks_processed: AtomicU64::new(0),
            blocks_new: AtomicU64::new(0),
            files_unchanged: AtomicU64::new(0),
        }
    }

    /// The parent entry of a file which did not change since the parent fileset
    fn unchanged(&self, entry: &SourceEntry, metadata: &Metadata) -> Option<&'a FileEntry> {
        let previous = self.parent?.file(&entry.name)?;
        let mtime = metadata.modified().ok().map(DateTime::<Local>::from);
        let same = previous.meta.size == metadata.len()
            && previous.meta.mtime.is_some()
            && previous.meta.mtime == mtime;
        // compaction may have dropped blocks of a pruned fileset in between
        (same && previous.content.iter().all(|id| self.dedup.refcount(id).is_some()))
            .then_some(previous)
    }

    /// Processes the given file.
    ///
    /// # Errors
    ///
    /// Only errors which must abort the run. Failures to read the file are
    /// returned as [`FileOutcome::Skipped`].
    pub(crate) fn process(&self, entry: &SourceEntry, p: &Progress) -> VaultResult<FileOutcome> {
        let file = match File::open(&entry.path) {
            Ok(file) => file,
            Err(err) => return Ok(FileOutcome::Skipped(err.to_string())),
        };
        let metadata = match file.metadata() {
            Ok(metadata) => metadata,
            Err(err) => return Ok(FileOutcome::Skipped(err.to_string())),
        };

        if let Some(previous) = self.unchanged(entry, &metadata) {
            self.cancel.check()?;
            _ = self.files_unchanged.fetch_add(1, Ordering::Relaxed);
            p.inc(previous.meta.size);
            trace!("{} is unchanged", entry.name.display());
            return Ok(FileOutcome::Stored {
                meta: FileMetadata {
                    mode: mode(&metadata),
                    ..previous.meta.clone()
                },
                content: previous.content.clone(),
            });
        }

        let size_hint = usize::try_from(metadata.len()).unwrap_or(usize::MAX);
        let mut digest = StreamHasher::default();
        let mut content = Vec::new();
        let mut size = 0;

        for block in self.hasher.blocks(file, size_hint) {
            self.cancel.check()?;
            let (id, data) = match block {
                Ok(block) => block,
                Err(err) if err.category() == ErrorCategory::Io => {
                    return Ok(FileOutcome::Skipped(err.to_string()))
                }
                Err(err) => return Err(err),
            };
            let len = data.len() as u64;
            digest.update(&data);

            if self.dedup.reserve(&id, self.run)? == ReserveOutcome::Reserved {
                _ = self.blocks_new.fetch_add(1, Ordering::Relaxed);
                self.packer.add(data, id)?;
            }
            _ = self.blocks_processed.fetch_add(1, Ordering::Relaxed);

            size += len;
            content.push(id);
            p.inc(len);
        }
        trace!("hashed {} in {} blocks", entry.name.display(), content.len());

        Ok(FileOutcome::Stored {
            meta: FileMetadata {
                size,
                mtime: metadata.modified().ok().map(DateTime::<Local>::from),
                mode: mode(&metadata),
                digest: Some(digest.finalize()),
            },
            content,
        })
    }

    /// The number of blocks read, the number of those which were novel and
    /// the number of files taken over from the parent
    pub(crate) fn stats(&self) -> (u64, u64, u64) {
        (
            self.blocks_processed.load(Ordering::Relaxed),
            self.blocks_new.load(Ordering::Relaxed),
            self.files_unchanged.load(Ordering::Relaxed),
        )
    }
}

#[cfg(unix)]
fn mode(metadata: &Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn mode(_metadata: &Metadata) -> Option<u32> {
    None
}
