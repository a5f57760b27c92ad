use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use chrono::{DateTime, Local};
use log::{debug, info};

use crate::{
    block::{BlockId, RunId, VolumeId},
    error::{FilesetErrorKind, IndexErrorKind},
    index::dedup::DedupIndex,
    repofile::filesetfile::{
        FileEntry, FileMetadata, Fileset, FilesetSummary, FilesetVersion, SkippedFile,
    },
    VaultResult,
};

/// The in-progress fileset of a backup run.
///
/// Obtained from [`FilesetIndex::begin_run`]. Files may be recorded from many
/// threads at once.
#[derive(Debug)]
pub struct RunHandle {
    id: RunId,
    started: DateTime<Local>,
    files: Mutex<BTreeMap<PathBuf, FileEntry>>,
    skipped: Mutex<BTreeMap<PathBuf, String>>,
}

impl RunHandle {
    /// The id of this run
    #[must_use]
    pub const fn id(&self) -> RunId {
        self.id
    }

    /// When the run started
    #[must_use]
    pub const fn started(&self) -> DateTime<Local> {
        self.started
    }

    /// Number of files recorded so far
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The files skipped so far
    #[must_use]
    pub fn skipped(&self) -> Vec<SkippedFile> {
        self.skipped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(path, reason)| SkippedFile {
                path: path.clone(),
                reason: reason.clone(),
            })
            .collect()
    }
}

/// The `FilesetIndex` holds all committed filesets and the single active run.
///
/// Filesets may be published as objects of the transport when they are
/// committed; the index remembers those objects so pruning can remove them.
#[derive(Debug, Default)]
pub struct FilesetIndex {
    versions: RwLock<BTreeMap<FilesetVersion, Arc<Fileset>>>,
    objects: RwLock<BTreeMap<FilesetVersion, VolumeId>>,
    active: Mutex<Option<RunId>>,
    last_version: AtomicU64,
}

impl FilesetIndex {
    /// Creates an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the index from persisted filesets.
    ///
    /// `last_version` is the highest version ever assigned, versions are never reused.
    #[must_use]
    pub fn from_filesets(filesets: impl IntoIterator<Item = Fileset>, last_version: u64) -> Self {
        let versions: BTreeMap<_, _> = filesets
            .into_iter()
            .map(|fileset| (fileset.version, Arc::new(fileset)))
            .collect();
        let last_version = versions
            .keys()
            .next_back()
            .map_or(last_version, |version| version.0.max(last_version));
        Self {
            versions: RwLock::new(versions),
            objects: RwLock::default(),
            active: Mutex::new(None),
            last_version: AtomicU64::new(last_version),
        }
    }

    /// Sets the transport objects the filesets were published as
    #[must_use]
    pub fn with_objects(self, objects: BTreeMap<FilesetVersion, VolumeId>) -> Self {
        *self.objects.write().unwrap_or_else(PoisonError::into_inner) = objects;
        self
    }

    /// The transport objects of all published filesets
    #[must_use]
    pub fn objects(&self) -> BTreeMap<FilesetVersion, VolumeId> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All filesets and the highest version ever assigned
    #[must_use]
    pub fn snapshot(&self) -> (Vec<Fileset>, u64) {
        let filesets = self
            .versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|fileset| Fileset::clone(fileset))
            .collect();
        (filesets, self.last_version.load(Ordering::SeqCst))
    }

    /// Starts a new run.
    ///
    /// # Errors
    ///
    /// * [`FilesetErrorKind::RunAlreadyActive`] - If another run has not finished
    pub fn begin_run(&self) -> VaultResult<RunHandle> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(run) = *active {
            return Err(FilesetErrorKind::RunAlreadyActive(run).into());
        }
        let id = RunId::random();
        *active = Some(id);
        debug!("started run {id}");
        Ok(RunHandle {
            id,
            started: Local::now(),
            files: Mutex::default(),
            skipped: Mutex::default(),
        })
    }

    fn check_active(&self, run: &RunHandle) -> VaultResult<()> {
        if *self.active.lock().unwrap_or_else(PoisonError::into_inner) != Some(run.id) {
            return Err(FilesetErrorKind::RunNotActive(run.id).into());
        }
        Ok(())
    }

    /// Records a file of the run. A later call for the same path replaces the entry.
    ///
    /// # Errors
    ///
    /// * [`FilesetErrorKind::RunNotActive`] - If the run was already committed or aborted
    pub fn record_file(
        &self,
        run: &RunHandle,
        path: impl Into<PathBuf>,
        meta: FileMetadata,
        content: Vec<BlockId>,
    ) -> VaultResult<()> {
        self.check_active(run)?;
        let path = path.into();
        _ = run
            .skipped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&path);
        _ = run
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.clone(), FileEntry { path, meta, content });
        Ok(())
    }

    /// Records a file which could not be backed up.
    ///
    /// # Errors
    ///
    /// * [`FilesetErrorKind::RunNotActive`] - If the run was already committed or aborted
    pub fn record_skipped(
        &self,
        run: &RunHandle,
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> VaultResult<()> {
        self.check_active(run)?;
        let path = path.into();
        _ = run
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&path);
        _ = run
            .skipped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, reason.into());
        Ok(())
    }

    /// Turns the run into a new fileset.
    ///
    /// Every block of every recorded file must be committed in `dedup` or uploaded by
    /// this run; otherwise nothing changes and the run stays active so it can be aborted.
    /// On success the blocks of the run become durable and each distinct block of the
    /// fileset gains one reference.
    ///
    /// # Errors
    ///
    /// * [`FilesetErrorKind::RunNotActive`] - If the run was already committed or aborted
    /// * [`FilesetErrorKind::UnresolvedBlock`] - If a block is not stored
    pub fn commit_run(
        &self,
        run: &RunHandle,
        dedup: &DedupIndex,
        paths: Vec<PathBuf>,
        summary: FilesetSummary,
    ) -> VaultResult<FilesetVersion> {
        self.commit_run_with(run, dedup, paths, summary, |_| Ok(None))
    }

    /// Like [`FilesetIndex::commit_run`], publishing the new fileset before it becomes visible.
    ///
    /// `publish` is called once all blocks are resolved. It may return the transport
    /// object holding the fileset. If it fails, nothing changes and the run stays active.
    ///
    /// # Errors
    ///
    /// * See [`FilesetIndex::commit_run`]
    /// * The error of `publish`
    pub fn commit_run_with(
        &self,
        run: &RunHandle,
        dedup: &DedupIndex,
        paths: Vec<PathBuf>,
        mut summary: FilesetSummary,
        publish: impl FnOnce(&Fileset) -> VaultResult<Option<VolumeId>>,
    ) -> VaultResult<FilesetVersion> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if *active != Some(run.id) {
            return Err(FilesetErrorKind::RunNotActive(run.id).into());
        }

        let files: Vec<FileEntry> = run
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for entry in &files {
            if let Some(id) = entry
                .content
                .iter()
                .find(|id| !dedup.resolves(id, run.id))
            {
                return Err(FilesetErrorKind::UnresolvedBlock {
                    path: entry.path.clone(),
                    id: *id,
                }
                .into());
            }
        }

        let skipped = run.skipped();
        summary.files_processed = files.len() as u64;
        summary.files_skipped = skipped.len() as u64;
        summary.bytes_processed = files.iter().map(|entry| entry.meta.size).sum();

        // the active run is the only one assigning versions
        let version = FilesetVersion(self.last_version.load(Ordering::SeqCst) + 1);
        let fileset = Fileset {
            version,
            time: Local::now(),
            paths,
            files,
            skipped,
            summary,
        };
        let object = publish(&fileset)?;

        self.last_version.store(version.0, Ordering::SeqCst);
        dedup.finalize_run(run.id, &fileset.distinct_blocks());
        _ = self
            .versions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(version, Arc::new(fileset));
        if let Some(id) = object {
            _ = self
                .objects
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(version, id);
        }
        *active = None;

        info!("committed run {} as fileset version {version}", run.id);
        Ok(version)
    }

    /// Ends the run without creating a fileset.
    ///
    /// # Errors
    ///
    /// * [`FilesetErrorKind::RunNotActive`] - If the run was already committed or aborted
    pub fn abort_run(&self, run: &RunHandle) -> VaultResult<()> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if *active != Some(run.id) {
            return Err(FilesetErrorKind::RunNotActive(run.id).into());
        }
        *active = None;
        debug!("aborted run {}", run.id);
        Ok(())
    }

    /// All committed versions, oldest first
    #[must_use]
    pub fn list_versions(&self) -> Vec<FilesetVersion> {
        self.versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// A committed fileset
    ///
    /// # Errors
    ///
    /// * [`FilesetErrorKind::VersionNotFound`] - If there is no such version
    pub fn get(&self, version: FilesetVersion) -> VaultResult<Arc<Fileset>> {
        self.versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&version)
            .cloned()
            .ok_or_else(|| FilesetErrorKind::VersionNotFound(version).into())
    }

    /// The newest committed fileset
    #[must_use]
    pub fn latest(&self) -> Option<Arc<Fileset>> {
        self.versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .next_back()
            .cloned()
    }

    /// Releases the references of a fileset and deletes it.
    ///
    /// All counts are checked before any is changed, so an error leaves the index untouched.
    ///
    /// # Errors
    ///
    /// * [`FilesetErrorKind::VersionNotFound`] - If there is no such version
    /// * [`IndexErrorKind::ReferenceCountUnderflow`] - If a block has no reference left
    pub fn prune(&self, version: FilesetVersion, dedup: &DedupIndex) -> VaultResult<Arc<Fileset>> {
        self.prune_with(version, dedup, |_, _| Ok(()))
    }

    /// Like [`FilesetIndex::prune`], calling `unpublish` with the fileset and its
    /// transport object once all counts are checked. If it fails, nothing changes.
    ///
    /// # Errors
    ///
    /// * See [`FilesetIndex::prune`]
    /// * The error of `unpublish`
    pub fn prune_with(
        &self,
        version: FilesetVersion,
        dedup: &DedupIndex,
        unpublish: impl FnOnce(&Fileset, Option<VolumeId>) -> VaultResult<()>,
    ) -> VaultResult<Arc<Fileset>> {
        let mut versions = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        let fileset = versions
            .get(&version)
            .cloned()
            .ok_or(FilesetErrorKind::VersionNotFound(version))?;

        let blocks = fileset.distinct_blocks();
        for id in &blocks {
            match dedup.refcount(id) {
                Some(0) => return Err(IndexErrorKind::ReferenceCountUnderflow(*id).into()),
                None => return Err(IndexErrorKind::UnknownBlock(*id).into()),
                Some(_) => {}
            }
        }
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        unpublish(&fileset, objects.get(&version).copied())?;

        for id in &blocks {
            _ = dedup.release_reference(id)?;
        }
        _ = versions.remove(&version);
        _ = objects.remove(&version);

        info!("pruned fileset version {version}");
        Ok(fileset)
    }
}
