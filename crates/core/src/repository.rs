use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, TryLockError},
};

use log::{debug, info};

use crate::{
    cancel::CancelToken,
    codec::BlockCodec,
    commands::{
        self,
        backup::{BackupOptions, BackupSummary},
        check::{CheckOptions, CheckReport},
        compact::{CompactOptions, CompactStats},
        config::ConfigOptions,
        forget::{ForgetPlan, KeepOptions},
        restore::{RestoreOptions, RestoreSummary},
    },
    crypto::CryptoKey,
    error::{CommandErrorKind, ConfigErrorKind, VaultErrorKind},
    index::{catalog::VolumeCatalog, dedup::DedupIndex, fileset::FilesetIndex},
    progress::{NoProgressBars, ProgressBars},
    repofile::{metafile, ConfigFile, Fileset, FilesetVersion},
    store::{IndexStore, RepositorySnapshot},
    transport::Transport,
    VaultResult,
};

/// A `Repository` allows all kind of actions to be performed.
///
/// It owns the in-memory indexes (dedup index, volume catalog and filesets)
/// and persists them to its [`IndexStore`] after every successful writing
/// operation. Reading operations like [`Repository::restore`] may run
/// concurrently with each other and with one writer.
///
/// # Type Parameters
///
/// * `C` - The key used to encrypt blocks
/// * `P` - The type of the progress bars
#[allow(missing_debug_implementations)]
pub struct Repository<C, P = NoProgressBars> {
    /// Where volumes are stored
    pub(crate) transport: Arc<dyn Transport>,

    /// Where the indexes are persisted
    pub(crate) store: Arc<dyn IndexStore>,

    /// Encodes and decodes blocks
    pub(crate) codec: BlockCodec<C>,

    /// The repository config
    pub(crate) config: ConfigFile,

    pub(crate) dedup: Arc<DedupIndex>,
    pub(crate) filesets: FilesetIndex,
    pub(crate) volumes: VolumeCatalog,

    /// The progress bars to use
    pub(crate) pb: P,

    /// Held by backup, forget, prune and compact
    writer: Mutex<()>,
}

impl<C: CryptoKey> Repository<C> {
    /// Initialize a new repository.
    ///
    /// The config is also stored as an object of the transport.
    ///
    /// # Arguments
    ///
    /// * `transport` - Where volumes are stored
    /// * `store` - Where the indexes are persisted, must be empty
    /// * `key` - The key to encrypt blocks with
    /// * `config_opts` - The options for the new config
    ///
    /// # Errors
    ///
    /// * [`ConfigErrorKind::RepositoryExists`] - If the store already holds a repository
    /// * If a config option is out of range
    /// * If the config could not be uploaded
    /// * If the store could not be read or written
    pub fn init(
        transport: Arc<dyn Transport>,
        store: Arc<dyn IndexStore>,
        key: C,
        config_opts: &ConfigOptions,
    ) -> VaultResult<Self> {
        if store.load()?.is_some() {
            return Err(ConfigErrorKind::RepositoryExists.into());
        }
        let config = config_opts.to_config(C::KIND)?;
        _ = metafile::save_file(&*transport, &BlockCodec::new(key, config.zstd()), &config)?;
        store.save(&RepositorySnapshot::new(config.clone()))?;
        info!(
            "initialized repository {} at {}",
            config.id,
            transport.location()
        );
        Ok(Self::from_snapshot(
            transport,
            store,
            key,
            RepositorySnapshot::new(config),
        ))
    }

    /// Open an existing repository.
    ///
    /// # Errors
    ///
    /// * [`ConfigErrorKind::NoRepositoryFound`] - If the store is empty
    /// * [`ConfigErrorKind::EncryptionMismatch`] - If `key` does not match the repository cipher
    /// * If the stored config is invalid
    /// * If the store could not be read
    pub fn open(
        transport: Arc<dyn Transport>,
        store: Arc<dyn IndexStore>,
        key: C,
    ) -> VaultResult<Self> {
        let snapshot = store.load()?.ok_or(ConfigErrorKind::NoRepositoryFound)?;
        snapshot.config.validate()?;
        if snapshot.config.encryption != C::KIND {
            return Err(ConfigErrorKind::EncryptionMismatch {
                expected: snapshot.config.encryption.to_string(),
                given: C::KIND.to_string(),
            }
            .into());
        }
        debug!(
            "opened repository {}: {} blocks, {} volumes, {} filesets",
            snapshot.config.id,
            snapshot.blocks.len(),
            snapshot.volumes.len(),
            snapshot.filesets.len()
        );
        Ok(Self::from_snapshot(transport, store, key, snapshot))
    }

    /// Rebuild the local state of a repository from the objects of its transport.
    ///
    /// Use this when the store was lost. Volumes, filesets and the config are read
    /// back; reference counts are derived from the filesets.
    ///
    /// # Errors
    ///
    /// * [`ConfigErrorKind::RepositoryExists`] - If the store is not empty
    /// * [`MetaErrorKind::NoConfigFound`](crate::error::MetaErrorKind::NoConfigFound) - If the transport holds no repository
    /// * [`ConfigErrorKind::EncryptionMismatch`] - If `key` does not match the repository cipher
    /// * If an object could not be fetched or decoded
    /// * If the store could not be written
    pub fn recreate(
        transport: Arc<dyn Transport>,
        store: Arc<dyn IndexStore>,
        key: C,
    ) -> VaultResult<Self> {
        if store.load()?.is_some() {
            return Err(ConfigErrorKind::RepositoryExists.into());
        }
        let snapshot = commands::recreate::recreate(&*transport, key)?;
        store.save(&snapshot)?;
        Ok(Self::from_snapshot(transport, store, key, snapshot))
    }

    fn from_snapshot(
        transport: Arc<dyn Transport>,
        store: Arc<dyn IndexStore>,
        key: C,
        snapshot: RepositorySnapshot,
    ) -> Self {
        let RepositorySnapshot {
            config,
            blocks,
            volumes,
            filesets,
            last_version,
            fileset_objects,
        } = snapshot;
        Self {
            transport,
            store,
            codec: BlockCodec::new(key, config.zstd()),
            config,
            dedup: Arc::new(DedupIndex::from_entries(blocks)),
            filesets: FilesetIndex::from_filesets(filesets, last_version)
                .with_objects(fileset_objects),
            volumes: VolumeCatalog::from_records(volumes),
            pb: NoProgressBars,
            writer: Mutex::new(()),
        }
    }
}

impl<C: CryptoKey, P> Repository<C, P> {
    /// Set the progress bar type to use for this repository
    pub fn with_progress_bars<Q: ProgressBars>(self, pb: Q) -> Repository<C, Q> {
        Repository {
            transport: self.transport,
            store: self.store,
            codec: self.codec,
            config: self.config,
            dedup: self.dedup,
            filesets: self.filesets,
            volumes: self.volumes,
            pb,
            writer: self.writer,
        }
    }

    /// The repository config
    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// The dedup index
    pub fn dedup_index(&self) -> &DedupIndex {
        &self.dedup
    }

    /// The volume catalog
    pub fn volume_catalog(&self) -> &VolumeCatalog {
        &self.volumes
    }

    /// All fileset versions, oldest first
    pub fn list_versions(&self) -> Vec<FilesetVersion> {
        self.filesets.list_versions()
    }

    /// Get a fileset
    ///
    /// # Errors
    ///
    /// * [`FilesetErrorKind::VersionNotFound`](crate::error::FilesetErrorKind::VersionNotFound) - If the version does not exist
    pub fn fileset(&self, version: FilesetVersion) -> VaultResult<Arc<Fileset>> {
        self.filesets.get(version)
    }

    /// The newest fileset, if any
    pub fn latest(&self) -> Option<Arc<Fileset>> {
        self.filesets.latest()
    }

    /// Claims the writer slot.
    ///
    /// # Errors
    ///
    /// * [`CommandErrorKind::WriterBusy`] - If another writer holds it
    pub(crate) fn writer_guard(&self) -> VaultResult<MutexGuard<'_, ()>> {
        match self.writer.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(CommandErrorKind::WriterBusy.into()),
        }
    }

    /// Saves the current state of all indexes to the store
    ///
    /// # Errors
    ///
    /// If the store could not be written
    pub(crate) fn persist(&self) -> VaultResult<()> {
        let (filesets, last_version) = self.filesets.snapshot();
        let snapshot = RepositorySnapshot {
            config: self.config.clone(),
            blocks: self.dedup.snapshot(),
            volumes: self.volumes.snapshot(),
            filesets,
            last_version,
            fileset_objects: self.filesets.objects(),
        };
        self.store.save(&snapshot)?;
        debug!(
            "persisted {} blocks, {} volumes, {} filesets",
            snapshot.blocks.len(),
            snapshot.volumes.len(),
            snapshot.filesets.len()
        );
        Ok(())
    }

    /// Prunes a fileset from the index and deletes its object from the transport
    ///
    /// # Errors
    ///
    /// * See [`FilesetIndex::prune`]
    /// * If the object could not be deleted; the fileset is kept then
    pub(crate) fn prune_fileset(&self, version: FilesetVersion) -> VaultResult<Arc<Fileset>> {
        self.filesets
            .prune_with(version, &self.dedup, |_, object| match object {
                Some(id) => {
                    self.transport
                        .delete(&id)
                        .map_err(VaultErrorKind::Transport)?;
                    debug!("deleted object {id} of fileset {version}");
                    Ok(())
                }
                None => Ok(()),
            })
    }
}

impl<C: CryptoKey, P: ProgressBars> Repository<C, P> {
    /// Backup `sources` into a new fileset.
    ///
    /// # Arguments
    ///
    /// * `opts` - The options to use
    /// * `sources` - Files and directories to backup; directories are descended
    ///
    /// # Errors
    ///
    /// * [`CommandErrorKind::WriterBusy`] - If another writer is active
    /// * [`CommandErrorKind::NoSources`] - If `sources` is empty
    /// * If a volume could not be uploaded. The run is rolled back then.
    /// * If the repository state could not be saved
    pub fn backup(&self, opts: &BackupOptions, sources: &[PathBuf]) -> VaultResult<BackupSummary> {
        self.backup_with_cancel(opts, sources, CancelToken::default())
    }

    /// Like [`Repository::backup`], but stops as soon as `cancel` fires.
    ///
    /// # Errors
    ///
    /// * [`CommandErrorKind::Cancelled`] - If the run was cancelled before its fileset was committed
    /// * See [`Repository::backup`]
    pub fn backup_with_cancel(
        &self,
        opts: &BackupOptions,
        sources: &[PathBuf],
        cancel: CancelToken,
    ) -> VaultResult<BackupSummary> {
        commands::backup::backup(self, opts, sources, cancel)
    }

    /// Restore the files of a fileset below `dest`.
    ///
    /// Files which fail are reported in the [`RestoreSummary`] unless
    /// [`RestoreOptions::all_or_nothing`] is set.
    ///
    /// # Errors
    ///
    /// * [`FilesetErrorKind::VersionNotFound`](crate::error::FilesetErrorKind::VersionNotFound) - If the version does not exist
    /// * In all-or-nothing mode, the first error of any file
    pub fn restore(
        &self,
        version: FilesetVersion,
        dest: impl AsRef<Path>,
        opts: &RestoreOptions,
    ) -> VaultResult<RestoreSummary> {
        self.restore_with_cancel(version, dest, opts, &CancelToken::default())
    }

    /// Like [`Repository::restore`], but stops as soon as `cancel` fires.
    ///
    /// Files which were not completely written when the restore stopped are removed.
    ///
    /// # Errors
    ///
    /// * [`CommandErrorKind::Cancelled`] - If `cancel` fired
    /// * See [`Repository::restore`]
    pub fn restore_with_cancel(
        &self,
        version: FilesetVersion,
        dest: impl AsRef<Path>,
        opts: &RestoreOptions,
        cancel: &CancelToken,
    ) -> VaultResult<RestoreSummary> {
        commands::restore::restore(self, version, dest.as_ref(), opts, cancel)
    }

    /// Remove one fileset and release its block references.
    ///
    /// # Errors
    ///
    /// * [`CommandErrorKind::WriterBusy`] - If another writer is active
    /// * [`FilesetErrorKind::VersionNotFound`](crate::error::FilesetErrorKind::VersionNotFound) - If the version does not exist
    /// * [`IndexErrorKind::ReferenceCountUnderflow`](crate::error::IndexErrorKind::ReferenceCountUnderflow) - If the index is corrupted
    /// * If the fileset object could not be deleted from the transport
    pub fn prune(&self, version: FilesetVersion) -> VaultResult<()> {
        let _guard = self.writer_guard()?;
        let fileset = self.prune_fileset(version)?;
        self.persist()?;
        info!("pruned fileset {version} with {} files", fileset.files.len());
        Ok(())
    }

    /// Prune all filesets not kept by `opts`.
    ///
    /// # Errors
    ///
    /// See [`Repository::prune`]
    pub fn forget(&self, opts: &KeepOptions) -> VaultResult<ForgetPlan> {
        commands::forget::forget(self, opts)
    }

    /// Delete unused volumes and repack sparse ones.
    ///
    /// # Errors
    ///
    /// * [`CommandErrorKind::WriterBusy`] - If another writer is active
    /// * If a volume to repack is corrupted or could not be fetched
    /// * If the transport or the store failed
    pub fn compact(&self, opts: CompactOptions) -> VaultResult<CompactStats> {
        commands::compact::compact(self, opts)
    }

    /// Check the repository for errors or inconsistencies
    ///
    /// # Errors
    ///
    /// * If the transport could not list its volumes
    /// * With `read_data`, if another writer is active or the state could not be saved
    pub fn check(&self, opts: CheckOptions) -> VaultResult<CheckReport> {
        commands::check::check_repository(self, opts)
    }
}
