//! Persistence of the repository state.
//!
//! The whole state (config, committed dedup entries, volume catalog and
//! filesets) is serialized as one JSON document. Stores replace it atomically.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use log::debug;
use serde_derive::{Deserialize, Serialize};

use crate::{
    block::VolumeId,
    error::StoreErrorKind,
    index::{catalog::VolumeRecord, dedup::DedupEntry},
    repofile::{ConfigFile, Fileset, FilesetVersion},
    VaultResult,
};

/// Everything needed to reopen a repository.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RepositorySnapshot {
    /// The repository config
    pub config: ConfigFile,
    /// The committed dedup index entries
    #[serde(default)]
    pub blocks: Vec<DedupEntry>,
    /// The volume catalog
    #[serde(default)]
    pub volumes: Vec<VolumeRecord>,
    /// The committed filesets
    #[serde(default)]
    pub filesets: Vec<Fileset>,
    /// The highest fileset version ever assigned
    #[serde(default)]
    pub last_version: u64,
    /// The transport objects holding the published filesets
    #[serde(default)]
    pub fileset_objects: BTreeMap<FilesetVersion, VolumeId>,
}

impl RepositorySnapshot {
    /// The snapshot of an empty repository
    #[must_use]
    pub const fn new(config: ConfigFile) -> Self {
        Self {
            config,
            blocks: Vec::new(),
            volumes: Vec::new(),
            filesets: Vec::new(),
            last_version: 0,
            fileset_objects: BTreeMap::new(),
        }
    }

    pub(crate) fn to_json(&self) -> VaultResult<Vec<u8>> {
        Ok(serde_json::to_vec(self).map_err(StoreErrorKind::SerializingFailed)?)
    }

    pub(crate) fn from_json(data: &[u8]) -> VaultResult<Self> {
        Ok(serde_json::from_slice(data).map_err(StoreErrorKind::DeserializingFailed)?)
    }
}

/// Durable storage of the [`RepositorySnapshot`].
pub trait IndexStore: Send + Sync + 'static {
    /// Loads the stored state, `None` if nothing was stored yet.
    ///
    /// # Errors
    ///
    /// If the state could not be read or parsed.
    fn load(&self) -> VaultResult<Option<RepositorySnapshot>>;

    /// Replaces the stored state. Either the old or the new state must survive a crash.
    ///
    /// # Errors
    ///
    /// If the state could not be written.
    fn save(&self, snapshot: &RepositorySnapshot) -> VaultResult<()>;
}

/// Keeps the state in memory, serialized like [`LocalStore`] does.
#[derive(Debug, Default)]
pub struct InMemoryStore(Mutex<Option<Vec<u8>>>);

impl InMemoryStore {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexStore for InMemoryStore {
    fn load(&self) -> VaultResult<Option<RepositorySnapshot>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .map(RepositorySnapshot::from_json)
            .transpose()
    }

    fn save(&self, snapshot: &RepositorySnapshot) -> VaultResult<()> {
        let data = snapshot.to_json()?;
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(data);
        Ok(())
    }
}

/// Stores the state as a JSON file.
#[derive(Debug, Clone)]
pub struct LocalStore {
    path: PathBuf,
}

impl LocalStore {
    /// Creates a store writing to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path of the state file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(ToOwned::to_owned)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl IndexStore for LocalStore {
    fn load(&self) -> VaultResult<Option<RepositorySnapshot>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreErrorKind::ReadingFailed {
                    path: self.path.clone(),
                    source,
                }
                .into())
            }
        };
        RepositorySnapshot::from_json(&data).map(Some)
    }

    fn save(&self, snapshot: &RepositorySnapshot) -> VaultResult<()> {
        let data = snapshot.to_json()?;
        let temp = self.temp_path();
        let writing_failed = |source| StoreErrorKind::WritingFailed {
            path: temp.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(writing_failed)?;
        }
        let mut file = File::create(&temp).map_err(writing_failed)?;
        file.write_all(&data).map_err(writing_failed)?;
        file.sync_all().map_err(writing_failed)?;
        drop(file);
        fs::rename(&temp, &self.path).map_err(|source| StoreErrorKind::WritingFailed {
            path: self.path.clone(),
            source,
        })?;

        debug!("saved repository state to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tempfile::tempdir;

    use crate::crypto::EncryptionKind;

    use super::*;

    fn snapshot() -> RepositorySnapshot {
        let mut snapshot = RepositorySnapshot::new(ConfigFile::new(EncryptionKind::None));
        snapshot.last_version = 3;
        snapshot
    }

    #[rstest]
    fn test_in_memory_store_passes() {
        let store = InMemoryStore::new();
        assert!(store.load().unwrap().is_none());

        store.save(&snapshot()).unwrap();

        assert_eq!(store.load().unwrap().unwrap(), snapshot());
    }

    #[rstest]
    fn test_local_store_replaces_state_passes() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("state").join("repository.json"));
        assert!(store.load().unwrap().is_none());

        store.save(&RepositorySnapshot::new(ConfigFile::new(EncryptionKind::None))).unwrap();
        store.save(&snapshot()).unwrap();

        assert_eq!(store.load().unwrap().unwrap(), snapshot());
        assert!(!store.temp_path().exists());
    }

    #[rstest]
    fn test_garbage_state_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repository.json");
        fs::write(&path, b"{ not json").unwrap();

        assert!(LocalStore::new(path).load().is_err());
    }
}
