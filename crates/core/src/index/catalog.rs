use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use serde_derive::{Deserialize, Serialize};

use crate::{
    block::VolumeId,
    error::IndexErrorKind,
    repofile::indexfile::IndexVolume,
    VaultResult,
};

/// Lifecycle of a remote volume known to the repository.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    /// The transport confirmed the upload
    Uploaded,
    /// The volume was downloaded and every block checked
    Verified,
    /// The volume is about to be removed by a compaction
    Deleting,
}

/// A volume together with its state
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    /// The lifecycle state
    pub state: VolumeState,
    /// The manifest of the volume
    #[serde(flatten)]
    pub volume: IndexVolume,
}

/// Registry of all volumes belonging to committed filesets.
#[derive(Debug, Default)]
pub struct VolumeCatalog {
    volumes: RwLock<BTreeMap<VolumeId, VolumeRecord>>,
}

impl VolumeCatalog {
    /// Creates an empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the catalog from persisted records
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = VolumeRecord>) -> Self {
        let volumes = records
            .into_iter()
            .map(|record| (record.volume.id, record))
            .collect();
        Self {
            volumes: RwLock::new(volumes),
        }
    }

    /// All records, sorted by volume id
    #[must_use]
    pub fn snapshot(&self) -> Vec<VolumeRecord> {
        self.volumes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Registers an uploaded volume
    pub fn register(&self, volume: IndexVolume) {
        _ = self
            .volumes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                volume.id,
                VolumeRecord {
                    state: VolumeState::Uploaded,
                    volume,
                },
            );
    }

    /// Moves a volume to a new state
    ///
    /// # Errors
    ///
    /// * [`IndexErrorKind::UnknownVolume`] - If the volume is not registered
    pub fn set_state(&self, id: &VolumeId, state: VolumeState) -> VaultResult<()> {
        let mut volumes = self.volumes.write().unwrap_or_else(PoisonError::into_inner);
        let record = volumes
            .get_mut(id)
            .ok_or(IndexErrorKind::UnknownVolume(*id))?;
        record.state = state;
        Ok(())
    }

    /// The record of a volume
    #[must_use]
    pub fn get(&self, id: &VolumeId) -> Option<VolumeRecord> {
        self.volumes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Whether the volume is registered
    #[must_use]
    pub fn contains(&self, id: &VolumeId) -> bool {
        self.volumes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Forgets a volume and returns its record
    pub fn remove(&self, id: &VolumeId) -> Option<VolumeRecord> {
        self.volumes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Number of registered volumes
    #[must_use]
    pub fn len(&self) -> usize {
        self.volumes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no volume is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
