use std::collections::BTreeSet;

use dashmap::{mapref::entry::Entry, DashMap};
use log::trace;
use serde_derive::{Deserialize, Serialize};

use crate::{
    block::{BlockId, RunId, VolumeLocation},
    error::IndexErrorKind,
    VaultResult,
};

/// Result of [`DedupIndex::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The block is stored or on its way; it must not be packed again.
    AlreadyPresent,
    /// The caller now owns the block and must hand it to the packer.
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    /// Claimed by a run, not yet uploaded
    Reserved { run: RunId },
    /// Uploaded by a run which has not committed its fileset yet
    Sealed { run: RunId, location: VolumeLocation },
    /// Part of the durable index
    Committed {
        location: VolumeLocation,
        refcount: u64,
    },
}

/// A committed entry of the [`DedupIndex`] as it is persisted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupEntry {
    /// The fingerprint of the block
    pub id: BlockId,
    /// Where the block is stored
    #[serde(flatten)]
    pub location: VolumeLocation,
    /// Number of committed filesets referencing the block
    pub refcount: u64,
}

/// The `DedupIndex` maps fingerprints to their volume location and reference count.
///
/// Every operation is atomic per fingerprint; there is no global lock. Blocks of a
/// running backup go through `Reserved` and `Sealed` and only become `Committed`
/// together with the fileset of their run.
#[derive(Debug, Default)]
pub struct DedupIndex {
    entries: DashMap<BlockId, BlockState>,
}

impl DedupIndex {
    /// Creates an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the index from persisted entries
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = DedupEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| {
                (
                    entry.id,
                    BlockState::Committed {
                        location: entry.location,
                        refcount: entry.refcount,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// All committed entries, sorted by fingerprint
    #[must_use]
    pub fn snapshot(&self) -> Vec<DedupEntry> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter_map(|item| match *item.value() {
                BlockState::Committed { location, refcount } => Some(DedupEntry {
                    id: *item.key(),
                    location,
                    refcount,
                }),
                _ => None,
            })
            .collect();
        entries.sort_unstable_by_key(|entry| entry.id);
        entries
    }

    /// Number of known blocks, including those of a running backup
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index knows no block at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Where a block is stored, if it was uploaded.
    #[must_use]
    pub fn lookup(&self, id: &BlockId) -> Option<VolumeLocation> {
        match *self.entries.get(id)? {
            BlockState::Sealed { location, .. } | BlockState::Committed { location, .. } => {
                Some(location)
            }
            BlockState::Reserved { .. } => None,
        }
    }

    /// The reference count of a committed block
    #[must_use]
    pub fn refcount(&self, id: &BlockId) -> Option<u64> {
        match *self.entries.get(id)? {
            BlockState::Committed { refcount, .. } => Some(refcount),
            _ => None,
        }
    }

    /// Atomically claims a block for `run`.
    ///
    /// # Errors
    ///
    /// * [`IndexErrorKind::ReservedByOtherRun`] - If another run holds the block
    pub fn reserve(&self, id: &BlockId, run: RunId) -> VaultResult<ReserveOutcome> {
        match self.entries.entry(*id) {
            Entry::Vacant(entry) => {
                _ = entry.insert(BlockState::Reserved { run });
                Ok(ReserveOutcome::Reserved)
            }
            Entry::Occupied(entry) => match *entry.get() {
                BlockState::Committed { .. } => Ok(ReserveOutcome::AlreadyPresent),
                BlockState::Reserved { run: owner } | BlockState::Sealed { run: owner, .. }
                    if owner == run =>
                {
                    Ok(ReserveOutcome::AlreadyPresent)
                }
                BlockState::Reserved { run: owner } | BlockState::Sealed { run: owner, .. } => {
                    Err(IndexErrorKind::ReservedByOtherRun {
                        id: *id,
                        run: owner,
                    }
                    .into())
                }
            },
        }
    }

    /// Records the location of a reserved block once its volume is stored.
    ///
    /// The block becomes visible to [`DedupIndex::lookup`] but gains no reference
    /// until its run is finalized.
    ///
    /// # Errors
    ///
    /// * [`IndexErrorKind::NotReserved`] - If the block was never reserved
    /// * [`IndexErrorKind::AlreadyCommitted`] - If the block already has a location
    pub fn commit(&self, id: &BlockId, location: VolumeLocation) -> VaultResult<()> {
        let Some(mut entry) = self.entries.get_mut(id) else {
            return Err(IndexErrorKind::NotReserved(*id).into());
        };
        match *entry {
            BlockState::Reserved { run } => {
                *entry = BlockState::Sealed { run, location };
                Ok(())
            }
            BlockState::Sealed { .. } | BlockState::Committed { .. } => {
                Err(IndexErrorKind::AlreadyCommitted(*id).into())
            }
        }
    }

    /// Whether `id` may be referenced by a fileset of `run`
    #[must_use]
    pub fn resolves(&self, id: &BlockId, run: RunId) -> bool {
        self.entries.get(id).is_some_and(|state| match *state {
            BlockState::Committed { .. } => true,
            BlockState::Sealed { run: owner, .. } => owner == run,
            BlockState::Reserved { .. } => false,
        })
    }

    /// Makes all blocks uploaded by `run` durable and adds one reference to
    /// every block in `referenced`.
    ///
    /// The caller must have checked [`DedupIndex::resolves`] for every referenced block.
    pub(crate) fn finalize_run(&self, run: RunId, referenced: &BTreeSet<BlockId>) {
        for mut entry in self.entries.iter_mut() {
            if let BlockState::Sealed { run: owner, location } = *entry {
                if owner == run {
                    *entry = BlockState::Committed {
                        location,
                        refcount: 0,
                    };
                }
            }
        }
        for id in referenced {
            if let Some(mut entry) = self.entries.get_mut(id) {
                if let BlockState::Committed { refcount, .. } = &mut *entry {
                    *refcount += 1;
                }
            }
        }
        trace!("finalized run {run} with {} referenced blocks", referenced.len());
    }

    /// Drops every reservation and every not yet finalized block of `run`.
    ///
    /// Returns the number of dropped blocks.
    pub fn rollback(&self, run: RunId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, state| match *state {
            BlockState::Reserved { run: owner } | BlockState::Sealed { run: owner, .. } => {
                owner != run
            }
            BlockState::Committed { .. } => true,
        });
        before.saturating_sub(self.entries.len())
    }

    /// Adds a reference to a committed block and returns the new count.
    ///
    /// # Errors
    ///
    /// * [`IndexErrorKind::UnknownBlock`] - If the block is not committed
    pub fn add_reference(&self, id: &BlockId) -> VaultResult<u64> {
        match self.entries.get_mut(id).as_deref_mut() {
            Some(BlockState::Committed { refcount, .. }) => {
                *refcount += 1;
                Ok(*refcount)
            }
            _ => Err(IndexErrorKind::UnknownBlock(*id).into()),
        }
    }

    /// Removes a reference from a committed block and returns the new count.
    ///
    /// # Errors
    ///
    /// * [`IndexErrorKind::UnknownBlock`] - If the block is not committed
    /// * [`IndexErrorKind::ReferenceCountUnderflow`] - If the count is already 0
    pub fn release_reference(&self, id: &BlockId) -> VaultResult<u64> {
        match self.entries.get_mut(id).as_deref_mut() {
            Some(BlockState::Committed { refcount: 0, .. }) => {
                Err(IndexErrorKind::ReferenceCountUnderflow(*id).into())
            }
            Some(BlockState::Committed { refcount, .. }) => {
                *refcount -= 1;
                Ok(*refcount)
            }
            _ => Err(IndexErrorKind::UnknownBlock(*id).into()),
        }
    }

    /// All committed blocks without any reference
    #[must_use]
    pub fn unreferenced(&self) -> Vec<(BlockId, VolumeLocation)> {
        self.entries
            .iter()
            .filter_map(|item| match *item.value() {
                BlockState::Committed {
                    location,
                    refcount: 0,
                } => Some((*item.key(), location)),
                _ => None,
            })
            .collect()
    }

    /// Moves a committed block to a new location, keeping its count.
    ///
    /// # Errors
    ///
    /// * [`IndexErrorKind::UnknownBlock`] - If the block is not committed
    pub fn relocate(&self, id: &BlockId, new_location: VolumeLocation) -> VaultResult<()> {
        match self.entries.get_mut(id).as_deref_mut() {
            Some(BlockState::Committed { location, .. }) => {
                *location = new_location;
                Ok(())
            }
            _ => Err(IndexErrorKind::UnknownBlock(*id).into()),
        }
    }

    /// Removes a committed block without references.
    ///
    /// Returns `false` if the block is unknown or still referenced, which leaves it untouched.
    pub fn remove(&self, id: &BlockId) -> bool {
        self.entries
            .remove_if(id, |_, state| {
                matches!(state, BlockState::Committed { refcount: 0, .. })
            })
            .is_some()
    }
}
