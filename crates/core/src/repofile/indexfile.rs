use std::{cmp::Ordering, num::NonZeroU32};

use chrono::{DateTime, Local};
use serde_derive::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::block::{BlockId, VolumeId};

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
/// Index information about a volume
pub struct IndexVolume {
    /// volume Id
    pub id: VolumeId,
    /// Index information about contained blocks
    pub blocks: Vec<IndexBlock>,
    /// The volume creation time
    pub time: Option<DateTime<Local>>,
    /// The volume size
    pub size: Option<u32>,
}

impl IndexVolume {
    /// Add a new block to the volume
    ///
    /// # Arguments
    ///
    /// * `id` - The block id
    /// * `offset` - The block offset within the payload
    /// * `length` - The encoded block length
    /// * `uncompressed_length` - The raw block length if the block is compressed
    pub(crate) fn add(
        &mut self,
        id: BlockId,
        offset: u32,
        length: u32,
        uncompressed_length: Option<NonZeroU32>,
    ) {
        self.blocks.push(IndexBlock {
            id,
            offset,
            length,
            uncompressed_length,
        });
    }

    /// Sum of the encoded lengths of all blocks
    #[must_use]
    pub fn payload_size(&self) -> u64 {
        self.blocks.iter().map(|block| u64::from(block.length)).sum()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Copy)]
/// Index information about a block
pub struct IndexBlock {
    /// Block Id
    pub id: BlockId,
    /// Offset of the block within the payload of the volume
    pub offset: u32,
    /// Length of the block as stored within the volume
    pub length: u32,
    /// Raw length of the block. This is only set if the block is compressed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncompressed_length: Option<NonZeroU32>,
}

impl PartialOrd<Self> for IndexBlock {
    /// Compare two blocks by their offset
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexBlock {
    /// Compare two blocks by their offset
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset.cmp(&other.offset)
    }
}
