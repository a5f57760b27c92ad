pub(crate) mod packer;
pub(crate) mod repopacker;
pub(crate) mod volume_sizer;

use std::num::NonZeroU32;

use serde_derive::{Deserialize, Serialize};

use crate::{define_new_id_struct, repofile::IndexBlock};

define_new_id_struct!(BlockId, "block, i.e. the SHA-256 of its raw content");
define_new_id_struct!(VolumeId, "volume, i.e. the SHA-256 of the sealed container");
define_new_id_struct!(RunId, "backup run");

impl RunId {
    /// A fresh random run id
    #[must_use]
    pub fn random() -> Self {
        Self(crate::Id::random())
    }
}

/// Where a block is stored.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeLocation {
    /// The volume containing the block
    pub volume: VolumeId,
    /// Offset within the payload of the volume
    pub offset: u32,
    /// Length of the encoded block
    pub length: u32,
    /// Raw length of the block. This is only set if the block is compressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncompressed_length: Option<NonZeroU32>,
}

impl VolumeLocation {
    /// The location of a block listed in the manifest of `volume`
    #[must_use]
    pub const fn new(volume: VolumeId, block: &IndexBlock) -> Self {
        Self {
            volume,
            offset: block.offset,
            length: block.length,
            uncompressed_length: block.uncompressed_length,
        }
    }

    /// The manifest entry for `id` at this location
    #[must_use]
    pub const fn to_index_block(&self, id: BlockId) -> IndexBlock {
        IndexBlock {
            id,
            offset: self.offset,
            length: self.length,
            uncompressed_length: self.uncompressed_length,
        }
    }
}
