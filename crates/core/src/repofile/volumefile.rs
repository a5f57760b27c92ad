//! The binary layout of a volume.
//!
//! ```text
//! Header   : magic "BVVOL\0\0\x01" (8 bytes)
//!            format_version u16, compression u8, encryption u8,
//!            block_size u32, block_count u32
//! Manifest : block_count x { fingerprint [u8; 32], offset u32,
//!                            stored_length u32, uncompressed_length u32 }
//! Payload  : concatenated encoded blocks
//! Trailer  : SHA-256 of header, manifest and payload
//! ```
//!
//! All integers are little endian. Offsets are relative to the start of the
//! payload. An `uncompressed_length` of 0 means the block is stored uncompressed.

use std::{io::Cursor, num::NonZeroU32};

use binrw::{BinRead, BinWrite};
use bytes::Bytes;

use crate::{
    block::BlockId,
    crypto::hasher::hash,
    error::VolumeErrorKind,
    id::Id,
    repofile::indexfile::IndexBlock,
    VaultResult,
};

pub(crate) mod constants {
    /// The newest volume format this crate reads and the one it writes
    pub(crate) const FORMAT_VERSION: u16 = 1;
    /// Length of [`super::VolumeHeader`] including the magic
    pub(crate) const HEADER_LEN: usize = 8 + 2 + 1 + 1 + 4 + 4;
    /// Length of one [`super::ManifestEntry`]
    pub(crate) const ENTRY_LEN: usize = 32 + 4 + 4 + 4;
    /// Length of the trailing checksum
    pub(crate) const TRAILER_LEN: usize = 32;
    /// The maximum number of blocks in one volume
    pub(crate) const MAX_COUNT: u32 = 10_000;
}

/// The fixed-size header at the start of each volume.
#[derive(BinWrite, BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little, magic = b"BVVOL\0\0\x01")]
pub struct VolumeHeader {
    /// Format version, see [`constants::FORMAT_VERSION`]
    pub version: u16,
    /// Id of the [`CompressionKind`](crate::CompressionKind) blocks may use
    pub compression: u8,
    /// Id of the [`EncryptionKind`](crate::EncryptionKind) of all blocks
    pub encryption: u8,
    /// The block size of the repository which wrote this volume
    pub block_size: u32,
    /// Number of manifest entries following the header
    pub block_count: u32,
}

/// One manifest entry, describing one block in the payload.
#[derive(BinWrite, BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
pub struct ManifestEntry {
    /// Fingerprint of the raw block
    pub id: Id,
    /// Offset within the payload
    pub offset: u32,
    /// Length of the encoded block
    pub length: u32,
    /// Length of the raw block if it is compressed, otherwise 0
    pub uncompressed_length: u32,
}

impl From<&IndexBlock> for ManifestEntry {
    fn from(block: &IndexBlock) -> Self {
        Self {
            id: *block.id,
            offset: block.offset,
            length: block.length,
            uncompressed_length: block.uncompressed_length.map_or(0, NonZeroU32::get),
        }
    }
}

impl From<ManifestEntry> for IndexBlock {
    fn from(entry: ManifestEntry) -> Self {
        Self {
            id: BlockId::from(entry.id),
            offset: entry.offset,
            length: entry.length,
            uncompressed_length: NonZeroU32::new(entry.uncompressed_length),
        }
    }
}

/// Serialize a complete volume.
///
/// # Arguments
///
/// * `header` - The header; its `block_count` must equal `blocks.len()`
/// * `blocks` - The manifest, offsets relative to `payload`
/// * `payload` - The encoded blocks
///
/// # Errors
///
/// * [`VolumeErrorKind::WritingBinaryRepresentationFailed`] - If the binary representation could not be written
pub(crate) fn write_volume(
    header: &VolumeHeader,
    blocks: &[IndexBlock],
    payload: &[u8],
) -> VaultResult<Vec<u8>> {
    let capacity = constants::HEADER_LEN
        + blocks.len() * constants::ENTRY_LEN
        + payload.len()
        + constants::TRAILER_LEN;
    let mut writer = Cursor::new(Vec::with_capacity(capacity));

    header
        .write(&mut writer)
        .map_err(VolumeErrorKind::WritingBinaryRepresentationFailed)?;
    for block in blocks {
        ManifestEntry::from(block)
            .write(&mut writer)
            .map_err(VolumeErrorKind::WritingBinaryRepresentationFailed)?;
    }

    let mut data = writer.into_inner();
    data.extend_from_slice(payload);
    let checksum = hash(&data);
    data.extend_from_slice(checksum.as_bytes());
    Ok(data)
}

/// A parsed and checksum-verified volume.
#[derive(Debug, Clone)]
pub struct VolumeFile {
    header: VolumeHeader,
    blocks: Vec<IndexBlock>,
    payload: Bytes,
}

impl VolumeFile {
    /// Parse a volume.
    ///
    /// The trailer checksum is verified first, then the header and every manifest
    /// entry is checked against the payload bounds.
    ///
    /// # Errors
    ///
    /// * [`VolumeErrorKind::TooShort`] - If the data cannot even hold header and trailer
    /// * [`VolumeErrorKind::ChecksumMismatch`] - If the trailer does not match the contents
    /// * [`VolumeErrorKind::WrongMagic`] - If the data is not a volume
    /// * [`VolumeErrorKind::VersionNotSupported`] - If the volume was written by a newer format
    /// * [`VolumeErrorKind::BlockOutOfBounds`] - If a manifest entry points outside the payload
    pub fn from_bytes(data: Bytes) -> VaultResult<Self> {
        if data.len() < constants::HEADER_LEN + constants::TRAILER_LEN {
            return Err(VolumeErrorKind::TooShort(data.len()).into());
        }

        let content_end = data.len() - constants::TRAILER_LEN;
        if hash(&data[..content_end]).as_bytes()[..] != data[content_end..] {
            return Err(VolumeErrorKind::ChecksumMismatch.into());
        }

        let mut reader = Cursor::new(&data[..content_end]);
        let header = VolumeHeader::read(&mut reader).map_err(|err| match err {
            binrw::Error::BadMagic { .. } => VolumeErrorKind::WrongMagic,
            err => VolumeErrorKind::ReadingBinaryRepresentationFailed(err),
        })?;
        if header.version > constants::FORMAT_VERSION {
            return Err(VolumeErrorKind::VersionNotSupported(header.version).into());
        }

        let manifest_len = (header.block_count as usize).saturating_mul(constants::ENTRY_LEN);
        if constants::HEADER_LEN + manifest_len > content_end {
            return Err(VolumeErrorKind::TooShort(data.len()).into());
        }

        let blocks = (0..header.block_count)
            .map(|_| ManifestEntry::read(&mut reader).map(IndexBlock::from))
            .collect::<binrw::BinResult<Vec<_>>>()
            .map_err(VolumeErrorKind::ReadingBinaryRepresentationFailed)?;

        let payload = data.slice(constants::HEADER_LEN + manifest_len..content_end);
        for block in &blocks {
            if u64::from(block.offset) + u64::from(block.length) > payload.len() as u64 {
                return Err(VolumeErrorKind::BlockOutOfBounds {
                    id: block.id,
                    offset: block.offset,
                    length: block.length,
                    payload_len: payload.len(),
                }
                .into());
            }
        }

        Ok(Self {
            header,
            blocks,
            payload,
        })
    }

    /// The volume header
    #[must_use]
    pub const fn header(&self) -> &VolumeHeader {
        &self.header
    }

    /// The manifest of this volume, in payload order
    #[must_use]
    pub fn blocks(&self) -> &[IndexBlock] {
        &self.blocks
    }

    /// The encoded bytes of one block.
    ///
    /// # Errors
    ///
    /// * [`VolumeErrorKind::BlockOutOfBounds`] - If `block` does not fit into the payload
    pub fn block_data(&self, block: &IndexBlock) -> VaultResult<Bytes> {
        let start = block.offset as usize;
        let end = start + block.length as usize;
        if end > self.payload.len() {
            return Err(VolumeErrorKind::BlockOutOfBounds {
                id: block.id,
                offset: block.offset,
                length: block.length,
                payload_len: self.payload.len(),
            }
            .into());
        }
        Ok(self.payload.slice(start..end))
    }

    /// Look up a block by its fingerprint.
    ///
    /// # Errors
    ///
    /// * [`VolumeErrorKind::BlockNotInVolume`] - If the manifest has no such block
    pub fn find(&self, id: &BlockId) -> VaultResult<&IndexBlock> {
        self.blocks
            .iter()
            .find(|block| &block.id == id)
            .ok_or_else(|| VolumeErrorKind::BlockNotInVolume(*id).into())
    }
}
