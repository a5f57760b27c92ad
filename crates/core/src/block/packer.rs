use std::num::NonZeroU32;

use bytes::{Bytes, BytesMut};
use chrono::Local;
use log::trace;

use crate::{
    block::{volume_sizer::VolumeSizer, BlockId, VolumeId},
    codec::CompressionKind,
    crypto::{hasher::hash, EncryptionKind},
    error::PackerErrorKind,
    repofile::{
        filesetfile::FilesetSummary,
        indexfile::IndexVolume,
        volumefile::{self, constants::FORMAT_VERSION, VolumeHeader},
    },
    VaultResult,
};

pub(crate) type PackerResult<T> = Result<T, PackerErrorKind>;

/// Statistics of the blocks which went through a packer
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackerStats {
    /// The number of blocks added
    pub blocks: u64,
    /// The raw size of the blocks added
    pub data: u64,
    /// The encoded size of the blocks added
    pub data_packed: u64,
    /// The number of sealed volumes
    pub volumes: u64,
}

impl PackerStats {
    /// Adds the stats to the summary
    pub fn apply(self, summary: &mut FilesetSummary) {
        summary.data_added += self.data;
        summary.data_added_stored += self.data_packed;
        summary.volumes_written += self.volumes;
    }
}

/// A sealed volume, ready to be handed to the transport.
#[derive(Debug, Clone)]
pub(crate) struct SealedVolume {
    /// The complete container
    pub data: Bytes,
    /// The manifest; `index.id` is the hash of `data`
    pub index: IndexVolume,
}

/// What all volumes of one repository have in common.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VolumeFormat {
    pub compression: CompressionKind,
    pub encryption: EncryptionKind,
    pub block_size: u32,
}

/// The `Packer` collects encoded blocks into the open volume.
///
/// It does no I/O; sealed volumes are returned to the caller.
#[allow(missing_debug_implementations)]
pub(crate) struct Packer<S> {
    /// The format written into the header
    format: VolumeFormat,
    /// The payload of the open volume
    file: BytesMut,
    /// The size of the payload
    size: u32,
    /// The number of blocks in the open volume
    count: u32,
    /// The manifest of the open volume
    index: IndexVolume,
    /// The volume sizer
    sizer: S,
    /// The packer stats
    pub stats: PackerStats,
}

impl<S: VolumeSizer> Packer<S> {
    /// Creates a new `Packer`.
    pub(crate) fn new(format: VolumeFormat, sizer: S) -> Self {
        Self {
            format,
            file: BytesMut::new(),
            size: 0,
            count: 0,
            index: IndexVolume::default(),
            sizer,
            stats: PackerStats::default(),
        }
    }

    /// Seals the open volume and returns it together with the stats
    ///
    /// # Errors
    ///
    /// * If the volume could not be serialized
    pub(crate) fn finalize(mut self) -> VaultResult<(Option<SealedVolume>, PackerStats)> {
        Ok((self.save()?, self.stats))
    }

    /// Appends the given data to the payload and returns its length.
    fn write_data(&mut self, data: &[u8]) -> PackerResult<u32> {
        let len: u32 = data
            .len()
            .try_into()
            .map_err(|err| PackerErrorKind::Conversion {
                to: "u32",
                from: "usize",
                source: err,
            })?;
        let size = self
            .size
            .checked_add(len)
            .ok_or(PackerErrorKind::SizeLimitExceeded(data.len()))?;
        self.stats.data_packed += u64::from(len);
        self.file.extend_from_slice(data);
        self.size = size;
        Ok(len)
    }

    /// Adds an already compressed/encrypted block to the open volume
    ///
    /// # Arguments
    ///
    /// * `data` - The encoded block
    /// * `id` - The block id
    /// * `data_len` - The raw length of the block
    /// * `uncompressed_length` - The raw length if the block is compressed
    ///
    /// # Errors
    ///
    /// * [`PackerErrorKind::SizeLimitExceeded`] - If the block does not fit
    pub(crate) fn add(
        &mut self,
        data: &[u8],
        id: &BlockId,
        data_len: u64,
        uncompressed_length: Option<NonZeroU32>,
    ) -> VaultResult<()> {
        let offset = self.size;
        let len = self.write_data(data)?;
        self.index.add(*id, offset, len, uncompressed_length);

        self.stats.blocks += 1;
        self.stats.data += data_len;
        self.count += 1;

        Ok(())
    }

    /// Determines if the open volume should be sealed.
    pub(crate) fn needs_save(&self) -> bool {
        self.count > 0 && self.sizer.is_full(self.size, self.count)
    }

    /// Seals the open volume if it is full
    ///
    /// # Errors
    ///
    /// * If the volume could not be serialized
    pub(crate) fn save_if_needed(&mut self) -> VaultResult<Option<SealedVolume>> {
        if !self.needs_save() {
            return Ok(None);
        }

        self.save()
    }

    /// Seals the open volume, if it contains any block
    ///
    /// # Errors
    ///
    /// * If the volume could not be serialized
    pub(crate) fn save(&mut self) -> VaultResult<Option<SealedVolume>> {
        if self.count == 0 {
            return Ok(None);
        }

        let header = VolumeHeader {
            version: FORMAT_VERSION,
            compression: self.format.compression.id(),
            encryption: self.format.encryption.id(),
            block_size: self.format.block_size,
            block_count: self.count,
        };
        let mut index = std::mem::take(&mut self.index);
        let file = std::mem::take(&mut self.file);
        let data = volumefile::write_volume(&header, &index.blocks, &file)?;

        index.id = VolumeId::from(hash(&data));
        index.time = Some(Local::now());
        index.size = Some(u32::try_from(data.len()).map_err(|err| {
            PackerErrorKind::Conversion {
                to: "u32",
                from: "usize",
                source: err,
            }
        })?);
        trace!(
            "sealed volume {} with {} blocks, {} bytes",
            index.id,
            self.count,
            data.len()
        );

        self.size = 0;
        self.count = 0;
        self.stats.volumes += 1;

        Ok(Some(SealedVolume {
            data: data.into(),
            index,
        }))
    }
}
