//! Per-block encoding: optional zstd compression followed by encryption.

use std::num::NonZeroU32;

use serde_derive::{Deserialize, Serialize};
use zstd::stream::{decode_all, encode_all};

pub use zstd::compression_level_range;

use crate::{crypto::CryptoKey, error::CodecErrorKind, VaultResult};

/// The maximum compression level allowed by zstd
#[must_use]
pub fn max_compression_level() -> i32 {
    *compression_level_range().end()
}

/// The compression a volume may contain.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, derive_more::Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionKind {
    /// Blocks are never compressed
    None,
    /// Blocks are zstd compressed when that makes them smaller
    Zstd,
}

impl CompressionKind {
    /// The id used in the volume header
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Zstd => 1,
        }
    }

    /// Reverse of [`CompressionKind::id`]
    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            1 => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Encodes raw block data into its stored form and back.
#[derive(Debug, Clone, Copy)]
pub struct BlockCodec<C> {
    key: C,
    zstd: Option<i32>,
}

impl<C: CryptoKey> BlockCodec<C> {
    /// Create a new codec.
    ///
    /// # Arguments
    ///
    /// * `key` - The key used to encrypt blocks
    /// * `zstd` - The zstd compression level, `None` disables compression
    pub const fn new(key: C, zstd: Option<i32>) -> Self {
        Self { key, zstd }
    }

    /// The compression kind written into volume headers
    pub const fn compression(&self) -> CompressionKind {
        match self.zstd {
            Some(_) => CompressionKind::Zstd,
            None => CompressionKind::None,
        }
    }

    /// Encode a raw block.
    ///
    /// The block is compressed only if that makes it strictly smaller.
    ///
    /// # Errors
    ///
    /// * [`CodecErrorKind::CompressingDataFailed`] - If zstd fails
    /// * [`CryptoErrorKind::DataEncryptionFailed`] - If the encryption fails
    ///
    /// # Returns
    ///
    /// The encoded data and, if it was compressed, the raw length.
    ///
    /// [`CryptoErrorKind::DataEncryptionFailed`]: crate::error::CryptoErrorKind::DataEncryptionFailed
    pub fn encode(&self, data: &[u8]) -> VaultResult<(Vec<u8>, Option<NonZeroU32>)> {
        if let Some(level) = self.zstd {
            let compressed =
                encode_all(data, level).map_err(CodecErrorKind::CompressingDataFailed)?;
            if compressed.len() < data.len() {
                let raw_length = u32::try_from(data.len())
                    .ok()
                    .and_then(NonZeroU32::new);
                if raw_length.is_some() {
                    return Ok((self.key.encrypt_data(&compressed)?, raw_length));
                }
            }
        }
        Ok((self.key.encrypt_data(data)?, None))
    }

    /// Decode a stored block.
    ///
    /// # Errors
    ///
    /// * [`CryptoErrorKind::DataDecryptionFailed`] - If the data could not be decrypted
    /// * [`CodecErrorKind::DecodingZstdCompressedDataFailed`] - If the data could not be decompressed
    /// * [`CodecErrorKind::LengthOfDecodedDataDoesNotMatch`] - If the decompressed length is off
    ///
    /// [`CryptoErrorKind::DataDecryptionFailed`]: crate::error::CryptoErrorKind::DataDecryptionFailed
    pub fn decode(&self, data: &[u8], uncompressed_length: Option<NonZeroU32>) -> VaultResult<Vec<u8>> {
        let mut data = self.key.decrypt_data(data)?;
        if let Some(length) = uncompressed_length {
            data = decode_all(&*data).map_err(CodecErrorKind::DecodingZstdCompressedDataFailed)?;
            if data.len() != length.get() as usize {
                return Err(CodecErrorKind::LengthOfDecodedDataDoesNotMatch {
                    expected: length.get(),
                    actual: data.len(),
                }
                .into());
            }
        }
        Ok(data)
    }
}
