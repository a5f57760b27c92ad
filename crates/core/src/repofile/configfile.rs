use serde_derive::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::{
    crypto::EncryptionKind, define_new_id_struct, error::ConfigErrorKind,
    repofile::volumefile::constants as volume_constants, VaultResult,
};

pub(crate) mod constants {
    pub(crate) const KB: u32 = 1024;
    pub(crate) const MB: u32 = 1024 * KB;

    /// The default block size = 1 MiB.
    pub(crate) const DEFAULT_BLOCK_SIZE: u32 = MB;
    /// The largest supported block size = 64 MiB.
    pub(crate) const MAX_BLOCK_SIZE: u32 = 64 * MB;
    /// The default targeted volume size = 50 MiB.
    pub(crate) const DEFAULT_VOLUME_SIZE: u32 = 50 * MB;
    /// The largest supported targeted volume size, offsets within a volume are u32.
    pub(crate) const MAX_VOLUME_SIZE: u32 = 4000 * MB;
    /// The default zstd level
    pub(crate) const DEFAULT_COMPRESSION: i32 = 3;
}

define_new_id_struct!(RepositoryId, "repository");

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// The config describes all repository-wide information.
///
/// It is persisted in the index store and never changes its block size.
pub struct ConfigFile {
    /// Volume format version written by this repository
    pub version: u16,

    /// The [`Id`](crate::Id) identifying the repository
    pub id: RepositoryId,

    /// The block size in bytes
    pub block_size: u32,

    /// Targeted size of a volume in bytes. Volumes are sealed once they reach it.
    ///
    /// If not set, defaults to `50 MiB`
    pub volume_size: Option<u32>,

    /// Compression level
    ///
    /// # Note
    ///
    /// `Some(0)` means no compression. If not set, the default level 3 is used.
    pub compression: Option<i32>,

    /// The cipher all blocks are encrypted with
    pub encryption: EncryptionKind,

    /// Decode every block again before it is uploaded
    pub extra_verify: Option<bool>,
}

impl ConfigFile {
    /// Creates a new `ConfigFile` with default sizes.
    #[must_use]
    pub fn new(encryption: EncryptionKind) -> Self {
        Self {
            version: volume_constants::FORMAT_VERSION,
            id: RepositoryId::from(crate::Id::random()),
            block_size: constants::DEFAULT_BLOCK_SIZE,
            volume_size: None,
            compression: None,
            encryption,
            extra_verify: None,
        }
    }

    /// Get the compression level, `None` if compression is disabled.
    #[must_use]
    pub fn zstd(&self) -> Option<i32> {
        match self.compression {
            Some(0) => None,
            Some(level) => Some(level),
            None => Some(constants::DEFAULT_COMPRESSION),
        }
    }

    /// The targeted volume size
    #[must_use]
    pub fn volume_size(&self) -> u32 {
        self.volume_size.unwrap_or(constants::DEFAULT_VOLUME_SIZE)
    }

    /// Get whether every block should be decoded again before uploading.
    #[must_use]
    pub fn extra_verify(&self) -> bool {
        self.extra_verify.unwrap_or(false)
    }

    /// Check all values against their supported ranges.
    ///
    /// # Errors
    ///
    /// * [`ConfigErrorKind::VersionNotSupported`] - If the format version is unknown
    /// * [`ConfigErrorKind::BlockSizeNotSupported`] - If the block size is out of range
    /// * [`ConfigErrorKind::VolumeSizeNotSupported`] - If the volume size is out of range
    /// * [`ConfigErrorKind::CompressionLevelNotSupported`] - If zstd does not know the level
    pub fn validate(&self) -> VaultResult<()> {
        if self.version == 0 || self.version > volume_constants::FORMAT_VERSION {
            return Err(ConfigErrorKind::VersionNotSupported(self.version).into());
        }

        let range = 1..=u64::from(constants::MAX_BLOCK_SIZE);
        if !range.contains(&u64::from(self.block_size)) {
            return Err(
                ConfigErrorKind::BlockSizeNotSupported(u64::from(self.block_size), range).into(),
            );
        }

        let range = 1..=u64::from(constants::MAX_VOLUME_SIZE);
        if !range.contains(&u64::from(self.volume_size())) {
            return Err(ConfigErrorKind::VolumeSizeNotSupported(
                u64::from(self.volume_size()),
                range,
            )
            .into());
        }

        if let Some(level) = self.zstd() {
            let range = zstd::compression_level_range();
            if !range.contains(&level) {
                return Err(ConfigErrorKind::CompressionLevelNotSupported(level, range).into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_default_config_is_valid_passes() {
        let config = ConfigFile::new(EncryptionKind::None);

        assert!(config.validate().is_ok());
        assert_eq!(config.block_size, 1024 * 1024);
        assert_eq!(config.zstd(), Some(3));
        assert_eq!(config.volume_size(), 50 * 1024 * 1024);
        assert!(!config.extra_verify());
    }

    #[rstest]
    #[case(0)]
    #[case(64 * 1024 * 1024 + 1)]
    fn test_block_size_out_of_range_fails(#[case] block_size: u32) {
        let config = ConfigFile {
            block_size,
            ..ConfigFile::new(EncryptionKind::None)
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_compression_zero_disables_zstd_passes() {
        let config = ConfigFile {
            compression: Some(0),
            ..ConfigFile::new(EncryptionKind::None)
        };

        assert_eq!(config.zstd(), None);
    }

    #[test]
    fn test_config_serialization_passes() {
        let config = ConfigFile::new(EncryptionKind::Aes256CtrPoly1305Aes);
        let json = serde_json::to_string(&config).unwrap();

        assert!(!json.contains("volume_size"));
        let parsed: ConfigFile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
