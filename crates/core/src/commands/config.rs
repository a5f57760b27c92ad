//! Repository-wide settings chosen at `init`
use bytesize::ByteSize;
use derive_setters::Setters;

use crate::{
    crypto::EncryptionKind,
    error::ConfigErrorKind,
    repofile::{configfile::constants, ConfigFile},
    VaultResult,
};

#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[derive(Debug, Clone, Copy, Default, Setters)]
#[setters(into)]
#[non_exhaustive]
/// Options used to create the [`ConfigFile`] of a new repository
pub struct ConfigOptions {
    /// Set the block size. Files are split into blocks of exactly this size.
    /// Defaults to `1 MiB` if not set, at most `64 MiB`.
    #[cfg_attr(feature = "clap", clap(long, value_name = "SIZE"))]
    pub set_block_size: Option<ByteSize>,

    /// Set the targeted volume size. Volumes are sealed once they reach it.
    /// Defaults to `50 MiB` if not set.
    #[cfg_attr(feature = "clap", clap(long, value_name = "SIZE"))]
    pub set_volume_size: Option<ByteSize>,

    /// Set compression level. Allowed levels are 1 to 22 and -1 to -7, see <https://facebook.github.io/zstd/>.
    /// Note that 0 equals to no compression
    #[cfg_attr(feature = "clap", clap(long, value_name = "LEVEL"))]
    pub set_compression: Option<i32>,

    /// Do an extra verification by decompressing/decrypting all data before uploading to the repository.
    /// Default: false
    #[cfg_attr(feature = "clap", clap(long))]
    pub set_extra_verify: Option<bool>,
}

impl ConfigOptions {
    /// Apply the [`ConfigOptions`] to a given [`ConfigFile`]
    ///
    /// # Errors
    ///
    /// * [`ConfigErrorKind::BlockSizeNotSupported`] - If the block size is out of range
    /// * [`ConfigErrorKind::VolumeSizeNotSupported`] - If the volume size is out of range
    /// * [`ConfigErrorKind::CompressionLevelNotSupported`] - If the compression level is not supported
    pub fn apply(&self, config: &mut ConfigFile) -> VaultResult<()> {
        if let Some(size) = self.set_block_size {
            let range = 1..=u64::from(constants::MAX_BLOCK_SIZE);
            config.block_size = u32::try_from(size.as_u64())
                .ok()
                .filter(|_| range.contains(&size.as_u64()))
                .ok_or(ConfigErrorKind::BlockSizeNotSupported(size.as_u64(), range))?;
        }

        if let Some(size) = self.set_volume_size {
            let range = 1..=u64::from(constants::MAX_VOLUME_SIZE);
            config.volume_size = Some(
                u32::try_from(size.as_u64())
                    .ok()
                    .filter(|_| range.contains(&size.as_u64()))
                    .ok_or(ConfigErrorKind::VolumeSizeNotSupported(size.as_u64(), range))?,
            );
        }

        if let Some(compression) = self.set_compression {
            let range = zstd::compression_level_range();
            if compression != 0 && !range.contains(&compression) {
                return Err(
                    ConfigErrorKind::CompressionLevelNotSupported(compression, range).into(),
                );
            }
            config.compression = Some(compression);
        }

        if let Some(extra_verify) = self.set_extra_verify {
            config.extra_verify = Some(extra_verify);
        }

        config.validate()
    }

    /// Creates the config of a new repository
    ///
    /// # Errors
    ///
    /// If an option is out of range, see [`ConfigOptions::apply`]
    pub fn to_config(&self, encryption: EncryptionKind) -> VaultResult<ConfigFile> {
        let mut config = ConfigFile::new(encryption);
        self.apply(&mut config)?;
        Ok(config)
    }
}
