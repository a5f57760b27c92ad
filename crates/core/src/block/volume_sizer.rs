use crate::repofile::{volumefile::constants::MAX_COUNT, ConfigFile};

/// The volume sizer decides when an open volume gets sealed.
pub trait VolumeSizer {
    /// The targeted size of a volume in bytes.
    #[must_use]
    fn volume_size(&self) -> u32;

    /// The maximum number of blocks in a volume.
    #[must_use]
    fn max_blocks(&self) -> u32 {
        MAX_COUNT
    }

    /// Evaluates whether a volume of this size and block count is full
    ///
    /// # Arguments
    ///
    /// * `size` - The payload size of the open volume
    /// * `count` - The number of blocks in the open volume
    #[must_use]
    fn is_full(&self, size: u32, count: u32) -> bool {
        size >= self.volume_size() || count >= self.max_blocks()
    }
}

/// A volume sizer which uses a fixed volume size
#[derive(Debug, Clone, Copy)]
pub struct FixedVolumeSizer {
    size: u32,
    max_blocks: u32,
}

impl FixedVolumeSizer {
    /// Creates a new sizer, at most [`MAX_COUNT`] blocks are allowed.
    #[must_use]
    pub fn new(size: u32, max_blocks: u32) -> Self {
        Self {
            size,
            max_blocks: max_blocks.clamp(1, MAX_COUNT),
        }
    }

    /// Creates a sizer using the volume size of the repository.
    #[must_use]
    pub fn from_config(config: &ConfigFile) -> Self {
        Self::new(config.volume_size(), MAX_COUNT)
    }
}

impl VolumeSizer for FixedVolumeSizer {
    fn volume_size(&self) -> u32 {
        self.size
    }

    fn max_blocks(&self) -> u32 {
        self.max_blocks
    }
}
