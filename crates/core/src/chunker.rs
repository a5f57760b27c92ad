use std::io::Read;

mod fixed_size;

use fixed_size::ChunkIter;

use crate::{block::BlockId, crypto::hasher::hash, VaultResult};

/// Cuts byte streams into fixed-size blocks and fingerprints them.
#[derive(Debug, Clone, Copy)]
pub struct BlockHasher {
    block_size: usize,
}

impl BlockHasher {
    /// Create a hasher for the given block size.
    ///
    /// `block_size` must not be zero; the repository config guarantees that.
    #[must_use]
    pub const fn new(block_size: usize) -> Self {
        Self { block_size }
    }

    /// The size of all but the last block of a stream.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns a lazy iterator over the fingerprinted blocks of `reader`.
    ///
    /// # Arguments
    ///
    /// * `reader` - The stream to read; it is consumed block by block
    /// * `size_hint` - An upper bound of the stream size, used for allocation
    pub fn blocks<R: Read + Send>(&self, reader: R, size_hint: usize) -> HashedBlocks<R> {
        HashedBlocks {
            chunks: ChunkIter::new(self.block_size, reader, size_hint),
        }
    }
}

/// Iterator returned by [`BlockHasher::blocks`].
pub struct HashedBlocks<R: Read + Send> {
    chunks: ChunkIter<R>,
}

impl<R: Read + Send> Iterator for HashedBlocks<R> {
    type Item = VaultResult<(BlockId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(
            self.chunks
                .next()?
                .map(|data| (BlockId::from(hash(&data)), data)),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Cursor;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_blocks_are_fingerprinted_passes() {
        let blocks: Vec<_> = BlockHasher::new(4)
            .blocks(Cursor::new(b"ABCDABCDEF"), 10)
            .collect::<VaultResult<_>>()
            .unwrap();

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].0, blocks[1].0);
        assert_ne!(blocks[1].0, blocks[2].0);
        assert_eq!(blocks[2].0, BlockId::from(hash(b"EF")));
    }

    #[test]
    fn test_empty_stream_has_one_empty_block_passes() {
        let blocks: Vec<_> = BlockHasher::new(1024)
            .blocks(Cursor::new(Vec::new()), 0)
            .collect::<VaultResult<_>>()
            .unwrap();

        assert_eq!(blocks, vec![(BlockId::from(hash(&[])), Vec::new())]);
    }

    proptest! {
        #[test]
        fn concatenated_blocks_reproduce_input(bytes in prop::collection::vec(prop::num::u8::ANY, 0..4096), size in 1usize..300) {
            let blocks: Vec<_> = BlockHasher::new(size)
                .blocks(Cursor::new(bytes.clone()), bytes.len())
                .collect::<VaultResult<_>>()
                .unwrap();

            prop_assert!(blocks.iter().rev().skip(1).all(|(_, data)| data.len() == size));
            prop_assert!(blocks.iter().all(|(id, data)| *id == BlockId::from(hash(data))));
            prop_assert_eq!(blocks.into_iter().flat_map(|(_, data)| data).collect::<Vec<_>>(), bytes);
        }
    }
}
