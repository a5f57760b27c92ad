use std::io::Read;

use crate::{error::VaultErrorKind, VaultResult};

/// `ChunkIter` is an iterator that cuts a reader into blocks of a fixed size.
///
/// Every block has exactly `size` bytes, except the last one which may be shorter.
/// An empty reader yields exactly one empty block.
pub(crate) struct ChunkIter<R: Read + Send> {
    /// The reader.
    reader: R,

    /// Used to optimize memory allocation; this should be an upper bound on the size.
    size_hint: usize,

    /// The size of a block.
    size: usize,

    /// If the iterator is finished.
    finished: bool,

    /// If at least one block was returned.
    emitted: bool,
}

impl<R: Read + Send> ChunkIter<R> {
    /// Creates a new `ChunkIter`.
    ///
    /// # Arguments
    ///
    /// * `size` - The block size, must not be zero.
    /// * `reader` - The reader to read from.
    /// * `size_hint` - Used to optimize memory allocation; this should be an upper bound on the size.
    pub(crate) fn new(size: usize, reader: R, size_hint: usize) -> Self {
        Self {
            reader,
            size_hint,
            size,
            finished: false,
            emitted: false,
        }
    }
}

impl<R: Read + Send> Iterator for ChunkIter<R> {
    type Item = VaultResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut vec = Vec::with_capacity(self.size_hint.min(self.size));

        // read_to_end retries on ErrorKind::Interrupted
        let size = match (&mut self.reader)
            .take(self.size as u64)
            .read_to_end(&mut vec)
        {
            Ok(size) => size,
            Err(err) => {
                self.finished = true;
                return Some(Err(VaultErrorKind::StdIo(err).into()));
            }
        };

        if size < self.size {
            self.finished = true;
        }
        self.size_hint = self.size_hint.saturating_sub(vec.len()); // size_hint can be too small!

        if vec.is_empty() && self.emitted {
            return None;
        }
        self.emitted = true;
        Some(Ok(vec))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::{self, Cursor};

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(b"", 4, vec![b"".to_vec()])]
    #[case(b"AB", 4, vec![b"AB".to_vec()])]
    #[case(b"ABCD", 4, vec![b"ABCD".to_vec()])]
    #[case(b"ABCDEFGH", 4, vec![b"ABCD".to_vec(), b"EFGH".to_vec()])]
    #[case(b"ABCDEFGHI", 4, vec![b"ABCD".to_vec(), b"EFGH".to_vec(), b"I".to_vec()])]
    fn test_fixed_size_chunks_passes(
        #[case] data: &[u8],
        #[case] size: usize,
        #[case] expected: Vec<Vec<u8>>,
    ) {
        let chunks: Vec<_> = ChunkIter::new(size, Cursor::new(data), data.len())
            .collect::<VaultResult<_>>()
            .unwrap();

        assert_eq!(chunks, expected);
    }

    struct BrokenReader;

    impl Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        }
    }

    #[test]
    fn test_read_error_is_propagated_passes() {
        let mut iter = ChunkIter::new(4, BrokenReader, 0);

        let err = iter.next().unwrap().unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Io);
        assert!(iter.next().is_none());
    }

    struct InterruptingReader {
        data: Cursor<Vec<u8>>,
        interrupt: bool,
    }

    impl Read for InterruptingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            let len = buf.len().min(1);
            self.data.read(&mut buf[..len])
        }
    }

    #[test]
    fn test_interrupted_reads_are_retried_passes() {
        let reader = InterruptingReader {
            data: Cursor::new(b"ABCDEF".to_vec()),
            interrupt: false,
        };
        let chunks: Vec<_> = ChunkIter::new(4, reader, 0)
            .collect::<VaultResult<_>>()
            .unwrap();

        assert_eq!(chunks, vec![b"ABCD".to_vec(), b"EF".to_vec()]);
    }
}
