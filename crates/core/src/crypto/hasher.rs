use std::io::{ErrorKind, Read, Result};

use sha2::{Digest, Sha256};

use crate::id::Id;

/// Hashes the given data.
///
/// # Arguments
///
/// * `data` - The data to hash.
///
/// # Returns
///
/// The hash Id of the data.
#[must_use]
pub fn hash(data: &[u8]) -> Id {
    Id::new(Sha256::digest(data).into())
}

/// Hashes the data from a [`Read`]er.
///
/// # Errors
///
/// - if the reader encounters an error other than [`ErrorKind::Interrupted`]
pub fn hash_reader(mut reader: impl Read) -> Result<Id> {
    let mut buffer = [0; 4096];
    let mut hasher = Sha256::default();

    loop {
        match reader.read(&mut buffer) {
            Err(err) => {
                if err.kind() != ErrorKind::Interrupted {
                    break Err(err);
                }
            }
            Ok(0) => break Ok(Id::new(hasher.finalize().into())),
            Ok(count) => hasher.update(&buffer[..count]),
        }
    }
}

/// Incremental hash over a stream which is fed in pieces, e.g. the blocks of one file.
#[derive(Debug, Clone, Default)]
pub struct StreamHasher(Sha256);

impl StreamHasher {
    /// Add the next piece of data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// The hash of everything added so far.
    #[must_use]
    pub fn finalize(self) -> Id {
        Id::new(self.0.finalize().into())
    }
}
