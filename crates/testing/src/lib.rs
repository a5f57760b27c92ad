//! Testing utilities for the `blockvault` ecosystem.

// test support panics on poisoned locks
#![allow(clippy::unwrap_used)]

/// Transports to be used solely for testing.
pub mod transport;

use std::{error::Error, fs, path::Path};

use tempfile::TempDir;

/// A test result.
pub type TestResult<T> = Result<T, Box<dyn Error>>;

/// Create a temporary directory containing the given files.
///
/// # Arguments
///
/// * `files` - Paths relative to the new directory with their content.
///
/// # Errors
///
/// If a directory or file could not be created.
pub fn source_dir<P, C>(files: impl IntoIterator<Item = (P, C)>) -> TestResult<TempDir>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    let dir = tempfile::tempdir()?;
    for (path, content) in files {
        let path = dir.path().join(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
    }
    Ok(dir)
}

/// Deterministic pseudo random content, different for each `seed`.
#[must_use]
pub fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    (0..len)
        .map(|_| {
            // xorshift64
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state.to_le_bytes()[0]
        })
        .collect()
}

/// Check if the given files differ.
///
/// # Errors
///
/// If one of the files could not be read.
pub fn files_differ(path_left: impl AsRef<Path>, path_right: impl AsRef<Path>) -> TestResult<bool> {
    Ok(fs::read(path_left)? != fs::read(path_right)?)
}
