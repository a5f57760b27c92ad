//! Errors of the transports in this crate.

use std::path::PathBuf;

use displaydoc::Display;
use thiserror::Error;

/// [`LocalBackendErrorKind`] describes the errors that can be returned by an action on the filesystem
#[derive(Error, Debug, Display)]
#[non_exhaustive]
pub enum LocalBackendErrorKind {
    /// directory creation failed for {path:?}: `{source:?}`
    DirectoryCreationFailed {
        /// The directory
        path: PathBuf,
        /// The cause
        source: std::io::Error,
    },
    /// querying WalkDir metadata failed: `{0:?}`
    QueryingWalkDirMetadataFailed(walkdir::Error),
    /// listing volumes failed: `{0:?}`
    ListingFailed(walkdir::Error),
    /// removing file {path:?} failed: `{source:?}`
    FileRemovalFailed {
        /// The file
        path: PathBuf,
        /// The cause
        source: std::io::Error,
    },
    /// reading file {path:?} failed: `{source:?}`
    ReadingContentsOfFileFailed {
        /// The file
        path: PathBuf,
        /// The cause
        source: std::io::Error,
    },
    /// writing file {path:?} failed: `{source:?}`
    WritingFileFailed {
        /// The file
        path: PathBuf,
        /// The cause
        source: std::io::Error,
    },
    /// volume {0} already exists with different content
    VolumeDiffers(String),
}
