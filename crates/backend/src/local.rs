use std::{
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use anyhow::Result;
use bytes::Bytes;
use log::{debug, trace};
use walkdir::WalkDir;

use blockvault_core::{Id, Transport, VolumeId};

use crate::error::LocalBackendErrorKind;

/// A transport storing volumes in a local directory.
///
/// Volume `id` is stored as `data/<first two hex digits>/<hex id>`.
#[derive(Clone, Debug)]
pub struct LocalBackend {
    /// The base path of the backend.
    path: PathBuf,
}

impl LocalBackend {
    /// Create a new [`LocalBackend`], creating its directories if needed.
    ///
    /// # Arguments
    ///
    /// * `path` - The base path of the backend
    ///
    /// # Errors
    ///
    /// * [`LocalBackendErrorKind::DirectoryCreationFailed`] - If a directory could not be created.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, LocalBackendErrorKind> {
        let path = path.into();
        trace!("creating volume directories at {path:?}");
        for i in 0u8..=255 {
            let dir = path.join("data").join(format!("{i:02x}"));
            fs::create_dir_all(&dir).map_err(|source| {
                LocalBackendErrorKind::DirectoryCreationFailed { path: dir, source }
            })?;
        }
        Ok(Self { path })
    }

    /// Path to the given volume.
    fn path(&self, id: &VolumeId) -> PathBuf {
        let hex_id = id.to_hex();
        self.path
            .join("data")
            .join(&hex_id[0..2])
            .join(hex_id.as_str())
    }

    /// Whether `path` already holds exactly `data`
    fn holds(path: &Path, data: &[u8]) -> Result<bool, LocalBackendErrorKind> {
        match fs::read(path) {
            Ok(existing) => Ok(existing == data),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(LocalBackendErrorKind::ReadingContentsOfFileFailed {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl Transport for LocalBackend {
    /// Returns the location of the backend.
    ///
    /// This is `local:<path>`.
    fn location(&self) -> String {
        let mut location = "local:".to_string();
        location.push_str(&self.path.to_string_lossy());
        location
    }

    /// Lists all volumes with their size.
    ///
    /// Files which are not named by a volume id, e.g. unfinished uploads, are ignored.
    ///
    /// # Errors
    ///
    /// * [`LocalBackendErrorKind::ListingFailed`] - If the directory could not be walked.
    /// * [`LocalBackendErrorKind::QueryingWalkDirMetadataFailed`] - If the size of a volume could not be queried.
    fn list(&self) -> Result<Vec<(VolumeId, u64)>> {
        trace!("listing volumes");
        let mut volumes = Vec::new();
        for entry in WalkDir::new(self.path.join("data")) {
            let entry = entry.map_err(LocalBackendErrorKind::ListingFailed)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(id) = entry.file_name().to_string_lossy().parse::<Id>() else {
                continue;
            };
            let size = entry
                .metadata()
                .map_err(LocalBackendErrorKind::QueryingWalkDirMetadataFailed)?
                .len();
            volumes.push((VolumeId::from(id), size));
        }
        Ok(volumes)
    }

    /// Stores a volume.
    ///
    /// The data is written to a temporary file first which is renamed once it is
    /// synced, so a volume is either complete or absent.
    ///
    /// # Errors
    ///
    /// * [`LocalBackendErrorKind::VolumeDiffers`] - If the volume exists with other content.
    /// * [`LocalBackendErrorKind::WritingFileFailed`] - If the file could not be written.
    fn upload(&self, id: &VolumeId, data: Bytes) -> Result<()> {
        trace!("writing volume {id}");
        let filename = self.path(id);
        if filename.exists() {
            if Self::holds(&filename, &data)? {
                debug!("volume {id} already exists, skipping upload");
                return Ok(());
            }
            return Err(LocalBackendErrorKind::VolumeDiffers(id.to_string()).into());
        }

        let temp = filename.with_extension("tmp");
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            fs::rename(&temp, &filename)
        };
        if let Err(source) = write() {
            _ = fs::remove_file(&temp);
            return Err(LocalBackendErrorKind::WritingFileFailed {
                path: filename,
                source,
            }
            .into());
        }
        Ok(())
    }

    /// Reads a complete volume.
    ///
    /// # Errors
    ///
    /// * [`LocalBackendErrorKind::ReadingContentsOfFileFailed`] - If the file could not be read.
    fn download(&self, id: &VolumeId) -> Result<Bytes> {
        trace!("reading volume {id}");
        let path = self.path(id);
        let data = fs::read(&path)
            .map_err(|source| LocalBackendErrorKind::ReadingContentsOfFileFailed { path, source })?;
        Ok(data.into())
    }

    /// Removes a volume. Removing a missing volume succeeds.
    ///
    /// # Errors
    ///
    /// * [`LocalBackendErrorKind::FileRemovalFailed`] - If the file could not be removed.
    fn delete(&self, id: &VolumeId) -> Result<()> {
        trace!("removing volume {id}");
        let path = self.path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("volume {id} was already removed");
                Ok(())
            }
            Err(source) => Err(LocalBackendErrorKind::FileRemovalFailed { path, source }.into()),
        }
    }
}
