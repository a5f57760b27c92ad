//! The interface to the remote storage of volumes.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use crate::block::VolumeId;

/// Trait for remote storage holding volumes.
///
/// Implementations are plain blocking object stores; retries, timeouts and
/// credentials are their own business. Errors are reported as [`anyhow::Error`]
/// and classified as [`ErrorCategory::Transport`](crate::ErrorCategory::Transport) by the engine.
///
/// Uploads are not required to be exactly-once: uploading an id that already
/// exists with the same content must succeed.
pub trait Transport: Send + Sync + 'static {
    /// Returns a human readable location of the storage, used for logging.
    fn location(&self) -> String;

    /// Lists all volumes with their size.
    ///
    /// # Errors
    ///
    /// If the volumes could not be listed.
    fn list(&self) -> Result<Vec<(VolumeId, u64)>>;

    /// Stores a sealed volume.
    ///
    /// # Arguments
    ///
    /// * `id` - The id of the volume, i.e. the hash of `data`.
    /// * `data` - The complete volume.
    ///
    /// # Errors
    ///
    /// If the volume could not be stored. The engine will not retry.
    fn upload(&self, id: &VolumeId, data: Bytes) -> Result<()>;

    /// Fetches a complete volume.
    ///
    /// # Errors
    ///
    /// If the volume does not exist or could not be read.
    fn download(&self, id: &VolumeId) -> Result<Bytes>;

    /// Removes a volume.
    ///
    /// # Errors
    ///
    /// If the volume could not be removed.
    fn delete(&self, id: &VolumeId) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn location(&self) -> String {
        self.as_ref().location()
    }

    fn list(&self) -> Result<Vec<(VolumeId, u64)>> {
        self.as_ref().list()
    }

    fn upload(&self, id: &VolumeId, data: Bytes) -> Result<()> {
        self.as_ref().upload(id, data)
    }

    fn download(&self, id: &VolumeId) -> Result<Bytes> {
        self.as_ref().download(id)
    }

    fn delete(&self, id: &VolumeId) -> Result<()> {
        self.as_ref().delete(id)
    }
}
