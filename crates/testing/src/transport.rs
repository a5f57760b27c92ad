//! An in-memory [`Transport`] with fault injection.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        RwLock,
    },
};

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;

use blockvault_core::{repofile::is_meta, CancelToken, Transport, VolumeId};

/// A call of the [`Transport`] moving data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// [`Transport::upload`]
    Upload,
    /// [`Transport::download`]
    Download,
}

#[derive(Debug, Default)]
/// In-memory transport to be used for testing
pub struct InMemoryTransport {
    volumes: RwLock<BTreeMap<VolumeId, Bytes>>,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    fail_upload_at: RwLock<Option<usize>>,
    cancel_at: RwLock<Option<(Transfer, usize, CancelToken)>>,
}

impl InMemoryTransport {
    /// Create a new (empty) `InMemoryTransport`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Let the `n`-th upload (counting from 1, over the whole lifetime) and all later ones fail
    pub fn fail_uploads_from(&self, n: usize) {
        *self.fail_upload_at.write().unwrap() = Some(n);
    }

    /// Let all uploads succeed again
    pub fn heal(&self) {
        *self.fail_upload_at.write().unwrap() = None;
    }

    /// Cancel `token` during the `n`-th `transfer` (counting from 1, over the whole lifetime).
    /// The transfer itself succeeds.
    pub fn cancel_on(&self, transfer: Transfer, n: usize, token: CancelToken) {
        *self.cancel_at.write().unwrap() = Some((transfer, n, token));
    }

    fn transferred(&self, transfer: Transfer, attempt: usize) {
        if let Some((_, _, token)) = self
            .cancel_at
            .read()
            .unwrap()
            .as_ref()
            .filter(|(kind, n, _)| *kind == transfer && attempt >= *n)
        {
            token.cancel();
        }
    }

    /// Number of upload attempts so far
    pub fn upload_attempts(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Number of download attempts so far
    pub fn download_attempts(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Ids of all stored objects, volumes and metadata
    pub fn ids(&self) -> Vec<VolumeId> {
        self.volumes.read().unwrap().keys().copied().collect()
    }

    /// Ids of all stored volumes
    pub fn volume_ids(&self) -> Vec<VolumeId> {
        self.ids_where(|data| !is_meta(data))
    }

    /// Ids of all stored metadata objects
    pub fn meta_ids(&self) -> Vec<VolumeId> {
        self.ids_where(is_meta)
    }

    fn ids_where(&self, filter: impl Fn(&[u8]) -> bool) -> Vec<VolumeId> {
        self.volumes
            .read()
            .unwrap()
            .iter()
            .filter(|(_, data)| filter(data))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Total size of all stored volumes
    pub fn volume_bytes(&self) -> u64 {
        self.volumes
            .read()
            .unwrap()
            .values()
            .filter(|data| !is_meta(data))
            .map(|data| data.len() as u64)
            .sum()
    }

    /// Content of a stored volume
    pub fn get(&self, id: &VolumeId) -> Option<Bytes> {
        self.volumes.read().unwrap().get(id).cloned()
    }

    /// Replace the content of a volume, bypassing all checks
    pub fn put(&self, id: VolumeId, data: impl Into<Bytes>) {
        _ = self.volumes.write().unwrap().insert(id, data.into());
    }

    /// Flip all bits of one byte of a stored volume
    ///
    /// # Panics
    ///
    /// If the volume does not exist or is too short
    pub fn corrupt(&self, id: &VolumeId, offset: usize) {
        let mut volumes = self.volumes.write().unwrap();
        let data = volumes.get_mut(id).unwrap();
        let mut bytes = data.to_vec();
        bytes[offset] ^= 0xff;
        *data = bytes.into();
    }

    /// Remove a volume, bypassing the transport interface
    pub fn lose(&self, id: &VolumeId) -> Option<Bytes> {
        self.volumes.write().unwrap().remove(id)
    }
}

impl Transport for InMemoryTransport {
    fn location(&self) -> String {
        "memory".to_string()
    }

    fn list(&self) -> Result<Vec<(VolumeId, u64)>> {
        Ok(self
            .volumes
            .read()
            .unwrap()
            .iter()
            .map(|(id, data)| (*id, data.len() as u64))
            .collect())
    }

    fn upload(&self, id: &VolumeId, data: Bytes) -> Result<()> {
        let attempt = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .fail_upload_at
            .read()
            .unwrap()
            .is_some_and(|n| attempt >= n)
        {
            bail!("injected failure of upload {attempt}");
        }
        self.transferred(Transfer::Upload, attempt);
        let mut volumes = self.volumes.write().unwrap();
        match volumes.get(id) {
            Some(existing) if existing != &data => bail!("volume {id} exists with other content"),
            _ => {
                _ = volumes.insert(*id, data);
            }
        }
        Ok(())
    }

    fn download(&self, id: &VolumeId) -> Result<Bytes> {
        let attempt = self.downloads.fetch_add(1, Ordering::SeqCst) + 1;
        let data = self.get(id).ok_or_else(|| anyhow!("volume {id} does not exist"))?;
        self.transferred(Transfer::Download, attempt);
        Ok(data)
    }

    fn delete(&self, id: &VolumeId) -> Result<()> {
        _ = self.volumes.write().unwrap().remove(id);
        Ok(())
    }
}
