use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};
use pariter::{scope, IteratorExt};

use crate::{
    block::{
        packer::{Packer, PackerStats, SealedVolume, VolumeFormat},
        volume_sizer::{FixedVolumeSizer, VolumeSizer},
        BlockId, VolumeLocation,
    },
    cancel::CancelToken,
    codec::BlockCodec,
    crypto::CryptoKey,
    error::{MultiprocessingErrorKind, PackerErrorKind},
    index::dedup::DedupIndex,
    repofile::indexfile::{IndexBlock, IndexVolume},
    transport::Transport,
    VaultResult,
};

/// The volumes uploaded by a packer, in upload order.
#[derive(Debug, Clone, Default)]
pub(crate) struct Uploads(Arc<Mutex<Vec<IndexVolume>>>);

impl Uploads {
    fn push(&self, volume: IndexVolume) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(volume);
    }

    /// Takes all uploaded volumes collected so far
    pub(crate) fn take(&self) -> Vec<IndexVolume> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// What to do with the dedup index once a volume is uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UploadMode {
    /// The blocks are new and were reserved by the current run
    Commit,
    /// The blocks already exist and move to the new volume
    Relocate,
}

/// Uploads sealed volumes and records the locations of their blocks.
#[derive(Clone)]
pub(crate) struct FileWriterHandle {
    transport: Arc<dyn Transport>,
    dedup: Arc<DedupIndex>,
    uploads: Uploads,
    mode: UploadMode,
    cancel: CancelToken,
}

impl FileWriterHandle {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        dedup: Arc<DedupIndex>,
        uploads: Uploads,
        mode: UploadMode,
        cancel: CancelToken,
    ) -> Self {
        Self {
            transport,
            dedup,
            uploads,
            mode,
            cancel,
        }
    }

    fn process(&self, volume: SealedVolume) -> VaultResult<IndexVolume> {
        self.cancel.check()?;
        let SealedVolume { data, index } = volume;
        let id = index.id;
        self.transport
            .upload(&id, data)
            .map_err(|error| PackerErrorKind::UploadFailed { volume: id, error })?;
        debug!("uploaded volume {id} to {}", self.transport.location());
        // recorded before indexing, so a failure below still knows what to clean up
        self.uploads.push(index.clone());
        Ok(index)
    }

    fn index(&self, index: &IndexVolume) -> VaultResult<()> {
        for block in &index.blocks {
            let location = VolumeLocation::new(index.id, block);
            match self.mode {
                UploadMode::Commit => self.dedup.commit(&block.id, location)?,
                UploadMode::Relocate => self.dedup.relocate(&block.id, location)?,
            }
        }
        Ok(())
    }
}

/// Background thread feeding sealed volumes to a [`FileWriterHandle`].
#[derive(Clone)]
pub(crate) struct Actor {
    sender: Sender<SealedVolume>,
    finish: Receiver<VaultResult<()>>,
}

impl Actor {
    /// Creates a new `Actor`.
    ///
    /// # Arguments
    ///
    /// * `fwh` - The file writer handle.
    /// * `queue_len` - The number of sealed volumes which may wait for upload.
    fn new(fwh: FileWriterHandle, queue_len: usize) -> Self {
        let (tx, rx) = bounded(queue_len);
        let (finish_tx, finish_rx) = bounded::<VaultResult<()>>(0);

        let _join_handle = std::thread::spawn(move || {
            let status = scope(|scope| {
                rx.into_iter()
                    .readahead_scoped(scope)
                    .map(|volume| fwh.process(volume))
                    .try_for_each(|index| fwh.index(&index?))
            })
            .unwrap_or_else(|_| Err(MultiprocessingErrorKind::WorkerPanicked("file writer").into()));
            _ = finish_tx.send(status);
        });

        Self {
            sender: tx,
            finish: finish_rx,
        }
    }

    /// Sends a sealed volume to the actor.
    ///
    /// # Errors
    ///
    /// * [`MultiprocessingErrorKind::ReceiverDropped`] - If the actor already stopped
    fn send(&self, volume: SealedVolume) -> VaultResult<()> {
        self.sender
            .send(volume)
            .map_err(|_| MultiprocessingErrorKind::ReceiverDropped)?;
        Ok(())
    }

    /// Waits until all volumes are uploaded
    fn finalize(self) -> VaultResult<()> {
        drop(self.sender);
        self.finish
            .recv()
            .map_err(|_| MultiprocessingErrorKind::WorkerPanicked("file writer"))?
    }
}

/// The `VolumePacker` turns blocks into uploaded volumes.
///
/// Blocks are encoded in parallel, packed in arrival order and sealed volumes
/// are uploaded by a background [`Actor`]. Callers must have reserved each
/// block in the dedup index before adding it.
#[allow(missing_debug_implementations)]
pub(crate) struct VolumePacker {
    file_writer: Actor,
    sender: Sender<(Vec<u8>, BlockId)>,
    finish: Receiver<VaultResult<PackerStats>>,
    aborted: Arc<AtomicBool>,
}

impl VolumePacker {
    /// Creates a new `VolumePacker` and starts its threads.
    ///
    /// # Arguments
    ///
    /// * `codec` - Encodes the blocks
    /// * `format` - The format of the volumes
    /// * `sizer` - Decides when a volume is full
    /// * `fwh` - Uploads the volumes
    /// * `extra_verify` - Decode every encoded block again and compare it to the input
    pub(crate) fn new<C: CryptoKey, S: VolumeSizer + Send + 'static>(
        codec: BlockCodec<C>,
        format: VolumeFormat,
        sizer: S,
        fwh: FileWriterHandle,
        extra_verify: bool,
    ) -> Self {
        let file_writer = Actor::new(fwh, 1);
        let (tx, rx) = bounded::<(Vec<u8>, BlockId)>(0);
        let (finish_tx, finish_rx) = bounded::<VaultResult<PackerStats>>(0);
        let aborted = Arc::new(AtomicBool::new(false));

        let writer = file_writer.clone();
        let stop = aborted.clone();
        let _join_handle = std::thread::spawn(move || {
            let mut packer = Packer::new(format, sizer);
            let status = scope(|scope| {
                rx.into_iter()
                    .readahead_scoped(scope)
                    .parallel_map_scoped(scope, |(data, id): (Vec<u8>, BlockId)| -> VaultResult<_> {
                        let (encoded, uncompressed_length) = codec.encode(&data)?;
                        if extra_verify && codec.decode(&encoded, uncompressed_length)? != data {
                            return Err(PackerErrorKind::ExtraVerificationFailed(id).into());
                        }
                        Ok((encoded, id, data.len() as u64, uncompressed_length))
                    })
                    .readahead_scoped(scope)
                    .try_for_each(|item: VaultResult<_>| -> VaultResult<()> {
                        let (data, id, data_len, ul) = item?;
                        packer.add(&data, &id, data_len, ul)?;
                        if let Some(volume) = packer.save_if_needed()? {
                            writer.send(volume)?;
                        }
                        Ok(())
                    })
            })
            .unwrap_or_else(|_| {
                Err(MultiprocessingErrorKind::WorkerPanicked("volume packer").into())
            })
            .and_then(|()| {
                if stop.load(Ordering::SeqCst) {
                    return Ok(packer.stats);
                }
                let (rest, stats) = packer.finalize()?;
                if let Some(volume) = rest {
                    writer.send(volume)?;
                }
                Ok(stats)
            });
            drop(writer);
            _ = finish_tx.send(status);
        });

        Self {
            file_writer,
            sender: tx,
            finish: finish_rx,
            aborted,
        }
    }

    /// Adds a reserved block
    ///
    /// # Errors
    ///
    /// * [`MultiprocessingErrorKind::ReceiverDropped`] - If the packer stopped after an error
    pub(crate) fn add(&self, data: Vec<u8>, id: BlockId) -> VaultResult<()> {
        self.sender
            .send((data, id))
            .map_err(|_| MultiprocessingErrorKind::ReceiverDropped)?;
        Ok(())
    }

    fn wait(self) -> (VaultResult<PackerStats>, VaultResult<()>) {
        drop(self.sender);
        let res = match self.finish.recv() {
            Ok(res) => res,
            Err(_) => Err(MultiprocessingErrorKind::WorkerPanicked("volume packer").into()),
        };
        let written = self.file_writer.finalize();
        (res, written)
    }

    /// Seals the open volume and waits until all volumes are uploaded
    ///
    /// # Errors
    ///
    /// * [`PackerErrorKind::UploadFailed`] - If a volume could not be uploaded
    /// * If a block could not be encoded
    pub(crate) fn finalize(self) -> VaultResult<PackerStats> {
        let (res, written) = self.wait();
        // an upload error is the root cause of a stopped packer
        written?;
        res
    }

    /// Stops the packer without sealing the open volume.
    ///
    /// Volumes sealed before are still uploaded.
    ///
    /// # Errors
    ///
    /// The first error of the packer or the uploader, if any.
    pub(crate) fn abort(self) -> VaultResult<()> {
        self.aborted.store(true, Ordering::SeqCst);
        let (res, written) = self.wait();
        written?;
        _ = res?;
        Ok(())
    }
}

/// The `Repacker` copies encoded blocks into new volumes without decoding them.
#[allow(missing_debug_implementations)]
pub(crate) struct Repacker {
    packer: Packer<FixedVolumeSizer>,
    file_writer: Actor,
}

impl Repacker {
    /// Creates a new `Repacker`; `fwh` should use [`UploadMode::Relocate`].
    pub(crate) fn new(format: VolumeFormat, sizer: FixedVolumeSizer, fwh: FileWriterHandle) -> Self {
        Self {
            packer: Packer::new(format, sizer),
            file_writer: Actor::new(fwh, 1),
        }
    }

    /// Adds an encoded block read from another volume
    ///
    /// # Errors
    ///
    /// * If the block does not fit into a volume
    /// * If the uploader stopped after an error
    pub(crate) fn add_raw(&mut self, data: &[u8], block: &IndexBlock) -> VaultResult<()> {
        let data_len = block
            .uncompressed_length
            .map_or(u64::from(block.length), |len| u64::from(len.get()));
        self.packer
            .add(data, &block.id, data_len, block.uncompressed_length)?;
        if let Some(volume) = self.packer.save_if_needed()? {
            self.file_writer.send(volume)?;
        }
        Ok(())
    }

    /// Seals the open volume and waits until all volumes are uploaded
    ///
    /// # Errors
    ///
    /// * [`PackerErrorKind::UploadFailed`] - If a volume could not be uploaded
    pub(crate) fn finalize(self) -> VaultResult<PackerStats> {
        let (rest, stats) = self.packer.finalize()?;
        let sent = rest.map_or(Ok(()), |volume| self.file_writer.send(volume));
        let written = self.file_writer.finalize();
        if let Err(err) = &sent {
            warn!("repacker stopped early: {err}");
        }
        written?;
        sent?;
        Ok(stats)
    }
}
