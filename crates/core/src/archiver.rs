pub(crate) mod file_archiver;
pub(crate) mod source;

use std::{path::PathBuf, sync::Arc};

use chrono::Local;
use log::{info, warn};
use rayon::{
    iter::{IntoParallelRefIterator, ParallelIterator},
    ThreadPoolBuilder,
};

use crate::{
    archiver::{
        file_archiver::{FileArchiver, FileOutcome},
        source::Scan,
    },
    block::{
        packer::VolumeFormat,
        repopacker::{FileWriterHandle, UploadMode, Uploads, VolumePacker},
        volume_sizer::FixedVolumeSizer,
    },
    cancel::CancelToken,
    chunker::BlockHasher,
    codec::BlockCodec,
    commands::backup::{BackupOptions, RunPhase},
    crypto::CryptoKey,
    error::{CommandErrorKind, VaultErrorKind},
    index::{
        catalog::VolumeCatalog,
        dedup::DedupIndex,
        fileset::{FilesetIndex, RunHandle},
    },
    progress::Progress,
    repofile::{metafile, ConfigFile, FilesetSummary, FilesetVersion},
    transport::Transport,
    VaultResult,
};

/// The `Archiver` drives one backup run.
///
/// It walks the sources, hashes files in parallel, packs and uploads novel
/// blocks and finally commits the run as a new fileset. Files whose size and
/// modification time match the latest fileset are not read again. If anything fails,
/// reservations of the run are rolled back and its volumes are deleted again.
#[allow(missing_debug_implementations)]
pub(crate) struct Archiver<'a, C: CryptoKey> {
    transport: &'a Arc<dyn Transport>,
    dedup: &'a Arc<DedupIndex>,
    filesets: &'a FilesetIndex,
    catalog: &'a VolumeCatalog,
    config: &'a ConfigFile,
    codec: BlockCodec<C>,
    cancel: CancelToken,
    threads: usize,
    force: bool,
    phase: RunPhase,
}

impl<'a, C: CryptoKey> Archiver<'a, C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: &'a Arc<dyn Transport>,
        dedup: &'a Arc<DedupIndex>,
        filesets: &'a FilesetIndex,
        catalog: &'a VolumeCatalog,
        config: &'a ConfigFile,
        codec: BlockCodec<C>,
        cancel: CancelToken,
        opts: &BackupOptions,
    ) -> Self {
        Self {
            transport,
            dedup,
            filesets,
            catalog,
            config,
            codec,
            cancel,
            threads: opts.threads,
            force: opts.force,
            phase: RunPhase::Scanning,
        }
    }

    fn enter(&mut self, run: &RunHandle, phase: RunPhase) {
        info!("run {}: {} -> {phase}", run.id(), self.phase);
        self.phase = phase;
    }

    /// Archives the given sources.
    ///
    /// # Errors
    ///
    /// * [`CommandErrorKind::NoSources`] - If `sources` is empty
    /// * [`CommandErrorKind::Cancelled`] - If the run was cancelled
    /// * If a volume could not be uploaded
    /// * If the run could not be committed
    ///
    /// # Returns
    ///
    /// The version of the new fileset
    pub(crate) fn archive(mut self, sources: &[PathBuf], p: &Progress) -> VaultResult<FilesetVersion> {
        let run = self.filesets.begin_run()?;
        let uploads = Uploads::default();

        match self.run(&run, &uploads, sources, p) {
            Ok(version) => {
                self.enter(&run, RunPhase::Done);
                p.finish();
                Ok(version)
            }
            Err(err) => {
                self.enter(&run, RunPhase::Failed);
                warn!("run {} failed: {err}", run.id());
                let released = self.dedup.rollback(run.id());
                for volume in uploads.take() {
                    if let Err(err) = self.transport.delete(&volume.id) {
                        warn!("could not delete volume {} of failed run: {err}", volume.id);
                    }
                }
                if let Err(err) = self.filesets.abort_run(&run) {
                    warn!("could not abort run {}: {err}", run.id());
                }
                info!("rolled back {released} reservations of run {}", run.id());
                Err(err)
            }
        }
    }

    fn run(
        &mut self,
        run: &RunHandle,
        uploads: &Uploads,
        sources: &[PathBuf],
        p: &Progress,
    ) -> VaultResult<FilesetVersion> {
        let scan = source::scan(sources)?;
        p.set_length(scan.total_size());
        let Scan { files, skipped } = scan;
        for (name, reason) in skipped {
            self.filesets.record_skipped(run, name, reason)?;
        }

        self.enter(run, RunPhase::Hashing);
        let format = VolumeFormat {
            compression: self.codec.compression(),
            encryption: C::KIND,
            block_size: self.config.block_size,
        };
        let packer = VolumePacker::new(
            self.codec,
            format,
            FixedVolumeSizer::from_config(self.config),
            FileWriterHandle::new(
                self.transport.clone(),
                self.dedup.clone(),
                uploads.clone(),
                UploadMode::Commit,
                self.cancel.clone(),
            ),
            self.config.extra_verify(),
        );
        let hasher = BlockHasher::new(self.config.block_size as usize);
        let parent = if self.force {
            None
        } else {
            self.filesets.latest()
        };
        if let Some(parent) = &parent {
            info!("using fileset {} as parent", parent.version);
        }
        let file_archiver = FileArchiver::new(
            hasher,
            self.dedup,
            &packer,
            parent.as_deref(),
            run.id(),
            &self.cancel,
        );

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(CommandErrorKind::FromRayonError)?;
        let filesets = self.filesets;
        let cancel = &self.cancel;
        let hashed = pool.install(|| {
            files.par_iter().try_for_each(|entry| -> VaultResult<()> {
                cancel.check()?;
                match file_archiver.process(entry, p)? {
                    FileOutcome::Stored { meta, content } => {
                        filesets.record_file(run, entry.name.clone(), meta, content)
                    }
                    FileOutcome::Skipped(reason) => {
                        warn!("skipping {}: {reason}", entry.path.display());
                        filesets.record_skipped(run, entry.name.clone(), reason)
                    }
                }
            })
        });
        let (blocks_processed, blocks_new, files_unchanged) = file_archiver.stats();
        drop(file_archiver);

        if let Err(err) = hashed {
            // a stopped packer only reports a closed channel, the uploader knows why
            return Err(match packer.abort() {
                Err(packer_err) if matches!(err.kind(), VaultErrorKind::Channel(_)) => packer_err,
                _ => err,
            });
        }

        self.enter(run, RunPhase::Sealing);
        let stats = packer.finalize()?;

        self.enter(run, RunPhase::Committing);
        self.cancel.check()?;
        let mut summary = FilesetSummary {
            blocks_processed,
            blocks_new,
            files_unchanged,
            backup_start: run.started(),
            ..Default::default()
        };
        stats.apply(&mut summary);
        summary.finalize(Local::now());

        let (transport, codec, cancel) = (self.transport, &self.codec, &self.cancel);
        let version = self.filesets.commit_run_with(
            run,
            self.dedup,
            sources.to_vec(),
            summary,
            |fileset| {
                cancel.check()?;
                metafile::save_file(&**transport, codec, fileset).map(Some)
            },
        )?;
        for volume in uploads.take() {
            self.catalog.register(volume);
        }
        Ok(version)
    }
}
