//! Reporting the progress of long running operations.
//!
//! Operations announce each phase through [`ProgressBars`] and advance the
//! returned [`Progress`] from their worker threads. The default,
//! [`NoProgressBars`], only logs the phases.

use std::sync::Arc;

use log::{debug, info};

/// Handle to the report of one phase. Clones advance the same report.
#[derive(Debug, Clone)]
pub struct Progress(Arc<dyn VaultProgress>);

impl Progress {
    /// Wrap a report
    pub fn new<P: VaultProgress>(p: P) -> Self {
        Self(Arc::new(p))
    }

    /// Set the total, in files, volumes or bytes depending on the [`ProgressType`]
    pub fn set_length(&self, len: u64) {
        self.0.set_length(len);
    }

    /// Advance by `inc`
    pub fn inc(&self, inc: u64) {
        self.0.inc(inc);
    }

    /// End the phase
    pub fn finish(&self) {
        self.0.finish();
    }
}

/// Receives the progress of one phase. Implement it to display progress to users.
pub trait VaultProgress: Send + Sync + 'static + std::fmt::Debug {
    /// The total is known
    fn set_length(&self, len: u64);

    /// Some work is done
    fn inc(&self, inc: u64);

    /// The phase ended
    fn finish(&self);
}

/// What a progress counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressType {
    /// Nothing, the phase is only started and finished
    Spinner,
    /// Items such as filesets or volumes
    Counter,
    /// Bytes of file content
    Bytes,
}

/// Factory for the progress reports of a [`Repository`](crate::Repository).
pub trait ProgressBars: std::fmt::Debug + Send + Sync + 'static {
    /// Start the report of a phase named `prefix`
    fn progress(&self, progress_type: ProgressType, prefix: &str) -> Progress;

    /// Start a [`ProgressType::Spinner`]
    fn progress_spinner(&self, prefix: &str) -> Progress {
        self.progress(ProgressType::Spinner, prefix)
    }

    /// Start a [`ProgressType::Counter`]
    fn progress_counter(&self, prefix: &str) -> Progress {
        self.progress(ProgressType::Counter, prefix)
    }

    /// Start a [`ProgressType::Bytes`]
    fn progress_bytes(&self, prefix: &str) -> Progress {
        self.progress(ProgressType::Bytes, prefix)
    }
}

/// Logs the end of a phase, nothing else.
#[derive(Clone, Copy, Debug)]
pub struct NoProgress;

impl VaultProgress for NoProgress {
    fn set_length(&self, _len: u64) {}
    fn inc(&self, _inc: u64) {}
    fn finish(&self) {
        debug!("finished.");
    }
}

/// Logs the start of every phase instead of showing progress bars.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgressBars;

impl ProgressBars for NoProgressBars {
    fn progress(&self, _progress_type: ProgressType, prefix: &str) -> Progress {
        info!("{prefix}");
        Progress::new(NoProgress)
    }
}
