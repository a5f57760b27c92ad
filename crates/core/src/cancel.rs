//! Cooperative cancellation of long running operations.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{error::CommandErrorKind, VaultResult};

/// A flag shared between the caller and a running operation.
///
/// The operation checks the token between units of work (blocks, files and
/// volumes) and fails with [`ErrorCategory::Cancelled`](crate::ErrorCategory::Cancelled)
/// once it is set or its deadline passed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token which is only cancelled by [`CancelToken::cancel`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A token which additionally expires after `timeout`
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Request cancellation. All clones of this token observe it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested or the deadline passed
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Returns an error if the token is cancelled.
    ///
    /// # Errors
    ///
    /// * [`CommandErrorKind::Cancelled`] - If cancellation was requested or the deadline passed
    pub fn check(&self) -> VaultResult<()> {
        if self.is_cancelled() {
            return Err(CommandErrorKind::Cancelled.into());
        }
        Ok(())
    }
}
