use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use tracing::{debug, warn};

use crate::error::{Result, SuperviseError};

/// Scoped SIGCHLD block for the supervision window.
///
/// SIGCHLD is blocked before the fixture is forked so that a child-exit
/// notification arriving between fork and waitpid becomes pending instead of
/// being dropped. The pre-block mask is captured here and reinstated either
/// explicitly via [`restore`](SignalGuard::restore) (happy path, after reap)
/// or by `Drop` when an error abandons the sequence, so no exit path leaves
/// the process with SIGCHLD blocked.
///
/// `pthread_sigmask` affects only the calling thread, which is the one
/// thread the supervision sequence runs on.
#[derive(Debug)]
pub struct SignalGuard {
    saved: SigSet,
    restored: bool,
}

impl SignalGuard {
    /// Blocks SIGCHLD and captures the previously active mask.
    pub fn block_sigchld() -> Result<Self> {
        let mut block = SigSet::empty();
        block.add(Signal::SIGCHLD);

        let mut saved = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&block), Some(&mut saved))
            .map_err(SuperviseError::SignalMask)?;

        debug!("blocked SIGCHLD for supervision window");
        Ok(Self {
            saved,
            restored: false,
        })
    }

    /// The mask that was active before SIGCHLD was blocked. Passed into the
    /// fixture child so it execs with the caller's original disposition, not
    /// the supervisor's blocked one.
    pub fn saved_mask(&self) -> SigSet {
        self.saved
    }

    /// Reinstates the saved mask, consuming the guard. Preferred over the
    /// `Drop` path where the result can still be reported.
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.saved), None)
            .map_err(SuperviseError::SignalMask)?;
        debug!("restored pre-supervision signal mask");
        Ok(())
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if !self.restored {
            if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.saved), None) {
                warn!("failed to restore signal mask during cleanup: {}", e);
            }
        }
    }
}
