use std::time::Duration;

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

use crate::supervisor::ExitStatus;

/// Everything that can end a supervision run early. None of these are
/// retried; the signal-mask guard restores before any of them surface.
#[derive(Error, Debug)]
pub enum SuperviseError {
    #[error("invalid fixture command: {0}")]
    InvalidCommand(String),

    #[error("failed to create fixture process: {0}")]
    LaunchFailed(Errno),

    #[error("failed to adjust signal mask: {0}")]
    SignalMask(Errno),

    #[error("could not deliver SIGTERM to fixture: {0}")]
    SignalDelivery(Errno),

    #[error("waiting for fixture failed: {0}")]
    WaitFailed(Errno),

    #[error("reaped pid {actual} but expected pid {expected}")]
    ReapMismatch { expected: Pid, actual: Pid },

    #[error("fixture did not exit within {0:?} of SIGTERM; leaving it unreaped")]
    ReapTimeout(Duration),

    #[error("fixture exited uncleanly: {0}")]
    UncleanExit(ExitStatus),
}

pub type Result<T> = std::result::Result<T, SuperviseError>;
