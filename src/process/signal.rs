//! Graceful/forceful termination signals for single PIDs and process groups.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal as NixSignal};
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Catchable termination request (SIGTERM).
    Graceful,
    /// Non-catchable termination (SIGKILL).
    Forceful,
}

impl Signal {
    fn as_nix(self) -> NixSignal {
        match self {
            Signal::Graceful => NixSignal::SIGTERM,
            Signal::Forceful => NixSignal::SIGKILL,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Graceful => f.write_str("SIGTERM"),
            Signal::Forceful => f.write_str("SIGKILL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("no such process")]
    NoSuchProcess,
    #[error("permission denied")]
    PermissionDenied,
    #[error("signal delivery failed: {0}")]
    Os(Errno),
}

impl From<Errno> for SignalError {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::ESRCH => SignalError::NoSuchProcess,
            Errno::EPERM => SignalError::PermissionDenied,
            other => SignalError::Os(other),
        }
    }
}

/// Delivers termination signals.
pub trait Signaller: Send + Sync {
    fn signal_pid(&self, pid: u32, signal: Signal) -> Result<(), SignalError>;

    /// Signal every member of the process group led by `pgid`.
    fn signal_group(&self, pgid: u32, signal: Signal) -> Result<(), SignalError>;
}

/// Real signal delivery through `kill(2)` / `killpg(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NixSignaller;

impl Signaller for NixSignaller {
    fn signal_pid(&self, pid: u32, signal: Signal) -> Result<(), SignalError> {
        let pid = to_nix_pid(pid)?;
        signal::kill(pid, signal.as_nix()).map_err(SignalError::from)
    }

    fn signal_group(&self, pgid: u32, signal: Signal) -> Result<(), SignalError> {
        let pgid = to_nix_pid(pgid)?;
        signal::killpg(pgid, signal.as_nix()).map_err(SignalError::from)
    }
}

// pid 0 and values past i32::MAX would address the caller's own group or every process
fn to_nix_pid(pid: u32) -> Result<Pid, SignalError> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(SignalError::NoSuchProcess),
    }
}
