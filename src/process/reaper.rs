//! Two-phase termination of every managed process.
//!
//! Phase 1 sends the graceful signal to everything the matcher finds, phase 2
//! sends the forceful signal to whatever a fresh scan still finds. Each phase
//! acts on a new snapshot, never on the PIDs collected earlier.

use std::time::Duration;

use log::{info, warn};

use super::signal::{Signal, SignalError, Signaller};
use super::{ManagedProcess, ProcessMatcher};

/// Default pause after the graceful signal.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);
/// Default pause after the forceful signal.
pub const DEFAULT_FORCE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct ReaperTimings {
    pub grace: Duration,
    pub force_wait: Duration,
}

impl Default for ReaperTimings {
    fn default() -> Self {
        Self {
            grace: DEFAULT_GRACE,
            force_wait: DEFAULT_FORCE_WAIT,
        }
    }
}

/// Outcome of one [`ProcessReaper::reap`] call.
#[derive(Debug, Clone, Default)]
pub struct ReapReport {
    /// Managed processes found by the first scan.
    pub found: Vec<ManagedProcess>,
    /// Survivors of the graceful phase that were sent the forceful signal.
    pub forced: Vec<ManagedProcess>,
    /// PIDs the OS refused to signal.
    pub permission_denied: Vec<u32>,
    /// Managed processes still present in the final scan.
    pub remaining: Vec<ManagedProcess>,
}

impl ReapReport {
    /// True if and only if no managed process remains.
    pub fn is_clean(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Nothing was running to begin with.
    pub fn was_noop(&self) -> bool {
        self.found.is_empty()
    }
}

pub struct ProcessReaper<'a> {
    matcher: &'a ProcessMatcher,
    signaller: &'a dyn Signaller,
    timings: ReaperTimings,
}

impl<'a> ProcessReaper<'a> {
    pub fn new(matcher: &'a ProcessMatcher, signaller: &'a dyn Signaller, timings: ReaperTimings) -> Self {
        Self {
            matcher,
            signaller,
            timings,
        }
    }

    pub async fn reap(&self) -> ReapReport {
        let mut report = ReapReport {
            found: self.matcher.find_managed(),
            ..ReapReport::default()
        };
        if report.found.is_empty() {
            info!("No managed processes running");
            return report;
        }

        info!("Sending SIGTERM to {} managed process(es)", report.found.len());
        self.signal_all(&report.found, Signal::Graceful, &mut report.permission_denied);
        tokio::time::sleep(self.timings.grace).await;

        let survivors = self.matcher.find_managed();
        if !survivors.is_empty() {
            warn!("{} process(es) still alive, sending SIGKILL", survivors.len());
            self.signal_all(&survivors, Signal::Forceful, &mut report.permission_denied);
            report.forced = survivors;
            tokio::time::sleep(self.timings.force_wait).await;
        }

        report.remaining = self.matcher.find_managed();
        if report.is_clean() {
            info!("All managed processes terminated");
        } else {
            warn!(
                "{} process(es) could not be terminated (owned by another user?)",
                report.remaining.len()
            );
        }
        report
    }

    fn signal_all(&self, targets: &[ManagedProcess], signal: Signal, denied: &mut Vec<u32>) {
        for process in targets {
            match self.signaller.signal_pid(process.pid, signal) {
                Ok(()) => log::debug!("Sent {signal} to PID {}", process.pid),
                Err(SignalError::NoSuchProcess) => {
                    log::debug!("PID {} already gone before {signal}", process.pid);
                }
                Err(SignalError::PermissionDenied) => {
                    warn!("No permission to signal PID {} (owned by another user)", process.pid);
                    if !denied.contains(&process.pid) {
                        denied.push(process.pid);
                    }
                }
                Err(e) => warn!("Failed to send {signal} to PID {}: {e}", process.pid),
            }
        }
    }
}
