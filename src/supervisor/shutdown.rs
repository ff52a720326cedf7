//! Graceful-then-forceful stop of one supervised service.

use std::time::Duration;

use log::{info, warn};
use tokio::process::Child;

use crate::process::signal::{Signal, SignalError, Signaller};

#[derive(Debug, Clone, Copy)]
pub struct ShutdownTimings {
    /// How long a service gets to exit after the graceful group signal.
    pub grace: Duration,
    /// How long to wait for the exit after the forceful group signal.
    pub force_wait: Duration,
}

impl Default for ShutdownTimings {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            force_wait: Duration::from_secs(5),
        }
    }
}

/// How a service ended up stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Had already exited before shutdown reached it.
    AlreadyExited(Option<i32>),
    /// Exited within the grace interval after the graceful signal.
    Graceful,
    /// Needed the forceful signal.
    Forced,
    /// Still not reaped after the forceful signal.
    Unresponsive,
}

/// Stop the process group led by `child`.
///
/// 1. graceful signal to the whole group
/// 2. wait up to `timings.grace` for the leader to exit
/// 3. forceful signal to the whole group
/// 4. wait up to `timings.force_wait`
///
/// The returned [`StopKind`] describes the leader. Once the leader is gone,
/// members that outlived it (e.g. ones ignoring SIGTERM) get SIGKILL.
pub async fn stop_group(
    name: &str,
    child: &mut Child,
    signaller: &dyn Signaller,
    timings: ShutdownTimings,
) -> StopKind {
    if let Ok(Some(status)) = child.try_wait() {
        return StopKind::AlreadyExited(status.code());
    }
    let Some(pgid) = child.id() else {
        return StopKind::AlreadyExited(None);
    };

    send_group(name, pgid, signaller, Signal::Graceful);
    let start = tokio::time::Instant::now();
    match tokio::time::timeout(timings.grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(
                "{name} exited gracefully in {:.2}s: {status}",
                start.elapsed().as_secs_f64()
            );
            sweep_group(name, pgid, signaller);
            return StopKind::Graceful;
        }
        Ok(Err(e)) => warn!("Graceful wait error for {name}: {e}"),
        Err(_) => warn!(
            "{name} graceful shutdown timeout ({:?}), escalating to SIGKILL",
            timings.grace
        ),
    }

    send_group(name, pgid, signaller, Signal::Forceful);
    match tokio::time::timeout(timings.force_wait, child.wait()).await {
        Ok(Ok(status)) => {
            info!("{name} terminated by SIGKILL: {status}");
            sweep_group(name, pgid, signaller);
            StopKind::Forced
        }
        Ok(Err(e)) => {
            warn!("SIGKILL wait failed for {name}: {e}");
            StopKind::Unresponsive
        }
        Err(_) => {
            warn!(
                "{name} did not respond to SIGKILL after {:?} (PID: {pgid})",
                timings.force_wait
            );
            StopKind::Unresponsive
        }
    }
}

/// SIGKILL whatever is left of the group; an empty group answers ESRCH.
fn sweep_group(name: &str, pgid: u32, signaller: &dyn Signaller) {
    match signaller.signal_group(pgid, Signal::Forceful) {
        Ok(()) => log::debug!("Swept leftover members of {name} (process group {pgid})"),
        Err(SignalError::NoSuchProcess) => {}
        Err(e) => warn!("Failed to sweep {name} (process group {pgid}): {e}"),
    }
}

fn send_group(name: &str, pgid: u32, signaller: &dyn Signaller, signal: Signal) {
    match signaller.signal_group(pgid, signal) {
        Ok(()) => info!("Sent {signal} to {name} (process group {pgid})"),
        Err(SignalError::NoSuchProcess) => {
            log::debug!("{name} process group {pgid} already gone before {signal}");
        }
        Err(e) => warn!("Failed {signal} to {name} (process group {pgid}): {e}"),
    }
}
