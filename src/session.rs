//! The explicit context handed to every supervisor and reaper call.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::port::{LocalPortProbe, PortProbe, PortWaiter};
use crate::process::reaper::{ProcessReaper, ReaperTimings};
use crate::process::{NixSignaller, ProcessMatcher, Signaller};
use crate::prompt::{InteractivePrompter, Prompter};
use crate::supervisor::output::LineSink;
use crate::supervisor::shutdown::ShutdownTimings;

#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub reaper: ReaperTimings,
    pub shutdown: ShutdownTimings,
    pub port_poll: Duration,
    /// Interval between two liveness polls during supervision.
    pub liveness_poll: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            reaper: ReaperTimings::default(),
            shutdown: ShutdownTimings::default(),
            port_poll: crate::port::DEFAULT_POLL_INTERVAL,
            liveness_poll: Duration::from_millis(500),
        }
    }
}

/// Everything one orchestrator invocation works with.
///
/// There is no process-wide registry: whoever holds the session owns the
/// collaborators, and the supervisor owns the children it launches.
pub struct Session {
    pub matcher: ProcessMatcher,
    pub signaller: Arc<dyn Signaller>,
    pub ports: PortWaiter,
    pub prompter: Arc<dyn Prompter>,
    pub sink: Arc<dyn LineSink>,
    pub timings: SessionTimings,
}

impl Session {
    /// Session wired to the real OS collaborators.
    pub fn new(matcher: ProcessMatcher, sink: Arc<dyn LineSink>, timings: SessionTimings) -> Self {
        Self {
            matcher,
            signaller: Arc::new(NixSignaller),
            ports: PortWaiter::new(Arc::new(LocalPortProbe), timings.port_poll),
            prompter: Arc::new(InteractivePrompter),
            sink,
            timings,
        }
    }

    #[must_use]
    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    #[must_use]
    pub fn with_signaller(mut self, signaller: Arc<dyn Signaller>) -> Self {
        self.signaller = signaller;
        self
    }

    #[must_use]
    pub fn with_port_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.ports = PortWaiter::new(probe, self.timings.port_poll);
        self
    }

    pub fn reaper(&self) -> ProcessReaper<'_> {
        ProcessReaper::new(&self.matcher, self.signaller.as_ref(), self.timings.reaper)
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM.
///
/// This is the single cancellation channel for a supervision session.
pub fn install_signal_handlers(token: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
        anyhow::anyhow!("Failed to register SIGINT handler: {e}. Signal handling is required for supervision.")
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
        anyhow::anyhow!("Failed to register SIGTERM handler: {e}. Signal handling is required for supervision.")
    })?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => log::info!("signal SIGINT – orderly shutdown"),
            _ = sigterm.recv() => log::info!("signal SIGTERM – orderly shutdown"),
        }
        token.cancel();
    });
    Ok(())
}
