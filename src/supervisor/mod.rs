//! Launch, watch and tear down the services of one session.
//!
//! The environment is all or none: launching stops at the first precondition
//! failure, and once supervision runs, the first service to exit on its own
//! takes every sibling down with it.

pub mod output;
pub mod shutdown;

use std::collections::BTreeMap;
use std::io::PipeReader;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;
use crate::prompt::ask;
use crate::session::Session;
use output::{spawn_multiplexer, spawn_reader};
use shutdown::{StopKind, stop_group};

/// Upper bound on waiting for buffered output after the children are gone.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// One service to launch, fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    /// Added on top of the orchestrator's own environment.
    pub env: BTreeMap<String, String>,
    pub readiness_port: u16,
    pub readiness_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    NotStarted,
    Launching,
    /// Readiness port was bound within the readiness timeout.
    Ready,
    /// Readiness timeout elapsed; the service keeps running unconfirmed.
    Unconfirmed,
    Exited(Option<i32>),
}

/// A launched child owned by the supervisor.
struct RunningService {
    name: Arc<str>,
    pid: Option<u32>,
    child: Child,
    state: ServiceState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Operator asked for shutdown.
    Cancelled,
    /// A service exited on its own; its siblings were shut down.
    ServiceExited { service: String, code: Option<i32> },
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub outcome: SessionOutcome,
    /// How each service was stopped, in launch order.
    pub stops: Vec<(String, StopKind)>,
}

impl SessionSummary {
    /// 0 for operator shutdown, 1 when a service died and took the session down.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            SessionOutcome::Cancelled => 0,
            SessionOutcome::ServiceExited { .. } => 1,
        }
    }
}

pub struct ServiceSupervisor<'a> {
    session: &'a Session,
    cancel: CancellationToken,
}

impl<'a> ServiceSupervisor<'a> {
    pub fn new(session: &'a Session, cancel: CancellationToken) -> Self {
        Self { session, cancel }
    }

    /// Launch every spec and supervise until shutdown.
    pub async fn run(&self, specs: Vec<ServiceSpec>) -> Result<SessionSummary, OrchestratorError> {
        let group = self.launch(specs).await?;
        Ok(group.supervise().await)
    }

    /// Offer to reap managed processes left over from an earlier session.
    pub async fn offer_stale_cleanup(&self) {
        let stale = self.session.matcher.find_managed();
        if stale.is_empty() {
            return;
        }
        warn!("Found {} existing managed process(es)", stale.len());
        for process in &stale {
            info!("  PID {}: {}", process.pid, process.display_line(100));
        }
        if ask(&self.session.prompter, "Kill them before starting?", true).await {
            let report = self.session.reaper().reap().await;
            if !report.is_clean() {
                warn!("{} stale process(es) survived", report.remaining.len());
            }
        }
    }

    /// Check every spec before anything is spawned.
    pub async fn check_preconditions(&self, specs: &[ServiceSpec]) -> Result<(), OrchestratorError> {
        for spec in specs {
            validate_spec(spec)?;
        }

        for spec in specs {
            let port = spec.readiness_port;
            if self.session.ports.is_port_free(port).await {
                continue;
            }
            warn!("Port {port} is already in use!");
            let question = format!("Port {port} needed by {} is in use. Kill the processes holding it?", spec.name);
            if !ask(&self.session.prompter, question, true).await {
                error!("Cannot start {}: port {port} occupied", spec.name);
                return Err(OrchestratorError::PortOccupied {
                    service: spec.name.clone(),
                    port,
                });
            }
            let freed = self
                .session
                .ports
                .reclaim(port, self.session.signaller.as_ref(), self.session.timings.reaper)
                .await;
            if !freed {
                error!("Port {port} is still in use after cleanup");
                return Err(OrchestratorError::PortOccupied {
                    service: spec.name.clone(),
                    port,
                });
            }
            info!("Port {port} freed");
        }
        Ok(())
    }

    /// Spawn the services in order, waiting for each readiness port in turn.
    pub async fn launch(&self, specs: Vec<ServiceSpec>) -> Result<ServiceGroup<'a>, OrchestratorError> {
        self.check_preconditions(&specs).await?;

        let (tx, mux) = spawn_multiplexer(Arc::clone(&self.session.sink));
        let mut group = ServiceGroup {
            session: self.session,
            cancel: self.cancel.clone(),
            services: Vec::with_capacity(specs.len()),
            mux,
        };

        for (slot, spec) in specs.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Launch interrupted, skipping {} and later services", spec.name);
                break;
            }

            let (child, reader) = match spawn_service(spec) {
                Ok(spawned) => spawned,
                Err(source) => {
                    error!("Failed to spawn {}: {source}", spec.name);
                    drop(tx);
                    group.rollback().await;
                    return Err(OrchestratorError::Launch {
                        service: spec.name.clone(),
                        source,
                    });
                }
            };

            let name: Arc<str> = Arc::from(spec.name.as_str());
            let pid = child.id();
            info!(
                "{} started (PID: {})",
                spec.name,
                pid.map_or("unavailable".to_string(), |p| p.to_string())
            );
            spawn_reader(slot, Arc::clone(&name), reader, tx.clone());

            group.services.push(RunningService {
                name,
                pid,
                child,
                state: ServiceState::Launching,
            });
            let Some(service) = group.services.last_mut() else {
                break;
            };

            info!("Waiting for {} on port {}...", spec.name, spec.readiness_port);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Cancelled while waiting for {}", spec.name);
                }
                status = service.child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    error!("{} exited during startup (code {code:?})", spec.name);
                    service.state = ServiceState::Exited(code);
                    break;
                }
                bound = self.session.ports.wait_until_bound(spec.readiness_port, spec.readiness_timeout) => {
                    if bound {
                        info!("{} listening on port {}", spec.name, spec.readiness_port);
                        service.state = ServiceState::Ready;
                    } else {
                        warn!(
                            "{} not listening on port {} after {:?}; it may still be starting up",
                            spec.name, spec.readiness_port, spec.readiness_timeout
                        );
                        service.state = ServiceState::Unconfirmed;
                    }
                }
            }
        }

        drop(tx);
        Ok(group)
    }
}

/// Launched services of one session.
pub struct ServiceGroup<'a> {
    session: &'a Session,
    cancel: CancellationToken,
    services: Vec<RunningService>,
    mux: JoinHandle<()>,
}

impl ServiceGroup<'_> {
    pub fn states(&self) -> Vec<(String, ServiceState)> {
        self.services
            .iter()
            .map(|svc| (svc.name.to_string(), svc.state))
            .collect()
    }

    pub fn pids(&self) -> Vec<(String, Option<u32>)> {
        self.services
            .iter()
            .map(|svc| (svc.name.to_string(), svc.pid))
            .collect()
    }

    /// Poll liveness until cancellation or the first unexpected exit, then
    /// shut every remaining service down.
    pub async fn supervise(mut self) -> SessionSummary {
        let mut tick = tokio::time::interval(self.session.timings.liveness_poll);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Shutting down servers...");
                    break SessionOutcome::Cancelled;
                }
                _ = tick.tick() => {
                    if let Some((service, code)) = self.poll_exits() {
                        error!("{service} process exited with code {}", describe_code(code));
                        break SessionOutcome::ServiceExited { service, code };
                    }
                }
            }
        };

        let stops = self.shutdown_all().await;
        self.drain_output().await;
        SessionSummary { outcome, stops }
    }

    /// First service found exited, if any.
    fn poll_exits(&mut self) -> Option<(String, Option<i32>)> {
        for svc in &mut self.services {
            if let ServiceState::Exited(code) = svc.state {
                return Some((svc.name.to_string(), code));
            }
            match svc.child.try_wait() {
                Ok(Some(status)) => {
                    svc.state = ServiceState::Exited(status.code());
                    return Some((svc.name.to_string(), status.code()));
                }
                Ok(None) => {}
                Err(e) => warn!("{} status check error: {e}", svc.name),
            }
        }
        None
    }

    /// Stop all services concurrently.
    async fn shutdown_all(&mut self) -> Vec<(String, StopKind)> {
        let signaller = self.session.signaller.as_ref();
        let timings = self.session.timings.shutdown;

        join_all(self.services.iter_mut().map(|svc| async move {
            let kind = match svc.state {
                ServiceState::Exited(code) => StopKind::AlreadyExited(code),
                _ => stop_group(&svc.name, &mut svc.child, signaller, timings).await,
            };
            match kind {
                StopKind::Graceful => info!("{} stopped", svc.name),
                StopKind::Forced => warn!("{} force-killed", svc.name),
                StopKind::Unresponsive => error!("{} could not be stopped", svc.name),
                StopKind::AlreadyExited(_) => debug!("{} was already gone", svc.name),
            }
            if !matches!(svc.state, ServiceState::Exited(_)) {
                let code = svc.child.try_wait().ok().flatten().and_then(|s| s.code());
                svc.state = ServiceState::Exited(code);
            }
            (svc.name.to_string(), kind)
        }))
        .await
    }

    /// Undo a partial launch, most recent service first.
    async fn rollback(&mut self) {
        warn!("Rolling back {} previously started services", self.services.len());
        let signaller = self.session.signaller.as_ref();
        let timings = self.session.timings.shutdown;
        for svc in self.services.iter_mut().rev() {
            let kind = stop_group(&svc.name, &mut svc.child, signaller, timings).await;
            info!("{} rolled back ({kind:?})", svc.name);
        }
        self.drain_output().await;
    }

    async fn drain_output(&mut self) {
        if tokio::time::timeout(OUTPUT_DRAIN, &mut self.mux).await.is_err() {
            // a grandchild outside the group may still hold the pipe open
            warn!("Output still open after shutdown; detaching");
            self.mux.abort();
        }
    }
}

fn describe_code(code: Option<i32>) -> String {
    code.map_or_else(|| "none (killed by signal)".to_string(), |c| c.to_string())
}

fn validate_spec(spec: &ServiceSpec) -> Result<(), OrchestratorError> {
    let Some(program) = spec.command.first() else {
        return Err(OrchestratorError::EmptyCommand(spec.name.clone()));
    };
    if !spec.working_dir.is_dir() {
        return Err(OrchestratorError::MissingDirectory {
            what: format!("{} working directory", spec.name),
            path: spec.working_dir.clone(),
        });
    }
    let path = spec
        .env
        .get("PATH")
        .cloned()
        .or_else(|| std::env::var("PATH").ok());
    if which::which_in(program, path, &spec.working_dir).is_err() {
        return Err(OrchestratorError::ToolMissing(program.clone()));
    }
    Ok(())
}

/// Spawn `spec` in its own process group with stdout and stderr sharing one pipe.
fn spawn_service(spec: &ServiceSpec) -> std::io::Result<(Child, PipeReader)> {
    let (reader, writer) = std::io::pipe()?;
    let writer_err = writer.try_clone()?;

    let mut cmd = tokio::process::Command::new(&spec.command[0]);
    cmd.args(&spec.command[1..])
        .current_dir(&spec.working_dir)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(writer)
        .stderr(writer_err)
        .process_group(0);

    let child = cmd.spawn()?;
    // `cmd` drops here, closing our copies of the write end
    Ok((child, reader))
}
