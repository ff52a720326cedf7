//! TCP port occupancy checks and readiness waiting.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::process::reaper::ReaperTimings;
use crate::process::signal::{Signal, SignalError, Signaller};

/// Default interval between two occupancy checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// One-shot listening-socket query for a TCP port.
pub trait PortProbe: Send + Sync {
    /// `true` when nothing is listening on `port`.
    fn is_port_free(&self, port: u16) -> bool;

    /// PIDs owning a listening socket on `port`, where the OS lets us see them.
    fn listener_pids(&self, port: u16) -> Vec<u32> {
        let _ = port;
        Vec::new()
    }
}

/// Probes the local machine without binding anything itself, so a child that
/// is about to bind the same port never races against the probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPortProbe;

impl PortProbe for LocalPortProbe {
    fn is_port_free(&self, port: u16) -> bool {
        let loopbacks = [
            SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            SocketAddr::from((Ipv6Addr::LOCALHOST, port)),
        ];
        if loopbacks
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, CONNECT_TIMEOUT).is_ok())
        {
            return false;
        }

        // listeners bound to a non-loopback interface only
        match listeners::get_all() {
            Ok(all) => !all.iter().any(|listener| listener.socket.port() == port),
            Err(e) => {
                debug!("Listening-socket table unavailable: {e}");
                true
            }
        }
    }

    fn listener_pids(&self, port: u16) -> Vec<u32> {
        let mut pids: Vec<u32> = match listeners::get_all() {
            Ok(all) => all
                .into_iter()
                .filter(|listener| listener.socket.port() == port)
                .map(|listener| listener.process.pid)
                .collect(),
            Err(e) => {
                warn!("Could not read listening sockets: {e}");
                Vec::new()
            }
        };
        pids.sort_unstable();
        pids.dedup();
        pids
    }
}

/// Polls a [`PortProbe`] at a fixed interval.
#[derive(Clone)]
pub struct PortWaiter {
    probe: Arc<dyn PortProbe>,
    interval: Duration,
}

impl PortWaiter {
    pub fn new(probe: Arc<dyn PortProbe>, interval: Duration) -> Self {
        Self { probe, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn is_port_free(&self, port: u16) -> bool {
        let probe = Arc::clone(&self.probe);
        match tokio::task::spawn_blocking(move || probe.is_port_free(port)).await {
            Ok(free) => free,
            Err(e) => {
                warn!("Port probe for {port} failed: {e}");
                true
            }
        }
    }

    /// Wait until something listens on `port`.
    ///
    /// Returns `false` when `timeout` elapses first; that is an answer, not an
    /// error. Never sleeps past the deadline, so the result is accurate to
    /// within one poll interval.
    pub async fn wait_until_bound(&self, port: u16, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_port_free(port).await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }

    /// Terminate whatever listens on `port` and report whether it is free now.
    ///
    /// Uses the same graceful-then-forceful escalation as the process reaper,
    /// looking the owners up again before each phase.
    pub async fn reclaim(&self, port: u16, signaller: &dyn Signaller, timings: ReaperTimings) -> bool {
        for (signal, pause) in [
            (Signal::Graceful, timings.grace),
            (Signal::Forceful, timings.force_wait),
        ] {
            if self.is_port_free(port).await {
                return true;
            }
            let owners = self.listener_pids(port).await;
            if owners.is_empty() {
                warn!("No visible owner for port {port}; it may belong to another user");
                break;
            }
            for &pid in &owners {
                match signaller.signal_pid(pid, signal) {
                    Ok(()) => info!("Sent {signal} to PID {pid} (port {port})"),
                    Err(SignalError::NoSuchProcess) => {}
                    Err(e) => warn!("Cannot signal PID {pid} holding port {port}: {e}"),
                }
            }
            tokio::time::sleep(pause).await;
        }

        self.is_port_free(port).await
    }

    async fn listener_pids(&self, port: u16) -> Vec<u32> {
        let probe = Arc::clone(&self.probe);
        tokio::task::spawn_blocking(move || probe.listener_pids(port))
            .await
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn local_probe_sees_a_loopback_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!LocalPortProbe.is_port_free(port));
        drop(listener);
    }

    #[test]
    fn local_probe_reports_owner_pid() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let owners = LocalPortProbe.listener_pids(port);
        // the socket table may hide owners in restricted sandboxes
        if !owners.is_empty() {
            assert!(owners.contains(&std::process::id()));
        }
    }

    #[tokio::test]
    async fn wait_succeeds_when_listener_binds_before_timeout() {
        let port = unused_port();
        let waiter = PortWaiter::new(Arc::new(LocalPortProbe), Duration::from_millis(50));

        let binder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(listener);
        });

        assert!(waiter.wait_until_bound(port, Duration::from_secs(2)).await);
        binder.abort();
    }

    #[tokio::test]
    async fn wait_times_out_when_nothing_binds() {
        let port = unused_port();
        let waiter = PortWaiter::new(Arc::new(LocalPortProbe), Duration::from_millis(50));

        let start = std::time::Instant::now();
        assert!(!waiter.wait_until_bound(port, Duration::from_millis(300)).await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(300) + Duration::from_secs(1));
    }

    /// Becomes bound once `bound` is set, counting probes.
    struct FlagProbe {
        bound: AtomicBool,
        probes: Mutex<u32>,
    }

    impl PortProbe for FlagProbe {
        fn is_port_free(&self, _port: u16) -> bool {
            *self.probes.lock().unwrap() += 1;
            !self.bound.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_at_the_interval_instead_of_spinning() {
        let probe = Arc::new(FlagProbe {
            bound: AtomicBool::new(false),
            probes: Mutex::new(0),
        });
        let waiter = PortWaiter::new(probe.clone(), Duration::from_millis(500));

        assert!(!waiter.wait_until_bound(4000, Duration::from_secs(2)).await);
        // t = 0, 0.5, 1.0, 1.5, 2.0
        assert_eq!(*probe.probes.lock().unwrap(), 5);
    }

    /// Port held by a set of fake owners; killing every owner frees it.
    struct OwnedPort {
        owners: Mutex<Vec<u32>>,
        ignores_term: Vec<u32>,
    }

    impl PortProbe for OwnedPort {
        fn is_port_free(&self, _port: u16) -> bool {
            self.owners.lock().unwrap().is_empty()
        }

        fn listener_pids(&self, _port: u16) -> Vec<u32> {
            self.owners.lock().unwrap().clone()
        }
    }

    struct Recorder {
        port: Arc<OwnedPort>,
        sent: Mutex<Vec<(u32, Signal)>>,
    }

    impl Signaller for Recorder {
        fn signal_pid(&self, pid: u32, signal: Signal) -> Result<(), SignalError> {
            self.sent.lock().unwrap().push((pid, signal));
            if signal == Signal::Forceful || !self.port.ignores_term.contains(&pid) {
                self.port.owners.lock().unwrap().retain(|&p| p != pid);
            }
            Ok(())
        }

        fn signal_group(&self, pgid: u32, signal: Signal) -> Result<(), SignalError> {
            self.signal_pid(pgid, signal)
        }
    }

    fn owned(owners: Vec<u32>, ignores_term: Vec<u32>) -> (PortWaiter, Arc<OwnedPort>) {
        let port = Arc::new(OwnedPort {
            owners: Mutex::new(owners),
            ignores_term,
        });
        (PortWaiter::new(port.clone(), Duration::from_millis(50)), port)
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_terminates_owners_gracefully() {
        let (waiter, port) = owned(vec![700, 701], vec![]);
        let recorder = Recorder {
            port,
            sent: Mutex::new(Vec::new()),
        };

        assert!(waiter.reclaim(4000, &recorder, ReaperTimings::default()).await);
        assert_eq!(
            *recorder.sent.lock().unwrap(),
            vec![(700, Signal::Graceful), (701, Signal::Graceful)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_escalates_only_against_current_owners() {
        let (waiter, port) = owned(vec![700, 701], vec![701]);
        let recorder = Recorder {
            port,
            sent: Mutex::new(Vec::new()),
        };

        assert!(waiter.reclaim(4000, &recorder, ReaperTimings::default()).await);
        assert_eq!(
            *recorder.sent.lock().unwrap(),
            vec![
                (700, Signal::Graceful),
                (701, Signal::Graceful),
                (701, Signal::Forceful),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_without_visible_owner_gives_up_at_once() {
        let hidden_owner = Arc::new(FlagProbe {
            bound: AtomicBool::new(true),
            probes: Mutex::new(0),
        });
        let waiter = PortWaiter::new(hidden_owner, Duration::from_millis(50));
        let recorder = Recorder {
            port: Arc::new(OwnedPort {
                owners: Mutex::new(vec![]),
                ignores_term: vec![],
            }),
            sent: Mutex::new(Vec::new()),
        };

        let start = Instant::now();
        assert!(!waiter.reclaim(4000, &recorder, ReaperTimings::default()).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn returns_immediately_when_already_bound() {
        let probe = Arc::new(FlagProbe {
            bound: AtomicBool::new(true),
            probes: Mutex::new(0),
        });
        let waiter = PortWaiter::new(probe.clone(), Duration::from_millis(500));
        let start = Instant::now();
        assert!(waiter.wait_until_bound(5173, Duration::from_secs(10)).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
