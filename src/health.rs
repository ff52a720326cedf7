//! Best-effort health probes for the service endpoints and the external
//! dependency. Probes are read-only and never fail: no answer is a result.

use std::time::Duration;

use chrono::{DateTime, Local};
use futures::future::join_all;
use reqwest::StatusCode;

use crate::console::Console;
use crate::port::PortWaiter;
use crate::process::ProcessMatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// Dependency answered, but asked for credentials.
    Unauthorized,
    /// Port is bound (or host reachable) but the answer was missing or wrong.
    Unresponsive,
    NotRunning,
}

/// A supervised service's HTTP endpoint on the local machine.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub name: String,
    pub port: u16,
    pub path: String,
    /// Substring a healthy response body must contain.
    pub expect: Option<String>,
}

impl ServiceEndpoint {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, self.path)
    }
}

/// External service the environment talks to but does not manage.
#[derive(Debug, Clone)]
pub struct DependencyEndpoint {
    pub name: String,
    pub base_url: String,
    pub status_path: String,
}

impl DependencyEndpoint {
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.status_path)
    }
}

#[derive(Debug, Clone)]
pub struct HealthEntry {
    pub name: String,
    pub target: String,
    pub health: Health,
    pub detail: Option<String>,
}

/// Point-in-time aggregate; not stored anywhere.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub checked_at: DateTime<Local>,
    pub managed_processes: usize,
    pub services: Vec<HealthEntry>,
    pub dependency: Option<HealthEntry>,
}

impl HealthReport {
    pub fn service(&self, name: &str) -> Option<&HealthEntry> {
        self.services.iter().find(|entry| entry.name == name)
    }

    pub fn all_services_healthy(&self) -> bool {
        self.services.iter().all(|entry| entry.health == Health::Healthy)
    }

    pub fn render(&self, console: &Console) {
        console.header(&format!(
            "Service Health Check ({})",
            self.checked_at.format("%Y-%m-%d %H:%M:%S")
        ));
        if self.managed_processes > 0 {
            console.success(&format!("Managed processes: {} running", self.managed_processes));
        } else {
            console.warn("Managed processes: NONE running");
        }
        for entry in &self.services {
            render_entry(console, entry);
        }
        if let Some(entry) = &self.dependency {
            render_entry(console, entry);
        }
    }
}

fn render_entry(console: &Console, entry: &HealthEntry) {
    let base = format!("{} ({})", entry.name, entry.target);
    let detail = entry
        .detail
        .as_deref()
        .map(|d| format!(" [{d}]"))
        .unwrap_or_default();
    match entry.health {
        Health::Healthy => console.success(&format!("{base}: HEALTHY")),
        Health::Unauthorized => console.success(&format!("{base}: REACHABLE (auth required)")),
        Health::Unresponsive => console.warn(&format!("{base}: PORT IN USE but not responding{detail}")),
        Health::NotRunning => console.warn(&format!("{base}: NOT RUNNING{detail}")),
    }
}

pub struct HealthAggregator<'a> {
    matcher: &'a ProcessMatcher,
    ports: &'a PortWaiter,
    client: reqwest::Client,
}

impl<'a> HealthAggregator<'a> {
    pub fn new(matcher: &'a ProcessMatcher, ports: &'a PortWaiter, probe_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .connect_timeout(probe_timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            matcher,
            ports,
            client,
        })
    }

    pub async fn check_all(&self, services: &[ServiceEndpoint], dependency: Option<&DependencyEndpoint>) -> HealthReport {
        let managed_processes = self.matcher.find_managed().len();
        let entries = join_all(services.iter().map(|ep| self.check_service(ep))).await;
        let dependency = match dependency {
            Some(dep) => Some(self.check_dependency(dep).await),
            None => None,
        };
        HealthReport {
            checked_at: Local::now(),
            managed_processes,
            services: entries,
            dependency,
        }
    }

    pub async fn check_service(&self, endpoint: &ServiceEndpoint) -> HealthEntry {
        let target = endpoint.url();
        let (health, detail) = if self.ports.is_port_free(endpoint.port).await {
            (Health::NotRunning, None)
        } else {
            match self.client.get(&target).send().await {
                Ok(resp) if resp.status().is_success() => match &endpoint.expect {
                    None => (Health::Healthy, None),
                    Some(needle) => match resp.text().await {
                        Ok(body) if body.contains(needle.as_str()) => (Health::Healthy, None),
                        Ok(_) => (Health::Unresponsive, Some(format!("body lacks \"{needle}\""))),
                        Err(e) => (Health::Unresponsive, Some(e.to_string())),
                    },
                },
                Ok(resp) => (Health::Unresponsive, Some(format!("HTTP {}", resp.status().as_u16()))),
                Err(e) => {
                    log::debug!("{} probe failed: {e}", endpoint.name);
                    (Health::Unresponsive, Some(probe_error(&e)))
                }
            }
        };
        HealthEntry {
            name: endpoint.name.clone(),
            target,
            health,
            detail,
        }
    }

    pub async fn check_dependency(&self, dependency: &DependencyEndpoint) -> HealthEntry {
        let target = dependency.url();
        let (health, detail) = match self.client.get(&target).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => (Health::Healthy, None),
            Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => (Health::Unauthorized, None),
            Ok(resp) => (Health::Unresponsive, Some(format!("HTTP {}", resp.status().as_u16()))),
            Err(e) => {
                log::debug!("{} probe failed: {e}", dependency.name);
                (Health::NotRunning, Some(probe_error(&e)))
            }
        };
        HealthEntry {
            name: dependency.name.clone(),
            target,
            health,
            detail,
        }
    }
}

fn probe_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "timed out".to_string()
    } else if e.is_connect() {
        "connection refused".to_string()
    } else {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;

    use super::*;
    use crate::port::LocalPortProbe;
    use crate::process::ManagedProcess;
    use crate::process::matcher::tests::FakeTable;

    async fn serve(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn fixtures(rows: Vec<ManagedProcess>) -> (ProcessMatcher, PortWaiter) {
        let matcher = ProcessMatcher::new(&["vite".into()], FakeTable::with_rows(rows))
            .unwrap()
            .with_own_pid(1);
        let ports = PortWaiter::new(Arc::new(LocalPortProbe), Duration::from_millis(50));
        (matcher, ports)
    }

    fn endpoint(name: &str, port: u16, path: &str, expect: Option<&str>) -> ServiceEndpoint {
        ServiceEndpoint {
            name: name.into(),
            port,
            path: path.into(),
            expect: expect.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn healthy_when_body_contains_expected_marker() {
        let port = serve(Router::new().route("/health", get(|| async { r#"{"status":"ok"}"# }))).await;
        let (matcher, ports) = fixtures(vec![]);
        let agg = HealthAggregator::new(&matcher, &ports, Duration::from_secs(2)).unwrap();

        let entry = agg.check_service(&endpoint("backend", port, "/health", Some("ok"))).await;
        assert_eq!(entry.health, Health::Healthy);
        assert_eq!(entry.target, format!("http://127.0.0.1:{port}/health"));
    }

    #[tokio::test]
    async fn unexpected_body_is_unresponsive() {
        let port = serve(Router::new().route("/health", get(|| async { "starting" }))).await;
        let (matcher, ports) = fixtures(vec![]);
        let agg = HealthAggregator::new(&matcher, &ports, Duration::from_secs(2)).unwrap();

        let entry = agg.check_service(&endpoint("backend", port, "/health", Some("ok"))).await;
        assert_eq!(entry.health, Health::Unresponsive);
    }

    #[tokio::test]
    async fn service_asking_for_credentials_is_unresponsive() {
        let port = serve(Router::new().route("/health", get(|| async { AxumStatus::UNAUTHORIZED }))).await;
        let (matcher, ports) = fixtures(vec![]);
        let agg = HealthAggregator::new(&matcher, &ports, Duration::from_secs(2)).unwrap();

        let entry = agg.check_service(&endpoint("backend", port, "/health", Some("ok"))).await;
        assert_eq!(entry.health, Health::Unresponsive);
        assert_eq!(entry.detail.as_deref(), Some("HTTP 401"));
    }

    #[tokio::test]
    async fn free_port_is_not_running() {
        let (matcher, ports) = fixtures(vec![]);
        let agg = HealthAggregator::new(&matcher, &ports, Duration::from_secs(2)).unwrap();

        let entry = agg.check_service(&endpoint("frontend", unused_port(), "/", None)).await;
        assert_eq!(entry.health, Health::NotRunning);
    }

    #[tokio::test]
    async fn silent_listener_is_unresponsive_within_timeout() {
        // accepts connections via the backlog but never answers
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();
        let (matcher, ports) = fixtures(vec![]);
        let agg = HealthAggregator::new(&matcher, &ports, Duration::from_millis(300)).unwrap();

        let start = std::time::Instant::now();
        let entry = agg.check_service(&endpoint("backend", port, "/health", None)).await;
        assert_eq!(entry.health, Health::Unresponsive);
        assert!(start.elapsed() < Duration::from_secs(3));
        drop(silent);
    }

    #[tokio::test]
    async fn dependency_status_codes_are_classified() {
        let port = serve(
            Router::new()
                .route("/ok", get(|| async { "fine" }))
                .route("/locked", get(|| async { AxumStatus::UNAUTHORIZED }))
                .route("/broken", get(|| async { AxumStatus::INTERNAL_SERVER_ERROR }))
                .route("/empty", get(|| async { AxumStatus::NO_CONTENT })),
        )
        .await;
        let (matcher, ports) = fixtures(vec![]);
        let agg = HealthAggregator::new(&matcher, &ports, Duration::from_secs(2)).unwrap();
        let dep = |path: &str| DependencyEndpoint {
            name: "api".into(),
            base_url: format!("http://127.0.0.1:{port}/"),
            status_path: path.into(),
        };

        assert_eq!(agg.check_dependency(&dep("/ok")).await.health, Health::Healthy);
        assert_eq!(agg.check_dependency(&dep("/locked")).await.health, Health::Unauthorized);
        let broken = agg.check_dependency(&dep("/broken")).await;
        assert_eq!(broken.health, Health::Unresponsive);
        assert_eq!(broken.detail.as_deref(), Some("HTTP 500"));
        let empty = agg.check_dependency(&dep("/empty")).await;
        assert_eq!(empty.health, Health::Unresponsive);
        assert_eq!(empty.detail.as_deref(), Some("HTTP 204"));
    }

    #[tokio::test]
    async fn unreachable_dependency_is_not_running() {
        let (matcher, ports) = fixtures(vec![]);
        let agg = HealthAggregator::new(&matcher, &ports, Duration::from_secs(2)).unwrap();
        let dep = DependencyEndpoint {
            name: "api".into(),
            base_url: format!("http://127.0.0.1:{}", unused_port()),
            status_path: "/api/status".into(),
        };
        assert_eq!(agg.check_dependency(&dep).await.health, Health::NotRunning);
    }

    #[tokio::test]
    async fn report_counts_managed_processes() {
        let port = serve(Router::new().route("/", get(|| async { "<html></html>" }))).await;
        let (matcher, ports) = fixtures(vec![
            ManagedProcess::new(10, "node vite"),
            ManagedProcess::new(11, "bash"),
        ]);
        let agg = HealthAggregator::new(&matcher, &ports, Duration::from_secs(2)).unwrap();

        let report = agg
            .check_all(&[endpoint("frontend", port, "/", None)], None)
            .await;
        assert_eq!(report.managed_processes, 1);
        assert!(report.all_services_healthy());
        assert!(report.dependency.is_none());
        assert_eq!(report.service("frontend").unwrap().health, Health::Healthy);
    }
}
