use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::health::{DependencyEndpoint, ServiceEndpoint};
use crate::process::reaper::ReaperTimings;
use crate::session::SessionTimings;
use crate::supervisor::ServiceSpec;
use crate::supervisor::shutdown::ShutdownTimings;

pub const CONFIG_FILE: &str = "devstack.toml";

/// Top-level configuration (defaults describe the backend + frontend workspace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Command-line patterns that identify managed processes.
    pub patterns: Vec<String>,
    /// Dotenv file whose entries are passed to every service.
    pub env_file: Option<PathBuf>,
    /// Executables that must be on `PATH` before anything starts.
    pub required_tools: Vec<String>,
    pub services: Vec<ServiceConfig>,
    pub dependency: Option<DependencyConfig>,
    pub timings: TimingsConfig,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// On-disk description of a single service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub readiness_port: u16,
    /// Environment key whose value, when present, overrides `readiness_port`.
    pub port_env: Option<String>,
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    pub health_expect: Option<String>,
    #[serde(default)]
    pub clean_paths: Vec<PathBuf>,
}

fn default_readiness_timeout() -> u64 {
    15
}

fn default_health_path() -> String {
    "/".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    pub name: String,
    /// Environment key holding the base URL.
    pub url_env: String,
    pub default_url: String,
    pub status_path: String,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            name: "RustSploit API".into(),
            url_env: "RSF_API_URL".into(),
            default_url: "http://127.0.0.1:8080".into(),
            status_path: "/api/status".into(),
        }
    }
}

/// All values in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingsConfig {
    pub reap_grace: u64,
    pub reap_force_wait: u64,
    pub port_poll: u64,
    pub liveness_poll: u64,
    pub shutdown_grace: u64,
    pub shutdown_force_wait: u64,
    pub probe_timeout: u64,
}

impl Default for TimingsConfig {
    fn default() -> Self {
        Self {
            reap_grace: 2000,
            reap_force_wait: 1000,
            port_poll: 500,
            liveness_poll: 500,
            shutdown_grace: 5000,
            shutdown_force_wait: 5000,
            probe_timeout: 3000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let npm_dev = || vec!["npm".to_string(), "run".into(), "dev".into()];
        let artifacts = || {
            vec![
                PathBuf::from("node_modules"),
                PathBuf::from("package-lock.json"),
                PathBuf::from("dist"),
            ]
        };
        Self {
            patterns: [
                r"tsx.*server\.ts",
                r"node.*rustsploit.gui",
                r"npm\s+exec\s+tsx",
                r"vite",
                r"esbuild.*--service.*--ping",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            env_file: Some(PathBuf::from("backend/.env")),
            required_tools: vec!["node".into(), "npm".into()],
            services: vec![
                ServiceConfig {
                    name: "backend".into(),
                    command: npm_dev(),
                    working_dir: PathBuf::from("backend"),
                    readiness_port: 4000,
                    port_env: Some("PORT".into()),
                    readiness_timeout_secs: 15,
                    health_path: "/health".into(),
                    health_expect: Some("ok".into()),
                    clean_paths: artifacts(),
                },
                ServiceConfig {
                    name: "frontend".into(),
                    command: npm_dev(),
                    working_dir: PathBuf::from("frontend"),
                    readiness_port: 5173,
                    port_env: None,
                    readiness_timeout_secs: 10,
                    health_path: "/".into(),
                    health_expect: None,
                    clean_paths: artifacts(),
                },
            ],
            dependency: Some(DependencyConfig::default()),
            timings: TimingsConfig::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Load from `explicit`, else `./devstack.toml`, else the user config
    /// directory, else built-in defaults rooted at the current directory.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let local = PathBuf::from(CONFIG_FILE);
        if local.is_file() {
            return Self::from_file(&local);
        }
        if let Some(user) = user_config_path()
            && user.is_file()
        {
            return Self::from_file(&user);
        }

        debug!("No {CONFIG_FILE} found, using built-in defaults");
        let mut cfg = Self::default();
        cfg.base_dir = std::env::current_dir().context("Failed to read current directory")?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut cfg: Config = toml::from_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        cfg.base_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        cfg.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for svc in &self.services {
            if !seen.insert(svc.name.as_str()) {
                bail!("Service {} is defined twice", svc.name);
            }
            if svc.command.is_empty() {
                bail!("Service {} has an empty command", svc.name);
            }
        }
        Ok(())
    }

    /// Write the default configuration as pretty TOML.
    pub fn write_default(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            bail!("{} already exists (use --force to overwrite)", path.display());
        }
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let toml = toml::to_string_pretty(&Config::default()).context("Failed to serialize default config")?;
        std::fs::write(path, toml).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn env_file_path(&self) -> Option<PathBuf> {
        self.env_file.as_deref().map(|p| self.resolve(p))
    }

    /// Entries of the env file; a missing file is an empty mapping.
    pub fn load_env(&self) -> Result<BTreeMap<String, String>> {
        let Some(path) = self.env_file_path() else {
            return Ok(BTreeMap::new());
        };
        if !path.is_file() {
            debug!("{} not found, services get no extra environment", path.display());
            return Ok(BTreeMap::new());
        }
        let iter = dotenvy::from_path_iter(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut env = BTreeMap::new();
        for item in iter {
            let (key, value) = item.with_context(|| format!("Invalid entry in {}", path.display()))?;
            env.insert(key, value);
        }
        Ok(env)
    }

    pub fn service_dir(&self, svc: &ServiceConfig) -> PathBuf {
        self.resolve(&svc.working_dir)
    }

    /// Readiness port of `svc`, honoring its `port_env` override.
    pub fn readiness_port(&self, svc: &ServiceConfig, env: &BTreeMap<String, String>) -> u16 {
        let Some(key) = &svc.port_env else {
            return svc.readiness_port;
        };
        match env.get(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("{key}={raw} is not a port number, using {}", svc.readiness_port);
                svc.readiness_port
            }),
            None => svc.readiness_port,
        }
    }

    pub fn service_specs(&self, env: &BTreeMap<String, String>) -> Vec<ServiceSpec> {
        self.services
            .iter()
            .map(|svc| ServiceSpec {
                name: svc.name.clone(),
                command: svc.command.clone(),
                working_dir: self.service_dir(svc),
                env: env.clone(),
                readiness_port: self.readiness_port(svc, env),
                readiness_timeout: Duration::from_secs(svc.readiness_timeout_secs),
            })
            .collect()
    }

    pub fn service_endpoints(&self, env: &BTreeMap<String, String>) -> Vec<ServiceEndpoint> {
        self.services
            .iter()
            .map(|svc| ServiceEndpoint {
                name: svc.name.clone(),
                port: self.readiness_port(svc, env),
                path: svc.health_path.clone(),
                expect: svc.health_expect.clone(),
            })
            .collect()
    }

    /// The dependency URL comes from the env file, then the process
    /// environment, then the configured default.
    pub fn dependency_endpoint(&self, env: &BTreeMap<String, String>) -> Option<DependencyEndpoint> {
        let dep = self.dependency.as_ref()?;
        let base_url = env
            .get(&dep.url_env)
            .cloned()
            .or_else(|| std::env::var(&dep.url_env).ok())
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| dep.default_url.clone());
        Some(DependencyEndpoint {
            name: dep.name.clone(),
            base_url,
            status_path: dep.status_path.clone(),
        })
    }

    pub fn session_timings(&self) -> SessionTimings {
        let ms = Duration::from_millis;
        let t = &self.timings;
        SessionTimings {
            reaper: ReaperTimings {
                grace: ms(t.reap_grace),
                force_wait: ms(t.reap_force_wait),
            },
            shutdown: ShutdownTimings {
                grace: ms(t.shutdown_grace),
                force_wait: ms(t.shutdown_force_wait),
            },
            port_poll: ms(t.port_poll),
            liveness_poll: ms(t.liveness_poll),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timings.probe_timeout)
    }
}

/// `<config_dir>/devstack/devstack.toml`, where the platform has one.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("devstack").join(CONFIG_FILE))
}
