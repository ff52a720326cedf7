//! Preconditions checked before anything is launched.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;

use crate::config::Config;
use crate::error::OrchestratorError;

/// Dependency key the backend needs to reach the external API.
pub const API_KEY_VAR: &str = "RSF_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    pub path: PathBuf,
    /// First line of `<tool> --version`, when the tool answers.
    pub version: Option<String>,
}

/// Resolve every tool on the current `PATH`.
pub fn check_tools(tools: &[String]) -> Result<Vec<ToolInfo>, OrchestratorError> {
    check_tools_in(tools, std::env::var_os("PATH"))
}

pub fn check_tools_in(tools: &[String], path: Option<OsString>) -> Result<Vec<ToolInfo>, OrchestratorError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    tools
        .iter()
        .map(|name| {
            let path = which::which_in(name, path.clone(), &cwd)
                .map_err(|_| OrchestratorError::ToolMissing(name.clone()))?;
            let version = tool_version(&path);
            Ok(ToolInfo {
                name: name.clone(),
                path,
                version,
            })
        })
        .collect()
}

fn tool_version(path: &Path) -> Option<String> {
    let output = Command::new(path).arg("--version").output().ok()?;
    if !output.status.success() {
        debug!("{} --version exited with {}", path.display(), output.status);
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
}

/// Every service's working directory must exist.
pub fn check_service_dirs(cfg: &Config) -> Result<(), OrchestratorError> {
    for svc in &cfg.services {
        let dir = cfg.service_dir(svc);
        if !dir.is_dir() {
            return Err(OrchestratorError::MissingDirectory {
                what: format!("{} directory", svc.name),
                path: dir,
            });
        }
    }
    Ok(())
}

/// One line of the workspace section of `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceCheck {
    pub label: String,
    pub ok: bool,
    /// What to do about it when not ok.
    pub hint: Option<String>,
}

/// Env file, API key and installed dependencies of each service.
pub fn workspace_checks(cfg: &Config, env: &BTreeMap<String, String>) -> Vec<WorkspaceCheck> {
    let mut checks = Vec::new();

    if let Some(path) = cfg.env_file_path() {
        let present = path.is_file();
        checks.push(WorkspaceCheck {
            label: format!("{} present", path.display()),
            ok: present,
            hint: (!present).then(|| "run the backend setup to create it".to_string()),
        });
        if present {
            let has_key = env.get(API_KEY_VAR).is_some_and(|v| !v.trim().is_empty());
            checks.push(WorkspaceCheck {
                label: format!("{API_KEY_VAR} configured"),
                ok: has_key,
                hint: (!has_key).then(|| format!("set {API_KEY_VAR}=<key> in {}", path.display())),
            });
        }
    }

    for svc in &cfg.services {
        let modules = cfg.service_dir(svc).join("node_modules");
        let installed = modules.is_dir();
        checks.push(WorkspaceCheck {
            label: format!("{} dependencies installed", svc.name),
            ok: installed,
            hint: (!installed).then(|| format!("npm install in {}", cfg.service_dir(svc).display())),
        });
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_sh_and_reports_missing_tool_by_name() {
        let found = check_tools(&["sh".into()]).unwrap();
        assert_eq!(found[0].name, "sh");
        assert!(found[0].path.is_absolute());

        let err = check_tools(&["sh".into(), "definitely-not-a-real-tool-4821".into()]).unwrap_err();
        match err {
            OrchestratorError::ToolMissing(name) => assert_eq!(name, "definitely-not-a-real-tool-4821"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_path_finds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_tools_in(&["sh".into()], Some(dir.path().as_os_str().to_owned())).unwrap_err();
        assert!(matches!(err, OrchestratorError::ToolMissing(_)));
    }

    #[test]
    fn missing_service_directory_is_a_precondition_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.base_dir = dir.path().to_path_buf();
        std::fs::create_dir(dir.path().join("backend")).unwrap();

        match check_service_dirs(&cfg).unwrap_err() {
            OrchestratorError::MissingDirectory { path, .. } => assert_eq!(path, dir.path().join("frontend")),
            other => panic!("unexpected error: {other}"),
        }

        std::fs::create_dir(dir.path().join("frontend")).unwrap();
        check_service_dirs(&cfg).unwrap();
    }

    #[test]
    fn workspace_checks_report_env_key_and_modules() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.base_dir = dir.path().to_path_buf();
        std::fs::create_dir_all(dir.path().join("backend/node_modules")).unwrap();
        std::fs::write(dir.path().join("backend/.env"), "PORT=4000\n").unwrap();

        let checks = workspace_checks(&cfg, &cfg.load_env().unwrap());
        let ok: Vec<bool> = checks.iter().map(|c| c.ok).collect();
        // env file, api key, backend modules, frontend modules
        assert_eq!(ok, vec![true, false, true, false]);
        assert!(checks[1].hint.as_deref().unwrap().contains(API_KEY_VAR));
    }
}
