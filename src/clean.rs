//! Removal of build artifacts for a fresh start.

use std::path::{Path, PathBuf};

use log::{debug, warn};
use walkdir::WalkDir;

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanOutcome {
    /// Removed; directories carry their size in bytes.
    Removed { bytes: Option<u64> },
    AlreadyClean,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanEntry {
    pub service: String,
    pub path: PathBuf,
    pub outcome: CleanOutcome,
}

/// Remove every service's `clean_paths`. One failure never stops the rest.
pub fn clean_artifacts(cfg: &Config) -> Vec<CleanEntry> {
    let mut entries = Vec::new();
    for svc in &cfg.services {
        let dir = cfg.service_dir(svc);
        for rel in &svc.clean_paths {
            let path = if rel.is_absolute() { rel.clone() } else { dir.join(rel) };
            let outcome = remove_path(&path);
            entries.push(CleanEntry {
                service: svc.name.clone(),
                path,
                outcome,
            });
        }
    }
    entries
}

fn remove_path(path: &Path) -> CleanOutcome {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CleanOutcome::AlreadyClean,
        Err(e) => return CleanOutcome::Failed(e.to_string()),
    };

    let result = if meta.is_dir() {
        let bytes = dir_size(path);
        debug!("Removing {} ({bytes} bytes)", path.display());
        std::fs::remove_dir_all(path).map(|()| Some(bytes))
    } else {
        std::fs::remove_file(path).map(|()| None)
    };

    match result {
        Ok(bytes) => CleanOutcome::Removed { bytes },
        Err(e) => {
            warn!("Failed to fully remove {}: {e}", path.display());
            CleanOutcome::Failed(e.to_string())
        }
    }
}

/// Approximate size of the regular files under `path`; unreadable entries count as zero.
fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// `12.3 MB`-style rendering for the clean report.
pub fn format_size(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
}
