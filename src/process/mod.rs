//! Process-table access and termination of managed processes.
//!
//! A [`ManagedProcess`] is rebuilt on every scan. PIDs get reused, so nothing
//! here caches them across scans; the command line is what decides membership.

pub mod matcher;
pub mod reaper;
pub mod signal;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

pub use matcher::ProcessMatcher;
pub use reaper::{ProcessReaper, ReapReport};
pub use signal::{NixSignaller, Signal, SignalError, Signaller};

/// One row of a process-table snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedProcess {
    pub pid: u32,
    pub command_line: String,
}

impl ManagedProcess {
    pub fn new(pid: u32, command_line: impl Into<String>) -> Self {
        Self {
            pid,
            command_line: command_line.into(),
        }
    }

    /// Command line shortened for display, with a trailing ellipsis when cut.
    pub fn display_line(&self, max: usize) -> String {
        if self.command_line.chars().count() > max {
            let cut: String = self.command_line.chars().take(max).collect();
            format!("{cut}...")
        } else {
            self.command_line.clone()
        }
    }
}

/// Source of process-table snapshots.
pub trait ProcessTable: Send + Sync {
    /// Every process visible to the caller, as `(pid, command line)` rows.
    fn snapshot(&self) -> Vec<ManagedProcess>;
}

/// Live process table read through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> Vec<ManagedProcess> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
        );

        system
            .processes()
            .iter()
            // Linux reports every thread as a task of its own
            .filter(|(_, process)| process.thread_kind().is_none())
            .map(|(pid, process)| {
                let cmd = process.cmd();
                let command_line = if cmd.is_empty() {
                    process.name().to_string_lossy().into_owned()
                } else {
                    cmd.iter()
                        .map(|arg| arg.to_string_lossy())
                        .collect::<Vec<_>>()
                        .join(" ")
                };
                ManagedProcess::new(pid.as_u32(), command_line)
            })
            .collect()
    }
}
