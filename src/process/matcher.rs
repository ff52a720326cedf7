use std::sync::Arc;

use regex::RegexSet;

use super::{ManagedProcess, ProcessTable};
use crate::error::OrchestratorError;

/// Selects the processes that belong to the managed environment.
///
/// A row matches when its command line matches any pattern (logical OR,
/// case-sensitive). The orchestrator's own PID is never returned, whatever
/// its command line says.
pub struct ProcessMatcher {
    patterns: RegexSet,
    own_pid: u32,
    table: Arc<dyn ProcessTable>,
}

impl ProcessMatcher {
    pub fn new(patterns: &[String], table: Arc<dyn ProcessTable>) -> Result<Self, OrchestratorError> {
        // compile one by one so a bad pattern is reported by name
        for pattern in patterns {
            regex::Regex::new(pattern).map_err(|source| OrchestratorError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        }
        let patterns = RegexSet::new(patterns).map_err(|source| OrchestratorError::InvalidPattern {
            pattern: patterns.join("|"),
            source,
        })?;

        Ok(Self {
            patterns,
            own_pid: std::process::id(),
            table,
        })
    }

    /// Treat `pid` as the orchestrator's own process.
    #[must_use]
    pub fn with_own_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    pub fn own_pid(&self) -> u32 {
        self.own_pid
    }

    /// Take a fresh snapshot and return every managed process in it.
    pub fn find_managed(&self) -> Vec<ManagedProcess> {
        self.filter(self.table.snapshot())
    }

    /// Apply the pattern set and self-exclusion to an existing snapshot.
    pub fn filter(&self, snapshot: Vec<ManagedProcess>) -> Vec<ManagedProcess> {
        snapshot
            .into_iter()
            .filter(|process| process.pid != self.own_pid)
            .filter(|process| self.patterns.is_match(&process.command_line))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Process table whose rows the test controls.
    #[derive(Default)]
    pub(crate) struct FakeTable {
        pub rows: Mutex<Vec<ManagedProcess>>,
    }

    impl FakeTable {
        pub(crate) fn with_rows(rows: Vec<ManagedProcess>) -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(rows),
            })
        }

        pub(crate) fn remove(&self, pid: u32) {
            self.rows.lock().unwrap().retain(|row| row.pid != pid);
        }
    }

    impl ProcessTable for FakeTable {
        fn snapshot(&self) -> Vec<ManagedProcess> {
            self.rows.lock().unwrap().clone()
        }
    }

    pub(crate) fn default_patterns() -> Vec<String> {
        [
            r"tsx.*server\.ts",
            r"node.*rustsploit.gui",
            r"npm\s+exec\s+tsx",
            r"vite",
            r"esbuild.*--service.*--ping",
        ]
        .iter()
        .map(|p| p.to_string())
        .collect()
    }

    #[test]
    fn matches_any_pattern_and_skips_unrelated_rows() {
        let table = FakeTable::with_rows(vec![
            ManagedProcess::new(100, "node /app/node_modules/.bin/tsx watch src/server.ts"),
            ManagedProcess::new(101, "node /app/frontend/node_modules/.bin/vite"),
            ManagedProcess::new(102, "/usr/bin/esbuild --service=0.21.5 --ping"),
            ManagedProcess::new(103, "/usr/sbin/sshd -D"),
            ManagedProcess::new(104, "npm exec tsx src/server.ts"),
        ]);
        let matcher = ProcessMatcher::new(&default_patterns(), table)
            .unwrap()
            .with_own_pid(1);

        let pids: Vec<u32> = matcher.find_managed().iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![100, 101, 102, 104]);
    }

    #[test]
    fn never_returns_own_pid_even_when_it_matches() {
        let table = FakeTable::with_rows(vec![
            ManagedProcess::new(42, "devstack start --vite"),
            ManagedProcess::new(43, "vite --port 5173"),
        ]);
        let matcher = ProcessMatcher::new(&default_patterns(), table)
            .unwrap()
            .with_own_pid(42);

        let found = matcher.find_managed();
        assert_eq!(found, vec![ManagedProcess::new(43, "vite --port 5173")]);
    }

    #[test]
    fn matching_is_case_sensitive() {
        let table = FakeTable::with_rows(vec![ManagedProcess::new(9, "VITE dev")]);
        let matcher = ProcessMatcher::new(&default_patterns(), table)
            .unwrap()
            .with_own_pid(1);
        assert!(matcher.find_managed().is_empty());
    }

    #[test]
    fn empty_table_is_not_an_error() {
        let matcher = ProcessMatcher::new(&default_patterns(), FakeTable::with_rows(vec![]))
            .unwrap();
        assert!(matcher.find_managed().is_empty());
    }

    #[test]
    fn invalid_pattern_is_reported_by_name() {
        let err = ProcessMatcher::new(&["vite".into(), "(unclosed".into()], FakeTable::with_rows(vec![]))
            .err()
            .unwrap();
        match err {
            OrchestratorError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "(unclosed"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn live_scan_excludes_the_test_process() {
        // a catch-all pattern matches everything, including this test binary
        let matcher = ProcessMatcher::new(&[".".into()], Arc::new(super::super::SystemProcessTable))
            .unwrap();
        let own = std::process::id();
        assert!(matcher.find_managed().iter().all(|p| p.pid != own));
    }
}
