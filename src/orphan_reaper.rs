use std::sync::Arc;
use std::time::Duration;

use crate::port_owner::PortOwnerResolver;
use crate::system_processes::{self, SystemProcesses};
use crate::{debug_log, info_log, warn_log};

/// How long to wait for a killed orphan to exit
pub const DEFAULT_ORPHAN_EXIT_TIMEOUT: Duration = Duration::from_secs(3);

/// What [`OrphanReaper::reap_if_orphaned`] found on the port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Nothing listens on the port
    PortFree,
    /// The listener is the process we own
    OwnProcess,
    /// The listener is some other program, left alone
    UnrelatedProcess { pid: u32 },
    /// A stale server was killed; `exited` tells whether its exit was confirmed in time
    Reaped { pid: u32, exited: bool },
}

/// Kills a stale server left on the configured port by an earlier host session
///
/// Only processes whose name matches the server binary are ever killed.
#[derive(Clone)]
pub struct OrphanReaper {
    resolver: Arc<dyn PortOwnerResolver>,
    processes: SystemProcesses,
    exit_timeout: Duration,
}

impl OrphanReaper {
    pub fn new(
        resolver: Arc<dyn PortOwnerResolver>,
        processes: SystemProcesses,
        exit_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            processes,
            exit_timeout,
        }
    }

    /// Makes one pass over the port, blocking for up to the exit timeout if it kills something
    ///
    /// # Arguments
    ///
    /// * `port` - Port the new server is about to listen on
    /// * `own_pid` - Process we currently own, never killed
    pub fn reap_if_orphaned(&self, port: u16, own_pid: Option<u32>) -> ReapOutcome {
        let Some(pid) = self.resolver.find_listening_process_id(port) else {
            return ReapOutcome::PortFree;
        };

        if own_pid == Some(pid) {
            return ReapOutcome::OwnProcess;
        }

        if !self.processes.has_server_name(pid) {
            let name = system_processes::process_name(pid).unwrap_or_else(|| "unknown".to_string());
            warn_log!(
                "Port {} is in use by unrelated process {} ({}), not killing it",
                port,
                pid,
                name
            );
            return ReapOutcome::UnrelatedProcess { pid };
        }

        info_log!("Killing orphaned MCP server process {} on port {}", pid, port);
        if !system_processes::kill_process(pid) {
            debug_log!("Kill signal to orphaned process {} was not delivered", pid);
        }

        let exited = system_processes::wait_for_process_exit(pid, self.exit_timeout);
        if !exited {
            warn_log!(
                "Orphaned process {} did not exit within {:?}, starting anyway",
                pid,
                self.exit_timeout
            );
        }
        ReapOutcome::Reaped { pid, exited }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_utils::FixedPortResolver;
    use std::process::Command;

    fn reaper(pid: Option<u32>, expected_name: &str) -> OrphanReaper {
        OrphanReaper::new(
            Arc::new(FixedPortResolver::new(pid)),
            SystemProcesses::new(expected_name),
            DEFAULT_ORPHAN_EXIT_TIMEOUT,
        )
    }

    #[test]
    fn test_free_port() {
        assert_eq!(reaper(None, "sleep").reap_if_orphaned(50123, None), ReapOutcome::PortFree);
    }

    #[test]
    fn test_own_process_is_left_alone() {
        let pid = std::process::id();
        assert_eq!(
            reaper(Some(pid), "sleep").reap_if_orphaned(50123, Some(pid)),
            ReapOutcome::OwnProcess
        );
    }

    #[test]
    fn test_unrelated_process_is_not_killed() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();

        let outcome = reaper(Some(pid), "unity-mcp-server").reap_if_orphaned(50123, None);
        assert_eq!(outcome, ReapOutcome::UnrelatedProcess { pid });
        assert!(system_processes::is_process_alive(pid));

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_matching_orphan_is_killed() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();

        let outcome = reaper(Some(pid), "sleep").reap_if_orphaned(50123, Some(pid + 1));
        assert_eq!(outcome, ReapOutcome::Reaped { pid, exited: true });
        child.wait().unwrap();
    }
}
