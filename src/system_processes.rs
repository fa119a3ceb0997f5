use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System, UpdateKind};

/// Linux truncates the kernel process name to this many bytes
const TRUNCATED_NAME_LEN: usize = 15;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Looks up OS processes and checks whether they are the server we supervise
///
/// Every lookup tolerates the process having exited in the meantime and reports it as
/// "not running" instead of failing.
#[derive(Debug, Clone)]
pub struct SystemProcesses {
    expected_name: String,
}

impl SystemProcesses {
    pub fn new(expected_name: impl Into<String>) -> Self {
        Self {
            expected_name: expected_name.into(),
        }
    }

    /// Whether `pid` is alive and carries the expected server name
    pub fn is_server_process(&self, pid: u32) -> bool {
        with_process(pid, |process| {
            is_alive_status(process.status())
                && matches_process_name(
                    &process.name().to_string_lossy(),
                    process.exe(),
                    &self.expected_name,
                )
        })
        .unwrap_or(false)
    }

    /// Whether the process name of `pid` matches the expected server name, alive or not
    pub fn has_server_name(&self, pid: u32) -> bool {
        with_process(pid, |process| {
            matches_process_name(
                &process.name().to_string_lossy(),
                process.exe(),
                &self.expected_name,
            )
        })
        .unwrap_or(false)
    }
}

/// Whether a process with this id exists and has not exited
pub fn is_process_alive(pid: u32) -> bool {
    with_process(pid, |process| is_alive_status(process.status())).unwrap_or(false)
}

/// Name of the process, `None` if it does not exist
pub fn process_name(pid: u32) -> Option<String> {
    with_process(pid, |process| process.name().to_string_lossy().into_owned())
}

/// Forcibly kills the process, returns whether the kill signal was delivered
pub fn kill_process(pid: u32) -> bool {
    with_process(pid, |process| process.kill()).unwrap_or(false)
}

/// Sends the graceful termination signal
///
/// Returns `None` when the process is gone or the platform has no such signal.
pub fn signal_terminate(pid: u32) -> Option<bool> {
    with_process(pid, |process| process.kill_with(Signal::Term)).flatten()
}

/// Polls until the process is gone or `timeout` elapses, returns whether it exited
pub fn wait_for_process_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

/// Case-insensitive match of a process against the expected binary name
///
/// Accepts the name containing the expected one, an executable file name containing it, and a
/// kernel-truncated name that is a prefix of it.
pub fn matches_process_name(name: &str, exe: Option<&Path>, expected: &str) -> bool {
    let expected = expected.to_lowercase();
    if expected.is_empty() {
        return false;
    }

    let name = name.to_lowercase();
    if name.contains(&expected) {
        return true;
    }
    if name.len() == TRUNCATED_NAME_LEN && expected.starts_with(&name) {
        return true;
    }

    exe.and_then(|exe| exe.file_name())
        .map(|file_name| file_name.to_string_lossy().to_lowercase().contains(&expected))
        .unwrap_or(false)
}

fn is_alive_status(status: ProcessStatus) -> bool {
    !matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

fn with_process<T>(pid: u32, inspect: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
    let sys_pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sys_pid]),
        true,
        ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet),
    );
    system.process(sys_pid).map(inspect)
}
