use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use crate::binary_removal::{BinaryFolderRemoval, RemovalStep};
use crate::orphan_reaper::{DEFAULT_ORPHAN_EXIT_TIMEOUT, OrphanReaper};
use crate::port_owner::{PortOwnerResolver, SystemPortOwnerResolver};
use crate::process_handle::{ProcessError, ProcessEvent, ProcessHandle, ProcessLaunch};
use crate::process_store::ProcessStore;
use crate::server_binary::{BinaryProvider, EXECUTABLE_NAME, ensure_executable};
use crate::server_config::ConfigProvider;
use crate::server_status::ServerStatus;
use crate::startup_verifier::{
    DEFAULT_GRACE_WINDOW, DEFAULT_POLL_INTERVAL, StartupVerifier, VerificationState,
    run_verification,
};
use crate::system_processes::SystemProcesses;
use crate::{debug_log, error_log, info_log, warn_log};

/// Store key holding the id of the server process we own
pub const PROCESS_ID_KEY: &str = "McpServerManager_ProcessId";

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("MCP server binary not found at {0}")]
    BinaryNotFound(PathBuf),
    #[error("MCP server is already {0}")]
    AlreadyActive(ServerStatus),
    #[error("Start was cancelled, status changed to {0}")]
    Cancelled(ServerStatus),
    #[error("Failed to launch MCP server: {0}")]
    Launch(#[from] ProcessError),
    #[error("Supervisor must be created inside a Tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Timeouts used by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorTimings {
    /// How long a new server must stay alive to count as started
    pub startup_grace: Duration,
    pub verify_poll_interval: Duration,
    /// Wait for exit after the terminate signal
    pub graceful_exit_timeout: Duration,
    /// Wait for exit after a forced kill
    pub kill_exit_timeout: Duration,
    pub orphan_exit_timeout: Duration,
    /// Connect timeout when probing for an external server
    pub external_probe_timeout: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            startup_grace: DEFAULT_GRACE_WINDOW,
            verify_poll_interval: DEFAULT_POLL_INTERVAL,
            graceful_exit_timeout: Duration::from_secs(5),
            kill_exit_timeout: Duration::from_secs(2),
            orphan_exit_timeout: DEFAULT_ORPHAN_EXIT_TIMEOUT,
            external_probe_timeout: Duration::from_millis(500),
        }
    }
}

/// Optional supervisor settings
#[derive(Clone)]
pub struct SupervisorOptions {
    /// Name the server process is recognised by, for reconnection and orphan checks
    pub process_name: String,
    pub timings: SupervisorTimings,
    pub port_resolver: Arc<dyn PortOwnerResolver>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            process_name: EXECUTABLE_NAME.to_string(),
            timings: SupervisorTimings::default(),
            port_resolver: Arc::new(SystemPortOwnerResolver::default()),
        }
    }
}

struct OwnedProcess {
    handle: ProcessHandle,
    pid: u32,
    started_at: DateTime<Utc>,
}

/// Everything guarded by the supervisor mutex
///
/// The status sender lives in here so the status can only change while the lock is held.
struct SupervisorState {
    owned: Option<OwnedProcess>,
    status_tx: watch::Sender<ServerStatus>,
    /// Bumped by every start, so a start that lost the lock can tell it was superseded
    start_attempt: u64,
}

impl SupervisorState {
    fn status(&self) -> ServerStatus {
        *self.status_tx.borrow()
    }

    fn set_status(&mut self, status: ServerStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            info_log!("MCP server status: {} -> {}", previous, status);
        }
    }

    fn owned_pid(&self) -> Option<u32> {
        self.owned.as_ref().map(|owned| owned.pid)
    }
}

struct Shared {
    state: Mutex<SupervisorState>,
    status_rx: watch::Receiver<ServerStatus>,
    store: Arc<dyn ProcessStore>,
    processes: SystemProcesses,
    timings: SupervisorTimings,
    runtime: Handle,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, pid: u32, status: ServerStatus) -> bool {
        let state = self.lock_state();
        state.status() == status && state.owned_pid() == Some(pid)
    }

    /// Waits for exit, escalating to a kill once the graceful window is over
    ///
    /// Blocks for up to the graceful plus the kill timeout.
    fn wait_then_kill(&self, handle: &ProcessHandle) {
        if handle.wait_for_exit(self.timings.graceful_exit_timeout) {
            return;
        }

        warn_log!(
            "MCP server process {} did not exit within {:?}, killing it",
            handle.pid(),
            self.timings.graceful_exit_timeout
        );
        if let Err(e) = handle.kill() {
            error_log!("Failed to kill MCP server process {}: {}", handle.pid(), e);
        }
        if !handle.wait_for_exit(self.timings.kill_exit_timeout) {
            warn_log!(
                "MCP server process {} still alive after kill, treating it as gone",
                handle.pid()
            );
        }
    }

    /// Releases the owned process and returns to `Stopped`
    ///
    /// With `expected_pid` set, nothing happens unless that pid is still the owned process, so a
    /// late notification about an old process never tears down a newer one. Safe to call
    /// repeatedly.
    fn cleanup(&self, expected_pid: Option<u32>) {
        let owned = {
            let mut state = self.lock_state();
            if let Some(pid) = expected_pid {
                if state.owned_pid() != Some(pid) {
                    debug_log!("Process {} is no longer owned, nothing to clean up", pid);
                    return;
                }
            }

            let owned = state.owned.take();
            if let Some(owned) = &owned {
                owned.handle.detach_events();
            }
            self.store.delete_key(PROCESS_ID_KEY);
            state.set_status(ServerStatus::Stopped);
            owned
        };

        if let Some(owned) = owned {
            debug_log!(
                "Released MCP server process {} started at {}",
                owned.pid,
                owned.started_at
            );
            let handle = owned.handle;
            self.runtime.spawn_blocking(move || handle.dispose());
        }
    }

    fn apply_verification(&self, pid: u32, expected: ServerStatus, result: VerificationState) {
        let mut state = self.lock_state();
        if state.status() != expected || state.owned_pid() != Some(pid) {
            debug_log!("Ignoring verification of process {}, state moved on", pid);
            return;
        }

        match result {
            VerificationState::Verified if expected == ServerStatus::Starting => {
                state.set_status(ServerStatus::Running);
            }
            VerificationState::Verified => {
                debug_log!("Reconnected MCP server process {} is still alive", pid);
            }
            VerificationState::FailedEarly => {
                let handle = state.owned.as_ref().map(|owned| owned.handle.clone());
                drop(state);
                warn_log!(
                    "MCP server process {} exited or was not the server within {:?} of starting",
                    pid,
                    self.timings.startup_grace
                );
                // Alive but not the server, e.g. a wrapper that never exec'd it
                if let Some(handle) = handle {
                    if let Err(e) = handle.kill() {
                        error_log!("Failed to kill MCP server process {}: {}", pid, e);
                    }
                }
                self.cleanup(Some(pid));
            }
            VerificationState::Pending => {}
        }
    }
}

/// Supervises the local MCP server process of one project
///
/// All clones share one state machine: `Stopped -> Starting -> Running -> Stopping -> Stopped`,
/// plus `External` when a server we don't own answers on the configured port. Every transition
/// happens under a single mutex, and the current status is published on a watch channel.
///
/// The supervisor must be created inside a Tokio runtime. Its public operations are synchronous
/// and may be called from any thread, only [`ServerSupervisor::stop_server`] with `force` blocks
/// for any noticeable time.
#[derive(Clone)]
pub struct ServerSupervisor {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    config: Arc<dyn ConfigProvider>,
    binary: Arc<dyn BinaryProvider>,
    reaper: OrphanReaper,
}

impl ServerSupervisor {
    /// Creates a supervisor with the default process name and timings
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        binary: Arc<dyn BinaryProvider>,
        store: Arc<dyn ProcessStore>,
    ) -> Result<Self, SupervisorError> {
        Self::with_options(config, binary, store, SupervisorOptions::default())
    }

    pub fn with_options(
        config: Arc<dyn ConfigProvider>,
        binary: Arc<dyn BinaryProvider>,
        store: Arc<dyn ProcessStore>,
        options: SupervisorOptions,
    ) -> Result<Self, SupervisorError> {
        let runtime = Handle::try_current()?;
        let processes = SystemProcesses::new(options.process_name);
        let (status_tx, status_rx) = watch::channel(ServerStatus::Stopped);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            state: Mutex::new(SupervisorState {
                owned: None,
                status_tx,
                start_attempt: 0,
            }),
            status_rx,
            store,
            processes: processes.clone(),
            timings: options.timings.clone(),
            runtime: runtime.clone(),
        });

        runtime.spawn(run_event_loop(Arc::downgrade(&shared), events_rx));

        let reaper = OrphanReaper::new(
            options.port_resolver,
            processes,
            options.timings.orphan_exit_timeout,
        );

        Ok(Self {
            shared,
            events: events_tx,
            config,
            binary,
            reaper,
        })
    }

    pub fn status(&self) -> ServerStatus {
        *self.shared.status_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.status() == ServerStatus::Running
    }

    /// Id of the owned server process, if any
    pub fn server_pid(&self) -> Option<u32> {
        self.shared.lock_state().owned_pid()
    }

    /// Launch time of the owned process, or the adoption time after a reconnect
    pub fn server_started_at(&self) -> Option<DateTime<Utc>> {
        self.shared
            .lock_state()
            .owned
            .as_ref()
            .map(|owned| owned.started_at)
    }

    /// Receiver of every status change
    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.shared.status_rx.clone()
    }

    /// Starts the server unless one is already starting, running or stopping
    ///
    /// Returns once the process is launched, the startup verification continues in the
    /// background. Returns `false` when nothing was launched.
    pub fn start_server(&self) -> bool {
        match self.try_start() {
            Ok(pid) => {
                info_log!("MCP server launched with pid {}", pid);
                true
            }
            Err(SupervisorError::AlreadyActive(status)) => {
                debug_log!("Not starting MCP server, it is already {}", status);
                false
            }
            Err(e) => {
                error_log!("Failed to start MCP server: {}", e);
                false
            }
        }
    }

    fn try_start(&self) -> Result<u32, SupervisorError> {
        let config = self.config.server_config();

        let (attempt, own_pid) = {
            let mut state = self.shared.lock_state();
            let status = state.status();
            if status.is_active() {
                return Err(SupervisorError::AlreadyActive(status));
            }
            if !self.binary.executable_exists() {
                return Err(SupervisorError::BinaryNotFound(
                    self.binary.executable_full_path(),
                ));
            }
            state.set_status(ServerStatus::Starting);
            state.start_attempt += 1;
            (state.start_attempt, state.owned_pid())
        };

        // May block for seconds, so it runs outside the lock
        let outcome = self.reaper.reap_if_orphaned(config.port, own_pid);
        debug_log!("Orphan check on port {}: {:?}", config.port, outcome);

        // A stop, or a stop followed by another start, may have happened meanwhile
        let mut state = self.shared.lock_state();
        let status = state.status();
        if status != ServerStatus::Starting
            || state.start_attempt != attempt
            || state.owned.is_some()
        {
            return Err(SupervisorError::Cancelled(status));
        }

        let launch = ProcessLaunch {
            program: self.binary.executable_full_path(),
            args: config.launch_arguments(),
            working_dir: self.binary.executable_folder_path(),
        };
        if let Err(e) = ensure_executable(&launch.program) {
            warn_log!(
                "Failed to make {} executable: {}",
                launch.program.display(),
                e
            );
        }

        info_log!(
            "Starting MCP server: {} {}",
            launch.program.display(),
            config.launch_argument_line()
        );
        let handle = match ProcessHandle::start(&launch, self.events.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                state.set_status(ServerStatus::Stopped);
                return Err(e.into());
            }
        };

        let pid = handle.pid();
        self.shared.store.set_int(PROCESS_ID_KEY, i64::from(pid));
        state.owned = Some(OwnedProcess {
            handle: handle.clone(),
            pid,
            started_at: handle.started_at(),
        });
        drop(state);

        self.spawn_verifier(handle, ServerStatus::Starting);
        Ok(pid)
    }

    /// Stops the owned server
    ///
    /// Sends the terminate signal and escalates to a kill if the process outlives the graceful
    /// window. With `force` the call blocks until the process is gone (bounded by both
    /// timeouts), otherwise the wait happens in the background. Returns `false` only if
    /// signalling failed, the process is cleaned up anyway.
    pub fn stop_server(&self, force: bool) -> bool {
        let handle = {
            let mut state = self.shared.lock_state();
            let status = state.status();
            if matches!(status, ServerStatus::Stopped | ServerStatus::Stopping) {
                return true;
            }

            let Some(handle) = state.owned.as_ref().map(|owned| owned.handle.clone()) else {
                self.shared.store.delete_key(PROCESS_ID_KEY);
                state.set_status(ServerStatus::Stopped);
                return true;
            };
            state.set_status(ServerStatus::Stopping);
            handle
        };

        let pid = handle.pid();
        info_log!("Stopping MCP server process {} (force: {})", pid, force);

        if let Err(e) = handle.send_terminate_signal() {
            error_log!("Failed to signal MCP server process {}: {}", pid, e);
            if let Err(e) = handle.kill() {
                error_log!("Failed to kill MCP server process {}: {}", pid, e);
            }
            self.shared.cleanup(Some(pid));
            return false;
        }

        if force {
            self.shared.wait_then_kill(&handle);
            self.shared.cleanup(Some(pid));
            return true;
        }

        if !handle.is_running() {
            self.shared.cleanup(Some(pid));
            return true;
        }

        let shared = Arc::clone(&self.shared);
        self.shared.runtime.spawn_blocking(move || {
            shared.wait_then_kill(&handle);
            shared.cleanup(Some(pid));
        });
        true
    }

    /// Adopts the server started by an earlier supervisor, if it is still alive
    ///
    /// The persisted pid is only trusted when a live process with the expected name carries it.
    /// Otherwise the stored id is discarded.
    pub fn reconnect(&self) -> bool {
        let stored = self.shared.store.get_int(PROCESS_ID_KEY, -1);
        let mut state = self.shared.lock_state();

        let status = state.status();
        if state.owned.is_some() || status.is_active() {
            debug_log!("Not reconnecting, MCP server is already {}", status);
            return false;
        }

        let pid = match u32::try_from(stored) {
            Ok(pid) if pid > 0 => pid,
            _ => {
                self.shared.store.delete_key(PROCESS_ID_KEY);
                return false;
            }
        };

        if !self.shared.processes.is_server_process(pid) {
            info_log!("Stored MCP server process {} is gone, forgetting it", pid);
            self.shared.store.delete_key(PROCESS_ID_KEY);
            return false;
        }

        let handle = match ProcessHandle::attach(
            pid,
            self.shared.processes.clone(),
            self.events.clone(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                error_log!("Failed to attach to MCP server process {}: {}", pid, e);
                return false;
            }
        };

        state.owned = Some(OwnedProcess {
            handle: handle.clone(),
            pid,
            started_at: handle.started_at(),
        });
        state.set_status(ServerStatus::Running);
        drop(state);

        info_log!("Reconnected to MCP server process {}", pid);
        self.spawn_verifier(handle, ServerStatus::Running);
        true
    }

    /// Probes the configured port for a server we don't own
    ///
    /// A reachable port while `Stopped` switches to `External`, an unreachable one while
    /// `External` switches back to `Stopped`. Returns whether the status is `External` afterwards.
    pub async fn detect_external_server(&self) -> bool {
        let port = self.config.server_config().port;
        let reachable = probe_port(port, self.shared.timings.external_probe_timeout).await;

        let mut state = self.shared.lock_state();
        match state.status() {
            ServerStatus::Stopped if reachable && state.owned.is_none() => {
                info_log!("External MCP server detected on port {}", port);
                state.set_status(ServerStatus::External);
            }
            ServerStatus::External if !reachable => {
                info_log!("External MCP server on port {} is gone", port);
                state.set_status(ServerStatus::Stopped);
            }
            _ => {}
        }
        state.status() == ServerStatus::External
    }

    /// Starts the server if the config asks to keep it running and nothing serves the port yet
    ///
    /// Returns whether a server was launched.
    pub async fn start_server_if_needed(&self) -> bool {
        if !self.config.server_config().keep_server_running {
            debug_log!("keepServerRunning is off, not starting MCP server");
            return false;
        }

        let status = self.status();
        if status.is_active() {
            debug_log!("MCP server is already {}", status);
            return false;
        }

        if self.detect_external_server().await {
            return false;
        }

        let supervisor = self.clone();
        match tokio::task::spawn_blocking(move || supervisor.start_server()).await {
            Ok(started) => started,
            Err(e) => {
                error_log!("MCP server start task failed: {}", e);
                false
            }
        }
    }

    /// Makes one attempt at deleting the binary folder
    ///
    /// After the first failure the owned server is stopped with `force`, since a running
    /// server keeps its binaries locked on Windows.
    pub fn attempt_binary_removal(&self, removal: &mut BinaryFolderRemoval) -> RemovalStep {
        removal.attempt(|| {
            let had_server = self.server_pid().is_some();
            self.stop_server(true);
            had_server
        })
    }

    fn spawn_verifier(&self, handle: ProcessHandle, expected: ServerStatus) {
        let pid = handle.pid();
        let verifier = StartupVerifier::new(pid, Instant::now(), self.shared.timings.startup_grace);
        let poll_interval = self.shared.timings.verify_poll_interval;
        let shared = Arc::clone(&self.shared);
        let processes = self.shared.processes.clone();

        self.shared.runtime.spawn(async move {
            let relevance = Arc::clone(&shared);
            let result = run_verification(
                verifier,
                poll_interval,
                move || relevance.is_current(pid, expected),
                move || handle.is_running(),
                move || processes.has_server_name(pid),
            )
            .await;

            if let Some(result) = result {
                shared.apply_verification(pid, expected, result);
            }
        });
    }
}

/// Consumes process events until the supervisor is gone
async fn run_event_loop(
    shared: Weak<Shared>,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Stdout { pid, line } => debug_log!("[mcp-server {}] {}", pid, line),
            ProcessEvent::Stderr { pid, line } => warn_log!("[mcp-server {}] {}", pid, line),
            ProcessEvent::Exited { pid, code } => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                info_log!("MCP server process {} exited with code {:?}", pid, code);
                shared.cleanup(Some(pid));
            }
        }
    }
    debug_log!("Process event loop finished");
}

async fn probe_port(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
#[path = "server_supervisor_tests.rs"]
mod server_supervisor_tests;
