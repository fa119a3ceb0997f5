use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;

use crate::{debug_log, warn_log};
use crate::system_processes::{self, SystemProcesses};

/// How often the exit monitor checks a spawned child
const CHILD_MONITOR_INTERVAL: Duration = Duration::from_millis(100);

/// How often the exit monitor checks an attached process, each check is a process table lookup
const ATTACHED_MONITOR_INTERVAL: Duration = Duration::from_millis(500);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Wait for a child killed because its helper threads could not start
const HELPER_FAILURE_EXIT_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to kill process {pid}: {source}")]
    Kill {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("Process {0} could not be terminated")]
    NotTerminated(u32),
    #[error("Failed to start process helper thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// Events published by a process handle, tagged with the pid they belong to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout { pid: u32, line: String },
    Stderr { pid: u32, line: String },
    Exited { pid: u32, code: Option<i32> },
}

/// What to run and where
#[derive(Debug, Clone)]
pub struct ProcessLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

enum ProcessTarget {
    /// Started by us, output is redirected
    Child(Mutex<Child>),
    /// Adopted by pid, only the process table is available
    Attached(SystemProcesses),
}

struct HandleInner {
    pid: u32,
    started_at: DateTime<Utc>,
    target: ProcessTarget,
    exited: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    detached: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl HandleInner {
    fn poll_running(&self) -> bool {
        if self.exited.load(Ordering::SeqCst) {
            return false;
        }

        let running = match &self.target {
            ProcessTarget::Child(child) => match child.lock() {
                Ok(mut child) => match child.try_wait() {
                    Ok(None) => true,
                    Ok(Some(status)) => {
                        if let Ok(mut code) = self.exit_code.lock() {
                            *code = status.code();
                        }
                        false
                    }
                    Err(_) => false,
                },
                Err(_) => false,
            },
            ProcessTarget::Attached(processes) => processes.is_server_process(self.pid),
        };

        if !running {
            self.exited.store(true, Ordering::SeqCst);
        }
        running
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code.lock().ok().and_then(|code| *code)
    }
}

/// Lifecycle wrapper around one OS process
///
/// Output lines and the exit notification are published on the event channel handed to
/// [`ProcessHandle::start`] or [`ProcessHandle::attach`] until [`ProcessHandle::detach_events`]
/// is called. Clones share the same process.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.inner.pid)
            .field("attached", &self.is_attached())
            .field("exited", &self.inner.exited.load(Ordering::SeqCst))
            .finish()
    }
}

impl ProcessHandle {
    /// Spawns the process with redirected output
    ///
    /// # Arguments
    ///
    /// * `launch` - Program, arguments and working directory
    /// * `events` - Channel receiving output lines and the exit notification
    pub fn start(
        launch: &ProcessLaunch,
        events: UnboundedSender<ProcessEvent>,
    ) -> Result<Self, ProcessError> {
        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .current_dir(&launch.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: launch.program.display().to_string(),
            source,
        })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let handle = Self {
            inner: Arc::new(HandleInner {
                pid,
                started_at: Utc::now(),
                target: ProcessTarget::Child(Mutex::new(child)),
                exited: AtomicBool::new(false),
                exit_code: Mutex::new(None),
                detached: Arc::new(AtomicBool::new(false)),
                monitor: Mutex::new(None),
            }),
        };

        if let Err(e) = handle.start_helpers(stdout, stderr, events) {
            handle.kill_after_failed_setup();
            return Err(e);
        }

        debug_log!("Started process {} ({})", pid, launch.program.display());
        Ok(handle)
    }

    /// Adopts an already running process by id
    ///
    /// No output is available, liveness is followed through the process table and an exit
    /// is reported once the pid disappears or stops carrying the expected name.
    pub fn attach(
        pid: u32,
        processes: SystemProcesses,
        events: UnboundedSender<ProcessEvent>,
    ) -> Result<Self, ProcessError> {
        let handle = Self {
            inner: Arc::new(HandleInner {
                pid,
                started_at: Utc::now(),
                target: ProcessTarget::Attached(processes),
                exited: AtomicBool::new(false),
                exit_code: Mutex::new(None),
                detached: Arc::new(AtomicBool::new(false)),
                monitor: Mutex::new(None),
            }),
        };

        handle.start_monitor(events, ATTACHED_MONITOR_INTERVAL)?;
        debug_log!("Attached to process {}", pid);
        Ok(handle)
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Time the handle was created, the launch time for spawned processes
    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.inner.target, ProcessTarget::Attached(_))
    }

    /// Exit code, once a spawned process has exited with one
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.exit_code()
    }

    /// Whether the process is still running, any inspection failure counts as exited
    pub fn is_running(&self) -> bool {
        self.inner.poll_running()
    }

    /// Asks the process to shut down gracefully
    ///
    /// Falls back to [`ProcessHandle::kill`] when the platform has no graceful signal or
    /// sending it fails.
    pub fn send_terminate_signal(&self) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Ok(());
        }

        match system_processes::signal_terminate(self.inner.pid) {
            Some(true) => {
                debug_log!("Sent terminate signal to process {}", self.inner.pid);
                Ok(())
            }
            Some(false) => {
                debug_log!(
                    "Terminate signal to process {} failed, killing it",
                    self.inner.pid
                );
                self.kill()
            }
            None => {
                debug_log!(
                    "No graceful termination available for process {}, killing it",
                    self.inner.pid
                );
                self.kill()
            }
        }
    }

    /// Terminates the process immediately
    pub fn kill(&self) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Ok(());
        }

        let pid = self.inner.pid;
        match &self.inner.target {
            ProcessTarget::Child(child) => {
                let mut child = child.lock().map_err(|_| ProcessError::NotTerminated(pid))?;
                match child.kill() {
                    Ok(()) => Ok(()),
                    // Already exited and reaped
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                    Err(source) => Err(ProcessError::Kill { pid, source }),
                }
            }
            ProcessTarget::Attached(_) => {
                if system_processes::kill_process(pid) || !system_processes::is_process_alive(pid) {
                    Ok(())
                } else {
                    Err(ProcessError::NotTerminated(pid))
                }
            }
        }
    }

    /// Blocks until the process exits or `timeout` elapses, returns whether it exited
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Stops publishing events, the process itself is left alone
    pub fn detach_events(&self) {
        self.inner.detached.store(true, Ordering::SeqCst);
    }

    /// Detaches and joins the exit monitor
    ///
    /// Blocks for up to one monitor interval, so callers on an async runtime run this through
    /// `spawn_blocking`. Output readers finish on their own once the pipes close.
    pub fn dispose(self) {
        self.detach_events();
        let monitor = self
            .inner
            .monitor
            .lock()
            .ok()
            .and_then(|mut monitor| monitor.take());
        if let Some(monitor) = monitor {
            if monitor.thread().id() != thread::current().id() {
                let _ = monitor.join();
            }
        }
        debug_log!("Disposed handle of process {}", self.inner.pid);
    }

    /// Kills a child nobody will ever observe and waits briefly for it to go away
    fn kill_after_failed_setup(&self) {
        let pid = self.inner.pid;
        if let Err(e) = self.kill() {
            warn_log!("Failed to kill process {} after setup failed: {}", pid, e);
        }
        if !self.wait_for_exit(HELPER_FAILURE_EXIT_TIMEOUT) {
            warn_log!("Process {} still running after setup failed", pid);
        }
    }

    fn start_helpers(
        &self,
        stdout: Option<impl Read + Send + 'static>,
        stderr: Option<impl Read + Send + 'static>,
        events: UnboundedSender<ProcessEvent>,
    ) -> Result<(), ProcessError> {
        let pid = self.inner.pid;
        if let Some(stdout) = stdout {
            spawn_reader(
                "stdout",
                stdout,
                Arc::clone(&self.inner.detached),
                events.clone(),
                move |line| ProcessEvent::Stdout { pid, line },
            )?;
        }
        if let Some(stderr) = stderr {
            spawn_reader(
                "stderr",
                stderr,
                Arc::clone(&self.inner.detached),
                events.clone(),
                move |line| ProcessEvent::Stderr { pid, line },
            )?;
        }
        self.start_monitor(events, CHILD_MONITOR_INTERVAL)
    }

    fn start_monitor(
        &self,
        events: UnboundedSender<ProcessEvent>,
        interval: Duration,
    ) -> Result<(), ProcessError> {
        let inner = Arc::clone(&self.inner);
        let monitor = thread::Builder::new()
            .name(format!("process-monitor-{}", inner.pid))
            .spawn(move || {
                loop {
                    if inner.detached.load(Ordering::SeqCst) {
                        break;
                    }
                    if !inner.poll_running() {
                        if !inner.detached.load(Ordering::SeqCst) {
                            let _ = events.send(ProcessEvent::Exited {
                                pid: inner.pid,
                                code: inner.exit_code(),
                            });
                        }
                        break;
                    }
                    thread::sleep(interval);
                }
            })
            .map_err(ProcessError::Thread)?;

        if let Ok(mut slot) = self.inner.monitor.lock() {
            *slot = Some(monitor);
        }
        Ok(())
    }
}

fn spawn_reader(
    stream: &str,
    source: impl Read + Send + 'static,
    detached: Arc<AtomicBool>,
    events: UnboundedSender<ProcessEvent>,
    to_event: impl Fn(String) -> ProcessEvent + Send + 'static,
) -> Result<(), ProcessError> {
    thread::Builder::new()
        .name(format!("process-{}", stream))
        .spawn(move || {
            for line in BufReader::new(source).lines() {
                let Ok(line) = line else {
                    break;
                };
                if line.is_empty() || detached.load(Ordering::SeqCst) {
                    continue;
                }
                if events.send(to_event(line)).is_err() {
                    break;
                }
            }
        })
        .map(|_| ())
        .map_err(ProcessError::Thread)
}
