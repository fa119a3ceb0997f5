use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::port_owner::PortOwnerResolver;
use crate::server_binary::{BinaryLayout, BinaryProvider};
use crate::server_status::ServerStatus;
use crate::server_supervisor::ServerSupervisor;

/// Server that stays up until it is signalled
pub const LONG_RUNNING_SCRIPT: &str = "#!/bin/sh\nexec sleep 30\n";

/// Server that ignores the terminate signal and only dies from a kill
pub const STUBBORN_SCRIPT: &str = "#!/bin/sh\ntrap '' TERM\nexec sleep 30\n";

/// Server that crashes two seconds after launch
pub const CRASHING_SCRIPT: &str = "#!/bin/sh\nsleep 2\nexit 3\n";

/// Resolver that always reports the same port owner
pub struct FixedPortResolver {
    pid: Option<u32>,
}

impl FixedPortResolver {
    pub fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }
}

impl PortOwnerResolver for FixedPortResolver {
    fn find_listening_process_id(&self, _port: u16) -> Option<u32> {
        self.pid
    }
}

/// Resolver that takes a while to answer and never finds a port owner
pub struct SlowPortResolver {
    delay: Duration,
}

impl SlowPortResolver {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl PortOwnerResolver for SlowPortResolver {
    fn find_listening_process_id(&self, _port: u16) -> Option<u32> {
        std::thread::sleep(self.delay);
        None
    }
}

/// A server binary laid out in a temporary folder
///
/// Scripts `exec sleep` so the running process is named `sleep`.
pub struct FakeServer {
    _dir: TempDir,
    layout: Arc<BinaryLayout>,
}

impl FakeServer {
    /// Lays out a server binary with the given shell script as its content
    pub fn with_script(script: &str) -> Self {
        let fake = Self::missing();
        let path = fake.layout.executable_full_path();
        fs::create_dir_all(fake.layout.executable_folder_path()).unwrap();
        fs::write(&path, script).unwrap();
        fake
    }

    /// A layout whose binary was never downloaded
    pub fn missing() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(BinaryLayout::with_root(dir.path().join("mcp-server")));
        Self { _dir: dir, layout }
    }

    pub fn layout(&self) -> Arc<BinaryLayout> {
        Arc::clone(&self.layout)
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }
}

/// Polls the supervisor until it reports `status` or `timeout` elapses
pub async fn wait_for_status(
    supervisor: &ServerSupervisor,
    status: ServerStatus,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if supervisor.status() == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    supervisor.status() == status
}

/// Initializes stdout logging for tests
pub fn init_test_logging() {
    crate::logging::init_test_logging();
}
