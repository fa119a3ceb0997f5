use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{debug_log, info_log, warn_log};

/// Attempts after which removal is aborted without asking again
const MAX_REMOVAL_ATTEMPTS: u32 = 10;

/// Pause after stopping the server so the OS can release file locks
const RELEASE_LOCKS_DELAY: Duration = Duration::from_secs(2);

/// States of a binary folder removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalState {
    /// Removal is being attempted without user involvement
    Attempting,
    /// Removal failed repeatedly, the caller has to decide how to continue
    AwaitingUserDecision,
    /// The caller asked for another attempt
    Retrying,
    /// The caller gave up, or the attempt limit was reached
    Aborted,
    /// The folder is gone
    Removed,
}

/// Answer to [`RemovalStep::AwaitingDecision`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalDecision {
    Retry,
    Abort,
}

/// Outcome of one removal attempt
#[derive(Debug)]
pub enum RemovalStep {
    Removed,
    NotPresent,
    /// Removal failed and will be retried by the next `attempt` call
    RetryPending,
    /// Removal keeps failing, most likely because the server still holds the binaries
    AwaitingDecision { error: io::Error },
    Aborted,
}

/// Removes the server binary folder, which fails while a server process still uses it
///
/// The first failure stops the server and retries, the second retries silently, every later
/// failure is handed to the caller as [`RemovalStep::AwaitingDecision`].
pub struct BinaryFolderRemoval {
    root: PathBuf,
    state: RemovalState,
    failures: u32,
    release_delay: Duration,
}

impl BinaryFolderRemoval {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            state: RemovalState::Attempting,
            failures: 0,
            release_delay: RELEASE_LOCKS_DELAY,
        }
    }

    pub fn state(&self) -> RemovalState {
        self.state
    }

    /// Attempts the removal once
    ///
    /// `stop_server` is called after the first failure and returns whether a server was stopped.
    pub fn attempt(&mut self, stop_server: impl FnOnce() -> bool) -> RemovalStep {
        match self.state {
            RemovalState::Removed => return RemovalStep::Removed,
            RemovalState::Aborted => return RemovalStep::Aborted,
            RemovalState::AwaitingUserDecision => {
                warn_log!("Binary folder removal is waiting for a decision");
                return RemovalStep::AwaitingDecision {
                    error: io::Error::other("removal is waiting for a decision"),
                };
            }
            RemovalState::Attempting | RemovalState::Retrying => {}
        }

        if !self.root.exists() {
            self.state = RemovalState::Removed;
            return RemovalStep::NotPresent;
        }

        let result = fs::remove_dir_all(&self.root);
        self.record(result, stop_server)
    }

    /// Applies the caller's decision after [`RemovalStep::AwaitingDecision`]
    pub fn decide(&mut self, decision: RemovalDecision) {
        if self.state != RemovalState::AwaitingUserDecision {
            return;
        }
        self.state = match decision {
            RemovalDecision::Retry => RemovalState::Retrying,
            RemovalDecision::Abort => RemovalState::Aborted,
        };
    }

    fn record(
        &mut self,
        result: io::Result<()>,
        stop_server: impl FnOnce() -> bool,
    ) -> RemovalStep {
        let error = match result {
            Ok(()) => {
                info_log!("Deleted MCP server folder: {}", self.root.display());
                self.state = RemovalState::Removed;
                return RemovalStep::Removed;
            }
            Err(error) => error,
        };

        self.failures += 1;
        debug_log!(
            "Failed to delete MCP server folder {} (attempt {}): {}",
            self.root.display(),
            self.failures,
            error
        );

        if self.failures >= MAX_REMOVAL_ATTEMPTS {
            warn_log!(
                "Giving up deleting MCP server folder after {} attempts",
                self.failures
            );
            self.state = RemovalState::Aborted;
            return RemovalStep::Aborted;
        }

        match self.failures {
            1 => {
                info_log!("Attempting to stop the MCP server before retrying deletion");
                if stop_server() {
                    std::thread::sleep(self.release_delay);
                } else {
                    warn_log!("No running MCP server process found to stop");
                }
                self.state = RemovalState::Retrying;
                RemovalStep::RetryPending
            }
            2 => {
                self.state = RemovalState::Retrying;
                RemovalStep::RetryPending
            }
            _ => {
                self.state = RemovalState::AwaitingUserDecision;
                RemovalStep::AwaitingDecision { error }
            }
        }
    }
}
