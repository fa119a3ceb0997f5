use std::fmt;

/// Lifecycle status of the supervised MCP server process
///
/// Only the supervisor changes this value, every other component observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServerStatus {
    /// No process owned and none believed to be running
    #[default]
    Stopped,
    /// Start requested, the new process has not been verified yet
    Starting,
    /// Started and verified alive past the grace window
    Running,
    /// Terminate signal sent, exit not confirmed yet
    Stopping,
    /// A server we don't own answers on the configured port
    External,
}

impl ServerStatus {
    /// Whether a start or stop is currently in flight or a server is owned
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServerStatus::Starting | ServerStatus::Running | ServerStatus::Stopping
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ServerStatus::Stopped => "Stopped",
            ServerStatus::Starting => "Starting",
            ServerStatus::Running => "Running",
            ServerStatus::Stopping => "Stopping",
            ServerStatus::External => "External",
        };
        f.write_str(text)
    }
}
