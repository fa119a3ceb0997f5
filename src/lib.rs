//! Unity MCP Server Supervisor
//!
//! Launches and supervises the local MCP server process of a Unity project: starts it with the
//! project's settings, verifies it survives startup, reconnects to it after the host restarts,
//! reaps orphaned servers left on its port, and shuts it down gracefully or by force.

pub mod logging;

pub mod binary_removal;
pub mod orphan_reaper;
pub mod port_owner;
pub mod process_handle;
pub mod process_store;
pub mod server_binary;
pub mod server_config;
pub mod server_status;
pub mod server_supervisor;
pub mod startup_verifier;
pub mod system_processes;

#[cfg(test)]
pub mod test_utils;

pub use binary_removal::{BinaryFolderRemoval, RemovalDecision, RemovalState, RemovalStep};
pub use process_store::{JsonFileStore, MemoryStore, ProcessStore};
pub use server_binary::{BinaryLayout, BinaryProvider};
pub use server_config::{AuthOption, ConfigProvider, JsonConfigProvider, ServerConfig};
pub use server_status::ServerStatus;
pub use server_supervisor::{
    ServerSupervisor, SupervisorError, SupervisorOptions, SupervisorTimings,
};
