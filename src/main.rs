use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use unity_mcp_supervisor::logging::init_logging;
use unity_mcp_supervisor::{
    BinaryLayout, BinaryProvider, ConfigProvider, JsonConfigProvider, JsonFileStore,
    ServerSupervisor, info_log, warn_log,
};

const STATE_FILE_NAME: &str = "supervisor-state.json";
const PROJECT_PATH_ENV: &str = "UNITY_PROJECT_PATH";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let project_path = resolve_project_path()?;
    println!("Unity MCP server supervisor");
    println!("Project path: {}", project_path.display());
    info_log!("Supervising MCP server of {}", project_path.display());

    let config = Arc::new(JsonConfigProvider::for_project(&project_path));
    let binary = Arc::new(BinaryLayout::for_project(&project_path));
    let store = Arc::new(JsonFileStore::open(binary.root().join(STATE_FILE_NAME)));

    match binary.binary_version() {
        Some(version) => println!("MCP server binary {} ({})", version, binary.platform()),
        None => warn_log!(
            "No MCP server binary version found at {}",
            binary.version_file_path().display()
        ),
    }

    let supervisor = ServerSupervisor::new(config.clone(), binary.clone(), store)
        .context("Failed to create MCP server supervisor")?;

    let mut status_rx = supervisor.subscribe();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = *status_rx.borrow_and_update();
            println!("MCP server status: {}", status);
        }
    });

    if supervisor.reconnect() {
        println!("Reconnected to running MCP server");
    } else if supervisor.detect_external_server().await {
        println!(
            "An MCP server not started by us is listening on port {}",
            config.server_config().port
        );
    } else {
        if !binary.executable_exists() {
            bail!(
                "MCP server binary not found at {}",
                binary.executable_full_path().display()
            );
        }
        let starter = supervisor.clone();
        let started = tokio::task::spawn_blocking(move || starter.start_server())
            .await
            .context("MCP server start task failed")?;
        if !started {
            bail!("MCP server could not be started, see the log for details");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    if config.server_config().keep_server_running {
        info_log!("keepServerRunning is set, leaving the MCP server running");
        println!("Leaving MCP server running");
        return Ok(());
    }

    let stopper = supervisor.clone();
    tokio::task::spawn_blocking(move || stopper.stop_server(true))
        .await
        .context("MCP server stop task failed")?;
    println!("MCP server stopped");
    Ok(())
}

/// Project path from the first argument, the environment, or the current directory
fn resolve_project_path() -> Result<PathBuf> {
    if let Some(arg) = std::env::args().nth(1) {
        return Ok(PathBuf::from(arg));
    }
    if let Ok(path) = std::env::var(PROJECT_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    std::env::current_dir().context("Failed to determine the current directory")
}
