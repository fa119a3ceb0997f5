use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::warn_log;

/// Default protocol timeout passed to the server, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u32 = 10000;

/// Range of ports a project's server port is generated from
const GENERATED_PORT_MIN: u16 = 50000;
const GENERATED_PORT_MAX: u16 = 59999;

/// Location of the plugin config file, relative to the project root
const CONFIG_RELATIVE_PATH: [&str; 2] = ["UserSettings", "AI-Game-Developer-Config.json"];

// Launch argument keys understood by the server binary
const ARG_PORT: &str = "port";
const ARG_PLUGIN_TIMEOUT: &str = "plugin-timeout";
const ARG_CLIENT_TRANSPORT: &str = "client-transport";
const ARG_AUTHORIZATION: &str = "authorization";
const ARG_TOKEN: &str = "token";

/// Transport the supervisor always launches the server with.
/// Stdio servers are spawned by the AI agent itself, never by us.
const SUPERVISED_TRANSPORT: &str = "streamableHttp";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Authorization mode of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthOption {
    #[default]
    None,
    Required,
}

impl fmt::Display for AuthOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthOption::None => f.write_str("none"),
            AuthOption::Required => f.write_str("required"),
        }
    }
}

/// Snapshot of the settings the supervisor needs to launch a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Server URL as configured by the user, e.g. `http://localhost:50123`
    #[serde(default)]
    pub host: Option<String>,
    /// Port the server listens on
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u32,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub auth_option: AuthOption,
    /// Whether the server should be started automatically and outlive the host
    #[serde(default = "default_keep_server_running")]
    pub keep_server_running: bool,
}

fn default_timeout_ms() -> u32 {
    DEFAULT_TIMEOUT_MS
}

fn default_keep_server_running() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: GENERATED_PORT_MIN,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            token: None,
            auth_option: AuthOption::None,
            keep_server_running: true,
        }
    }
}

impl ServerConfig {
    /// Creates a config for the given port with default settings
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Builds the launch argument tokens passed to the server binary
    ///
    /// The token argument is only added when authorization is required and a token is set.
    pub fn launch_arguments(&self) -> Vec<String> {
        let mut args = vec![
            format!("{}={}", ARG_PORT, self.port),
            format!("{}={}", ARG_PLUGIN_TIMEOUT, self.timeout_ms),
            format!("{}={}", ARG_CLIENT_TRANSPORT, SUPERVISED_TRANSPORT),
            format!("{}={}", ARG_AUTHORIZATION, self.auth_option),
        ];

        if self.auth_option == AuthOption::Required {
            if let Some(token) = self.token.as_deref().filter(|token| !token.is_empty()) {
                args.push(format!("{}={}", ARG_TOKEN, token));
            }
        }

        args
    }

    /// The launch arguments joined into a single space separated line
    pub fn launch_argument_line(&self) -> String {
        self.launch_arguments().join(" ")
    }
}

/// Source of the server settings, read again before every start
pub trait ConfigProvider: Send + Sync {
    fn server_config(&self) -> ServerConfig;
}

impl ConfigProvider for ServerConfig {
    fn server_config(&self) -> ServerConfig {
        self.clone()
    }
}

/// Reads the server settings from the project's plugin config file
#[derive(Debug, Clone)]
pub struct JsonConfigProvider {
    project_path: PathBuf,
    config_path: PathBuf,
}

impl JsonConfigProvider {
    /// Creates a provider for the config file of the given Unity project
    pub fn for_project<P: AsRef<Path>>(project_path: P) -> Self {
        let project_path = project_path.as_ref().to_path_buf();
        let config_path = CONFIG_RELATIVE_PATH
            .iter()
            .fold(project_path.clone(), |path, segment| path.join(segment));
        Self {
            project_path,
            config_path,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Loads the config file, resolving the port from the host URL or the project directory
    pub fn load(&self) -> Result<ServerConfig, ConfigError> {
        let content = fs::read_to_string(&self.config_path)?;
        let mut config: ServerConfig = serde_json::from_str(&content)?;
        config.port = self.resolve_port(config.host.as_deref());
        Ok(config)
    }

    /// Saves the config file, creating the parent folder if needed
    pub fn save(&self, config: &ServerConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.config_path, content)?;
        Ok(())
    }

    fn resolve_port(&self, host: Option<&str>) -> u16 {
        host.and_then(port_from_host)
            .unwrap_or_else(|| generate_port_from_directory(&self.project_path))
    }
}

impl ConfigProvider for JsonConfigProvider {
    fn server_config(&self) -> ServerConfig {
        match self.load() {
            Ok(config) => config,
            Err(e) => {
                warn_log!(
                    "Failed to read MCP config from {}, using defaults: {}",
                    self.config_path.display(),
                    e
                );
                ServerConfig {
                    port: self.resolve_port(None),
                    ..ServerConfig::default()
                }
            }
        }
    }
}

/// Extracts an explicit, non-zero port from a URL like `http://localhost:50123/`
pub fn port_from_host(host: &str) -> Option<u16> {
    let without_scheme = host.split_once("://").map_or(host, |(_, rest)| rest);
    let authority = without_scheme.split('/').next()?;
    let (_, port) = authority.rsplit_once(':')?;
    port.parse::<u16>().ok().filter(|port| *port > 0)
}

/// Generates a stable port for a project directory
///
/// The lower-cased path is hashed with SHA-256 and the first four bytes, read as a little-endian
/// integer, are mapped into the 50000-59999 range.
pub fn generate_port_from_directory(directory: &Path) -> u16 {
    let normalized = directory.to_string_lossy().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let hash = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let range = u32::from(GENERATED_PORT_MAX - GENERATED_PORT_MIN) + 1;
    GENERATED_PORT_MIN + (hash % range) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_arguments_without_auth() {
        let config = ServerConfig {
            port: 50123,
            timeout_ms: 15000,
            token: Some("secret".to_string()),
            ..ServerConfig::default()
        };

        assert_eq!(
            config.launch_argument_line(),
            "port=50123 plugin-timeout=15000 client-transport=streamableHttp authorization=none"
        );
    }

    #[test]
    fn test_launch_arguments_with_required_auth() {
        let config = ServerConfig {
            port: 50123,
            token: Some("secret".to_string()),
            auth_option: AuthOption::Required,
            ..ServerConfig::default()
        };

        let args = config.launch_arguments();
        assert_eq!(args.len(), 5);
        assert_eq!(args[3], "authorization=required");
        assert_eq!(args[4], "token=secret");
    }

    #[test]
    fn test_launch_arguments_required_auth_with_empty_token() {
        let config = ServerConfig {
            token: Some(String::new()),
            auth_option: AuthOption::Required,
            ..ServerConfig::default()
        };

        assert!(!config.launch_argument_line().contains("token="));
    }

    #[test]
    fn test_port_from_host() {
        assert_eq!(port_from_host("http://localhost:50123"), Some(50123));
        assert_eq!(port_from_host("http://127.0.0.1:8080/mcp"), Some(8080));
        assert_eq!(port_from_host("localhost:9000"), Some(9000));
        assert_eq!(port_from_host("http://localhost"), None);
        assert_eq!(port_from_host("http://localhost:0"), None);
        assert_eq!(port_from_host("http://localhost:99999"), None);
    }

    #[test]
    fn test_generated_port_is_stable_and_in_range() {
        let first = generate_port_from_directory(Path::new("/Projects/MyGame"));
        let second = generate_port_from_directory(Path::new("/projects/mygame"));
        assert_eq!(first, second);
        assert!((GENERATED_PORT_MIN..=GENERATED_PORT_MAX).contains(&first));
    }

    #[test]
    fn test_json_provider_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let provider = JsonConfigProvider::for_project(dir.path());

        let config = provider.server_config();
        assert_eq!(config.port, generate_port_from_directory(dir.path()));
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.auth_option, AuthOption::None);
    }

    #[test]
    fn test_json_provider_reads_saved_config() {
        let dir = tempfile::tempdir().unwrap();
        let provider = JsonConfigProvider::for_project(dir.path());
        let saved = ServerConfig {
            host: Some("http://localhost:51234".to_string()),
            port: 0,
            timeout_ms: 20000,
            token: Some("abc".to_string()),
            auth_option: AuthOption::Required,
            keep_server_running: false,
        };
        provider.save(&saved).unwrap();

        let loaded = provider.server_config();
        assert_eq!(loaded.port, 51234);
        assert_eq!(loaded.timeout_ms, 20000);
        assert_eq!(loaded.auth_option, AuthOption::Required);
        assert!(!loaded.keep_server_running);
    }

    #[test]
    fn test_json_provider_accepts_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let provider = JsonConfigProvider::for_project(dir.path());
        fs::create_dir_all(provider.config_path().parent().unwrap()).unwrap();
        fs::write(provider.config_path(), r#"{ "authOption": "required" }"#).unwrap();

        let config = provider.load().unwrap();
        assert_eq!(config.auth_option, AuthOption::Required);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(config.keep_server_running);
    }
}
