use std::fs;
use std::path::{Path, PathBuf};

/// Base name of the MCP server executable
pub const EXECUTABLE_NAME: &str = "unity-mcp-server";

const VERSION_FILE_NAME: &str = "version";

/// Provides the server binary the supervisor launches
///
/// Downloading and unpacking the binary happens elsewhere, the supervisor only needs to know
/// whether it exists and where it lives.
pub trait BinaryProvider: Send + Sync {
    fn executable_exists(&self) -> bool;
    fn executable_full_path(&self) -> PathBuf;
    /// Folder the server is started in
    fn executable_folder_path(&self) -> PathBuf;
}

/// Binary layout inside a Unity project:
/// `<project>/Library/mcp-server/<os>-<arch>/unity-mcp-server[.exe]` with a sibling `version` file
#[derive(Debug, Clone)]
pub struct BinaryLayout {
    root: PathBuf,
    platform: String,
}

impl BinaryLayout {
    /// Layout for the current platform inside the given Unity project
    pub fn for_project<P: AsRef<Path>>(project_path: P) -> Self {
        Self::with_root(project_path.as_ref().join("Library").join("mcp-server"))
    }

    /// Layout for the current platform under an explicit root folder
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            platform: platform_name(),
        }
    }

    /// Folder holding the binaries of every platform
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn version_file_path(&self) -> PathBuf {
        self.executable_folder_path().join(VERSION_FILE_NAME)
    }

    /// Reads the version the installed binary was downloaded for
    pub fn binary_version(&self) -> Option<String> {
        fs::read_to_string(self.version_file_path())
            .ok()
            .map(|version| version.trim().to_string())
    }

    pub fn is_version_matching(&self, expected: &str) -> bool {
        self.binary_version()
            .map(|version| version == expected.trim())
            .unwrap_or(false)
    }
}

impl BinaryProvider for BinaryLayout {
    fn executable_exists(&self) -> bool {
        self.executable_full_path().is_file()
    }

    fn executable_full_path(&self) -> PathBuf {
        self.executable_folder_path().join(executable_file_name())
    }

    fn executable_folder_path(&self) -> PathBuf {
        self.root.join(&self.platform)
    }
}

/// `<os>-<arch>` name of the current platform, e.g. `linux-x64` or `osx-arm64`
pub fn platform_name() -> String {
    let os = match std::env::consts::OS {
        "windows" => "win",
        "macos" => "osx",
        "linux" => "linux",
        _ => "unknown",
    };
    let arch = match std::env::consts::ARCH {
        "x86" => "x86",
        "x86_64" => "x64",
        "arm" => "arm",
        "aarch64" => "arm64",
        _ => "unknown",
    };
    format!("{}-{}", os, arch)
}

/// Executable file name for the current platform
pub fn executable_file_name() -> String {
    if cfg!(windows) {
        format!("{}.exe", EXECUTABLE_NAME)
    } else {
        EXECUTABLE_NAME.to_string()
    }
}

/// Makes the binary executable (0755), a no-op on Windows
pub fn ensure_executable(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
