use std::path::{Path, PathBuf};

use crate::support::env_string;

/// Operating system and CPU architecture the commands are built for.
///
/// Captured from the build target by default; tests override it to walk the
/// Windows-only branches on any host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPlatform {
    pub os: &'static str,
    pub arch: &'static str,
}

impl HostPlatform {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    pub fn exe_name(&self, name: &str) -> String {
        if self.is_windows() {
            format!("{name}.exe")
        } else {
            name.to_string()
        }
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::current()
    }
}

/// Filesystem layout under the core home directory.
#[derive(Debug, Clone)]
pub struct CorePaths {
    pub home_dir: PathBuf,
    pub env_dir: PathBuf,
    pub env_bin_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub state_file: PathBuf,
    pub home_state_file: PathBuf,
    platform: HostPlatform,
}

impl CorePaths {
    pub fn new(home_dir: impl Into<PathBuf>, platform: HostPlatform) -> Self {
        let home_dir = home_dir.into();
        let env_dir = home_dir.join("penv");
        let env_bin_dir = if platform.is_windows() {
            env_dir.join("Scripts")
        } else {
            env_dir.join("bin")
        };
        Self {
            cache_dir: home_dir.join(".cache"),
            state_file: home_dir.join("piobridge-state.json"),
            home_state_file: home_dir.join("homestate.json"),
            env_dir,
            env_bin_dir,
            home_dir,
            platform,
        }
    }

    pub fn platform(&self) -> HostPlatform {
        self.platform
    }

    pub fn env_bin(&self, name: &str) -> PathBuf {
        self.env_bin_dir.join(self.platform.exe_name(name))
    }

    /// Program used to run core commands: the environment's copy in managed
    /// mode, whatever is on the search path otherwise.
    pub fn core_program(&self, builtin: bool) -> PathBuf {
        if builtin {
            self.env_bin("platformio")
        } else {
            PathBuf::from("platformio")
        }
    }

    pub fn windows_python_dir(&self) -> PathBuf {
        self.home_dir.join("python27")
    }
}

/// `PLATFORMIO_HOME_DIR`, else `~/.platformio`.
pub fn default_home_dir() -> PathBuf {
    if let Some(dir) = env_string("PLATFORMIO_HOME_DIR") {
        return absolutize(Path::new(&dir));
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".platformio")
}

fn absolutize(p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    }
}
