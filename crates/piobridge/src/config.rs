use std::path::{Path, PathBuf};

use anyhow::Context;
use piobridge_core::ReconnectPolicy;

use crate::{
    paths,
    support::{env_bool, env_string, env_u64},
};

pub const DEFAULT_VIRTUALENV_URL: &str =
    "https://files.pythonhosted.org/packages/source/v/virtualenv/virtualenv-16.7.12.tar.gz";

/// Environment variable the host editor sets to its own version.
pub const IDE_VERSION_ENV: &str = "PLATFORMIO_IDE";

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Core home directory; `PLATFORMIO_HOME_DIR` or `~/.platformio` when unset.
    pub home_dir: Option<PathBuf>,
    /// Use the managed environment instead of a system-wide core.
    pub use_builtin_core: bool,
    /// Install the core from its develop branch.
    pub use_development_core: bool,
    pub min_core_version: String,
    /// Upper bound on interactive interpreter prompts per install.
    pub max_python_prompts: u32,
    /// Pinned source archive that carries a standalone `virtualenv.py`.
    pub virtualenv_url: String,
    /// Interpreter version requested from conda (`python=<this>`).
    pub conda_python: String,
    /// Interpreter installed from the python.org MSI on Windows.
    pub windows_python_version: String,
    pub home: HomeConfig,
    pub reconnect: ReconnectPolicy,
    /// Host editor version, from [`IDE_VERSION_ENV`]. Not read from the file.
    #[serde(skip)]
    pub ide_version: Option<String>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            home_dir: None,
            use_builtin_core: true,
            use_development_core: false,
            min_core_version: "3.5.0".to_string(),
            max_python_prompts: 10,
            virtualenv_url: DEFAULT_VIRTUALENV_URL.to_string(),
            conda_python: "2".to_string(),
            windows_python_version: "2.7.18".to_string(),
            home: HomeConfig::default(),
            reconnect: ReconnectPolicy::default(),
            ide_version: None,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct HomeConfig {
    pub base_port: u16,
    /// Exclusive upper bound of the port scan.
    pub max_port: u16,
    pub poll_interval_ms: u64,
    pub startup_timeout_ms: u64,
    /// Connect timeout for a single port probe.
    pub probe_timeout_ms: u64,
    /// Websocket path of the command channel.
    pub channel_path: String,
}

impl Default for HomeConfig {
    fn default() -> Self {
        Self {
            base_port: 8010,
            max_port: 9000,
            poll_interval_ms: 500,
            startup_timeout_ms: 15_000,
            probe_timeout_ms: 1_000,
            channel_path: "/wsrpc/websocket".to_string(),
        }
    }
}

impl BootstrapConfig {
    /// Reads `PIOBRIDGE_CONFIG` (or `<home>/piobridge.toml` when present),
    /// then applies `PIOBRIDGE_*` environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(None)
    }

    /// Like [`BootstrapConfig::load`], with `explicit` taking precedence over
    /// `PIOBRIDGE_CONFIG`.
    pub fn load_from(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = explicit.or_else(|| env_string("PIOBRIDGE_CONFIG").map(PathBuf::from));
        let path = explicit
            .clone()
            .unwrap_or_else(|| paths::default_home_dir().join("piobridge.toml"));

        let mut cfg = if explicit.is_some() || path.is_file() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.normalize();
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let mut cfg: Self = toml::from_str(raw)?;
        cfg.normalize();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_bool("PIOBRIDGE_USE_BUILTIN_CORE") {
            self.use_builtin_core = v;
        }
        if let Some(v) = env_bool("PIOBRIDGE_DEVELOP_CORE") {
            self.use_development_core = v;
        }
        if let Some(v) = env_string("PIOBRIDGE_MIN_CORE_VERSION") {
            self.min_core_version = v;
        }
        if let Some(v) = env_u64("PIOBRIDGE_BASE_PORT") {
            self.home.base_port = v.clamp(1024, 65_000) as u16;
        }
        if let Some(v) = env_u64("PIOBRIDGE_MAX_PORT") {
            self.home.max_port = v.clamp(1025, 65_535) as u16;
        }
        if let Some(v) = env_u64("PIOBRIDGE_POLL_INTERVAL_MS") {
            self.home.poll_interval_ms = v;
        }
        if let Some(v) = env_u64("PIOBRIDGE_STARTUP_TIMEOUT_MS") {
            self.home.startup_timeout_ms = v;
        }
        if let Some(v) = env_bool("PIOBRIDGE_RECONNECT") {
            self.reconnect.enabled = v;
        }
        self.ide_version = env_string(IDE_VERSION_ENV);
    }

    fn normalize(&mut self) {
        self.home.poll_interval_ms = self.home.poll_interval_ms.clamp(50, 10_000);
        self.home.startup_timeout_ms = self.home.startup_timeout_ms.clamp(1_000, 10 * 60 * 1000);
        self.home.probe_timeout_ms = self.home.probe_timeout_ms.clamp(50, 30_000);
        if self.home.max_port <= self.home.base_port {
            self.home.max_port = self.home.base_port.saturating_add(1);
        }
        self.max_python_prompts = self.max_python_prompts.clamp(1, 1000);
        self.reconnect.max_delay_ms = self.reconnect.max_delay_ms.max(self.reconnect.delay_ms);
    }

    pub fn home_dir(&self) -> PathBuf {
        self.home_dir.clone().unwrap_or_else(paths::default_home_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = BootstrapConfig::default();
        assert!(cfg.use_builtin_core);
        assert!(!cfg.use_development_core);
        assert_eq!(cfg.home.base_port, 8010);
        assert_eq!(cfg.home.max_port, 9000);
        assert_eq!(cfg.home.poll_interval_ms, 500);
        assert_eq!(cfg.home.startup_timeout_ms, 15_000);
        assert!(!cfg.reconnect.enabled);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = BootstrapConfig::from_toml_str(
            r#"
            min_core_version = "4.0.0"
            use_builtin_core = false

            [home]
            base_port = 9100
            max_port = 9200

            [reconnect]
            enabled = true
            delay_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(cfg.min_core_version, "4.0.0");
        assert!(!cfg.use_builtin_core);
        assert_eq!(cfg.home.base_port, 9100);
        assert_eq!(cfg.home.max_port, 9200);
        assert_eq!(cfg.home.startup_timeout_ms, 15_000);
        assert!(cfg.reconnect.enabled);
        assert_eq!(cfg.reconnect.delay_ms, 250);
        assert_eq!(cfg.reconnect.max_delay_ms, 10_000);
    }

    #[test]
    fn inverted_port_range_is_repaired() {
        let cfg = BootstrapConfig::from_toml_str("[home]\nbase_port = 9000\nmax_port = 8000\n")
            .unwrap();
        assert_eq!(cfg.home.max_port, 9001);
    }

    #[test]
    fn rejects_unparseable_toml() {
        assert!(BootstrapConfig::from_toml_str("use_builtin_core = \"maybe\"").is_err());
    }
}
