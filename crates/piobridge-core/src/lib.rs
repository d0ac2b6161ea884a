use std::time::Duration;

pub mod rpc;

pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Current on-disk layout of [`ProvisioningState`].
pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StageStatus {
    #[default]
    Pending,
    Installing,
    Succeeded,
    Failed,
}

/// Persisted record of the last toolchain check.
///
/// The field names match the state file written by the editor extensions so
/// both can share one file. Decoding goes through [`ProvisioningState::from_json`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ProvisioningState {
    pub schema: u32,
    #[serde(rename = "pioCoreChecked")]
    pub last_checked_at_unix_ms: u64,
    #[serde(rename = "lastIDEVersion")]
    pub last_ide_version: Option<String>,
}

impl Default for ProvisioningState {
    fn default() -> Self {
        Self {
            schema: STATE_SCHEMA_VERSION,
            last_checked_at_unix_ms: 0,
            last_ide_version: None,
        }
    }
}

impl ProvisioningState {
    /// Validates the shape of a decoded state document.
    ///
    /// Returns `None` unless the value is an object carrying both keys with
    /// usable types. A numeric string timestamp is accepted since older
    /// writers stored it that way.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;

        let schema = match obj.get("schema") {
            None => STATE_SCHEMA_VERSION,
            Some(v) => u32::try_from(v.as_u64()?).ok()?,
        };
        if schema == 0 || schema > STATE_SCHEMA_VERSION {
            return None;
        }

        let checked = match obj.get("pioCoreChecked")? {
            serde_json::Value::Number(n) => n.as_u64()?,
            serde_json::Value::String(s) => s.trim().parse::<u64>().ok()?,
            _ => return None,
        };

        let last_ide_version = match obj.get("lastIDEVersion")? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            _ => return None,
        };

        Some(Self {
            schema,
            last_checked_at_unix_ms: checked,
            last_ide_version,
        })
    }

    pub fn parse_or_default(raw: &str) -> Self {
        serde_json::from_str::<serde_json::Value>(raw)
            .ok()
            .and_then(|v| Self::from_json(&v))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServiceEndpoint {
    pub fn loopback(port: u16) -> Self {
        Self {
            host: LOOPBACK_HOST.to_string(),
            port,
        }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn shutdown_url(&self) -> String {
        format!("{}/?__shutdown__=1", self.http_url())
    }

    pub fn ws_url(&self, path: &str) -> String {
        let path = path.trim();
        if path.starts_with('/') {
            format!("ws://{}:{}{}", self.host, self.port, path)
        } else {
            format!("ws://{}:{}/{}", self.host, self.port, path)
        }
    }
}

/// What the command channel does after its connection closes.
///
/// Disabled by default: a closed channel stays closed until the caller
/// starts a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub delay_ms: u64,
    pub max_delay_ms: u64,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: 500,
            max_delay_ms: 10_000,
            max_retries: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            enabled: true,
            delay_ms,
            max_delay_ms: max_delay_ms.max(delay_ms),
            max_retries: None,
        }
    }

    /// Delay before the given retry. `attempt` is 1-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = self
            .delay_ms
            .saturating_mul(u64::from(attempt.max(1)))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.enabled && self.max_retries.is_none_or(|max| attempt <= max)
    }
}
