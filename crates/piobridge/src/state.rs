use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use piobridge_core::ProvisioningState;

/// How long a core check stays fresh before the next check upgrades it.
pub const UPGRADE_CHECK_INTERVAL: Duration = Duration::from_secs(86_400 * 3);

/// JSON file holding the [`ProvisioningState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: an absent, unreadable or malformed file yields the
    /// zeroed default.
    pub fn load(&self) -> ProvisioningState {
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let state = ProvisioningState::parse_or_default(&raw);
                if state == ProvisioningState::default() && !raw.trim().is_empty() {
                    tracing::debug!(path = %self.path.display(), "state file not recognised, using defaults");
                }
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProvisioningState::default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "read state file");
                ProvisioningState::default()
            }
        }
    }

    pub fn save(&self, state: &ProvisioningState) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let payload = serde_json::to_vec_pretty(state).context("encode state")?;
        let tmp = self.path.with_extension("tmp");
        let mut f = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(&payload)?;
        f.sync_all().ok();
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("write {}", self.path.display()))?;
        Ok(())
    }
}

/// Whether the periodic core upgrade is due.
///
/// Due when more than [`UPGRADE_CHECK_INTERVAL`] passed since the last check,
/// or when the host editor reports a different version than last time (both
/// versions must be known).
pub fn upgrade_due(state: &ProvisioningState, now_unix_ms: u64, ide_version: Option<&str>) -> bool {
    let ide_changed = matches!(
        (state.last_ide_version.as_deref(), ide_version),
        (Some(last), Some(current)) if last != current
    );
    let interval_ms = UPGRADE_CHECK_INTERVAL.as_millis() as u64;
    let stale = now_unix_ms.saturating_sub(state.last_checked_at_unix_ms) > interval_ms;
    ide_changed || stale
}
