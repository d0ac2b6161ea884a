use std::path::Path;

use serde_json::Value;

/// Whether the home UI wants to be shown when `caller` starts.
///
/// Reads `storage.showOnStartup[caller]` from the home UI state file.
/// Anything missing or malformed means yes.
pub fn show_at_startup(state_file: &Path, caller: &str) -> bool {
    let raw = match std::fs::read_to_string(state_file) {
        Ok(raw) => raw,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %state_file.display(), error = %e, "read home state");
            }
            return true;
        }
    };
    let Ok(state) = serde_json::from_str::<Value>(&raw) else {
        tracing::debug!(path = %state_file.display(), "home state is not valid JSON");
        return true;
    };
    state
        .pointer("/storage/showOnStartup")
        .and_then(|m| m.get(caller))
        .and_then(Value::as_bool)
        .unwrap_or(true)
}
