use std::path::PathBuf;

use piobridge_core::rpc::RpcParseError;

/// Failures surfaced by the provisioning stage, the home supervisor and the
/// command channel.
///
/// Intermediate fallbacks never show up here; only the terminal failure of a
/// public operation does.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("can not find a Python interpreter")]
    InterpreterNotFound,

    #[error("virtual environment is not created: {} does not exist", .0.display())]
    EnvironmentMissing(PathBuf),

    #[error("could not create virtual environment: {0}")]
    EnvironmentCreationFailed(String),

    #[error("could not install PlatformIO Core: {0}")]
    PackageInstallFailed(String),

    #[error("incompatible PlatformIO Core {found} (required >= {required})")]
    IncompatibleVersion { found: String, required: String },

    #[error("PlatformIO Core is not available: {0}")]
    CoreUnavailable(String),

    #[error("could not start PIO Home server on port {port}: no connection after {waited_ms}ms")]
    StartupTimeout { port: u16, waited_ms: u64 },

    #[error("no free port in {start}..{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("could not spawn PIO Home server: {0}")]
    Spawn(String),

    #[error("invalid RPC message: {0}")]
    RpcParse(#[from] RpcParseError),

    #[error("errored RPC result ({code}): {message}")]
    RpcApplication { code: i64, message: String },
}

pub type Result<T, E = BootstrapError> = std::result::Result<T, E>;
