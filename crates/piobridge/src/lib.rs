//! Provisioning of PlatformIO Core and supervision of the PIO Home server.
//!
//! [`provision::CoreStage`] makes sure a compatible core is installed,
//! [`supervisor::HomeSupervisor`] starts the home server on a free loopback
//! port and [`channel::CommandChannel`] relays the IDE commands it pushes.

pub mod channel;
pub mod config;
pub mod download;
pub mod error;
pub mod home_state;
pub mod paths;
pub mod port_alloc;
pub mod provision;
pub mod python;
pub mod runner;
pub mod state;
pub mod supervisor;
mod support;
pub mod version;

pub use error::{BootstrapError, Result};
pub use support::format_error_chain;
