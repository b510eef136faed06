//! CLI command implementations.

pub mod build;
pub mod config;
pub mod console;
pub mod destroy;
pub mod doctor;
pub mod down;
pub mod init;
pub mod list;
pub mod parsers;
pub mod setup;
pub mod ssh;
pub mod status;
pub mod up;

use embervm::config::EmbervmConfig;
use embervm::Controller;

/// Open the controller over the real host.
pub fn controller(config: EmbervmConfig) -> embervm::Result<Controller> {
    Controller::open(config)
}

/// Render an optional value for table output.
pub fn or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}
