//! Error types for embervm.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using embervm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in embervm operations.
#[derive(Error, Debug)]
pub enum Error {
    // Record errors
    /// VM record not found.
    #[error("vm not found: {0}")]
    NotFound(String),

    /// A VM or resource with this identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// VM is in an invalid state for the requested operation.
    #[error("invalid vm state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// VM name does not match `[A-Za-z0-9_-]+`.
    #[error("invalid vm name '{name}': {reason}")]
    InvalidName {
        /// Rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A state file exists but could not be parsed.
    #[error("corrupt state file {}: {message}", path.display())]
    Corrupt {
        /// Offending file.
        path: PathBuf,
        /// Parse failure.
        message: String,
    },

    /// Another invocation holds the advisory lock.
    #[error("{resource} is locked by another embervm process (pid {pid})")]
    Locked {
        /// Locked resource.
        resource: String,
        /// PID recorded in the lock file.
        pid: u32,
    },

    // Network errors
    /// No free address left in the configured range.
    #[error("network exhausted: {0}")]
    ResourceExhausted(String),

    // Command execution errors
    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    /// A bounded wait ran out.
    #[error("timed out after {}: {what}", humantime::format_duration(*after))]
    Timeout {
        /// What was being waited for.
        what: String,
        /// How long we waited.
        after: Duration,
    },

    /// Operation needs root.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Machine description rejected before launch.
    #[error("invalid machine description: {0}")]
    Description(#[from] embervm_protocol::DescriptionError),

    /// JSON error wrapper.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a corrupt state error.
    pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }

    /// True for errors the user fixes by changing input and retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::AlreadyExists(_)
                | Error::InvalidState { .. }
                | Error::InvalidName { .. }
                | Error::ResourceExhausted(_)
                | Error::Locked { .. }
                | Error::PermissionDenied(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages should include context that helps users fix the problem.

    #[test]
    fn test_not_found_includes_name() {
        let err = Error::NotFound("my-test-vm".to_string());
        assert!(err.to_string().contains("my-test-vm"));
    }

    #[test]
    fn test_corrupt_includes_path_and_reason() {
        let err = Error::corrupt("/state/a/vm.json", "expected value at line 1");
        let msg = err.to_string();
        assert!(msg.contains("/state/a/vm.json"));
        assert!(msg.contains("line 1"));
    }

    #[test]
    fn test_invalid_state_includes_both_states() {
        let err = Error::invalid_state("built", "initialized");
        let msg = err.to_string();
        assert!(msg.contains("built"));
        assert!(msg.contains("initialized"));
    }

    #[test]
    fn test_timeout_is_human_readable() {
        let err = Error::timeout("ssh on 172.16.0.2", Duration::from_secs(120));
        let msg = err.to_string();
        assert!(msg.contains("2m"), "got: {msg}");
        assert!(msg.contains("172.16.0.2"));
    }

    #[test]
    fn test_locked_includes_holder_pid() {
        let err = Error::Locked {
            resource: "vm 'a'".into(),
            pid: 4242,
        };
        assert!(err.to_string().contains("4242"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::ResourceExhausted("full".into()).is_recoverable());
        assert!(Error::invalid_state("built", "running").is_recoverable());
        assert!(!Error::command_failed("ip", "boom").is_recoverable());
        assert!(!Error::corrupt("/x", "bad").is_recoverable());
    }
}
