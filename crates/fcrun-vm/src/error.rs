//! Error types for fcrun-vm.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for fcrun-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while driving a Firecracker process.
#[derive(Debug, Error)]
pub enum VmError {
    /// Failed to spawn the hypervisor process
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to stop the hypervisor process
    #[error("failed to stop process: {0}")]
    Stop(String),

    /// Request body could not be built or serialized
    #[error("configuration error: {0}")]
    Config(String),

    /// The API socket could not be reached or the exchange broke off
    #[error("PUT {path} failed: {message}")]
    Transport { path: String, message: String },

    /// The API answered with a non-success status
    #[error("PUT {path} failed: {status}: {body}")]
    Api {
        path: String,
        status: u16,
        body: String,
    },

    /// Host network device operation failed
    #[error("network device {device}: {message}")]
    Network { device: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for operation
    #[error("{what} timed out after {elapsed:?}")]
    Timeout { what: String, elapsed: Duration },

    /// The run deadline expired or the caller cancelled
    #[error("{0}")]
    Cancelled(String),
}

impl VmError {
    /// Whether this error came from the shared deadline rather than the operation itself.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, VmError::Cancelled(_))
    }
}
