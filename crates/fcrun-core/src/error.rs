//! Error types for fcrun-core.

use crate::runner::RunState;
use thiserror::Error;

/// Result type alias for fcrun-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that end a run before a receipt can be produced.
///
/// A guest that never reports completion is not an error: the run still
/// yields a receipt with the incomplete exit code.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The configuration was rejected before any resource was created
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// A setup step failed; everything acquired so far has been released
    #[error("run failed in state {state}: {source}")]
    Setup {
        /// State the run had reached when the step failed
        state: RunState,
        #[source]
        source: fcrun_vm::VmError,
    },
}

impl CoreError {
    /// Whether the configuration was rejected up front.
    pub fn is_validation(&self) -> bool {
        matches!(self, CoreError::Validation(_))
    }

    /// State a failed setup had reached, if this is a setup error.
    pub fn state(&self) -> Option<RunState> {
        match self {
            CoreError::Setup { state, .. } => Some(*state),
            CoreError::Validation(_) => None,
        }
    }
}
