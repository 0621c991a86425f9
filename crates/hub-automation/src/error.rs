//! Engine error type

use hub_core::CharacteristicError;
use thiserror::Error;

/// Automation engine errors
///
/// `Clone` so a memoized operation can hand the same failure to every caller
/// awaiting it.
#[derive(Debug, Clone, Error)]
pub enum AutomationError {
    /// Unknown type, unknown plugin, bad options
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Misuse of the engine API, e.g. an out-of-range progress value
    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("Trigger {0} is not running")]
    NotRunning(u64),

    #[error("Runner {0} has already finished")]
    RunnerFinished(u64),

    #[error("{kind} {id} belongs to a different automation group")]
    CrossGroup { kind: &'static str, id: u64 },

    #[error("Duplicate uuid: {0}")]
    DuplicateUuid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error(transparent)]
    Characteristic(#[from] CharacteristicError),

    /// Runtime failure reported by a plugin condition, action or trigger
    #[error("{0}")]
    Failed(String),

    #[error("Automation group has been dropped")]
    GroupDropped,
}

impl From<mlua::Error> for AutomationError {
    fn from(e: mlua::Error) -> Self {
        AutomationError::Script(e.to_string())
    }
}

/// Result type for engine operations
pub type AutomationResult<T> = Result<T, AutomationError>;
