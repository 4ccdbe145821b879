//! Error types for call-control operations
//!
//! Every command outcome that is not a success is one of the variants of
//! [`ControlError`]. The variants line up with what the command layer reports
//! back to its caller:
//!
//! - **InvalidArgument** - malformed or missing command fields, nothing was mutated
//! - **UnknownAction** - the action name is not recognized
//! - **InvalidState** - the action is illegal for the entity's current state, nothing was mutated
//! - **InvalidConfig** - account or service configuration is missing required values
//! - **AccountBusy** - the account still owns live calls
//! - **StaleReference** - the id points at an entity that is terminated, removed or was never allocated
//! - **EngineFailure** - the telephony engine reported a failure, code and message are passed through
//!
//! # Logging errors
//!
//! ```rust
//! use rvoip_call_control::ControlError;
//!
//! let err = ControlError::invalid_state("call 7", "answer", "Connected");
//! tracing::warn!(error = %err, kind = err.kind(), category = err.category(), "Command rejected");
//! assert_eq!(err.kind(), "InvalidState");
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineFailure;

/// Result type alias for call-control operations
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors reported by the command dispatcher and the managers behind it
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    /// A payload field is missing or has the wrong type
    #[error("Invalid argument: {field} - {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("Unknown action: {action}")]
    UnknownAction { action: String },

    /// The operation is not allowed from the entity's current state
    #[error("Invalid state: {operation} not permitted on {entity} while {state}")]
    InvalidState {
        entity: String,
        operation: String,
        state: String,
    },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Account {account_id} is busy: {active_calls} active call(s)")]
    AccountBusy { account_id: u32, active_calls: usize },

    /// The id was terminated, removed or never allocated
    #[error("Stale reference: {entity} {id} - {reason}")]
    StaleReference {
        entity: String,
        id: u32,
        reason: String,
    },

    #[error("Engine failure ({code}): {message}")]
    EngineFailure { code: u16, message: String },
}

impl ControlError {
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_action(action: impl Into<String>) -> Self {
        Self::UnknownAction {
            action: action.into(),
        }
    }

    pub fn invalid_state(
        entity: impl Into<String>,
        operation: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            entity: entity.into(),
            operation: operation.into(),
            state: state.into(),
        }
    }

    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn stale_call(call_id: u32, reason: impl Into<String>) -> Self {
        Self::StaleReference {
            entity: "call".to_string(),
            id: call_id,
            reason: reason.into(),
        }
    }

    pub fn stale_account(account_id: u32, reason: impl Into<String>) -> Self {
        Self::StaleReference {
            entity: "account".to_string(),
            id: account_id,
            reason: reason.into(),
        }
    }

    pub fn engine_failure(code: u16, message: impl Into<String>) -> Self {
        Self::EngineFailure {
            code,
            message: message.into(),
        }
    }

    /// Taxonomy name reported to the command layer
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::InvalidArgument { .. } => "InvalidArgument",
            ControlError::UnknownAction { .. } => "UnknownAction",
            ControlError::InvalidState { .. } => "InvalidState",
            ControlError::InvalidConfig { .. } => "InvalidConfig",
            ControlError::AccountBusy { .. } => "AccountBusy",
            ControlError::StaleReference { .. } => "StaleReference",
            ControlError::EngineFailure { .. } => "EngineFailure",
        }
    }

    /// Coarse grouping used in log fields
    pub fn category(&self) -> &'static str {
        match self {
            ControlError::InvalidArgument { .. } | ControlError::UnknownAction { .. } => "command",
            ControlError::InvalidConfig { .. } => "configuration",
            ControlError::InvalidState { .. } | ControlError::AccountBusy { .. } => "state",
            ControlError::StaleReference { .. } => "reference",
            ControlError::EngineFailure { .. } => "engine",
        }
    }

    /// Whether resubmitting the same command later could succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            ControlError::AccountBusy { .. } => true,
            ControlError::InvalidState { .. } => true,
            ControlError::EngineFailure { code, .. } => matches!(code, 408 | 480 | 486 | 500 | 503 | 504),
            _ => false,
        }
    }

    /// Engine status code, when the failure came from the engine
    pub fn engine_code(&self) -> Option<u16> {
        match self {
            ControlError::EngineFailure { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind().to_string(),
            message: self.to_string(),
            code: self.engine_code(),
        }
    }
}

impl From<EngineFailure> for ControlError {
    fn from(failure: EngineFailure) -> Self {
        ControlError::EngineFailure {
            code: failure.code,
            message: failure.message,
        }
    }
}

/// Serialized form of an error inside a callback result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}
