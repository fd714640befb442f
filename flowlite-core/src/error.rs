//! Typed engine error model.
//!
//! Every step-level failure maps to exactly one `EngineError` variant; the
//! stable code string (`EngineError::code`) is what lands on incident
//! records and in the event log.

use std::time::Duration;
use uuid::Uuid;

/// All failure modes visible at the engine seam.
///
/// Rules: `thiserror` for derivation, no manual `Display` impls, no
/// `unwrap()` in this module.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// A typed extraction from an untyped element map failed. `path` is the
    /// key path that was missing or mistyped.
    #[error("validation failed at `{path}`: {reason}")]
    ValidationFailed { path: String, reason: String },

    #[error("process not found: {0}")]
    ProcessNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("element `{element_id}` not found in process `{process_key}`")]
    ElementNotFound {
        process_key: String,
        element_id: String,
    },

    /// Exclusive gateway with no truthy condition and no default flow.
    #[error("no condition matched and no default flow at gateway `{0}`")]
    NoDefaultFlow(String),

    #[error("expression `{expression}` failed: {reason}")]
    ExpressionError { expression: String, reason: String },

    #[error("connector `{connector}` failed: {reason}")]
    ConnectorError { connector: String, reason: String },

    #[error("store error: {0}")]
    StoreError(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A collaborator callback arrived for a token that is no longer
    /// waiting on that key. Always a silent no-op at the scheduler.
    #[error("stale callback dropped: {0}")]
    CallbackStale(String),
}

impl EngineError {
    /// Stable machine-readable code, used on incidents and in the event log.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ValidationFailed { .. } => "VALIDATION_FAILED",
            EngineError::ProcessNotFound(_) => "PROCESS_NOT_FOUND",
            EngineError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            EngineError::ElementNotFound { .. } => "ELEMENT_NOT_FOUND",
            EngineError::NoDefaultFlow(_) => "NO_DEFAULT_FLOW",
            EngineError::ExpressionError { .. } => "EXPRESSION_ERROR",
            EngineError::ConnectorError { .. } => "CONNECTOR_ERROR",
            EngineError::StoreError(_) => "STORE_ERROR",
            EngineError::Timeout(_) => "TIMEOUT",
            EngineError::CallbackStale(_) => "CALLBACK_STALE",
        }
    }

    pub fn validation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::ValidationFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
