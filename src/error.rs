//! Error types for the verified analysis pipeline
//!
//! Anticipated pipeline failures (blocked code, timeouts, rejected
//! extractions) are recorded as `FailureKind` outcomes on the pipeline
//! state. These errors cover collaborator I/O and defects.

use crate::models::PipelineStage;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Planning error: {0}")]
    PlanningError(String),

    #[error("Data fetch error: {0}")]
    FetchError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Debate error: {0}")]
    DebateError(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid stage transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: PipelineStage,
        to: PipelineStage,
    },

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Audit error: {0}")]
    AuditError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
