//! Error types for warden-core operations.

use std::path::PathBuf;

/// All errors that can occur in warden-core operations.
///
/// None of these are fatal to a monitoring loop: callers log them and retry on
/// the next tick or reconcile pass.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Monitoring directory could not be resolved")]
    NoMonitoringDir,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Configuration insufficient: {0}")]
    ConfigInsufficient(String),

    // ─────────────────────────────────────────────────────────────────────
    // Coordination Errors (TransientIOFailure)
    // ─────────────────────────────────────────────────────────────────────
    #[error("Coordination file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Coordination file is locked: {0}")]
    FileLocked(PathBuf),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Analysis Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Analysis strategy {strategy} failed: {details}")]
    AnalysisFailed { strategy: String, details: String },

    #[error("Analysis strategy {strategy} timed out after {secs}s")]
    AnalysisTimeout { strategy: String, secs: u64 },

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    // ─────────────────────────────────────────────────────────────────────
    // Effector Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Effector {effect} failed: {details}")]
    EffectorFailed { effect: String, details: String },

    #[error("Effector {0} is not supported on this platform")]
    EffectorUnsupported(String),

    // ─────────────────────────────────────────────────────────────────────
    // Supervision Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Command execution failed: {command}: {details}")]
    CommandFailed { command: String, details: String },

    #[error("Platform not supported for this operation: {0}")]
    UnsupportedPlatform(String),
}

impl WardenError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        WardenError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn analysis(strategy: impl Into<String>, details: impl Into<String>) -> Self {
        WardenError::AnalysisFailed {
            strategy: strategy.into(),
            details: details.into(),
        }
    }

    pub fn effector(effect: impl std::fmt::Display, details: impl Into<String>) -> Self {
        WardenError::EffectorFailed {
            effect: effect.to_string(),
            details: details.into(),
        }
    }
}

/// Convenience type alias for Results using WardenError.
pub type Result<T> = std::result::Result<T, WardenError>;

impl From<WardenError> for String {
    fn from(err: WardenError) -> String {
        err.to_string()
    }
}
