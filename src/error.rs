//! Error types
//!
//! Store, collaborator, configuration and pipeline errors. Search failures are
//! not errors at this level: they are classified by [`crate::search::ErrorKind`]
//! and recorded as terminal results.

use std::path::PathBuf;
use thiserror::Error;

use crate::session::Stage;

/// Session persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    /// The document carries a different (or no) schema version
    #[error("Schema mismatch in session {session_id}: expected version {expected}, found {found:?}")]
    SchemaMismatch {
        session_id: String,
        expected: u32,
        found: Option<u64>,
    },

    /// The file exists but is not a valid session document
    #[error("Corrupt session {session_id}: {message}")]
    Corrupt { session_id: String, message: String },

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("IO error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a corrupt-document error
    pub fn corrupt(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            session_id: session_id.into(),
            message: message.into(),
        }
    }

    /// Whether the failure should be routed to a [`crate::session::SessionRepairer`]
    pub fn needs_repair(&self) -> bool {
        matches!(self, Self::SchemaMismatch { .. } | Self::Corrupt { .. })
    }
}

/// Failure reported by a generation collaborator (questions, plan, report)
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GeneratorError {
    pub message: String,
}

impl GeneratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The repair collaborator could not reconstruct a valid document
#[derive(Debug, Error)]
#[error("Session file {path} is irrecoverable: {reason}")]
pub struct Irrecoverable {
    pub path: PathBuf,
    pub reason: String,
}

impl Irrecoverable {
    pub fn new(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Invalid configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Top-level pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Generation failed during {stage}: {message}")]
    Generation { stage: Stage, message: String },

    #[error("Report writing failed: {0}")]
    Report(String),

    /// Stopped by the caller's abort signal; the session stays resumable
    #[error("Pipeline aborted")]
    Aborted,

    #[error("Session is already in terminal stage {0}")]
    Terminal(Stage),

    #[error(transparent)]
    Irrecoverable(#[from] Irrecoverable),
}

impl PipelineError {
    pub fn generation(stage: Stage, err: GeneratorError) -> Self {
        Self::Generation {
            stage,
            message: err.message,
        }
    }
}
