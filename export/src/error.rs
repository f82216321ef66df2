use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by export pipeline operations.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("shape mismatch for {name:?}: expected {expected}, got {got}")]
    ShapeMismatch {
        name: String,
        expected: String,
        got: String,
    },

    #[error("output arity: expected at least {expected} outputs, got {got}")]
    OutputArity { expected: usize, got: usize },

    #[error("specialization failed: {0}")]
    Specialization(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("export destination {0:?} already exists")]
    ArtifactExists(PathBuf),

    #[error("export destination {0:?} is not an export artifact")]
    IncompatibleDestination(PathBuf),

    #[error("manifest: {0}")]
    Manifest(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("worker protocol: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for ExportError {
    fn from(e: serde_json::Error) -> Self {
        ExportError::Manifest(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExportError>;
