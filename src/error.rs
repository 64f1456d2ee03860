use std::path::PathBuf;
use thiserror::Error;

/// Maximum length of an error message persisted on an entity's `last_error`.
pub const MAX_STORED_ERROR_LEN: usize = 1000;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("integrity violation: {0}")]
    Integrity(String),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Error class label used in logs and stored error messages.
    pub fn class(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Validation(_) => "validation",
            Self::Transient(_) => "transient",
            Self::Integrity(_) => "integrity",
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("input file does not exist: {0}")]
    MissingInput(PathBuf),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("conversion completed but produced no output: {0}")]
    MissingOutput(PathBuf),
}

/// Bound an error message before persisting it on an entity row.
pub fn truncate_error(msg: &str) -> String {
    if msg.len() <= MAX_STORED_ERROR_LEN {
        return msg.to_string();
    }
    let mut end = MAX_STORED_ERROR_LEN;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}
