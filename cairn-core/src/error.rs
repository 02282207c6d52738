use thiserror::Error;

/// Extract the full error message from a tokio_postgres::Error,
/// including the underlying DbError details that Display hides.
pub fn format_db_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = db_err.message().to_string();
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  Detail: {}", detail));
        }
        if let Some(hint) = db_err.hint() {
            msg.push_str(&format!("\n  Hint: {}", hint));
        }
        if let Some(position) = db_err.position() {
            msg.push_str(&format!("\n  Position: {:?}", position));
        }
        return msg;
    }
    // Fallback: walk the source chain
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        msg.push_str(&format!(": {}", s));
        source = s.source();
    }
    msg
}

#[derive(Error, Debug)]
pub enum CairnError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {}", format_db_error(.0))]
    DatabaseError(#[from] tokio_postgres::Error),

    #[error("Source parse error: {0}")]
    SourceParseError(String),

    #[error("Unknown change type '{0}'")]
    UnknownChangeTypeError(String),

    #[error("Invalid dependency graph input: {0}")]
    InvalidGraphInputError(String),

    #[error("Unsortable graph elements: {0}")]
    UnsortableElementsError(String),

    #[error("Dependency '{target}' declared by {change} could not be resolved")]
    UnresolvedDependencyError { change: String, target: String },

    #[error("{message}")]
    GraphCycleError {
        message: String,
        cycles: Vec<Vec<String>>,
    },

    #[error("Found exceptions:\n{0}")]
    FatalWarningsError(String),

    #[error("Command failed for {command}: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("No rollback script is defined for {0}")]
    MissingRollbackError(String),

    #[error("Failed to acquire advisory lock: {0}")]
    LockError(String),

    #[error("Clean is disabled. Pass --allow-clean to enable it or set clean_enabled = true in config.")]
    CleanDisabled,

    #[error("Clean was not confirmed; no objects were dropped.")]
    CleanAbortedError,

    #[error("Could not clean schema after {attempts} attempt(s); remaining errors:\n{}", .errors.join("\n"))]
    CleanFailedError { attempts: usize, errors: Vec<String> },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Token '{key}' not found. Available tokens: {available}")]
    TokenNotFound { key: String, available: String },
}

pub type Result<T> = std::result::Result<T, CairnError>;
