use crate::store::EntityOperation;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Recursive configuration: {0}")]
    RecursiveConfiguration(String),

    #[error("Dependency cycle: {0}")]
    DependencyCycle(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Saving changes failed while executing {operation} for entity type '{entity_type}': {source}")]
    SaveFailed {
        operation: EntityOperation,
        entity_type: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Command {index} failed: {source}")]
    CommandFailed {
        index: usize,
        #[source]
        source: Box<DbError>,
    },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl DbError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Rejects empty or whitespace-only names the way every public entry point does.
    pub fn check_not_empty(value: &str, argument: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(Self::InvalidArgument(format!(
                "The string argument '{}' cannot be empty.",
                argument
            )));
        }
        Ok(())
    }

    /// Innermost error after unwrapping save and command context.
    pub fn root_cause(&self) -> &DbError {
        match self {
            Self::SaveFailed { source, .. } | Self::CommandFailed { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
