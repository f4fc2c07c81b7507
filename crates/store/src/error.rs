use thiserror::Error;

/// Errors that can occur inside a unit of work.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lock contention or a serialization conflict. The unit was rolled back
    /// and may be retried as a whole.
    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    /// A statement that must touch a row touched none: a precondition no
    /// longer holds, or the row was claimed by someone else first.
    #[error("Statement '{statement}' affected no rows")]
    ZeroEffect { statement: &'static str },

    /// A row required by the unit does not exist.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// A row read from storage could not be converted into its model.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Returns true for failures caused by concurrent activity rather than by
    /// the data itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. } | StoreError::ZeroEffect { .. }
        )
    }

    pub(crate) fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}

/// SQLSTATE codes PostgreSQL reports for aborts caused by concurrent units.
const CONFLICT_CODES: [&str; 3] = [
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err
            && let Some(code) = db_err.code()
            && CONFLICT_CODES.contains(&code.as_ref())
        {
            return StoreError::Conflict {
                reason: db_err.message().to_string(),
            };
        }
        StoreError::Database(err)
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
