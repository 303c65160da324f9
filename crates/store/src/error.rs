use thiserror::Error;

/// Coarse error class, used by the CLI to pick an exit code and by the
/// scheduler to decide whether a retry is worthwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    UniqueConflict,
    Transient,
    Permanent,
    Invariant,
    Internal,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed input: missing required field, unparseable date, bad enum slug.
    #[error("validation: {0}")]
    Validation(String),

    /// A unique key already holds this value.  Reported, never overwritten.
    #[error("unique conflict on {entity}: {key}")]
    UniqueConflict { entity: &'static str, key: String },

    /// The backend is unreachable or busy; the write may be spooled and retried.
    #[error("transient store error: {0}")]
    Transient(String),

    /// The backend rejected us in a way a retry cannot fix.
    #[error("permanent store error: {0}")]
    Permanent(String),

    /// A state-machine rule was about to be broken: second open batch,
    /// embedding dimension/model mismatch, application against an
    /// intelligence-only listing.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("internal store error: {0}")]
    Internal(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::UniqueConflict { .. } => ErrorKind::UniqueConflict,
            StoreError::Transient(_) => ErrorKind::Transient,
            StoreError::Permanent(_) => ErrorKind::Permanent,
            StoreError::Invariant(_) => ErrorKind::Invariant,
            StoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Classify a raw rusqlite error: busy/locked becomes `Transient`, a
    /// constraint hit on `entity` becomes `UniqueConflict`, the rest stay
    /// `Internal`.
    pub fn from_sqlite(err: rusqlite::Error, entity: &'static str, key: String) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::ConstraintViolation => StoreError::UniqueConflict { entity, key },
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    StoreError::Transient(err.to_string())
                }
                ErrorCode::NotADatabase | ErrorCode::CannotOpen => {
                    StoreError::Permanent(err.to_string())
                }
                _ => StoreError::Internal(err),
            },
            _ => StoreError::Internal(err),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
