use thiserror::Error;

/// Event rejected before it reached the incident state machine.
///
/// Carries a client-visible message; the listener returns it verbatim
/// with a 400 status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Errors returned by the incident engine.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    /// A state event whose severity equals the current per-source
    /// severity, or an OK event for an object without an open incident.
    /// Callers may demote this to debug logging.
    #[error("superfluous state change")]
    SuperfluousStateChange,

    /// An acknowledgement arrived for an object without an open incident.
    #[error("no open incident for this object")]
    NoOpenIncident,

    #[error("database error: {0}")]
    Database(#[from] DbError),
}

impl ProcessError {
    /// True for the sentinel errors that do not indicate a fault in the
    /// daemon and must not be logged at error level.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ProcessError::SuperfluousStateChange | ProcessError::NoOpenIncident
        )
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("row not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("transaction is no longer usable")]
    TransactionClosed,

    #[error("unsupported database driver '{0}'")]
    UnsupportedDriver(String),

    #[error("I/O error: {0}")]
    Io(String),
}
