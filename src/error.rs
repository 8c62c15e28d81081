use core::fmt::Display;
use core::fmt::Result;

/// Reasons a transactional operation failed.
///
/// Recoverable variants are conflicts the retry loop in [`atomic`] and
/// [`atomic_read`] handles transparently; the closure is simply re-run.
/// Non-recoverable variants terminate the transaction and propagate.
///
/// [`atomic`]: crate::atomic()
/// [`atomic_read`]: crate::atomic_read()
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// A read observed a version newer than the transaction snapshot and
    /// the snapshot could not be extended.
    ReadInconsistent,
    /// Commit-time re-validation of the read set failed because a
    /// concurrent transaction committed first.
    CommitValidation,
    /// The contention manager elected to yield the stripe to a
    /// higher-priority transaction.
    WriteContention,
    /// A per-transaction set exceeded its fixed capacity.
    CapacityExceeded,
    /// A read-write transaction was requested inside a running read-only
    /// transaction.
    IncompatibleNesting,
    /// A transactional call was made on a thread that never ran
    /// [`thread_init`](crate::thread_init).
    Uninitialized,
    /// A generic error string (for user logic inside the atomic closure).
    User(String),
}

impl TransactionError {
    /// Whether the enclosing retry loop should re-run the transaction.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            TransactionError::ReadInconsistent
                | TransactionError::CommitValidation
                | TransactionError::WriteContention
        )
    }
}

impl Display for TransactionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result {
        match self {
            TransactionError::ReadInconsistent => write!(f, "Read inconsistent state"),
            TransactionError::CommitValidation => write!(f, "Failed to validate read set"),
            TransactionError::WriteContention => {
                write!(f, "Yielded write lock to higher-priority transaction")
            }
            TransactionError::CapacityExceeded => {
                write!(f, "Transaction set capacity exceeded")
            }
            TransactionError::IncompatibleNesting => {
                write!(f, "Read-write transaction inside read-only transaction")
            }
            TransactionError::Uninitialized => {
                write!(f, "Transactional call before thread_init")
            }
            TransactionError::User(s) => write!(f, "Transaction error: {}", s),
        }
    }
}

impl std::error::Error for TransactionError {}
