use crate::txn_manager::TxnId;

#[derive(Debug)]
pub enum Error {
    /// Buffer pool exhausted with no evictable frame.
    OutOfMemory,
    /// The transaction must roll back; the reason names the trigger.
    TransactionAborted(TxnId, String),
    DuplicateKey,
    TupleNotFound,
    TupleTooLarge(usize, usize),
    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "no free frames to evict"),
            Error::TransactionAborted(id, reason) => {
                write!(f, "transaction {id} aborted: {reason}")
            }
            Error::DuplicateKey => write!(f, "key already exists in index"),
            Error::TupleNotFound => write!(f, "tuple not found"),
            Error::TupleTooLarge(max, got) => {
                write!(f, "tuple of {got} bytes exceeds the {max} byte limit")
            }
            Error::Internal(context) => write!(f, "internal error: {context}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Whether an error chain bottoms out in a transaction abort. Callers
    /// that see `true` must hand the context to `TransactionManager::abort`.
    pub fn is_abort(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Error>(), Some(Error::TransactionAborted(_, _)))
    }
}
