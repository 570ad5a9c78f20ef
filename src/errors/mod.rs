use crate::transaction::TxnId;

/// Why a transaction was forced into the `Aborted` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
    Deadlock,
}

#[derive(Debug, PartialEq)]
pub enum Error {
    // storage
    OutOfMemory,
    NoFreeExtent,
    InvalidPageId(i32),
    Io(String),
    // index
    DuplicateKey,
    KeyNotFound,
    // transactions
    TxnAborted(TxnId, AbortReason),
    // catalog
    TableAlreadyExists(String),
    TableNotExists(String),
    IndexAlreadyExists(String),
    IndexNotFound(String),
    ColumnNameNotExists(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "Buffer pool has no evictable frame."),
            Error::NoFreeExtent => write!(f, "All extents are full."),
            Error::InvalidPageId(id) => write!(f, "Invalid page id {id}."),
            Error::Io(context) => write!(f, "I/O error: {context}."),
            Error::DuplicateKey => write!(f, "Key already exists in index."),
            Error::KeyNotFound => write!(f, "Key does not exist in index."),
            Error::TxnAborted(id, reason) => {
                write!(f, "Transaction {id} aborted: {reason:?}.")
            }
            Error::TableAlreadyExists(table) => write!(f, "Table {table} already exists."),
            Error::TableNotExists(table) => write!(f, "Table {table} does not exist."),
            Error::IndexAlreadyExists(index) => write!(f, "Index {index} already exists."),
            Error::IndexNotFound(index) => write!(f, "Index {index} does not exist."),
            Error::ColumnNameNotExists(column) => write!(f, "Column {column} does not exist."),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
