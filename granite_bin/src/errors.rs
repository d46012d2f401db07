use std::fmt;
use std::io;

/// The closed error taxonomy every catalog and engine operation reports
/// through. Success is the `Ok` arm of `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbError {
    /// Generic failure; deep I/O and resource errors surface here.
    Failed,
    AlreadyExist,
    NotExist,
    TableAlreadyExist,
    TableNotExist,
    IndexAlreadyExist,
    IndexNotFound,
    ColumnNameNotExist,
    KeyNotFound,
    /// Sentinel used by the shell to leave its loop.
    Quit,
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            DbError::Failed => "operation failed",
            DbError::AlreadyExist => "database already exists",
            DbError::NotExist => "database does not exist",
            DbError::TableAlreadyExist => "table already exists",
            DbError::TableNotExist => "table does not exist",
            DbError::IndexAlreadyExist => "index already exists",
            DbError::IndexNotFound => "index not found",
            DbError::ColumnNameNotExist => "column name does not exist",
            DbError::KeyNotFound => "key not found",
            DbError::Quit => "quit",
        };
        f.write_str(message)
    }
}

impl std::error::Error for DbError {}

impl From<io::Error> for DbError {
    fn from(err: io::Error) -> Self {
        crate::granite_debug_log!("[DbError] I/O failure: {err}");
        DbError::Failed
    }
}
