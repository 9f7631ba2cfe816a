use thiserror::Error;
use std::io;

#[derive(Debug, Error)]
pub enum TreeError {
    /// The key is missing and the caller used a fail-fast accessor.
    #[error("key not found: {0:?}")]
    KeyNotFound(String),
    /// Caller error: key too long for this tree, or a value that cannot
    /// be coerced to the requested type.
    #[error("bad key or value: {0}")]
    BadKeyValue(String),
    /// Storage integrity: malformed block, out-of-range offset, truncated
    /// read, or a corrupt free chain. The in-memory tree state is not
    /// guaranteed consistent afterwards; abort or reopen.
    #[error("block file error: {0}")]
    BlockFile(String),
    /// Invalid tree configuration at create/open time.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Engine misuse, e.g. recovery with uncommitted changes in flight.
    #[error("invalid tree state: {0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type TreeResult<T> = Result<T, TreeError>;
