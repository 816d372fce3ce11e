//! Error types for the TSFile core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Binary layout error: {0}")]
    BinRw(String),

    /// Bad magic, unsupported flag combination, ambiguous page layout.
    /// Fatal to the enclosing load, not to an already-open handle.
    #[error("Format error: {0}")]
    Format(String),

    /// Schema check or validate failure, too many fields, duplicate name.
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Unknown tag: {0}")]
    UnknownTag(u16),

    #[error("Entry index {index} out of range (count {count})")]
    OutOfRange { index: u64, count: u64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The handle was released; the backing storage is closed.
    #[error("File handle is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        Error::BinRw(e.to_string())
    }
}
