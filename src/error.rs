//! Engine-wide error type.
//!
//! One variant per kind named in the control-surface error policy: checksum
//! failures are expected and recovered from during redo, but fatal for a
//! normal superblock/snapshot read; I/O errors on metadata writes latch the
//! engine read-only.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch at sector {sector}")]
    Checksum { sector: u64 },

    #[error("invalid lsid: {0}")]
    InvalidLsid(String),

    #[error("log overflow")]
    LogOverflow,

    #[error("engine is read-only")]
    ReadOnly,

    #[error("name conflict: {0}")]
    NameConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy")]
    Busy,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;
