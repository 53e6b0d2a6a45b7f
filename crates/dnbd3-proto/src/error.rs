//! Errors surfaced by wire decoding/encoding.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("header truncated: need {need} bytes, got {got}")]
    HeaderTooShort { need: usize, got: usize },

    #[error("bad magic: expected {expected:#06x}, got {actual:#06x}")]
    BadMagic { expected: u16, actual: u16 },

    #[error("unknown command code {0:#06x}")]
    UnknownCommand(u16),

    #[error("image name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] binrw::Error),
}
