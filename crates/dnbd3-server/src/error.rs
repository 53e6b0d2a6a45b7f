//! Errors surfaced by the server-side image cache, uplink engine, and their
//! supporting services.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("uplink request queue is full")]
    RequestQueueFull,

    #[error("image is corrupt: {0}")]
    ImageCorrupt(String),

    #[error("requested image is unavailable: {0}")]
    ImageUnavailable(String),

    #[error("insufficient disk space: need {needed} bytes, freed down to {available}")]
    DiskFull { needed: u64, available: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] dnbd3_proto::Error),

    #[error(transparent)]
    Transport(#[from] dnbd3_transport::TransportError),
}
