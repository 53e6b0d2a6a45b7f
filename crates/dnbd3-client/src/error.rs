use std::io;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no configured alt-server is reachable")]
    NoServerReachable,

    #[error("handshake with upstream failed: {0}")]
    HandshakeFailed(String),

    #[error("requested image is unavailable: {0}")]
    ImageUnavailable(String),

    #[error("connection manager is shutting down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Proto(#[from] dnbd3_proto::Error),

    #[error(transparent)]
    Transport(#[from] dnbd3_transport::TransportError),
}
