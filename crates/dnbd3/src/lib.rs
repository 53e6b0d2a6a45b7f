//! A distributed network block device: a proxy/caching server mesh and its
//! reciprocal client-side connection manager, speaking one small binary
//! protocol over TCP.
//!
//! Three subsystems do the work: a multi-homed [`dnbd3_client::
//! ConnectionManager`] that keeps a client pinned to its lowest-RTT
//! alt-server and resends in-flight requests transparently on failover; a
//! server-side [`dnbd3_server::Uplink`] that coalesces many clients' cache
//! misses onto one upstream fetch and persists the result; and an
//! [`dnbd3_server::Image`]/[`dnbd3_server::CacheMap`] pair backed by a
//! background [`dnbd3_server::IntegrityChecker`] that keeps the on-disk
//! cache honest. This crate re-exports all of the above plus the wire
//! codec (`dnbd3_proto`) and socket pool (`dnbd3_transport`) they're built
//! on, behind one top-level [`Error`].

pub use dnbd3_client::{ConnectionManager, ConnectionManagerConfig};
pub use dnbd3_proto::{
    Command, Crc32Reply, Host, ReplyHeader, RequestHeader, SelectImageReply, SelectImageRequest,
    ServerEntry,
};
pub use dnbd3_server::{
    AltServerRegistry, CacheMap, ClientId, DiskSpaceGuard, Image, ImageConfig, ImageId,
    ImageRegistry, IntegrityChecker, ServerAltEntry, ServerConfig, ThreadPool, Uplink,
};
pub use dnbd3_transport::SocketPool;

pub mod client {
    pub use dnbd3_client::*;
}

pub mod server {
    pub use dnbd3_server::*;
}

pub mod proto {
    pub use dnbd3_proto::*;
}

pub mod transport {
    pub use dnbd3_transport::*;
}

/// Unifies every sub-crate's narrow error enum for a caller driving more
/// than one of them directly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Proto(#[from] dnbd3_proto::Error),

    #[error(transparent)]
    Transport(#[from] dnbd3_transport::TransportError),

    #[error(transparent)]
    Client(#[from] dnbd3_client::Error),

    #[error(transparent)]
    Server(#[from] dnbd3_server::Error),
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_crate_errors_convert_via_from() {
        let proto_err: dnbd3_proto::Error = dnbd3_proto::Error::BadMagic { expected: 1, actual: 2 };
        let wrapped: Error = proto_err.into();
        assert!(matches!(wrapped, Error::Proto(_)));

        let transport_err = dnbd3_transport::TransportError::Exhausted;
        let wrapped: Error = transport_err.into();
        assert!(matches!(wrapped, Error::Transport(_)));
    }
}
