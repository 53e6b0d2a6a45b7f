//! Client-side connection manager for the DNBD3 mesh: maintains a pool of
//! alt-servers, keeps a single live TCP connection pinned to the fastest
//! healthy one, and multiplexes `GET_BLOCK` requests over it without
//! dropping in-flight work across a failover.

mod alt_server;
mod config;
mod error;
mod live_socket;
mod manager;
mod pending;
mod probe;

pub use alt_server::{AltServer, ACTIVE_SLOTS, SLOT_COUNT};
pub use config::ConnectionManagerConfig;
pub use error::Error;
pub use live_socket::LiveSocket;
pub use manager::ConnectionManager;
pub use pending::ReplyMode;

pub type Result<T> = std::result::Result<T, Error>;
