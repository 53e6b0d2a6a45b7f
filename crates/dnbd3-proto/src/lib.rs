//! Wire protocol for the Distributed Network Block Device mesh.
//!
//! Fixed-size request/reply headers, the handshake payloads exchanged right
//! after `SELECT_IMAGE`, and the CRC-32 primitives used by the integrity
//! checker all live here so that both the client connection manager and the
//! server uplink engine encode/decode against the same types.

pub mod command;
pub mod constants;
pub mod crc;
pub mod error;
pub mod handshake;
pub mod header;
pub mod host;
pub mod servers;

pub use command::Command;
pub use constants::*;
pub use crc::{crc32_of_crc_list, crc32_of_hash_block, Crc32Reply};
pub use error::Error;
pub use handshake::{SelectImageReply, SelectImageRequest};
pub use header::{ReplyHeader, RequestHeader};
pub use host::{AddressFamily, Host};
pub use servers::ServerEntry;

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
