//! Protocol-wide constants.

/// Size in bytes of a single cacheable block. `GET_BLOCK` offsets and sizes
/// must be multiples of this.
pub const BLOCK_SIZE: u64 = 4096;

/// Size in bytes of a single CRC-32 hash-block. The last hash-block of an
/// image may be shorter if the image size is not a multiple of this.
pub const HASH_BLOCK_SIZE: u64 = 16 * 1024 * 1024;

/// Wire magic: the two ASCII bytes `"rs"`, low byte first (`0x73 0x72`
/// little-endian on the wire, i.e. `0x72` transmitted before `0x73`).
pub const MAGIC: u16 = 0x7372;

/// Minimum protocol version this implementation will negotiate with.
pub const PROTOCOL_MIN_VERSION: u16 = 2;

/// Protocol version this implementation advertises.
pub const PROTOCOL_VERSION: u16 = 2;

/// A request whose `hops` field reaches this value is dropped rather than
/// forwarded, to break cycles in the peer mesh.
pub const MAX_HOPS: u8 = 7;

/// Requested revision id meaning "give me whatever is latest".
pub const RID_ANY: u16 = 0;
