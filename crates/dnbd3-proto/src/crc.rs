//! CRC-32 primitives over 16 MiB hash-blocks.

use binrw::prelude::*;

use crate::constants::BLOCK_SIZE;

/// `GET_CRC32` reply payload: the master CRC followed by one CRC-32 per
/// hash-block. The wire form carries no explicit count — `block_crcs` is
/// read until the reply's payload (bounded by the reply header's `size`)
/// is exhausted, the same `until_eof` pattern used for other trailing,
/// stream-bounded fields.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crc32Reply {
    pub master_crc: u32,
    #[br(parse_with = binrw::helpers::until_eof)]
    pub block_crcs: Vec<u32>,
}

impl Crc32Reply {
    /// Builds a reply from a hash-block CRC list, computing the master CRC
    /// the same way [`crc32_of_crc_list`] does.
    pub fn new(block_crcs: Vec<u32>) -> Self {
        let master_crc = crc32_of_crc_list(&block_crcs);
        Crc32Reply { master_crc, block_crcs }
    }
}

/// CRC-32 of one hash-block's raw data, zero-padded to a multiple of
/// [`BLOCK_SIZE`] if `data` isn't already block-aligned (the tail of the
/// last hash-block of an image).
pub fn crc32_of_hash_block(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    let remainder = data.len() as u64 % BLOCK_SIZE;
    if remainder != 0 {
        let pad = (BLOCK_SIZE - remainder) as usize;
        let zeros = vec![0u8; pad];
        hasher.update(&zeros);
    }
    hasher.finalize()
}

/// The on-disk `.crc` file's master CRC: the CRC-32 of the concatenated
/// per-hash-block CRCs, each serialized little-endian.
pub fn crc32_of_crc_list(crcs: &[u32]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for crc in crcs {
        hasher.update(&crc.to_le_bytes());
    }
    hasher.finalize()
}

/// Serializes a `.crc` file body: 4-byte master CRC followed by one 4-byte
/// CRC per hash-block, all little-endian.
pub fn encode_crc_file(crcs: &[u32]) -> Vec<u8> {
    let master = crc32_of_crc_list(crcs);
    let mut out = Vec::with_capacity(4 + crcs.len() * 4);
    out.extend_from_slice(&master.to_le_bytes());
    for crc in crcs {
        out.extend_from_slice(&crc.to_le_bytes());
    }
    out
}

/// Parses a `.crc` file body, returning `(master_crc, per_block_crcs)`.
/// Does not itself verify the master CRC — callers decide whether a
/// mismatch there is fatal (see `dnbd3-server`'s image loader).
pub fn decode_crc_file(bytes: &[u8]) -> Option<(u32, Vec<u32>)> {
    if bytes.len() < 4 || (bytes.len() - 4) % 4 != 0 {
        return None;
    }
    let master = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
    let crcs = bytes[4..]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Some((master, crcs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::io::Cursor;

    #[test]
    fn crc32_reply_roundtrip_reads_block_crcs_until_eof() {
        let reply = Crc32Reply::new(vec![0x1111_1111, 0x2222_2222, 0x3333_3333]);
        let mut buf = Cursor::new(Vec::new());
        reply.write(&mut buf).unwrap();
        let bytes = buf.into_inner();

        let decoded = Crc32Reply::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(decoded.master_crc, crc32_of_crc_list(&reply.block_crcs));
    }

    #[test]
    fn padded_tail_matches_explicit_zeros_iff_tail_is_zero() {
        // A short buffer that's already zero beyond the first block: the
        // implicit zero-padding inside crc32_of_hash_block should match a
        // buffer extended with explicit zero bytes to the same length.
        let mut zero_tail = vec![7u8; BLOCK_SIZE as usize + 10];
        zero_tail[BLOCK_SIZE as usize..].fill(0);
        let mut explicit_zeros = zero_tail[..BLOCK_SIZE as usize + 10].to_vec();
        explicit_zeros.resize(2 * BLOCK_SIZE as usize, 0);
        assert_eq!(
            crc32_of_hash_block(&zero_tail),
            crc32_of_hash_block(&explicit_zeros[..2 * BLOCK_SIZE as usize])
        );

        // A buffer with a non-zero tail must NOT match the same data
        // zero-padded out to the block boundary.
        let mut nonzero_tail = vec![7u8; BLOCK_SIZE as usize + 10];
        nonzero_tail[BLOCK_SIZE as usize..].fill(9);
        assert_ne!(
            crc32_of_hash_block(&nonzero_tail),
            crc32_of_hash_block(&explicit_zeros[..2 * BLOCK_SIZE as usize])
        );
    }

    #[test]
    fn crc_file_roundtrip() {
        let crcs = vec![0xdead_beef, 0x1234_5678, 0];
        let bytes = encode_crc_file(&crcs);
        let (master, decoded) = decode_crc_file(&bytes).unwrap();
        assert_eq!(decoded, crcs);
        assert_eq!(master, crc32_of_crc_list(&crcs));
    }

    #[test]
    fn master_crc_is_over_serialized_list_not_raw_values() {
        let crcs = vec![1, 2, 3];
        let master = crc32_of_crc_list(&crcs);
        let mut hasher = crc32fast::Hasher::new();
        for c in &crcs {
            hasher.update(&c.to_le_bytes());
        }
        assert_eq!(master, hasher.finalize());
    }
}
