//! Per-image cache-map: a packed bit array tracking which 4 KiB blocks are
//! locally present.

use dnbd3_proto::{BLOCK_SIZE, HASH_BLOCK_SIZE};

/// Bits per hash-block: how many [`BLOCK_SIZE`] blocks make up one
/// [`HASH_BLOCK_SIZE`] region.
const BLOCKS_PER_HASH_BLOCK: u64 = HASH_BLOCK_SIZE / BLOCK_SIZE;

/// A bit array over `ceil(virtual_size / BLOCK_SIZE)` bits, LSB-first
/// within each byte. `set_range` is the only mutator
/// and is idempotent; `clear_range` is used exclusively by the integrity
/// checker to invalidate a hash-block on CRC mismatch.
#[derive(Debug, Clone)]
pub struct CacheMap {
    bits: Vec<u8>,
    block_count: u64,
}

impl CacheMap {
    /// A fully-empty cache-map for an image of `virtual_size` bytes.
    pub fn new_empty(virtual_size: u64) -> Self {
        let block_count = virtual_size.div_ceil(BLOCK_SIZE);
        let byte_count = (block_count as usize).div_ceil(8);
        CacheMap { bits: vec![0u8; byte_count], block_count }
    }

    /// A fully-present cache-map — used only in memory when an image
    /// completes and its `.map` file is about to be deleted.
    pub fn new_full(virtual_size: u64) -> Self {
        let mut map = Self::new_empty(virtual_size);
        map.bits.fill(0xff);
        map
    }

    /// Loads a cache-map from an on-disk `.map` file's raw bytes.
    pub fn from_bytes(bytes: Vec<u8>, virtual_size: u64) -> Self {
        let block_count = virtual_size.div_ceil(BLOCK_SIZE);
        let expected_len = (block_count as usize).div_ceil(8);
        let mut bits = bytes;
        bits.resize(expected_len, 0);
        CacheMap { bits, block_count }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn is_block_present(&self, block_index: u64) -> bool {
        if block_index >= self.block_count {
            return false;
        }
        let byte = self.bits[(block_index / 8) as usize];
        (byte >> (block_index % 8)) & 1 != 0
    }

    /// Marks every block covering `[from, to)` as present. `from`/`to` must
    /// be block-aligned; idempotent if already set.
    pub fn set_range(&mut self, from: u64, to: u64) {
        debug_assert_eq!(from % BLOCK_SIZE, 0);
        let first = from / BLOCK_SIZE;
        let last = to.div_ceil(BLOCK_SIZE);
        for block in first..last.min(self.block_count) {
            let idx = (block / 8) as usize;
            self.bits[idx] |= 1 << (block % 8);
        }
    }

    /// Clears every block covering `[from, to)` — used when the integrity
    /// checker invalidates a hash-block.
    pub fn clear_range(&mut self, from: u64, to: u64) {
        let first = from / BLOCK_SIZE;
        let last = to.div_ceil(BLOCK_SIZE);
        for block in first..last.min(self.block_count) {
            let idx = (block / 8) as usize;
            self.bits[idx] &= !(1 << (block % 8));
        }
    }

    /// A hash-block is complete iff every block up to the logical end of
    /// file within its range has its bit set; bits beyond the end of file
    /// don't exist and are ignored.
    pub fn is_hash_block_complete(&self, hash_block_index: u64) -> bool {
        let first_block = hash_block_index * BLOCKS_PER_HASH_BLOCK;
        let last_block = (first_block + BLOCKS_PER_HASH_BLOCK).min(self.block_count);
        if first_block >= self.block_count {
            return true;
        }
        (first_block..last_block).all(|b| self.is_block_present(b))
    }

    pub fn hash_block_count(&self) -> u64 {
        self.block_count.div_ceil(BLOCKS_PER_HASH_BLOCK).max(1)
    }

    pub fn is_fully_complete(&self) -> bool {
        (0..self.hash_block_count()).all(|h| self.is_hash_block_complete(h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_range_is_idempotent() {
        let mut map = CacheMap::new_empty(3 * BLOCK_SIZE);
        map.set_range(0, BLOCK_SIZE);
        let snapshot = map.as_bytes().to_vec();
        map.set_range(0, BLOCK_SIZE);
        assert_eq!(map.as_bytes(), &snapshot[..]);
        assert!(map.is_block_present(0));
        assert!(!map.is_block_present(1));
    }

    #[test]
    fn clear_range_unsets_bits() {
        let mut map = CacheMap::new_full(2 * BLOCK_SIZE);
        assert!(map.is_block_present(0) && map.is_block_present(1));
        map.clear_range(0, BLOCK_SIZE);
        assert!(!map.is_block_present(0));
        assert!(map.is_block_present(1));
    }

    #[test]
    fn hash_block_straddling_eof_is_complete_once_blocks_up_to_eof_are_set() {
        // Virtual size shorter than one hash-block: only the first two 4 KiB
        // blocks actually exist.
        let virtual_size = 2 * BLOCK_SIZE;
        let mut map = CacheMap::new_empty(virtual_size);
        assert!(!map.is_hash_block_complete(0));
        map.set_range(0, virtual_size);
        assert!(map.is_hash_block_complete(0));
    }

    #[test]
    fn full_map_on_aligned_size_is_complete() {
        let map = CacheMap::new_full(HASH_BLOCK_SIZE);
        assert!(map.is_hash_block_complete(0));
        assert_eq!(map.hash_block_count(), 1);
    }

    #[test]
    fn byte_count_rounds_up() {
        // 1 block needs 1 bit but a whole byte must be allocated.
        let map = CacheMap::new_empty(1);
        assert_eq!(map.as_bytes().len(), 1);
        assert_eq!(map.block_count(), 1);
    }
}
