//! Background integrity checker: re-hashes completed hash-blocks and
//! invalidates the cache-map range if a CRC no longer matches.

use std::collections::HashSet;
use std::sync::Arc;

use dnbd3_proto::{crc32_of_hash_block, HASH_BLOCK_SIZE};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;

use crate::image::Image;

/// Queue capacity.
pub const QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct QueueKey {
    image_path_hash: u64,
    hash_block_index: u64,
}

/// One `(image, hash_block_index)` job handed to the checker.
struct Job {
    image: Arc<Image>,
    hash_block_index: u64,
    key: QueueKey,
}

/// A bounded, deduplicating queue plus the single worker task that drains
/// it. Deduplication is tracked in a set shared between
/// `enqueue` (the producer side) and the worker, since an `mpsc` channel's
/// own buffer can't be inspected for an already-queued duplicate.
pub struct IntegrityChecker {
    tx: mpsc::Sender<Job>,
    pending: Arc<SyncMutex<HashSet<QueueKey>>>,
}

impl IntegrityChecker {
    /// Spawns the worker task. Returns a handle whose `enqueue` calls feed
    /// it; dropping every handle (and therefore the `tx` side of the
    /// channel) lets the worker exit once the queue drains.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let pending = Arc::new(SyncMutex::new(HashSet::new()));
        tokio::spawn(worker_loop(rx, Arc::clone(&pending)));
        IntegrityChecker { tx, pending }
    }

    /// Enqueues a hash-block for re-checking, skipping it if the same
    /// `(image, hash_block_index)` is already queued.
    pub async fn enqueue(&self, image: Arc<Image>, hash_block_index: u64) {
        let key = QueueKey { image_path_hash: path_hash(&image.path), hash_block_index };
        if !self.pending.lock().insert(key) {
            return;
        }
        if self.tx.send(Job { image, hash_block_index, key }).await.is_err() {
            log::warn!("integrity checker worker is gone, dropping job");
            self.pending.lock().remove(&key);
        }
    }
}

async fn worker_loop(mut rx: mpsc::Receiver<Job>, pending: Arc<SyncMutex<HashSet<QueueKey>>>) {
    while let Some(job) = rx.recv().await {
        if let Err(e) = check_one(&job.image, job.hash_block_index).await {
            log::warn!(
                "integrity check failed for {} hash-block {}: {e}",
                job.image.id,
                job.hash_block_index
            );
        }
        pending.lock().remove(&job.key);
    }
}

async fn check_one(image: &Arc<Image>, hash_block_index: u64) -> Result<(), crate::error::Error> {
    let Some(expected) = image.crc_for_hash_block(hash_block_index) else {
        // No CRC list yet (still mid-transfer on first pass); nothing to
        // verify against.
        return Ok(());
    };

    let from = hash_block_index * HASH_BLOCK_SIZE;
    let to = (from + HASH_BLOCK_SIZE).min(image.virtual_file_size);
    let length = (to - from) as u32;

    let image = Arc::clone(image);
    let actual = tokio::task::spawn_blocking(move || -> Result<u32, crate::error::Error> {
        let data = image.read_at(from, length)?;
        Ok(crc32_of_hash_block(&data))
    })
    .await
    .map_err(|e| crate::error::Error::Io(std::io::Error::other(e)))??;

    if actual != expected {
        log::warn!("hash-block {hash_block_index} CRC mismatch: expected {expected:#x}, got {actual:#x}");
        image.invalidate_hash_block(hash_block_index)?;
    }
    Ok(())
}

fn path_hash(path: &std::path::Path) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnbd3_proto::HASH_BLOCK_SIZE;

    #[tokio::test]
    async fn mismatched_crc_invalidates_the_hash_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.r1");
        let image = Image::create(&path, "img", 1, HASH_BLOCK_SIZE).unwrap();
        let data = bytes::Bytes::from(vec![0x11u8; HASH_BLOCK_SIZE as usize]);
        image.write_cached_range(0, data).await.unwrap();
        // Deliberately wrong CRC.
        image.set_crc_list(vec![0xDEAD_BEEF]).unwrap();

        check_one(&image, 0).await.unwrap();
        assert!(!image.is_block_present(0));
    }

    #[tokio::test]
    async fn matching_crc_leaves_cache_map_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.r1");
        let image = Image::create(&path, "img", 1, HASH_BLOCK_SIZE).unwrap();
        let data = vec![0x22u8; HASH_BLOCK_SIZE as usize];
        image.write_cached_range(0, bytes::Bytes::from(data.clone())).await.unwrap();
        let crc = crc32_of_hash_block(&data);
        image.set_crc_list(vec![crc]).unwrap();

        check_one(&image, 0).await.unwrap();
        assert!(image.is_block_present(0));
    }
}
