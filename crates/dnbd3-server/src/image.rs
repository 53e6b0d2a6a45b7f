//! On-disk image: the raw `.r<rid>` file, its companion `.map` cache-map and
//! `.crc` hash list, and the bookkeeping (`users`, `atime`, `working`, the
//! uplink back-reference) that makes up one entry in the image registry.

use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dnbd3_proto::{crc32_of_crc_list, decode_crc_file, encode_crc_file, BLOCK_SIZE, HASH_BLOCK_SIZE};
use parking_lot::Mutex as SyncMutex;

use crate::cache_map::CacheMap;
use crate::error::Error;
use crate::uplink::Uplink;

/// `(name, rid)` — the stable key images are registered under in the
/// global image registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId {
    pub name: String,
    pub rid: u16,
}

impl ImageId {
    pub fn new(name: impl Into<String>, rid: u16) -> Self {
        ImageId { name: name.into(), rid }
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.r{}", self.name, self.rid)
    }
}

/// Mutable per-image state gathered behind one lock — the image's own
/// "per-image lock", acquired only after the registry lookup (never before
/// it), preserving the documented lock order `imageList-lock > image.lock`.
struct ImageState {
    cache_map: Option<CacheMap>,
    crc_list: Option<Vec<u32>>,
    file: Option<std::fs::File>,
    /// Weak so the image doesn't keep its uplink alive — the uplink
    /// registry (owned by the server facade) holds the strong `Arc`.
    uplink: Option<Weak<Uplink>>,
    last_work_check: Instant,
    completeness_estimate: Option<(f32, Instant)>,
}

/// An immutable, versioned block device identified by `(name, rid)`.
pub struct Image {
    pub id: ImageId,
    pub path: PathBuf,
    pub real_file_size: u64,
    pub virtual_file_size: u64,
    state: SyncMutex<ImageState>,
    users: AtomicU32,
    atime: AtomicU64,
    working: AtomicBool,
}

/// How long a cached completeness estimate stays valid before it's
/// recomputed.
const COMPLETENESS_CACHE_TTL: Duration = Duration::from_secs(5);

impl Image {
    fn virtual_size_of(real_size: u64) -> u64 {
        real_size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
    }

    /// Loads an existing image from disk: the raw file plus an optional
    /// `.map` (absent ⇒ complete) and optional `.crc`.
    pub fn load(path: &Path, name: &str, rid: u16) -> Result<Arc<Image>, Error> {
        let file = std::fs::File::open(path)?;
        let real_file_size = file.metadata()?.len();
        let virtual_file_size = Self::virtual_size_of(real_file_size);

        let map_path = map_path_of(path);
        let cache_map = if map_path.exists() {
            let bytes = std::fs::read(&map_path)?;
            Some(CacheMap::from_bytes(bytes, virtual_file_size))
        } else {
            None
        };

        let crc_path = crc_path_of(path);
        let crc_list = if crc_path.exists() {
            let bytes = std::fs::read(&crc_path)?;
            let (master, crcs) = decode_crc_file(&bytes)
                .ok_or_else(|| Error::ImageCorrupt(format!("{} .crc file truncated", name)))?;
            if crc32_of_crc_list(&crcs) != master {
                return Err(Error::ImageCorrupt(format!("{name} master CRC mismatch")));
            }
            Some(crcs)
        } else {
            None
        };

        Ok(Arc::new(Image {
            id: ImageId::new(name, rid),
            path: path.to_path_buf(),
            real_file_size,
            virtual_file_size,
            state: SyncMutex::new(ImageState {
                cache_map,
                crc_list,
                file: Some(file),
                uplink: None,
                last_work_check: Instant::now(),
                completeness_estimate: None,
            }),
            users: AtomicU32::new(0),
            atime: AtomicU64::new(now_unix_millis()),
            working: AtomicBool::new(false),
        }))
    }

    /// Creates a brand-new, entirely-absent proxied image: an empty raw
    /// file pre-allocated to `virtual_size`, a zeroed `.map`, and no `.crc`
    /// yet (it's written once the image completes and its hash-blocks have
    /// been computed).
    pub fn create(path: &Path, name: &str, rid: u16, virtual_size: u64) -> Result<Arc<Image>, Error> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(virtual_size)?;
        let cache_map = CacheMap::new_empty(virtual_size);
        std::fs::write(map_path_of(path), cache_map.as_bytes())?;

        Ok(Arc::new(Image {
            id: ImageId::new(name, rid),
            path: path.to_path_buf(),
            real_file_size: virtual_size,
            virtual_file_size: virtual_size,
            state: SyncMutex::new(ImageState {
                cache_map: Some(cache_map),
                crc_list: None,
                file: Some(file),
                uplink: None,
                last_work_check: Instant::now(),
                completeness_estimate: None,
            }),
            users: AtomicU32::new(0),
            atime: AtomicU64::new(now_unix_millis()),
            working: AtomicBool::new(false),
        }))
    }

    pub fn acquire(&self) {
        self.users.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    /// Releases a reference; returns the resulting count.
    pub fn release(&self) -> u32 {
        self.users.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn user_count(&self) -> u32 {
        self.users.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.atime.store(now_unix_millis(), Ordering::Relaxed);
    }

    pub fn atime_millis(&self) -> u64 {
        self.atime.load(Ordering::Relaxed)
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::Relaxed)
    }

    pub fn set_working(&self, value: bool) {
        self.working.store(value, Ordering::Relaxed);
    }

    /// `cache_map == None` iff the image is complete.
    pub fn is_complete(&self) -> bool {
        self.state.lock().cache_map.is_none()
    }

    pub fn is_block_present(&self, offset: u64) -> bool {
        let state = self.state.lock();
        match &state.cache_map {
            None => true,
            Some(map) => map.is_block_present(offset / BLOCK_SIZE),
        }
    }

    pub fn uplink(&self) -> Option<Arc<Uplink>> {
        self.state.lock().uplink.as_ref().and_then(Weak::upgrade)
    }

    pub fn set_uplink(&self, uplink: Option<Weak<Uplink>>) {
        self.state.lock().uplink = uplink;
    }

    pub fn last_work_check(&self) -> Instant {
        self.state.lock().last_work_check
    }

    pub fn mark_work_checked(&self) {
        self.state.lock().last_work_check = Instant::now();
    }

    /// A cheap, possibly-stale completeness percentage, refreshed at most
    /// every [`COMPLETENESS_CACHE_TTL`] — cheap enough to poll from a
    /// status endpoint without walking the whole bitmap each time.
    pub fn completeness_estimate(&self) -> f32 {
        let mut state = self.state.lock();
        if let Some((value, at)) = state.completeness_estimate {
            if at.elapsed() < COMPLETENESS_CACHE_TTL {
                return value;
            }
        }
        let value = match &state.cache_map {
            None => 1.0,
            Some(map) => {
                let total = map.block_count().max(1);
                let present = (0..total).filter(|&b| map.is_block_present(b)).count() as u64;
                present as f32 / total as f32
            }
        };
        state.completeness_estimate = Some((value, Instant::now()));
        value
    }

    /// Reads up to `length` bytes starting at `offset` from the on-disk
    /// image file. Caller must have already confirmed the range is cached
    /// (or that the image is complete).
    pub fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; length as usize];
        let state = self.state.lock();
        let file = state.file.as_ref().ok_or_else(|| {
            Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "image file descriptor is closed"))
        })?;
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Writes `data` at `offset` (block-aligned) and marks the covered
    /// blocks present in the cache-map, persisting the updated `.map`
    /// file. The write, fsync, and map persist are all blocking syscalls,
    /// so this runs on a `spawn_blocking` thread rather than the async
    /// reactor — the same tradeoff `integrity.rs` makes for `read_at`.
    ///
    /// Returns the hash-block indices that became complete as a result of
    /// this write, so the caller can hand them to the integrity checker.
    pub async fn write_cached_range(self: &Arc<Self>, offset: u64, data: Bytes) -> Result<Vec<u64>, Error> {
        let image = Arc::clone(self);
        tokio::task::spawn_blocking(move || image.write_cached_range_blocking(offset, &data))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    fn write_cached_range_blocking(&self, offset: u64, data: &[u8]) -> Result<Vec<u64>, Error> {
        let mut state = self.state.lock();
        let file = state.file.as_ref().ok_or_else(|| {
            Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "image file descriptor is closed"))
        })?;
        file.write_all_at(data, offset)?;
        file.sync_data()?;

        let end = offset + data.len() as u64;
        let mut newly_complete = Vec::new();
        if let Some(map) = state.cache_map.as_mut() {
            let first_hash_block = offset / HASH_BLOCK_SIZE;
            let last_hash_block = end.div_ceil(HASH_BLOCK_SIZE);
            map.set_range(offset, end);
            std::fs::write(map_path_of(&self.path), map.as_bytes())?;
            for hb in first_hash_block..last_hash_block {
                if map.is_hash_block_complete(hb) {
                    newly_complete.push(hb);
                }
            }
        }
        state.completeness_estimate = None;
        Ok(newly_complete)
    }

    /// Called once every hash-block is complete: drops the cache-map,
    /// deletes the `.map` file, and marks the image complete. The caller is responsible for shutting down the uplink.
    pub fn mark_complete(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.cache_map = None;
        state.completeness_estimate = Some((1.0, Instant::now()));
        let map_path = map_path_of(&self.path);
        if map_path.exists() {
            std::fs::remove_file(map_path)?;
        }
        Ok(())
    }

    /// Clears the cache-map bits covering `hash_block_index` — the
    /// integrity checker's only corrective action on a CRC mismatch.
    pub fn invalidate_hash_block(&self, hash_block_index: u64) -> Result<(), Error> {
        let mut state = self.state.lock();
        if let Some(map) = state.cache_map.as_mut() {
            let from = hash_block_index * HASH_BLOCK_SIZE;
            let to = from + HASH_BLOCK_SIZE;
            map.clear_range(from, to);
            std::fs::write(map_path_of(&self.path), map.as_bytes())?;
        }
        state.completeness_estimate = None;
        Ok(())
    }

    pub fn crc_for_hash_block(&self, hash_block_index: u64) -> Option<u32> {
        self.state.lock().crc_list.as_ref().and_then(|l| l.get(hash_block_index as usize).copied())
    }

    pub fn set_crc_list(&self, crcs: Vec<u32>) -> Result<(), Error> {
        std::fs::write(crc_path_of(&self.path), encode_crc_file(&crcs))?;
        self.state.lock().crc_list = Some(crcs);
        Ok(())
    }

    pub fn has_crc_list(&self) -> bool {
        self.state.lock().crc_list.is_some()
    }

    /// Whether every hash-block is complete, i.e. it's time for the uplink
    /// to call [`Image::mark_complete`] and shut itself down. An already-complete image (no
    /// cache-map at all) trivially qualifies.
    pub fn is_fully_populated(&self) -> bool {
        match &self.state.lock().cache_map {
            None => true,
            Some(map) => map.is_fully_complete(),
        }
    }

    /// Closes the read file descriptor — reopened transparently on next
    /// `read_at`/`write_cached_range` by the disk-space guard's eviction
    /// path, which only ever calls this on images it's about to unlink
    /// anyway.
    pub fn close_fd(&self) {
        self.state.lock().file = None;
    }
}

pub fn map_path_of(image_path: &Path) -> PathBuf {
    with_extension_suffix(image_path, "map")
}

pub fn crc_path_of(image_path: &Path) -> PathBuf {
    with_extension_suffix(image_path, "crc")
}

pub fn meta_path_of(image_path: &Path) -> PathBuf {
    with_extension_suffix(image_path, "meta")
}

fn with_extension_suffix(image_path: &Path, suffix: &str) -> PathBuf {
    let mut name = image_path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    image_path.with_file_name(name)
}

fn now_unix_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnbd3_proto::BLOCK_SIZE;

    #[test]
    fn virtual_size_rounds_up_to_block_multiple() {
        assert_eq!(Image::virtual_size_of(BLOCK_SIZE), BLOCK_SIZE);
        assert_eq!(Image::virtual_size_of(BLOCK_SIZE + 1), 2 * BLOCK_SIZE);
        assert_eq!(Image::virtual_size_of(0), 0);
    }

    #[tokio::test]
    async fn create_then_write_marks_blocks_and_reports_newly_complete_hash_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.r1");
        let size = dnbd3_proto::HASH_BLOCK_SIZE;
        let image = Image::create(&path, "img", 1, size).unwrap();
        assert!(!image.is_complete());

        let data = Bytes::from(vec![0xABu8; size as usize]);
        let completed = image.write_cached_range(0, data).await.unwrap();
        assert_eq!(completed, vec![0]);

        image.mark_complete().unwrap();
        assert!(image.is_complete());
        assert!(!map_path_of(&path).exists());
    }

    #[test]
    fn users_refcount_tracks_acquire_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.r1");
        let image = Image::create(&path, "img", 1, BLOCK_SIZE).unwrap();
        image.acquire();
        image.acquire();
        assert_eq!(image.user_count(), 2);
        assert_eq!(image.release(), 1);
        assert_eq!(image.release(), 0);
    }
}
