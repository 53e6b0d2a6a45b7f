//! Frees space for a proxied image by evicting the least-recently-used,
//! currently-unused image on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::Error;
use crate::image::{crc_path_of, map_path_of, meta_path_of, Image};
use crate::registry::ImageRegistry;

/// Retry cap on `ensure_disk_space`'s evict-and-recheck loop.
const MAX_EVICTION_ITERATIONS: usize = 20;

/// Below this server uptime, eviction is refused even if space is short —
/// protects a freshly restarted server from immediately churning through
/// its cache.
const FRESH_RESTART_GUARD: Duration = Duration::from_secs(10 * 3600);

/// An image touched more recently than this is never evicted unless sparse
/// mode is in effect.
const RECENTLY_TOUCHED_GUARD: Duration = Duration::from_secs(24 * 3600);

/// Evicts images under `base_path` when free space runs short. Sparse-file
/// mode (images whose on-disk footprint tracks only the cached fraction
/// rather than the full virtual size) disables the 24-hour recently-touched
/// guard, since a sparse image's real disk cost is already proportional to
/// how little of it has been cached.
pub struct DiskSpaceGuard {
    base_path: PathBuf,
    started_at: Instant,
    sparse_mode: bool,
}

impl DiskSpaceGuard {
    pub fn new(base_path: impl Into<PathBuf>, sparse_mode: bool) -> Self {
        DiskSpaceGuard { base_path: base_path.into(), started_at: Instant::now(), sparse_mode }
    }

    /// Ensures at least `bytes` are free under the base path, evicting
    /// the globally least-recently-accessed, zero-user image as many
    /// times as needed (capped at [`MAX_EVICTION_ITERATIONS`]). `force`
    /// bypasses both the fresh-restart and recently-touched guards —
    /// used when the caller has no alternative but to make room right now.
    pub fn ensure_disk_space(&self, registry: &ImageRegistry, bytes: u64, force: bool) -> Result<(), Error> {
        let mut available = self.free_bytes()?;
        if available >= bytes {
            return Ok(());
        }
        if !force && self.started_at.elapsed() < FRESH_RESTART_GUARD {
            return Err(Error::DiskFull { needed: bytes, available });
        }

        for _ in 0..MAX_EVICTION_ITERATIONS {
            let Some(victim) = self.select_victim(registry, force) else {
                return Err(Error::DiskFull { needed: bytes, available });
            };
            log::info!("evicting image {} to free disk space (atime {})", victim.id, victim.atime_millis());
            self.evict(registry, &victim)?;

            available = self.free_bytes()?;
            if available >= bytes {
                return Ok(());
            }
        }

        Err(Error::DiskFull { needed: bytes, available })
    }

    /// The least-recently-accessed image with no active readers, skipping
    /// anything touched within [`RECENTLY_TOUCHED_GUARD`] unless `force` or
    /// sparse mode allows it.
    fn select_victim(&self, registry: &ImageRegistry, force: bool) -> Option<Arc<Image>> {
        let now = now_unix_millis();
        registry
            .iter()
            .filter(|image| image.user_count() == 0)
            .filter(|image| {
                force || self.sparse_mode || now.saturating_sub(image.atime_millis()) >= RECENTLY_TOUCHED_GUARD.as_millis() as u64
            })
            .min_by_key(|image| image.atime_millis())
    }

    fn evict(&self, registry: &ImageRegistry, image: &Arc<Image>) -> Result<(), Error> {
        registry.remove(&image.id);
        image.close_fd();
        remove_if_exists(&image.path)?;
        remove_if_exists(&map_path_of(&image.path))?;
        remove_if_exists(&crc_path_of(&image.path))?;
        remove_if_exists(&meta_path_of(&image.path))?;
        Ok(())
    }

    fn free_bytes(&self) -> Result<u64, Error> {
        let stat = nix::sys::statvfs::statvfs(&self.base_path)
            .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
}

fn remove_if_exists(path: &Path) -> Result<(), Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

fn now_unix_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnbd3_proto::BLOCK_SIZE;

    #[test]
    fn select_victim_picks_oldest_unused_image() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ImageRegistry::new();
        let guard = DiskSpaceGuard::new(dir.path(), true);

        let old = Image::create(&dir.path().join("old.r1"), "old", 1, BLOCK_SIZE).unwrap();
        let newer = Image::create(&dir.path().join("new.r1"), "new", 1, BLOCK_SIZE).unwrap();
        old.set_working(false);
        // Force a strictly older atime than `newer`'s (set at `create` time).
        std::thread::sleep(std::time::Duration::from_millis(5));
        newer.touch();
        registry.insert(old);
        registry.insert(newer);

        let victim = guard.select_victim(&registry, true).unwrap();
        assert_eq!(victim.id.name, "old");
    }

    #[test]
    fn select_victim_skips_images_with_active_users() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ImageRegistry::new();
        let guard = DiskSpaceGuard::new(dir.path(), true);

        let busy = Image::create(&dir.path().join("busy.r1"), "busy", 1, BLOCK_SIZE).unwrap();
        busy.acquire();
        registry.insert(busy);

        assert!(guard.select_victim(&registry, true).is_none());
    }

    #[test]
    fn evict_removes_image_and_companion_files_and_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ImageRegistry::new();
        let guard = DiskSpaceGuard::new(dir.path(), true);
        let path = dir.path().join("img.r1");
        let image = Image::create(&path, "img", 1, BLOCK_SIZE).unwrap();
        let id = image.id.clone();
        registry.insert(Arc::clone(&image));

        guard.evict(&registry, &image).unwrap();
        assert!(registry.get(&id).is_none());
        assert!(!path.exists());
        assert!(!map_path_of(&path).exists());
    }
}
