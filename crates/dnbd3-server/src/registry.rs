//! The global image registry: a concurrent map from `(name, rid)` to the
//! `Arc<Image>` that owns it.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Error;
use crate::image::{Image, ImageId};

/// Owns every loaded [`Image`] by its stable `(name, rid)` key. `DashMap`'s
/// internal sharding gives the same "short critical section, no blocking
/// I/O held" property a hand-rolled mutex-guarded map would need discipline
/// to maintain.
#[derive(Default)]
pub struct ImageRegistry {
    images: DashMap<ImageId, Arc<Image>>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        ImageRegistry::default()
    }

    pub fn get(&self, id: &ImageId) -> Option<Arc<Image>> {
        self.images.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the image at the requested rid, or (if `rid == 0`, i.e.
    /// "any") the highest rid registered under `name`.
    pub fn resolve(&self, name: &str, requested_rid: u16) -> Option<Arc<Image>> {
        if requested_rid != 0 {
            return self.get(&ImageId::new(name, requested_rid));
        }
        self.images
            .iter()
            .filter(|entry| entry.key().name == name)
            .max_by_key(|entry| entry.key().rid)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn insert(&self, image: Arc<Image>) {
        self.images.insert(image.id.clone(), image);
    }

    /// Removes an image from the registry. The `Image` itself is only
    /// actually dropped once every other `Arc<Image>` clone (held by
    /// in-flight requests, uplinks) goes out of scope — this just unlinks
    /// it from the registry so no *new* caller can find it.
    pub fn remove(&self, id: &ImageId) -> Option<Arc<Image>> {
        self.images.remove(id).map(|(_, image)| image)
    }

    pub fn iter(&self) -> impl Iterator<Item = Arc<Image>> + '_ {
        self.images.iter().map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Scans `base_path` for `<name>.r<rid>` files and loads each as an
    /// `Image`. The CLI/config loader calls this at startup; kept here
    /// since it's pure filesystem + `Image::load` composition with no
    /// argument-parsing concerns of its own.
    pub fn load_all(&self, base_path: &Path) -> Result<usize, Error> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(base_path)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            let Some((name, rid)) = parse_image_file_name(file_name) else { continue };
            match Image::load(&path, name, rid) {
                Ok(image) => {
                    self.insert(image);
                    loaded += 1;
                }
                Err(e) => log::warn!("failed to load image {file_name}: {e}"),
            }
        }
        Ok(loaded)
    }
}

/// Parses `"<name>.r<rid>"` into `(name, rid)`. Companion files (`.map`,
/// `.crc`, `.meta`) don't match this pattern and are skipped.
fn parse_image_file_name(file_name: &str) -> Option<(&str, u16)> {
    let (name, rid_part) = file_name.rsplit_once(".r")?;
    let rid: u16 = rid_part.parse().ok()?;
    Some((name, rid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_revisioned_file_names() {
        assert_eq!(parse_image_file_name("ubuntu/22.04.r7"), Some(("ubuntu/22.04", 7)));
        assert_eq!(parse_image_file_name("img.map"), None);
        assert_eq!(parse_image_file_name("img.rabc"), None);
    }

    #[test]
    fn resolve_any_picks_highest_rid() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ImageRegistry::new();
        for rid in [1u16, 3, 2] {
            let path = dir.path().join(format!("img.r{rid}"));
            let image = Image::create(&path, "img", rid, 4096).unwrap();
            registry.insert(image);
        }
        let resolved = registry.resolve("img", 0).unwrap();
        assert_eq!(resolved.id.rid, 3);
    }
}
