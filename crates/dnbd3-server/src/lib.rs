//! Server-side caching and proxying: the on-disk image cache, the uplink
//! engine that services cache misses against an upstream peer, the
//! server-side alt-server registry, and their supporting infrastructure
//! (background integrity checking, a short-lived-task thread pool, and a
//! disk-space eviction guard).

mod alt_server;
mod cache_map;
mod config;
mod disk_space;
mod error;
mod image;
mod integrity;
mod registry;
mod thread_pool;
mod uplink;

pub use alt_server::{AltServerRegistry, ServerAltEntry};
pub use cache_map::CacheMap;
pub use config::{ImageConfig, ServerConfig};
pub use disk_space::DiskSpaceGuard;
pub use error::Error;
pub use image::{Image, ImageId};
pub use integrity::IntegrityChecker;
pub use registry::ImageRegistry;
pub use thread_pool::ThreadPool;
pub use uplink::{ClientId, Uplink};

pub type Result<T> = std::result::Result<T, Error>;
