use std::path::PathBuf;
use std::time::Duration;

/// Process-wide tunables, populated by the (out of scope) CLI/config
/// loader — this crate never parses a config file or argument list itself.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root directory scanned for `<name>.r<rid>` images on startup.
    pub base_path: PathBuf,
    /// Whether images are stored sparse — disables the disk-space guard's
    /// 24-hour recently-touched eviction guard.
    pub sparse_files: bool,
    /// Idle-worker cap for the short-lived-task [`crate::ThreadPool`].
    pub thread_pool_max_idle: usize,
    /// How many uplink candidates `Uplink::acquire_upstream` asks the
    /// alt-server registry for per reconnect attempt.
    pub uplink_candidate_count: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            base_path: PathBuf::from("."),
            sparse_files: false,
            thread_pool_max_idle: 8,
            uplink_candidate_count: 4,
        }
    }
}

/// Per-image overrides layered on top of [`ServerConfig`], populated the
/// same way (e.g. parsed from a `.meta` sidecar by the out-of-scope config
/// loader, not by this crate).
#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub name: String,
    pub rid: u16,
    /// `Some` pins this image to a specific uplink instead of letting
    /// `AltServerRegistry::list_for_uplink` pick freely.
    pub fixed_uplink: Option<dnbd3_proto::Host>,
    pub cache_check_interval: Duration,
}

impl ImageConfig {
    pub fn new(name: impl Into<String>, rid: u16) -> Self {
        ImageConfig { name: name.into(), rid, fixed_uplink: None, cache_check_interval: Duration::from_secs(10) }
    }
}
