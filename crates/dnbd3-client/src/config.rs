use std::time::Duration;

/// Tunables for a [`crate::ConnectionManager`], populated by the (out of
/// scope) CLI/FUSE front-end rather than parsed by this crate itself.
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// Background-loop probe cadence once startup has settled.
    pub probe_interval_normal: Duration,
    /// Background-loop probe cadence during the startup window.
    pub probe_interval_startup: Duration,
    /// How long after `init` the startup cadence applies.
    pub startup_duration: Duration,
    /// Keepalive push cadence to the live server.
    pub keepalive_interval: Duration,
    /// Per-candidate connect budget used by `init`'s first pass.
    pub init_connect_timeout: Duration,
    /// Per-candidate connect budget used by `init`'s drain pass.
    pub init_drain_timeout: Duration,
    /// Per-candidate connect budget used by normal-mode probing.
    pub probe_connect_timeout: Duration,
    /// Per-candidate connect budget used by panic-mode probing.
    pub panic_connect_timeout: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        ConnectionManagerConfig {
            probe_interval_normal: Duration::from_secs(2),
            probe_interval_startup: Duration::from_secs(1),
            startup_duration: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(2),
            init_connect_timeout: Duration::from_millis(100),
            init_drain_timeout: Duration::from_millis(400),
            probe_connect_timeout: Duration::from_millis(333),
            panic_connect_timeout: Duration::from_secs(1),
        }
    }
}
