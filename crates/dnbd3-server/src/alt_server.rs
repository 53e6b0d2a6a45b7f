//! Server-side alt-server registry: up to 8 configured peers, ranked by RTT
//! and network closeness, used both to advertise peers to clients and to
//! pick an uplink.

use std::time::{Duration, Instant};

use dnbd3_proto::Host;
use parking_lot::RwLock;

/// Server-side alt-server capacity.
pub const SLOT_COUNT: usize = 8;

/// RTT ring depth for the server-side record.
pub const RTT_COUNT: usize = 5;

/// Consecutive-failure count past which [`AltServerRegistry::list_for_uplink`]'s
/// second pass starts applying the cooldown regardless of `emergency` (see
/// `DESIGN.md` for how this value was chosen).
pub const BAD_UPLINK_FAIL_THRESHOLD: u32 = 3;

/// Cooldown after a repeatedly-failing server's last failure before it's
/// reconsidered as an uplink candidate outside `emergency` mode.
pub const BAD_UPLINK_COOLDOWN: Duration = Duration::from_secs(60);

/// How much [`AltServerRegistry::server_failed`] bumps the fail counter by.
pub const UPLINK_FAIL_INCREASE: u32 = 5;

/// Minimum time between two [`AltServerRegistry::server_failed`] calls
/// against the same server before the counter is allowed to increase again
/// — prevents every image's uplink hammering the counter during one network
/// hiccup.
pub const FAILURE_CORRELATION_GUARD: Duration = Duration::from_secs(1);

/// One configured server-side alt-server record.
#[derive(Debug, Clone)]
pub struct ServerAltEntry {
    pub host: Host,
    pub comment: String,
    pub is_private: bool,
    pub is_client_only: bool,
    rtt_ring: [u32; RTT_COUNT],
    rtt_index: usize,
    pub num_fails: u32,
    pub last_fail: Option<Instant>,
}

impl ServerAltEntry {
    pub fn new(host: Host, comment: String, is_private: bool, is_client_only: bool) -> Self {
        ServerAltEntry {
            host,
            comment,
            is_private,
            is_client_only,
            rtt_ring: [0; RTT_COUNT],
            rtt_index: 0,
            num_fails: 0,
            last_fail: None,
        }
    }

    /// Smoothed RTT: the arithmetic mean of the 5-slot ring.
    pub fn rtt(&self) -> u32 {
        (self.rtt_ring.iter().map(|&v| v as u64).sum::<u64>() / RTT_COUNT as u64) as u32
    }

    /// Records a successful measurement: rotates it into the ring and
    /// decrements the fail counter (floor 0).
    fn record_success(&mut self, rtt_micros: u32) {
        self.rtt_index = (self.rtt_index + 1) % RTT_COUNT;
        self.rtt_ring[self.rtt_index] = rtt_micros;
        self.num_fails = self.num_fails.saturating_sub(1);
    }
}

/// The fixed-capacity, duplicate-rejecting set of configured peers a server
/// may use as an uplink or advertise to clients.
pub struct AltServerRegistry {
    entries: RwLock<Vec<ServerAltEntry>>,
}

impl Default for AltServerRegistry {
    fn default() -> Self {
        AltServerRegistry { entries: RwLock::new(Vec::with_capacity(SLOT_COUNT)) }
    }
}

impl AltServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a server, rejecting duplicates (same host+port) and refusing
    /// past [`SLOT_COUNT`].
    pub fn add(&self, entry: ServerAltEntry) -> bool {
        let mut entries = self.entries.write();
        if entries.len() >= SLOT_COUNT {
            return false;
        }
        if entries.iter().any(|e| e.host == entry.host) {
            return false;
        }
        entries.push(entry);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn record_rtt(&self, host: Host, rtt_micros: u32) -> Option<u32> {
        let mut entries = self.entries.write();
        let entry = entries.iter_mut().find(|e| e.host == host)?;
        entry.record_success(rtt_micros);
        Some(entry.rtt())
    }

    /// Called when an uplink server failed during normal operation. If the
    /// previous failure was too recent, the call is ignored to avoid many
    /// images sharing one uplink all bumping the counter for one network
    /// hiccup; otherwise the counter is bumped and the server rotated to
    /// the back of the list so it's less likely to be picked next.
    pub fn server_failed(&self, host: Host) {
        let mut entries = self.entries.write();
        let Some(idx) = entries.iter().position(|e| e.host == host) else { return };
        let now = Instant::now();
        if let Some(last) = entries[idx].last_fail {
            if now.duration_since(last) < FAILURE_CORRELATION_GUARD {
                return;
            }
        }
        entries[idx].num_fails += UPLINK_FAIL_INCREASE;
        entries[idx].last_fail = Some(now);
        let failing = entries.remove(idx);
        entries.push(failing);
    }

    /// Up to `n` public servers ranked by network-closeness-minus-fails,
    /// mixed-family entries heavily penalised.
    pub fn list_for_client(&self, requester: Host, n: usize) -> Vec<Host> {
        let entries = self.entries.read();
        let mut scored: Vec<(i64, Host)> = entries
            .iter()
            .filter(|e| !e.is_private)
            .map(|e| {
                let score = if e.host.family() == requester.family() {
                    requester.net_closeness(&e.host) as i64 - e.num_fails as i64
                } else {
                    -(e.num_fails as i64 + 128)
                };
                (score, e.host)
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(n).map(|(_, host)| host).collect()
    }

    /// Up to `n` usable uplink candidates, excluding `is_client_only`.
    /// First pass: zero-fail servers. Second pass (only if the first
    /// didn't fill `n`): failed servers whose last failure is past the
    /// cooldown, or any failed server at all if `emergency` is set.
    pub fn list_for_uplink(&self, n: usize, emergency: bool) -> Vec<Host> {
        let entries = self.entries.read();
        let mut out = Vec::with_capacity(n);

        for e in entries.iter().filter(|e| !e.is_client_only && e.num_fails == 0) {
            if out.len() >= n {
                break;
            }
            out.push(e.host);
        }
        if out.len() < n {
            let now = Instant::now();
            for e in entries.iter().filter(|e| !e.is_client_only && e.num_fails > 0) {
                if out.len() >= n {
                    break;
                }
                let cooled_down = e
                    .last_fail
                    .map(|t| now.duration_since(t) >= BAD_UPLINK_COOLDOWN)
                    .unwrap_or(true);
                if !(emergency || e.num_fails <= BAD_UPLINK_FAIL_THRESHOLD || cooled_down) {
                    continue;
                }
                out.push(e.host);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn host(oct: u8) -> Host {
        Host::new_v4(Ipv4Addr::new(10, 0, 0, oct), 5003)
    }

    #[test]
    fn add_rejects_duplicates_and_overflow() {
        let registry = AltServerRegistry::new();
        assert!(registry.add(ServerAltEntry::new(host(1), String::new(), false, false)));
        assert!(!registry.add(ServerAltEntry::new(host(1), String::new(), false, false)));
        for i in 2..=SLOT_COUNT as u8 {
            registry.add(ServerAltEntry::new(host(i), String::new(), false, false));
        }
        assert_eq!(registry.len(), SLOT_COUNT);
        assert!(!registry.add(ServerAltEntry::new(host(200), String::new(), false, false)));
    }

    #[test]
    fn list_for_client_excludes_private_servers() {
        let registry = AltServerRegistry::new();
        registry.add(ServerAltEntry::new(host(1), String::new(), true, false));
        registry.add(ServerAltEntry::new(host(2), String::new(), false, false));
        let list = registry.list_for_client(host(9), 8);
        assert_eq!(list, vec![host(2)]);
    }

    #[test]
    fn list_for_uplink_excludes_client_only() {
        let registry = AltServerRegistry::new();
        registry.add(ServerAltEntry::new(host(1), String::new(), false, true));
        registry.add(ServerAltEntry::new(host(2), String::new(), false, false));
        let list = registry.list_for_uplink(8, false);
        assert_eq!(list, vec![host(2)]);
    }

    #[test]
    fn server_failed_rotates_to_back_and_bumps_fails() {
        let registry = AltServerRegistry::new();
        registry.add(ServerAltEntry::new(host(1), String::new(), false, false));
        registry.add(ServerAltEntry::new(host(2), String::new(), false, false));
        registry.server_failed(host(1));
        let entries = registry.entries.read();
        assert_eq!(entries[0].host, host(2));
        assert_eq!(entries[1].host, host(1));
        assert_eq!(entries[1].num_fails, UPLINK_FAIL_INCREASE);
    }

    #[test]
    fn rtt_is_mean_of_ring() {
        let registry = AltServerRegistry::new();
        registry.add(ServerAltEntry::new(host(1), String::new(), false, false));
        for _ in 0..RTT_COUNT {
            registry.record_rtt(host(1), 1000);
        }
        assert_eq!(registry.record_rtt(host(1), 1000), Some(1000));
    }
}
