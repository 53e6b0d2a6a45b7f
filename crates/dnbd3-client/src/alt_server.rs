//! Client-side alt-server bookkeeping: the 16-slot array, its RTT ring, and
//! the sort/probe/switch policy that keeps the live connection on the
//! lowest-RTT healthy peer.

use dnbd3_proto::Host;

/// Samples kept per server in the RTT ring.
pub const RTT_COUNT: usize = 4;

/// Number of leading slots considered "active" (probed every round,
/// eligible to become the live connection). Slots at or beyond this index
/// are only visited during a merge, a panic sweep, or a sort-policy swap.
pub const ACTIVE_SLOTS: usize = 5;

/// Total alt-server capacity.
pub const SLOT_COUNT: usize = 16;

/// Consecutive-failure count past which a slot is considered for eviction
/// by the sort policy, and past which normal-mode probing starts skipping
/// it probabilistically.
pub const FAIL_BACKOFF_START_COUNT: u32 = 8;

/// Penalty applied to a swapped-out active slot so it doesn't immediately
/// win its way back.
pub const SORT_SWAP_PENALTY: u32 = 4 * FAIL_BACKOFF_START_COUNT;

/// `best_count` ceiling.
pub const BEST_COUNT_CAP: u32 = 50;

/// Sticky-switch `best_count` floor past which a consistent winner can
/// trigger a switch even on a thin RTT margin.
pub const STICKY_BEST_COUNT_THRESHOLD: u32 = 12;

/// Safety-valve margin: a decided switch is cancelled if the winner's
/// `best_count` doesn't lead the current server's by at least this much.
pub const SAFETY_VALVE_MARGIN: u32 = 8;

/// Absolute RTT margin (microseconds) past which the regular switch rule
/// fires regardless of `best_count`.
pub const SWITCH_ABS_MARGIN_MICROS: u32 = 1500;

/// Factor applied to the current server's RTT in the regular switch rule's
/// second clause.
pub const SWITCH_RTT_FACTOR: f64 = 0.75;

/// Offset added after applying [`SWITCH_RTT_FACTOR`].
pub const SWITCH_FACTOR_OFFSET_MICROS: u32 = 1000;

/// One slot of the client-side alt-server array.
#[derive(Debug, Clone, Copy)]
pub struct AltServer {
    pub host: Host,
    pub consecutive_fails: u32,
    rtt_ring: [u32; RTT_COUNT],
    rtt_index: usize,
    /// Smoothed RTT derived from the probe ring, in microseconds.
    pub rtt: u32,
    /// How often this server won a recent probing round, saturating at
    /// [`BEST_COUNT_CAP`].
    pub best_count: u32,
    /// EWMA of RTT observed from real `GET_BLOCK` traffic, in microseconds.
    pub live_rtt: u32,
}

impl Default for AltServer {
    fn default() -> Self {
        AltServer {
            host: Host::EMPTY,
            consecutive_fails: 0,
            rtt_ring: [0; RTT_COUNT],
            rtt_index: 0,
            rtt: 0,
            best_count: 0,
            live_rtt: 0,
        }
    }
}

impl AltServer {
    pub fn new(host: Host) -> Self {
        AltServer {
            host,
            ..AltServer::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.host.is_empty()
    }

    /// Records one successful probe's round-trip time and recomputes the
    /// smoothed RTT.
    pub fn record_probe_rtt(&mut self, micros: u32) {
        self.rtt_ring[self.rtt_index] = micros;
        self.rtt_index = (self.rtt_index + 1) % RTT_COUNT;
        let ring_sum: u64 = self.rtt_ring.iter().map(|&v| v as u64).sum();
        let denom = RTT_COUNT as u64 + if self.live_rtt != 0 { 1 } else { 0 };
        self.rtt = ((ring_sum + self.live_rtt as u64) / denom) as u32;
    }

    /// Marks the whole RTT ring "unreachable" (zeroed), as done when a slot
    /// is swapped by the sort policy.
    pub fn reset_rtt(&mut self) {
        self.rtt_ring = [0; RTT_COUNT];
        self.rtt_index = 0;
        self.rtt = 0;
        self.live_rtt = 0;
    }

    /// Updates `live_rtt` from one real `GET_BLOCK` round trip, ignoring
    /// samples older than 30s.
    pub fn update_live_rtt(&mut self, sample_micros: u32, sample_age: std::time::Duration) {
        if sample_age > std::time::Duration::from_secs(30) {
            return;
        }
        self.live_rtt = if self.live_rtt == 0 {
            sample_micros
        } else {
            ((3 * self.live_rtt as u64 + sample_micros as u64) / 4) as u32
        };
    }

    pub fn record_probe_failure(&mut self) {
        self.consecutive_fails += 10;
    }

    pub fn record_probe_success(&mut self) {
        self.consecutive_fails = 0;
    }

    /// Applies one round's `best_count` adjustment: the probe round's
    /// fastest server gets `+2` (capped), everyone else `-1` (floored at 0).
    pub fn adjust_best_count(&mut self, was_fastest: bool) {
        if was_fastest {
            self.best_count = (self.best_count + 2).min(BEST_COUNT_CAP);
        } else {
            self.best_count = self.best_count.saturating_sub(1);
        }
    }

    /// Decays `live_rtt` down by 1% when it's stale — i.e. larger than both
    /// this round's probed `rtt` and the live connection's own `live_rtt` —
    /// so an EWMA that hasn't seen fresh traffic doesn't keep a server
    /// looking artificially slow forever.
    pub fn decay_live_rtt_if_stale(&mut self, current_live_rtt: u32) {
        if self.live_rtt > self.rtt && self.live_rtt > current_live_rtt {
            self.live_rtt -= self.live_rtt / 100;
        }
    }
}

/// Returns true if `index` falls in the actively-probed partition of the
/// 16-slot array.
pub fn is_active_slot(index: usize) -> bool {
    index < ACTIVE_SLOTS
}

/// Applies the sort policy once: for each inactive slot that is known-good
/// (zero fails), find the first active slot whose fail count exceeds the
/// backoff threshold and swap them, resetting both RTT rings and
/// penalising the swapped-out active slot.
pub fn apply_sort_policy(slots: &mut [AltServer; SLOT_COUNT]) {
    for inactive_idx in ACTIVE_SLOTS..SLOT_COUNT {
        if !slots[inactive_idx].is_configured() || slots[inactive_idx].consecutive_fails != 0 {
            continue;
        }
        let swap_target = (0..ACTIVE_SLOTS)
            .find(|&i| slots[i].consecutive_fails > FAIL_BACKOFF_START_COUNT);
        if let Some(active_idx) = swap_target {
            slots.swap(active_idx, inactive_idx);
            slots[active_idx].reset_rtt();
            slots[inactive_idx].reset_rtt();
            slots[inactive_idx].consecutive_fails = SORT_SWAP_PENALTY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[test]
    fn probe_rtt_smoothing_uses_ring_plus_live_rtt() {
        let mut s = AltServer::new(Host::new_v4(Ipv4Addr::new(10, 0, 0, 1), 5003));
        s.record_probe_rtt(1000);
        s.record_probe_rtt(1000);
        s.record_probe_rtt(1000);
        s.record_probe_rtt(1000);
        assert_eq!(s.rtt, 1000);
        s.live_rtt = 2000;
        s.record_probe_rtt(1000);
        // (1000*4 + 2000) / 5 = 1200
        assert_eq!(s.rtt, 1200);
    }

    #[test]
    fn live_rtt_ewma_ignores_stale_samples() {
        let mut s = AltServer::default();
        s.update_live_rtt(1000, Duration::from_secs(1));
        assert_eq!(s.live_rtt, 1000);
        s.update_live_rtt(5000, Duration::from_secs(1));
        assert_eq!(s.live_rtt, (3 * 1000 + 5000) / 4);
        let before = s.live_rtt;
        s.update_live_rtt(999_999, Duration::from_secs(31));
        assert_eq!(s.live_rtt, before);
    }

    #[test]
    fn best_count_saturates_and_floors() {
        let mut s = AltServer::default();
        s.best_count = BEST_COUNT_CAP - 1;
        s.adjust_best_count(true);
        assert_eq!(s.best_count, BEST_COUNT_CAP);
        s.best_count = 0;
        s.adjust_best_count(false);
        assert_eq!(s.best_count, 0);
    }

    #[test]
    fn stale_live_rtt_decays_only_when_it_exceeds_both_comparisons() {
        let mut s = AltServer::default();
        s.rtt = 1000;
        s.live_rtt = 2000;
        s.decay_live_rtt_if_stale(500);
        assert_eq!(s.live_rtt, 2000 - 20);

        let mut not_stale = AltServer::default();
        not_stale.rtt = 3000;
        not_stale.live_rtt = 2000;
        not_stale.decay_live_rtt_if_stale(500);
        assert_eq!(not_stale.live_rtt, 2000);
    }

    #[test]
    fn sort_policy_swaps_good_inactive_with_bad_active() {
        let mut slots: [AltServer; SLOT_COUNT] = std::array::from_fn(|_| AltServer::default());
        slots[0] = AltServer::new(Host::new_v4(Ipv4Addr::new(10, 0, 0, 1), 5003));
        slots[0].consecutive_fails = FAIL_BACKOFF_START_COUNT + 1;
        slots[5] = AltServer::new(Host::new_v4(Ipv4Addr::new(10, 0, 0, 2), 5003));

        apply_sort_policy(&mut slots);

        assert_eq!(slots[0].host, Host::new_v4(Ipv4Addr::new(10, 0, 0, 2), 5003));
        assert_eq!(slots[5].host, Host::new_v4(Ipv4Addr::new(10, 0, 0, 1), 5003));
        assert_eq!(slots[5].consecutive_fails, SORT_SWAP_PENALTY);
    }

    #[test]
    fn sort_policy_leaves_healthy_active_slots_alone() {
        let mut slots: [AltServer; SLOT_COUNT] = std::array::from_fn(|_| AltServer::default());
        slots[0] = AltServer::new(Host::new_v4(Ipv4Addr::new(10, 0, 0, 1), 5003));
        slots[5] = AltServer::new(Host::new_v4(Ipv4Addr::new(10, 0, 0, 2), 5003));

        apply_sort_policy(&mut slots);

        assert_eq!(slots[0].host, Host::new_v4(Ipv4Addr::new(10, 0, 0, 1), 5003));
        assert_eq!(slots[5].host, Host::new_v4(Ipv4Addr::new(10, 0, 0, 2), 5003));
    }
}
