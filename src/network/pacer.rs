// FASTPATH — EDT PACING GATE
// Zero-spin earliest-departure-time pacing for the egress path. Instead of
// busy-waiting, `pace` returns a release timestamp the dispatcher gates on
// with non-blocking head-of-line checks. The inter-packet gap widens with
// the burst level: heavier bursts get spread harder so downstream
// schedulers never see micro-burst buffer overflows.
//
// Memory: three u64 + one u64 counter. Fits in a single cache line.

use crate::engine::burst::BurstLevel;

/// Fallback gap when the link rate is unknown: 1500-byte frame at 1 Gbps.
const DEFAULT_GAP_NS: u64 = 12_000;

/// Gap multiplier per burst level. None/Low pass through at line spacing;
/// higher levels stretch the window.
#[inline(always)]
fn burst_factor(level: BurstLevel) -> u64 {
    match level {
        BurstLevel::None | BurstLevel::Low => 1,
        BurstLevel::Medium => 2,
        BurstLevel::High => 3,
        BurstLevel::Extreme => 4,
    }
}

pub struct PacingGate {
    /// Nanosecond timestamp of the last scheduled departure.
    last_tx_ns: u64,
    /// Nanoseconds per byte at the configured link rate.
    ns_per_byte: u64,
    /// Packets paced since creation (telemetry counter).
    paced_count: u64,
}

impl PacingGate {
    /// Gate calibrated for a link rate in bits per second.
    pub fn new(link_bps: u64) -> Self {
        PacingGate {
            last_tx_ns: 0,
            ns_per_byte: Self::rate_to_ns_per_byte(link_bps),
            paced_count: 0,
        }
    }

    /// Fixed inter-packet gap in nanoseconds (test calibration).
    pub fn with_fixed_gap_ns(gap_ns: u64) -> Self {
        PacingGate {
            last_tx_ns: 0,
            ns_per_byte: gap_ns.max(1),
            paced_count: 0,
        }
    }

    #[inline(always)]
    fn rate_to_ns_per_byte(link_bps: u64) -> u64 {
        if link_bps > 0 {
            ((8 * 1_000_000_000) / link_bps).max(1)
        } else {
            DEFAULT_GAP_NS
        }
    }

    /// Compute the departure time for a frame; never blocks.
    #[inline(always)]
    pub fn pace(&mut self, now_ns: u64, frame_bytes: u32, level: BurstLevel) -> u64 {
        let delay_ns = frame_bytes as u64 * self.ns_per_byte * burst_factor(level);
        let release_ns = self.last_tx_ns.max(now_ns) + delay_ns;
        self.last_tx_ns = release_ns;
        self.paced_count += 1;
        release_ns
    }

    /// Reset the departure timestamp after an idle period so the gate does
    /// not burst-compensate all the missed slots.
    #[inline(always)]
    pub fn reset(&mut self, now_ns: u64) {
        self.last_tx_ns = now_ns;
    }

    #[inline(always)]
    pub fn paced_count(&self) -> u64 {
        self.paced_count
    }

    #[inline(always)]
    pub fn ns_per_byte(&self) -> u64 {
        self.ns_per_byte
    }

    /// Update the link rate dynamically (congestion feedback).
    #[inline(always)]
    pub fn set_link_bps(&mut self, link_bps: u64) {
        self.ns_per_byte = Self::rate_to_ns_per_byte(link_bps);
    }
}
