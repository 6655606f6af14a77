// FASTPATH — CONFIGURATION
// All substrate knobs in one place. `Config::from_env` layers FP_* overrides
// over the defaults; `normalized` clamps everything into contract ranges so
// a bad knob degrades to the nearest legal value instead of failing boot.

use crate::engine::burst::BurstConfig;
use crate::engine::ring::RING_MAX_CAPACITY;

pub const BATCH_MIN: usize = 16;
pub const BATCH_MAX: usize = 32;
pub const POOL_SLOTS_MIN: usize = 4;
pub const POOL_SLOTS_MAX: usize = 16;

#[derive(Clone, Debug)]
pub struct Config {
    /// Dispatcher batch size (16–32 packets per drain cycle).
    pub batch_size: usize,
    /// Crypto output buffers are rounded up to this granule.
    pub chunk_size: usize,
    /// Reserved feature bits passed through to the boundary.
    pub feature_flags: u32,
    /// Crypto workers; 0 = auto (`min(2 × online cores, 16)`).
    pub worker_count: usize,
    /// Total persistent sockets across the three egress classes (4–16).
    pub pool_total_slots: usize,
    /// Egress class split (stream / vision / reserve), floor one each.
    pub class_ratios: [u32; 3],
    /// EWMA smoothing factor.
    pub ewma_alpha: f64,
    /// Burst window length in nanoseconds.
    pub burst_window_ns: u64,
    /// Burst level thresholds in bits per second, ascending.
    pub burst_thresholds_bps: [u64; 4],
    /// Packet ring capacity hint (rounded up to a power of two).
    pub ring_capacity: usize,
    /// Slab cell size; payloads beyond this get slot-owned allocations.
    pub ring_payload_size: usize,
    /// Nominal egress link rate for the pacing gate.
    pub link_bps: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            batch_size: 32,
            chunk_size: 64,
            feature_flags: 0,
            worker_count: 0,
            pool_total_slots: 8,
            class_ratios: [40, 35, 25],
            ewma_alpha: 0.1,
            burst_window_ns: 10_000_000,
            burst_thresholds_bps: [1_000_000, 10_000_000, 50_000_000, 100_000_000],
            ring_capacity: 4096,
            ring_payload_size: 2048,
            link_bps: 1_000_000_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    /// Defaults with FP_* environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        if let Some(v) = env_parse("FP_BATCH_SIZE") {
            cfg.batch_size = v;
        }
        if let Some(v) = env_parse("FP_CHUNK_SIZE") {
            cfg.chunk_size = v;
        }
        if let Some(v) = env_parse("FP_WORKERS") {
            cfg.worker_count = v;
        }
        if let Some(v) = env_parse("FP_POOL_SLOTS") {
            cfg.pool_total_slots = v;
        }
        if let Some(v) = env_parse("FP_EWMA_ALPHA") {
            cfg.ewma_alpha = v;
        }
        if let Some(v) = env_parse("FP_BURST_WINDOW_NS") {
            cfg.burst_window_ns = v;
        }
        if let Some(v) = env_parse("FP_RING_CAPACITY") {
            cfg.ring_capacity = v;
        }
        if let Some(v) = env_parse("FP_RING_PAYLOAD_SIZE") {
            cfg.ring_payload_size = v;
        }
        if let Some(v) = env_parse("FP_LINK_BPS") {
            cfg.link_bps = v;
        }
        cfg
    }

    /// Clamp every knob into its contract range.
    pub fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.clamp(BATCH_MIN, BATCH_MAX);
        self.pool_total_slots = self.pool_total_slots.clamp(POOL_SLOTS_MIN, POOL_SLOTS_MAX);
        self.chunk_size = self.chunk_size.max(1);
        if !(0.0..=1.0).contains(&self.ewma_alpha) {
            self.ewma_alpha = 0.1;
        }
        if self.burst_window_ns == 0 {
            self.burst_window_ns = 10_000_000;
        }
        if self.ring_capacity == 0 {
            self.ring_capacity = 4096;
        }
        self.ring_capacity = self.ring_capacity.min(RING_MAX_CAPACITY);
        for r in &mut self.class_ratios {
            *r = (*r).max(1);
        }
        self
    }

    pub fn burst(&self) -> BurstConfig {
        BurstConfig {
            alpha: self.ewma_alpha,
            window_ns: self.burst_window_ns,
            thresholds_bps: self.burst_thresholds_bps,
        }
    }
}
