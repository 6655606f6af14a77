// FASTPATH — ENGINE: BURST INTENSITY TRACKER
// EWMA over the observed byte rate in rolling windows, classified into a
// discrete pacing level. Updated on every packet without locking; exact
// accounting is not required, but the published level is always a valid
// enum value.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Discrete burst classification consumed by the pacing gate.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum BurstLevel {
    None = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Extreme = 4,
}

impl BurstLevel {
    /// Decode a raw level, clamping anything out of range to `Extreme`.
    #[inline(always)]
    pub fn from_u32(v: u32) -> BurstLevel {
        match v {
            0 => BurstLevel::None,
            1 => BurstLevel::Low,
            2 => BurstLevel::Medium,
            3 => BurstLevel::High,
            _ => BurstLevel::Extreme,
        }
    }
}

/// Burst estimator knobs. Thresholds are bits per second, ascending.
#[derive(Copy, Clone, Debug)]
pub struct BurstConfig {
    pub alpha: f64,
    pub window_ns: u64,
    pub thresholds_bps: [u64; 4],
}

impl Default for BurstConfig {
    fn default() -> Self {
        BurstConfig {
            alpha: 0.1,
            window_ns: 10_000_000, // 10 ms
            thresholds_bps: [1_000_000, 10_000_000, 50_000_000, 100_000_000],
        }
    }
}

/// Classify a smoothed rate against the threshold vector. Pure function.
#[inline(always)]
pub fn classify(rate_bps: f64, thresholds_bps: &[u64; 4]) -> BurstLevel {
    if rate_bps > thresholds_bps[3] as f64 {
        BurstLevel::Extreme
    } else if rate_bps > thresholds_bps[2] as f64 {
        BurstLevel::High
    } else if rate_bps > thresholds_bps[1] as f64 {
        BurstLevel::Medium
    } else if rate_bps > thresholds_bps[0] as f64 {
        BurstLevel::Low
    } else {
        BurstLevel::None
    }
}

/// EWMA burst tracker. All state is atomic: producers and the dispatcher
/// may update concurrently and the accounting degrades gracefully — the
/// window-close CAS elects exactly one closer per window.
pub struct BurstTracker {
    cfg: BurstConfig,
    byte_count: AtomicU64,
    packet_count: AtomicU64,
    window_start_ns: AtomicU64,
    /// Smoothed rate in bits per second, stored as f64 bits.
    smoothed_bits: AtomicU64,
    level: AtomicU32,
}

impl BurstTracker {
    pub fn new(cfg: BurstConfig) -> Self {
        BurstTracker {
            cfg,
            byte_count: AtomicU64::new(0),
            packet_count: AtomicU64::new(0),
            window_start_ns: AtomicU64::new(0),
            smoothed_bits: AtomicU64::new(0f64.to_bits()),
            level: AtomicU32::new(BurstLevel::None as u32),
        }
    }

    /// Account one packet. When the rolling window has elapsed, fold the
    /// window's byte count into the EWMA and re-classify.
    #[inline]
    pub fn update(&self, bytes: u64, now_ns: u64) {
        let start = self.window_start_ns.load(Ordering::Relaxed);
        if start == 0 {
            let _ = self.window_start_ns.compare_exchange(
                0,
                now_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        } else if now_ns.saturating_sub(start) > self.cfg.window_ns
            && self
                .window_start_ns
                .compare_exchange(start, now_ns, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            // This thread won the window close.
            let window_bytes = self.byte_count.swap(0, Ordering::Relaxed);
            self.packet_count.swap(0, Ordering::Relaxed);
            let elapsed_ns = now_ns - start;
            let rate_bps = (window_bytes as f64 * 8.0) / (elapsed_ns as f64 / 1e9);
            let old = f64::from_bits(self.smoothed_bits.load(Ordering::Relaxed));
            let smoothed = self.cfg.alpha * rate_bps + (1.0 - self.cfg.alpha) * old;
            self.smoothed_bits.store(smoothed.to_bits(), Ordering::Relaxed);
            self.level.store(
                classify(smoothed, &self.cfg.thresholds_bps) as u32,
                Ordering::Relaxed,
            );
        }
        self.byte_count.fetch_add(bytes, Ordering::Relaxed);
        self.packet_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Current level. Relaxed load: a pacing hint, not synchronization.
    #[inline(always)]
    pub fn current_level(&self) -> BurstLevel {
        BurstLevel::from_u32(self.level.load(Ordering::Relaxed))
    }

    /// External override (e.g. the managed layer already classified the
    /// traffic). Takes effect until the next window close.
    #[inline(always)]
    pub fn submit_hint(&self, level: BurstLevel) {
        self.level.store(level as u32, Ordering::Relaxed);
    }

    /// Smoothed rate estimate in bits per second.
    pub fn smoothed_bps(&self) -> f64 {
        f64::from_bits(self.smoothed_bits.load(Ordering::Relaxed))
    }
}
