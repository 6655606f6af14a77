// FASTPATH — ENGINE: CPU CAPABILITY PROBE
// One-shot detection of SIMD vector support and AES/PMULL crypto
// extensions. aarch64 asks the auxiliary vector (with a /proc/cpuinfo
// feature-string fallback); x86_64 uses CPUID feature detection. The
// result is cached in two atomics and every subsequent read is lock-free.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub const CAP_SIMD: u32  = 1 << 0;
pub const CAP_AES: u32   = 1 << 1;
pub const CAP_PMULL: u32 = 1 << 2;
pub const CAP_SHA2: u32  = 1 << 3;

static CAPS_CACHED: AtomicBool = AtomicBool::new(false);
static CAPS: AtomicU32 = AtomicU32::new(0);

// aarch64 AT_HWCAP bits (stable kernel ABI).
#[cfg(target_arch = "aarch64")]
mod hwcap {
    pub const ASIMD: u64 = 1 << 1;
    pub const AES: u64   = 1 << 3;
    pub const PMULL: u64 = 1 << 4;
    pub const SHA2: u64  = 1 << 6;
}

#[cfg(target_arch = "aarch64")]
fn detect() -> u32 {
    // SAFETY: getauxval is always safe; AT_HWCAP returns 0 when absent.
    let hw = unsafe { libc::getauxval(libc::AT_HWCAP) };
    if hw != 0 {
        let mut caps = 0;
        if hw & hwcap::ASIMD != 0 { caps |= CAP_SIMD; }
        if hw & hwcap::AES != 0   { caps |= CAP_AES; }
        if hw & hwcap::PMULL != 0 { caps |= CAP_PMULL; }
        if hw & hwcap::SHA2 != 0  { caps |= CAP_SHA2; }
        return caps;
    }
    detect_from_cpuinfo()
}

/// Fallback: scan the Features line of /proc/cpuinfo.
#[cfg(target_arch = "aarch64")]
fn detect_from_cpuinfo() -> u32 {
    let text = match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(t) => t,
        Err(_) => return 0,
    };
    let mut caps = 0;
    for line in text.lines() {
        if !line.starts_with("Features") {
            continue;
        }
        for feat in line.split(':').nth(1).unwrap_or("").split_whitespace() {
            match feat {
                "asimd" | "neon" => caps |= CAP_SIMD,
                "aes" => caps |= CAP_AES,
                "pmull" => caps |= CAP_PMULL,
                "sha2" => caps |= CAP_SHA2,
                _ => {}
            }
        }
        break;
    }
    caps
}

#[cfg(target_arch = "x86_64")]
fn detect() -> u32 {
    let mut caps = 0;
    if is_x86_feature_detected!("sse2") {
        caps |= CAP_SIMD;
    }
    if is_x86_feature_detected!("aes") {
        caps |= CAP_AES;
    }
    if is_x86_feature_detected!("pclmulqdq") {
        caps |= CAP_PMULL;
    }
    if is_x86_feature_detected!("sha") {
        caps |= CAP_SHA2;
    }
    caps
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
fn detect() -> u32 {
    0
}

/// Full capability mask. First call probes; later calls are two loads.
pub fn caps_mask() -> u32 {
    if CAPS_CACHED.load(Ordering::Acquire) {
        return CAPS.load(Ordering::Relaxed);
    }
    let caps = detect();
    CAPS.store(caps, Ordering::Relaxed);
    CAPS_CACHED.store(true, Ordering::Release);
    caps
}

#[inline(always)]
pub fn has_simd() -> bool {
    caps_mask() & CAP_SIMD != 0
}

#[inline(always)]
pub fn has_aes() -> bool {
    caps_mask() & CAP_AES != 0
}
