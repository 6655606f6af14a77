// FASTPATH — ENGINE: RUNTIME SUPPORT
// Infrastructure under the data plane that isn't the data plane itself:
// monotonic clock, cache-line padding, core topology discovery, and
// best-effort thread pinning for the crypto workers.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Hardware cache-line padding.
/// 128 bytes guarantees immunity from L1d false sharing and adjacent
/// hardware spatial prefetcher intersections (128-byte stride on ARM
/// Cortex-A cores, 128-byte pair on Intel Spatial Prefetcher).
#[repr(C, align(128))]
pub struct CachePadded<T> {
    pub value: T,
}

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        CachePadded { value }
    }
}

/// Monotonic nanosecond clock for packet timestamps and pacing deadlines.
/// CLOCK_MONOTONIC so suspend/resume and wall-clock steps never move the
/// pacing window backwards.
#[inline(always)]
pub fn clock_ns() -> u64 {
    let mut ts = std::mem::MaybeUninit::<libc::timespec>::uninit();
    // SAFETY: the out-pointer targets live stack storage; assume_init runs
    // only after clock_gettime reported success and filled it.
    unsafe {
        if libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()) != 0 {
            return 0;
        }
        let ts = ts.assume_init();
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

/// Number of online CPUs. Cached after the first query.
pub fn online_cores() -> usize {
    static CACHED: AtomicUsize = AtomicUsize::new(0);
    let cached = CACHED.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf is always safe to call; _SC_NPROCESSORS_ONLN is a valid name.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    let n = if n < 1 { 1 } else { n as usize };
    CACHED.store(n, Ordering::Relaxed);
    n
}

/// Discover performance cores by cpufreq max frequency: cores whose
/// `cpuinfo_max_freq` equals the machine-wide maximum. On heterogeneous
/// CPUs (big.LITTLE) this selects the big cluster; on homogeneous CPUs it
/// returns every core. Empty only when sysfs is unreadable.
pub fn discover_perf_cores() -> Vec<usize> {
    let n = online_cores();
    let mut freqs = Vec::with_capacity(n);
    for cpu in 0..n {
        let path = format!("/sys/devices/system/cpu/cpu{}/cpufreq/cpuinfo_max_freq", cpu);
        let f = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        freqs.push(f);
    }
    let max = freqs.iter().copied().max().unwrap_or(0);
    if max == 0 {
        // No cpufreq (VM, container): treat all cores as performance cores.
        return (0..n).collect();
    }
    (0..n).filter(|&c| freqs[c] == max).collect()
}

/// Pin the calling thread to a single core. Best-effort: a failure is
/// reported to the caller, never fatal — affinity is a hint, not a gate.
pub fn pin_to_core(core_id: usize) -> bool {
    // SAFETY: cpu_set_t is repr(C) and all-zeroes is a valid bit pattern.
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut cpuset);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) == 0
    }
}

/// Parse a kernel-style CPU list ("0-3,5,7") into sorted core ids.
pub fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut cores = Vec::new();
    if list.is_empty() {
        return cores;
    }
    for part in list.split(',') {
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(s), Ok(e)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                for i in s..=e {
                    cores.push(i);
                }
            }
        } else if let Ok(id) = part.parse::<usize>() {
            cores.push(id);
        }
    }
    cores.sort();
    cores.dedup();
    cores
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = clock_ns();
        let b = clock_ns();
        assert!(b >= a);
    }

    #[test]
    fn online_cores_at_least_one() {
        assert!(online_cores() >= 1);
    }

    #[test]
    fn perf_cores_subset_of_online() {
        let n = online_cores();
        for c in discover_perf_cores() {
            assert!(c < n);
        }
    }

    #[test]
    fn cpu_list_parsing() {
        assert_eq!(parse_cpu_list("0-3,5"), vec![0, 1, 2, 3, 5]);
        assert_eq!(parse_cpu_list("7"), vec![7]);
        assert_eq!(parse_cpu_list(""), Vec::<usize>::new());
        assert_eq!(parse_cpu_list("2,2,1"), vec![1, 2]);
    }

    #[test]
    fn cache_padded_stride() {
        assert!(std::mem::size_of::<CachePadded<u64>>() >= 128);
        assert_eq!(std::mem::align_of::<CachePadded<u64>>(), 128);
    }
}
