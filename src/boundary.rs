// FASTPATH — BOUNDARY SURFACE
// The operation set the external data plane consumes, expressed over one
// owning context object. Integer conventions at this layer: non-negative =
// success (often a length, fd or handle), 0 = try again (ring full/empty,
// connect in progress), negative = failure (error::RC_*). Handles are
// opaque u64 values; 0 is reserved for "invalid/null handle".
//
// Handle layout: ring handles are registry ids; a slot handle packs
// `(ring_id << SLOT_HANDLE_BITS) | (slot_index + 1)`. Job handles come
// from a monotonic registry of their own.
//
// Teardown order: stop accepting ring writes → drain outstanding crypto
// jobs → destroy rings → destroy connection pool. Field declaration order
// below enforces it for the implicit drop path too.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::cryptography::aead::DIR_EGRESS;
use crate::cryptography::pool::{CryptoJob, CryptoPool, WorkerSnapshot};
use crate::engine::burst::{BurstLevel, BurstTracker};
use crate::engine::caps;
use crate::engine::ring::{self, RingConsumer, RingProducer};
use crate::engine::slot::PacketMeta;
use crate::error::{Error, Result, RC_INVALID};
use crate::network::conn::{ConnectionPool, TrafficClass};

/// Slot-index field width inside a slot handle. Covers the 64 Ki capacity
/// ceiling plus the +1 bias.
const SLOT_HANDLE_BITS: u32 = 24;
const SLOT_HANDLE_MASK: u64 = (1 << SLOT_HANDLE_BITS) - 1;

/// The ring every `Substrate` starts with.
pub const DEFAULT_RING: u64 = 1;

struct RingEntry {
    producer: Mutex<RingProducer>,
    consumer: Mutex<RingConsumer>,
}

/// Aggregate view of the substrate for monitors.
#[derive(Clone, Debug)]
pub struct SubstrateStats {
    pub ring_occupancy: usize,
    pub ring_capacity: usize,
    pub burst_level: BurstLevel,
    pub smoothed_bps: f64,
    pub workers: Vec<WorkerSnapshot>,
    pub conn_slots: [usize; 3],
}

pub struct Substrate {
    // Dropped first: job Arcs, then the pool (joins workers holding raw
    // slot pointers) — both strictly before any ring memory goes away.
    jobs: Mutex<HashMap<u64, Arc<CryptoJob>>>,
    crypto: CryptoPool,
    rings: Mutex<HashMap<u64, Arc<RingEntry>>>,
    pub burst: BurstTracker,
    pub conns: ConnectionPool,
    next_ring_handle: AtomicU64,
    next_job_handle: AtomicU64,
    accepting: AtomicBool,
    shut: AtomicBool,
}

impl Substrate {
    /// Build the full substrate from one config and the externally
    /// supplied master secret. The default ring (handle `DEFAULT_RING`)
    /// is created from the config's capacity knobs.
    pub fn new(cfg: &Config, master_key: &[u8; 32]) -> Result<Substrate> {
        let cfg = cfg.clone().normalized();
        let crypto = CryptoPool::new(master_key, DIR_EGRESS, cfg.worker_count, cfg.chunk_size)?;
        let conns = ConnectionPool::new(cfg.class_ratios);
        conns.init(cfg.pool_total_slots);
        let s = Substrate {
            jobs: Mutex::new(HashMap::new()),
            crypto,
            rings: Mutex::new(HashMap::new()),
            burst: BurstTracker::new(cfg.burst()),
            conns,
            next_ring_handle: AtomicU64::new(DEFAULT_RING),
            next_job_handle: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            shut: AtomicBool::new(false),
        };
        let h = s.ring_create(cfg.ring_capacity, cfg.ring_payload_size);
        if h <= 0 {
            return Err(Error::OutOfMemory);
        }
        debug_assert_eq!(h, DEFAULT_RING as i64);
        Ok(s)
    }

    // ── Ring registry ───────────────────────────────────────────────────

    /// Create a ring. Returns its handle (> 0) or a negative code.
    pub fn ring_create(&self, capacity: usize, payload_size: usize) -> i64 {
        match ring::create(capacity, payload_size) {
            Ok((producer, consumer)) => {
                let handle = self.next_ring_handle.fetch_add(1, Ordering::Relaxed);
                self.rings.lock().unwrap().insert(
                    handle,
                    Arc::new(RingEntry {
                        producer: Mutex::new(producer),
                        consumer: Mutex::new(consumer),
                    }),
                );
                handle as i64
            }
            Err(e) => e.code(),
        }
    }

    /// Destroy a ring, releasing its slab and per-slot payloads. Safe only
    /// when no slot references remain (outstanding jobs on this ring must
    /// be released first). Destroying an unknown handle is a no-op, so a
    /// double destroy is safe.
    pub fn ring_destroy(&self, ring_handle: u64) -> i64 {
        self.rings.lock().unwrap().remove(&ring_handle);
        1
    }

    fn ring_entry(&self, ring_handle: u64) -> Option<Arc<RingEntry>> {
        self.rings.lock().unwrap().get(&ring_handle).cloned()
    }

    #[inline]
    fn pack_slot(ring_handle: u64, idx: usize) -> i64 {
        ((ring_handle << SLOT_HANDLE_BITS) | (idx as u64 + 1)) as i64
    }

    #[inline]
    fn unpack_slot(slot_handle: u64) -> Option<(u64, usize)> {
        let idx_field = slot_handle & SLOT_HANDLE_MASK;
        let ring = slot_handle >> SLOT_HANDLE_BITS;
        if idx_field == 0 || ring == 0 {
            return None;
        }
        Some((ring, (idx_field - 1) as usize))
    }

    // ── Ring data path ──────────────────────────────────────────────────

    /// Write a packet to a specific ring. Returns a slot handle (> 0),
    /// 0 when the ring is full, negative on failure. SPSC contract: one
    /// producer thread per ring — the lock is a safety net and stays
    /// uncontended.
    pub fn ring_write_to(
        &self,
        ring_handle: u64,
        bytes: &[u8],
        timestamp_ns: u64,
        flags: u16,
        queue: u16,
    ) -> i64 {
        if !self.accepting.load(Ordering::Acquire) {
            return Error::Closed.code();
        }
        let Some(entry) = self.ring_entry(ring_handle) else {
            return RC_INVALID;
        };
        let mut prod = entry.producer.lock().unwrap();
        match prod.write(bytes, timestamp_ns, flags, queue) {
            Ok(idx) => Self::pack_slot(ring_handle, idx),
            Err(e) => e.code(),
        }
    }

    /// Read the next packet from a specific ring. Slot handle (> 0) or 0
    /// when empty.
    pub fn ring_read_from(&self, ring_handle: u64) -> i64 {
        let Some(entry) = self.ring_entry(ring_handle) else {
            return RC_INVALID;
        };
        let mut cons = entry.consumer.lock().unwrap();
        match cons.read() {
            Ok(idx) => Self::pack_slot(ring_handle, idx),
            Err(e) => e.code(),
        }
    }

    /// Default-ring write (the common single-ring deployment).
    pub fn ring_write(&self, bytes: &[u8], timestamp_ns: u64, flags: u16, queue: u16) -> i64 {
        self.ring_write_to(DEFAULT_RING, bytes, timestamp_ns, flags, queue)
    }

    /// Default-ring read.
    pub fn ring_read(&self) -> i64 {
        self.ring_read_from(DEFAULT_RING)
    }

    /// Metadata of a slot handle returned by a read.
    pub fn slot_meta(&self, slot_handle: u64) -> Option<PacketMeta> {
        let (entry, idx) = self.resolve_slot(slot_handle)?;
        let cons = entry.consumer.lock().unwrap();
        Some(*cons.meta(idx))
    }

    /// Payload pointer + length. Valid until a subsequent write wraps back
    /// onto the slot (at least `capacity` writes away).
    pub fn slot_payload_ptr(&self, slot_handle: u64) -> Option<(*const u8, usize)> {
        let (entry, idx) = self.resolve_slot(slot_handle)?;
        let cons = entry.consumer.lock().unwrap();
        Some(cons.payload_raw(idx))
    }

    /// Owned copy of a slot payload (convenience for callers that outlive
    /// the borrow window).
    pub fn slot_payload_copy(&self, slot_handle: u64) -> Option<Vec<u8>> {
        let (entry, idx) = self.resolve_slot(slot_handle)?;
        let cons = entry.consumer.lock().unwrap();
        Some(cons.payload(idx).to_vec())
    }

    fn resolve_slot(&self, slot_handle: u64) -> Option<(Arc<RingEntry>, usize)> {
        let (ring_handle, idx) = Self::unpack_slot(slot_handle)?;
        let entry = self.ring_entry(ring_handle)?;
        let cap = entry.consumer.lock().unwrap().ring().capacity();
        if idx < cap {
            Some((entry, idx))
        } else {
            None
        }
    }

    // ── Crypto ──────────────────────────────────────────────────────────

    /// Submit a slot to the crypto pool. Job handle (> 0) or negative.
    pub fn crypto_submit(&self, slot_handle: u64) -> i64 {
        let Some((entry, idx)) = self.resolve_slot(slot_handle) else {
            return RC_INVALID;
        };
        let (ptr, len, ts) = {
            let cons = entry.consumer.lock().unwrap();
            let (ptr, len) = cons.payload_raw(idx);
            (ptr, len, cons.meta(idx).timestamp_ns)
        };
        // SAFETY: the slot was published by a ring this context owns; the
        // dispatcher protocol keeps the slot un-wrapped and the ring alive
        // while its job is in flight.
        let job = match unsafe { self.crypto.submit(ptr, len, ts) } {
            Ok(j) => j,
            Err(e) => return e.code(),
        };
        self.register_job(job)
    }

    /// Submit a decrypt job for a slot carrying sealed ingress data.
    /// `seq` is the sender-side job sequence recovered from the wire.
    pub fn crypto_submit_open(&self, slot_handle: u64, seq: u64) -> i64 {
        let Some((entry, idx)) = self.resolve_slot(slot_handle) else {
            return RC_INVALID;
        };
        let (ptr, len, ts) = {
            let cons = entry.consumer.lock().unwrap();
            let (ptr, len) = cons.payload_raw(idx);
            (ptr, len, cons.meta(idx).timestamp_ns)
        };
        // SAFETY: see crypto_submit.
        let job = match unsafe { self.crypto.submit_open(ptr, len, ts, seq) } {
            Ok(j) => j,
            Err(e) => return e.code(),
        };
        self.register_job(job)
    }

    fn register_job(&self, job: Arc<CryptoJob>) -> i64 {
        let handle = self.next_job_handle.fetch_add(1, Ordering::Relaxed);
        self.jobs.lock().unwrap().insert(handle, job);
        handle as i64
    }

    /// Await a job. Output length on success, RC_TIMEOUT / RC_FAILED on
    /// deadline / crypto failure.
    pub fn crypto_await(&self, job_handle: u64, timeout_ms: u64) -> i64 {
        let Some(job) = self.job_ref(job_handle) else {
            return RC_INVALID;
        };
        match self.crypto.await_job(&job, Duration::from_millis(timeout_ms)) {
            Ok(n) => n as i64,
            Err(e) => e.code(),
        }
    }

    /// Output pointer for a completed job; null for unknown handles.
    pub fn crypto_output_ptr(&self, job_handle: u64) -> *const u8 {
        match self.job_ref(job_handle) {
            Some(job) => job.output_ptr(),
            None => std::ptr::null(),
        }
    }

    /// Output copy for a completed job.
    pub fn crypto_output_copy(&self, job_handle: u64) -> Option<Vec<u8>> {
        let job = self.job_ref(job_handle)?;
        if !job.is_done() {
            return None;
        }
        Some(job.output().to_vec())
    }

    /// Release a job and its output buffer. 1 on success.
    pub fn crypto_release(&self, job_handle: u64) -> i64 {
        match self.jobs.lock().unwrap().remove(&job_handle) {
            Some(job) => {
                self.crypto.release(job);
                1
            }
            None => RC_INVALID,
        }
    }

    fn job_ref(&self, job_handle: u64) -> Option<Arc<CryptoJob>> {
        self.jobs.lock().unwrap().get(&job_handle).cloned()
    }

    pub fn crypto_stats(&self) -> Vec<WorkerSnapshot> {
        self.crypto.stats()
    }

    pub fn crypto_workers(&self) -> usize {
        self.crypto.worker_count()
    }

    // ── Burst ───────────────────────────────────────────────────────────

    pub fn burst_update(&self, bytes: u64, timestamp_ns: u64) {
        self.burst.update(bytes, timestamp_ns);
    }

    pub fn burst_level(&self) -> i64 {
        self.burst.current_level() as u32 as i64
    }

    pub fn burst_hint(&self, level: i64) {
        if (0..=BurstLevel::Extreme as u32 as i64).contains(&level) {
            self.burst.submit_hint(BurstLevel::from_u32(level as u32));
        }
    }

    // ── Connections ─────────────────────────────────────────────────────

    pub fn conn_init(&self, total_slots: usize) -> i64 {
        self.conns.init(total_slots);
        self.conns.class_sizes().iter().sum::<usize>() as i64
    }

    pub fn conn_acquire(&self, class: i64) -> i64 {
        let Some(class) = Self::class_of(class) else {
            return RC_INVALID;
        };
        match self.conns.acquire(class) {
            Ok(fd) => fd as i64,
            Err(e) => e.code(),
        }
    }

    pub fn conn_slot_index(&self, class: i64, fd: i64) -> i64 {
        let Some(class) = Self::class_of(class) else {
            return RC_INVALID;
        };
        match self.conns.slot_index_of(class, fd as i32) {
            Some(idx) => idx as i64,
            None => RC_INVALID,
        }
    }

    /// Connect a held slot. Returns the (possibly refreshed) fd — the
    /// caller polls writability to resolve an in-progress dial, the usual
    /// non-blocking workflow.
    pub fn conn_connect(&self, class: i64, fd: i64, host: &str, port: u16) -> i64 {
        let Some(class) = Self::class_of(class) else {
            return RC_INVALID;
        };
        let Ok(ip) = host.parse::<Ipv4Addr>() else {
            return RC_INVALID;
        };
        match self.conns.connect(class, fd as i32, ip, port) {
            Ok((new_fd, _progress)) => new_fd as i64,
            Err(e) => e.code(),
        }
    }

    pub fn conn_release(&self, class: i64, fd: i64) -> i64 {
        let Some(class) = Self::class_of(class) else {
            return RC_INVALID;
        };
        self.conns.release(class, fd as i32);
        1
    }

    pub fn conn_destroy(&self) {
        self.conns.destroy();
    }

    fn class_of(raw: i64) -> Option<TrafficClass> {
        if raw < 0 {
            return None;
        }
        TrafficClass::from_index(raw as usize)
    }

    // ── Capabilities ────────────────────────────────────────────────────

    pub fn has_simd(&self) -> bool {
        caps::has_simd()
    }

    pub fn has_aes(&self) -> bool {
        caps::has_aes()
    }

    pub fn caps_mask(&self) -> u32 {
        caps::caps_mask()
    }

    // ── Stats & lifecycle ───────────────────────────────────────────────

    /// Aggregate snapshot (default ring occupancy + subsystem counters).
    pub fn stats(&self) -> SubstrateStats {
        let (occ, cap) = match self.ring_entry(DEFAULT_RING) {
            Some(entry) => {
                let cons = entry.consumer.lock().unwrap();
                (cons.ring().len(), cons.ring().capacity())
            }
            None => (0, 0),
        };
        SubstrateStats {
            ring_occupancy: occ,
            ring_capacity: cap,
            burst_level: self.burst.current_level(),
            smoothed_bps: self.burst.smoothed_bps(),
            workers: self.crypto.stats(),
            conn_slots: self.conns.class_sizes(),
        }
    }

    /// Orderly teardown. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        self.accepting.store(false, Ordering::Release);
        // Drain outstanding crypto jobs before the workers go away.
        let outstanding: Vec<Arc<CryptoJob>> = {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.drain().map(|(_, j)| j).collect()
        };
        for job in &outstanding {
            let _ = self.crypto.await_job(job, Duration::from_millis(100));
        }
        drop(outstanding);
        self.crypto.shutdown();
        self.rings.lock().unwrap().clear();
        self.conns.destroy();
        eprintln!("[FP-EXEC] Substrate shut down");
    }
}

impl Drop for Substrate {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ring::RING_MAX_CAPACITY;
    use crate::engine::slot::META_FLAG_CRYPTO;

    fn substrate() -> Substrate {
        let cfg = Config {
            ring_capacity: 16,
            ring_payload_size: 256,
            worker_count: 2,
            ..Config::default()
        };
        Substrate::new(&cfg, &[0x77u8; 32]).unwrap()
    }

    #[test]
    fn handle_zero_is_invalid() {
        let s = substrate();
        assert!(s.slot_meta(0).is_none());
        assert!(s.slot_payload_ptr(0).is_none());
        assert_eq!(s.crypto_await(0, 1), RC_INVALID);
        assert!(s.crypto_output_ptr(0).is_null());
        assert!(Substrate::unpack_slot(0).is_none());
    }

    #[test]
    fn slot_handles_pack_ring_and_index() {
        for ring in [1u64, 2, 77] {
            for idx in [0usize, 1, RING_MAX_CAPACITY - 1] {
                let h = Substrate::pack_slot(ring, idx);
                assert!(h > 0);
                assert_eq!(Substrate::unpack_slot(h as u64), Some((ring, idx)));
            }
        }
    }

    #[test]
    fn ring_codes_follow_convention() {
        let s = substrate();
        // Empty ring: try-again.
        assert_eq!(s.ring_read(), 0);
        let h = s.ring_write(b"hello", 5, META_FLAG_CRYPTO, 0);
        assert!(h > 0);
        let rh = s.ring_read();
        assert_eq!(rh, h);
        let meta = s.slot_meta(rh as u64).unwrap();
        assert_eq!(meta.length, 5);
        assert_eq!(meta.timestamp_ns, 5);
        assert_eq!(s.slot_payload_copy(rh as u64).unwrap(), b"hello");
    }

    #[test]
    fn full_ring_reports_try_again() {
        let s = substrate();
        for _ in 0..16 {
            assert!(s.ring_write(b"x", 0, 0, 0) > 0);
        }
        assert_eq!(s.ring_write(b"x", 0, 0, 0), 0);
    }

    #[test]
    fn secondary_rings_are_independent() {
        let s = substrate();
        let r2 = s.ring_create(4, 64);
        assert!(r2 > 0);
        assert_ne!(r2 as u64, DEFAULT_RING);

        let h2 = s.ring_write_to(r2 as u64, b"aux", 1, 0, 0);
        assert!(h2 > 0);
        // The default ring stays empty.
        assert_eq!(s.ring_read(), 0);
        let rh = s.ring_read_from(r2 as u64);
        assert_eq!(rh, h2);
        assert_eq!(s.slot_payload_copy(rh as u64).unwrap(), b"aux");

        assert_eq!(s.ring_destroy(r2 as u64), 1);
        // Destroy twice is a no-op; the handle is gone.
        assert_eq!(s.ring_destroy(r2 as u64), 1);
        assert_eq!(s.ring_read_from(r2 as u64), RC_INVALID);
    }

    #[test]
    fn submit_await_release_flow() {
        let s = substrate();
        let wh = s.ring_write(&[0xEE; 200], 9, META_FLAG_CRYPTO, 1);
        let rh = s.ring_read();
        assert_eq!(wh, rh);
        let jh = s.crypto_submit(rh as u64);
        assert!(jh > 0);
        let n = s.crypto_await(jh as u64, 5000);
        assert_eq!(n, 200 + 16);
        let ct = s.crypto_output_copy(jh as u64).unwrap();
        assert_eq!(ct.len(), n as usize);
        assert_eq!(s.crypto_release(jh as u64), 1);
        // Double release is an invalid handle, not a crash.
        assert_eq!(s.crypto_release(jh as u64), RC_INVALID);
    }

    #[test]
    fn seal_then_open_through_the_boundary() {
        let s = substrate();
        let plain = [0x42u8; 96];
        let wh = s.ring_write(&plain, 1, META_FLAG_CRYPTO, 0);
        let rh = s.ring_read();
        assert_eq!(wh, rh);
        let jh = s.crypto_submit(rh as u64);
        let n = s.crypto_await(jh as u64, 5000);
        assert!(n > 0);
        let sealed = s.crypto_output_copy(jh as u64).unwrap();
        let seal_seq = {
            let job = s.job_ref(jh as u64).unwrap();
            job.seq()
        };
        s.crypto_release(jh as u64);

        // Feed the ciphertext back as ingress and open it.
        let wh2 = s.ring_write(&sealed, 2, META_FLAG_CRYPTO, 0);
        let rh2 = s.ring_read();
        assert_eq!(wh2, rh2);
        let jh2 = s.crypto_submit_open(rh2 as u64, seal_seq);
        assert!(jh2 > 0);
        let m = s.crypto_await(jh2 as u64, 5000);
        assert_eq!(m as usize, plain.len());
        assert_eq!(&s.crypto_output_copy(jh2 as u64).unwrap()[..], &plain[..]);
        s.crypto_release(jh2 as u64);
    }

    #[test]
    fn writes_rejected_after_shutdown() {
        let mut s = substrate();
        s.shutdown();
        assert!(s.ring_write(b"x", 0, 0, 0) < 0);
        // Idempotent.
        s.shutdown();
    }

    #[test]
    fn burst_surface_round_trips() {
        let s = substrate();
        assert_eq!(s.burst_level(), 0);
        s.burst_hint(3);
        assert_eq!(s.burst_level(), 3);
        s.burst_hint(99); // out of range: ignored
        assert_eq!(s.burst_level(), 3);
    }

    #[test]
    fn conn_surface_codes() {
        let s = substrate();
        assert_eq!(s.conn_acquire(7), RC_INVALID);
        let fd = s.conn_acquire(TrafficClass::Stream as i64);
        assert!(fd >= 0);
        let idx = s.conn_slot_index(TrafficClass::Stream as i64, fd);
        assert!(idx >= 0);
        assert_eq!(s.conn_release(TrafficClass::Stream as i64, fd), 1);
        s.conn_destroy();
    }

    #[test]
    fn stats_snapshot_reflects_ring_occupancy() {
        let s = substrate();
        assert_eq!(s.stats().ring_occupancy, 0);
        s.ring_write(b"one", 0, 0, 0);
        s.ring_write(b"two", 0, 0, 0);
        let st = s.stats();
        assert_eq!(st.ring_occupancy, 2);
        assert_eq!(st.ring_capacity, 16);
        assert_eq!(st.workers.len(), 2);
    }
}
