// FASTPATH — CRYPTO WORKER POOL
// Fixed worker set pinned (best-effort) to performance cores, consuming
// jobs that reference ring slots and sealing into job-owned output
// buffers. The queue is a mutex+condvar MPMC — contention is acceptable
// because a job is large relative to the enqueue cost.
//
// Job lifecycle: Arc-owned by the submitter and the pool; the worker that
// takes a job is the only writer of its output buffer until it publishes
// `done` with release ordering. Releasing a still-running job just drops
// the caller's Arc — the worker's clone keeps the buffer alive (orphaned
// jobs free themselves when the worker finishes).

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ring::aead::LessSafeKey;

use crate::cryptography::aead::{self, TAG_LEN};
use crate::engine::runtime::{discover_perf_cores, online_cores, pin_to_core, CachePadded};
use crate::error::{Error, Result};

/// Hard ceiling on worker count regardless of core count.
pub const WORKER_HARD_CAP: usize = 16;

/// Bounded spin before a waiter parks on the job condvar.
const AWAIT_SPIN_BUDGET: u32 = 4096;

// ============================================================================
// PER-WORKER TELEMETRY
// ============================================================================

/// Per-worker scratch, one cache line each. Workers update their own entry
/// with relaxed ordering — diagnostic, not synchronization.
pub struct WorkerLocal {
    pub worker_id: u32,
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub last_timestamp_ns: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerSnapshot {
    pub worker_id: u32,
    pub packets: u64,
    pub bytes: u64,
    pub last_timestamp_ns: u64,
}

// ============================================================================
// CRYPTO JOB
// ============================================================================

/// Seal turns plaintext into ciphertext+tag; Open verifies and strips the
/// tag from sealed ingress data.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum JobKind {
    Seal,
    Open,
}

pub struct CryptoJob {
    kind: JobKind,
    /// Borrowed view into the originating ring slot. The job never frees
    /// it — the ring owns slot payloads outright.
    src_ptr: *const u8,
    src_len: usize,
    /// Producer timestamp carried through for worker telemetry.
    timestamp_ns: u64,
    /// Nonce sequence: pool-unique for Seal, wire-recovered for Open.
    seq: u64,
    /// Job-owned output buffer; written by exactly one worker.
    out: UnsafeCell<Box<[u8]>>,
    output_len: AtomicU32,
    failed: AtomicBool,
    done: AtomicBool,
    done_lock: Mutex<bool>,
    done_cv: Condvar,
}

// SAFETY: the output buffer has a single writer (the one worker that took
// the job off the queue) and is read only after `done` is observed with
// acquire ordering, which happens-after the worker's release store. The
// source pointer targets a published ring slot the submitter keeps valid
// for the job's lifetime.
unsafe impl Send for CryptoJob {}
unsafe impl Sync for CryptoJob {}

impl CryptoJob {
    /// Completion flag, acquire — pairs with the worker's release publish.
    #[inline(always)]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Ciphertext view. Valid once `await_job` reported success; stays
    /// valid until the job is released.
    pub fn output(&self) -> &[u8] {
        debug_assert!(self.is_done());
        let len = self.output_len.load(Ordering::Acquire) as usize;
        // SAFETY: after the acquire of done/output_len the worker has
        // finished writing and will never touch the buffer again.
        unsafe { &(&*self.out.get())[..len] }
    }

    /// Raw output pointer for the boundary surface.
    pub fn output_ptr(&self) -> *const u8 {
        // SAFETY: the box is allocated for the job's lifetime.
        unsafe { (*self.out.get()).as_ptr() }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }
}

// ============================================================================
// POOL
// ============================================================================

struct PoolShared {
    queue: Mutex<VecDeque<Arc<CryptoJob>>>,
    queue_cv: Condvar,
    running: AtomicBool,
    key: LessSafeKey,
    direction: u8,
    next_seq: AtomicU64,
    locals: Box<[CachePadded<WorkerLocal>]>,
}

pub struct CryptoPool {
    shared: Arc<PoolShared>,
    workers: Vec<std::thread::JoinHandle<()>>,
    chunk_size: usize,
}

impl CryptoPool {
    /// One-shot pool initialization. Worker count is
    /// `min(2 × online cores, 16)` unless overridden; each worker is
    /// pinned to a performance core on a best-effort basis.
    pub fn new(master_key: &[u8; 32], direction: u8, worker_override: usize, chunk_size: usize) -> Result<CryptoPool> {
        let key = aead::derive_job_key(master_key, direction)?;
        let count = if worker_override > 0 {
            worker_override.min(WORKER_HARD_CAP)
        } else {
            (2 * online_cores()).clamp(1, WORKER_HARD_CAP)
        };

        let locals: Box<[CachePadded<WorkerLocal>]> = (0..count)
            .map(|i| {
                CachePadded::new(WorkerLocal {
                    worker_id: i as u32,
                    packets: AtomicU64::new(0),
                    bytes: AtomicU64::new(0),
                    last_timestamp_ns: AtomicU64::new(0),
                })
            })
            .collect();

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            running: AtomicBool::new(true),
            key,
            direction,
            next_seq: AtomicU64::new(1),
            locals,
        });

        let perf_cores = discover_perf_cores();
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let sh = shared.clone();
            let core = perf_cores.get(i % perf_cores.len().max(1)).copied();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("fp-crypto-{}", i))
                    .spawn(move || {
                        if let Some(c) = core {
                            if !pin_to_core(c) {
                                eprintln!(
                                    "[FP-CRYPTO] WARNING: worker {} affinity to core {} failed. Continuing.",
                                    i, c
                                );
                            }
                        }
                        worker_loop(i, &sh);
                    })
                    .map_err(|_| Error::System(libc::EAGAIN))?,
            );
        }

        eprintln!(
            "[FP-CRYPTO] Pool initialized: {} workers, perf cores {:?}",
            count, perf_cores
        );
        Ok(CryptoPool { shared, workers, chunk_size: chunk_size.max(1) })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Create a job for a ring slot and enqueue it. `Closed` when the pool
    /// is shutting down; `OutOfMemory` when the output buffer cannot be
    /// allocated — both reported synchronously.
    ///
    /// # Safety
    /// `src_ptr .. src_ptr + src_len` must be a published ring slot payload
    /// that stays valid until the job is released: the ring must outlive
    /// the job, and the consumer must not let a subsequent write wrap back
    /// onto the slot while the job is in flight.
    pub unsafe fn submit(
        &self,
        src_ptr: *const u8,
        src_len: usize,
        timestamp_ns: u64,
    ) -> Result<Arc<CryptoJob>> {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        self.enqueue(JobKind::Seal, src_ptr, src_len, timestamp_ns, seq)
    }

    /// Enqueue a decrypt job for sealed ingress data. `seq` is the
    /// sender-side sequence recovered from the wire.
    ///
    /// # Safety
    /// Same contract as `submit`.
    pub unsafe fn submit_open(
        &self,
        src_ptr: *const u8,
        src_len: usize,
        timestamp_ns: u64,
        seq: u64,
    ) -> Result<Arc<CryptoJob>> {
        if src_len < TAG_LEN {
            return Err(Error::InvalidArgument);
        }
        self.enqueue(JobKind::Open, src_ptr, src_len, timestamp_ns, seq)
    }

    fn enqueue(
        &self,
        kind: JobKind,
        src_ptr: *const u8,
        src_len: usize,
        timestamp_ns: u64,
        seq: u64,
    ) -> Result<Arc<CryptoJob>> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if src_ptr.is_null() {
            return Err(Error::InvalidArgument);
        }

        // Output sized to at least payload + tag, rounded to the chunk
        // granule so buffer sizes stay friendly to the allocator.
        let need = src_len + TAG_LEN;
        let rounded = need.div_ceil(self.chunk_size) * self.chunk_size;
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(rounded).map_err(|_| Error::OutOfMemory)?;
        buf.resize(rounded, 0);

        let job = Arc::new(CryptoJob {
            kind,
            src_ptr,
            src_len,
            timestamp_ns,
            seq,
            out: UnsafeCell::new(buf.into_boxed_slice()),
            output_len: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            done: AtomicBool::new(false),
            done_lock: Mutex::new(false),
            done_cv: Condvar::new(),
        });

        {
            let mut q = self.shared.queue.lock().unwrap();
            if !self.shared.running.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            q.push_back(job.clone());
        }
        self.shared.queue_cv.notify_one();
        Ok(job)
    }

    /// Block until the job completes or the timeout elapses. Bounded spin
    /// first (jobs are short), then park on the job's condvar. On timeout
    /// the job stays live: the caller may re-await or release it.
    pub fn await_job(&self, job: &CryptoJob, timeout: Duration) -> Result<usize> {
        for _ in 0..AWAIT_SPIN_BUDGET {
            if job.is_done() {
                return finish(job);
            }
            std::hint::spin_loop();
        }

        let deadline = Instant::now() + timeout;
        let mut signalled = job.done_lock.lock().unwrap();
        loop {
            if *signalled || job.is_done() {
                return finish(job);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (guard, wait) = job
                .done_cv
                .wait_timeout(signalled, deadline - now)
                .unwrap();
            signalled = guard;
            if wait.timed_out() && !*signalled && !job.is_done() {
                return Err(Error::Timeout);
            }
        }
    }

    /// Release a job: drops the caller's reference. Safe on a job that is
    /// still running — the worker's clone owns the buffer until `done`.
    pub fn release(&self, job: Arc<CryptoJob>) {
        drop(job);
    }

    /// Snapshot the per-worker counters.
    pub fn stats(&self) -> Vec<WorkerSnapshot> {
        self.shared
            .locals
            .iter()
            .map(|l| WorkerSnapshot {
                worker_id: l.value.worker_id,
                packets: l.value.packets.load(Ordering::Relaxed),
                bytes: l.value.bytes.load(Ordering::Relaxed),
                last_timestamp_ns: l.value.last_timestamp_ns.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Cooperative shutdown: mark not running, wake every worker, join
    /// them, then drain whatever jobs never ran. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.queue_cv.notify_all();
        for h in self.workers.drain(..) {
            let _ = h.join();
        }
        let drained = {
            let mut q = self.shared.queue.lock().unwrap();
            let n = q.len();
            q.clear();
            n
        };
        if drained > 0 {
            eprintln!("[FP-CRYPTO] Shutdown drained {} unprocessed job(s)", drained);
        }
    }
}

impl Drop for CryptoPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolve a completed job to its await result.
fn finish(job: &CryptoJob) -> Result<usize> {
    if job.failed.load(Ordering::Acquire) {
        return Err(Error::Failed);
    }
    Ok(job.output_len.load(Ordering::Acquire) as usize)
}

// ============================================================================
// WORKER LOOP
// ============================================================================

fn worker_loop(worker_id: usize, shared: &PoolShared) {
    let local = &shared.locals[worker_id].value;
    loop {
        let job = {
            let mut q = shared.queue.lock().unwrap();
            loop {
                if !shared.running.load(Ordering::Acquire) {
                    return;
                }
                if let Some(j) = q.pop_front() {
                    break j;
                }
                q = shared.queue_cv.wait(q).unwrap();
            }
        };
        process_job(&job, shared, local);
    }
}

/// Process one job. The worker writes the job's output buffer and its own
/// telemetry line only — never the ring or the slot body.
fn process_job(job: &CryptoJob, shared: &PoolShared, local: &WorkerLocal) {
    // SAFETY: submit's contract — src points at a published slot payload
    // kept valid for the job's lifetime.
    let input = unsafe { std::slice::from_raw_parts(job.src_ptr, job.src_len) };
    // SAFETY: this worker is the only writer of the output buffer until
    // `done` publishes (at-most-one worker processes any given job).
    let out = unsafe { &mut *job.out.get() };

    let result = match job.kind {
        JobKind::Seal => aead::seal_packet(&shared.key, job.seq, shared.direction, input, out),
        JobKind::Open => {
            // Verify-and-strip in the job-owned buffer; the slot body is
            // never mutated.
            out[..job.src_len].copy_from_slice(input);
            aead::open_packet(&shared.key, job.seq, shared.direction, &mut out[..job.src_len])
        }
    };

    match result {
        Ok(n) => {
            job.output_len.store(n as u32, Ordering::Release);
            local.packets.fetch_add(1, Ordering::Relaxed);
            local.bytes.fetch_add(job.src_len as u64, Ordering::Relaxed);
            local.last_timestamp_ns.store(job.timestamp_ns, Ordering::Relaxed);
        }
        Err(_) => {
            // Failure marker: consumer sees Failed, output undefined.
            // The worker itself keeps running.
            job.output_len.store(0, Ordering::Release);
            job.failed.store(true, Ordering::Release);
        }
    }

    job.done.store(true, Ordering::Release);
    let mut signalled = job.done_lock.lock().unwrap();
    *signalled = true;
    job.done_cv.notify_all();
    drop(signalled);
}

// ============================================================================
// TESTS
// ============================================================================
