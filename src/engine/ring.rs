// FASTPATH — ENGINE: SPSC PACKET RING
// Lock-free single-producer/single-consumer transport between the tunnel
// reader and the dispatcher. Publication and consumption synchronize purely
// through atomic counters; neither side ever blocks or retries.
//
// Counters: positions are 64-bit monotonic; each side carries a 32-bit
// generation sequence bumped when its position crosses the wrap threshold,
// at which point the position is rebased by a fixed multiple of the
// capacity. Slot index is `pos & mask` and survives the rebase unchanged.
//
// Cache geometry: producer cursor, consumer cursor and shared metadata
// occupy three distinct cache lines.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::runtime::CachePadded;
use crate::engine::slot::{PacketMeta, RingSlot};
use crate::error::{Error, Result};

/// Capacity ceiling. Mirrors the 64 Ki slot limit of the transport contract.
pub const RING_MAX_CAPACITY: usize = 64 * 1024;

/// One side's cursor: wide position + ABA generation sequence.
struct Cursor {
    pos: AtomicU64,
    seq: AtomicU32,
}

impl Cursor {
    const fn new() -> Self {
        Cursor { pos: AtomicU64::new(0), seq: AtomicU32::new(0) }
    }
}

/// The ring. Constructed once; torn down when both handles drop.
pub struct PacketRing {
    write: CachePadded<Cursor>, // producer-written, consumer-read
    read: CachePadded<Cursor>,  // consumer-written, producer-read
    // Shared metadata, immutable after construction (third cache line).
    capacity: u64,
    mask: u64,
    payload_size: usize,
    slots: *mut RingSlot,
    slab: *mut u8,
    slab_len: usize,
    /// Wide positions at or above this value rebase and bump the generation.
    wrap_limit: u64,
    /// Fixed rebase amount: the largest multiple of capacity below the wrap
    /// limit. Both sides subtract the same constant, so occupancy across a
    /// generation gap stays exactly computable.
    rebase: u64,
}

// SAFETY: the ring is SPSC by contract — RingProducer and RingConsumer are
// each held by exactly one thread and partition the mutable state (producer
// writes slots ahead of write.pos, consumer reads slots behind it, ordered
// by the release/acquire pair on the positions). Slab and slot storage are
// plain bytes/PODs with no interior references.
unsafe impl Send for PacketRing {}
unsafe impl Sync for PacketRing {}

impl Drop for PacketRing {
    fn drop(&mut self) {
        // SAFETY: slots/slab were produced by Box::into_raw on boxed slices
        // of exactly `capacity` / `slab_len` elements; reconstructing the
        // boxes releases the allocations. Per-slot heap payloads are freed
        // first.
        unsafe {
            for i in 0..self.capacity {
                let slot = &mut *self.slots.add(i as usize);
                free_heap_payload(slot);
            }
            let _ = Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.slots,
                self.capacity as usize,
            ));
            if !self.slab.is_null() {
                let _ = Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.slab, self.slab_len));
            }
        }
    }
}

/// Free a slot's heap-owned payload, if any. Slab-backed payloads are
/// untouched — the slab belongs to the ring.
///
/// # Safety
/// `slot` must be exclusively borrowed and its payload pointer, when
/// heap-owned, must have come from `alloc_heap_payload`.
unsafe fn free_heap_payload(slot: &mut RingSlot) {
    if slot.heap_owned != 0 && !slot.payload.is_null() {
        let cap = slot.payload_cap as usize;
        let _ = Box::from_raw(std::ptr::slice_from_raw_parts_mut(slot.payload, cap));
    }
    slot.payload = std::ptr::null_mut();
    slot.payload_cap = 0;
    slot.heap_owned = 0;
}

/// Allocate an owned payload buffer for an oversized packet.
/// Reports `OutOfMemory` instead of aborting on allocation failure.
/// Boxed slice so the deallocation layout is exact.
fn alloc_heap_payload(len: usize) -> Result<*mut u8> {
    let mut v: Vec<u8> = Vec::new();
    v.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
    v.resize(len, 0);
    Ok(Box::into_raw(v.into_boxed_slice()) as *mut u8)
}

/// Raw occupancy from a `(pos, seq)` snapshot of both cursors. Same
/// generation: plain wide-counter difference. Generation gap (producer
/// rebased, consumer not yet): undo the rebase on the producer position —
/// exact, no modular ambiguity.
///
/// Every legal snapshot lands in `[0, capacity]`. A value outside that
/// range means the snapshot tore across the other side's two-store
/// publish (possible only in the rebase window, once per 2^64 ops); each
/// caller resolves it conservatively — the producer treats it as full,
/// the consumer as empty — and the next poll sees a consistent pair.
#[inline(always)]
fn occupancy_raw(wpos: u64, wseq: u32, rpos: u64, rseq: u32, rebase: u64) -> u64 {
    if wseq == rseq {
        // wpos < rpos has no legal same-generation reading; the wrapping
        // difference pushes it past capacity so callers reject it.
        wpos.wrapping_sub(rpos)
    } else {
        wpos.wrapping_add(rebase).wrapping_sub(rpos)
    }
}

/// Create an SPSC packet ring. `capacity` is rounded up to the next power
/// of two (ceiling 65 536); `payload_size > 0` pre-allocates a slab of
/// `capacity × payload_size` bytes for copy-free slot reuse.
pub fn create(capacity: usize, payload_size: usize) -> Result<(RingProducer, RingConsumer)> {
    if capacity == 0 || capacity > RING_MAX_CAPACITY {
        return Err(Error::InvalidArgument);
    }
    let cap = capacity.next_power_of_two() as u64;
    let mask = cap - 1;

    let mut slot_vec: Vec<RingSlot> = Vec::new();
    slot_vec.try_reserve_exact(cap as usize).map_err(|_| Error::OutOfMemory)?;
    for _ in 0..cap {
        slot_vec.push(RingSlot::empty());
    }
    let slots = Box::into_raw(slot_vec.into_boxed_slice()) as *mut RingSlot;

    let (slab, slab_len) = if payload_size > 0 {
        let len = cap as usize * payload_size;
        let mut v: Vec<u8> = Vec::new();
        if v.try_reserve_exact(len).is_err() {
            // Roll the slot array back before reporting.
            // SAFETY: slots holds exactly cap initialized elements from above.
            unsafe {
                let _ = Box::from_raw(std::ptr::slice_from_raw_parts_mut(slots, cap as usize));
            }
            return Err(Error::OutOfMemory);
        }
        v.resize(len, 0);
        (Box::into_raw(v.into_boxed_slice()) as *mut u8, len)
    } else {
        (std::ptr::null_mut(), 0)
    };

    let wrap_limit = u64::MAX - 2 * cap;
    let ring = Arc::new(PacketRing {
        write: CachePadded::new(Cursor::new()),
        read: CachePadded::new(Cursor::new()),
        capacity: cap,
        mask,
        payload_size,
        slots,
        slab,
        slab_len,
        wrap_limit,
        rebase: wrap_limit & !mask,
    });

    Ok((RingProducer { ring: ring.clone() }, RingConsumer { ring }))
}

impl PacketRing {
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[inline(always)]
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Occupancy as observed from a full cursor snapshot, clamped to
    /// `[0, capacity]` (diagnostic view).
    pub fn len(&self) -> usize {
        let wseq = self.write.value.seq.load(Ordering::Acquire);
        let wpos = self.write.value.pos.load(Ordering::Acquire);
        let rseq = self.read.value.seq.load(Ordering::Acquire);
        let rpos = self.read.value.pos.load(Ordering::Acquire);
        occupancy_raw(wpos, wseq, rpos, rseq, self.rebase).min(self.capacity) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advance a cursor by one, rebasing across the wrap threshold.
    /// The owning side stores the new sequence first (when it changes),
    /// then the new position with release ordering, so an acquire load of
    /// the position observes a consistent pair.
    #[inline(always)]
    fn publish(&self, cursor: &Cursor, old_pos: u64) {
        self.publish_n(cursor, old_pos, 1);
    }

    /// Publish `n` advances with a single release store — one memory
    /// barrier per batch instead of per element. The rebase can trigger at
    /// most once per batch: positions re-enter far below the threshold.
    #[inline(always)]
    fn publish_n(&self, cursor: &Cursor, old_pos: u64, n: u64) {
        let next = old_pos + n;
        if next >= self.wrap_limit {
            let seq = cursor.seq.load(Ordering::Relaxed);
            cursor.seq.store(seq.wrapping_add(1), Ordering::Release);
            cursor.pos.store(next - self.rebase, Ordering::Release);
        } else {
            cursor.pos.store(next, Ordering::Release);
        }
    }

    /// Test fixture: force both cursors to `pos` (generation 0) so wrap
    /// behavior can be exercised without 2^64 operations.
    #[doc(hidden)]
    pub fn force_positions(&self, pos: u64) {
        self.write.value.pos.store(pos, Ordering::SeqCst);
        self.read.value.pos.store(pos, Ordering::SeqCst);
        self.write.value.seq.store(0, Ordering::SeqCst);
        self.read.value.seq.store(0, Ordering::SeqCst);
    }
}

// ============================================================================
// PRODUCER SIDE
// ============================================================================

pub struct RingProducer {
    ring: Arc<PacketRing>,
}

// SAFETY: the producer handle is used by exactly one thread.
unsafe impl Send for RingProducer {}

impl RingProducer {
    /// Reserve the next write slot, copy the payload in, write metadata,
    /// and publish with release ordering. Returns the slot index on
    /// success. `Full` when no slot is free — the caller decides whether
    /// to back off or drop; this never blocks and never partially
    /// publishes.
    pub fn write(
        &mut self,
        bytes: &[u8],
        timestamp_ns: u64,
        flags: u16,
        queue: u16,
    ) -> Result<usize> {
        let ring = &*self.ring;
        if bytes.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument);
        }

        let wpos = ring.write.value.pos.load(Ordering::Relaxed);
        let wseq = ring.write.value.seq.load(Ordering::Relaxed);
        let rseq = ring.read.value.seq.load(Ordering::Acquire);
        let rpos = ring.read.value.pos.load(Ordering::Acquire);
        // Torn consumer snapshots land above capacity and reject the write.
        if occupancy_raw(wpos, wseq, rpos, rseq, ring.rebase) >= ring.capacity {
            return Err(Error::Full);
        }

        let idx = (wpos & ring.mask) as usize;
        // SAFETY: idx is masked to the slot array bounds. The slot is ahead
        // of the published write position, so the consumer cannot observe it
        // until the release store below.
        let slot = unsafe { &mut *ring.slots.add(idx) };

        // SAFETY: slot is exclusively borrowed by the producer here.
        unsafe { free_heap_payload(slot) };

        if !ring.slab.is_null() && bytes.len() <= ring.payload_size {
            // SAFETY: slab cell [idx * payload_size .. +payload_size] is
            // owned by slot idx; copy length is bounded by payload_size.
            unsafe {
                let dst = ring.slab.add(idx * ring.payload_size);
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
                slot.payload = dst;
            }
            slot.payload_cap = ring.payload_size as u64;
            slot.heap_owned = 0;
        } else {
            let dst = alloc_heap_payload(bytes.len())?;
            // SAFETY: dst was just allocated with exactly bytes.len() bytes.
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
            slot.payload = dst;
            slot.payload_cap = bytes.len() as u64;
            slot.heap_owned = 1;
        }

        slot.meta = PacketMeta {
            timestamp_ns,
            length: bytes.len() as u32,
            flags,
            queue,
            reserved: [0u8; 48],
        };

        ring.publish(&ring.write.value, wpos);
        Ok(idx)
    }

    /// Batch write: fills as many free slots as the payload list allows
    /// and publishes them with a single release store. Returns the number
    /// of packets written — the prefix of `payloads`; the rest did not fit
    /// (or an allocation failed) and nothing about them changed.
    pub fn write_batch(
        &mut self,
        payloads: &[&[u8]],
        timestamp_ns: u64,
        flags: u16,
        queue: u16,
    ) -> usize {
        let ring = &*self.ring;
        if payloads.is_empty() {
            return 0;
        }

        let wpos = ring.write.value.pos.load(Ordering::Relaxed);
        let wseq = ring.write.value.seq.load(Ordering::Relaxed);
        let rseq = ring.read.value.seq.load(Ordering::Acquire);
        let rpos = ring.read.value.pos.load(Ordering::Acquire);
        let occ = occupancy_raw(wpos, wseq, rpos, rseq, ring.rebase);
        if occ >= ring.capacity {
            return 0;
        }
        let free = (ring.capacity - occ) as usize;
        let to_write = payloads.len().min(free);

        let mut written = 0usize;
        for (i, bytes) in payloads[..to_write].iter().enumerate() {
            let idx = ((wpos + i as u64) & ring.mask) as usize;
            // SAFETY: idx is masked to the slot array bounds and lies ahead
            // of the published write position.
            let slot = unsafe { &mut *ring.slots.add(idx) };
            // SAFETY: slot is exclusively borrowed by the producer here.
            unsafe { free_heap_payload(slot) };

            if !ring.slab.is_null() && bytes.len() <= ring.payload_size {
                // SAFETY: slab cell belongs to slot idx; length bounded.
                unsafe {
                    let dst = ring.slab.add(idx * ring.payload_size);
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
                    slot.payload = dst;
                }
                slot.payload_cap = ring.payload_size as u64;
                slot.heap_owned = 0;
            } else {
                let dst = match alloc_heap_payload(bytes.len()) {
                    Ok(p) => p,
                    Err(_) => break, // publish the prefix, report short count
                };
                // SAFETY: dst was allocated with exactly bytes.len() bytes.
                unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
                slot.payload = dst;
                slot.payload_cap = bytes.len() as u64;
                slot.heap_owned = 1;
            }
            slot.meta = PacketMeta {
                timestamp_ns,
                length: bytes.len() as u32,
                flags,
                queue,
                reserved: [0u8; 48],
            };
            written += 1;
        }

        if written > 0 {
            ring.publish_n(&ring.write.value, wpos, written as u64);
        }
        written
    }

    /// Free slots currently available for writing.
    pub fn available(&self) -> usize {
        self.ring.capacity() - self.ring.len()
    }

    pub fn ring(&self) -> &Arc<PacketRing> {
        &self.ring
    }
}

// ============================================================================
// CONSUMER SIDE
// ============================================================================

pub struct RingConsumer {
    ring: Arc<PacketRing>,
}

// SAFETY: the consumer handle is used by exactly one thread.
unsafe impl Send for RingConsumer {}

impl RingConsumer {
    /// Advance the read cursor and return the slot index. `Empty` when
    /// nothing is published. The slot is borrowed: its payload and
    /// metadata stay valid until a subsequent write wraps back around to
    /// it, which takes at least `capacity` further writes.
    pub fn read(&mut self) -> Result<usize> {
        let ring = &*self.ring;
        let rpos = ring.read.value.pos.load(Ordering::Relaxed);
        let rseq = ring.read.value.seq.load(Ordering::Relaxed);
        let wseq = ring.write.value.seq.load(Ordering::Acquire);
        let wpos = ring.write.value.pos.load(Ordering::Acquire);
        // Torn producer snapshots land above capacity and read as empty.
        let occ = occupancy_raw(wpos, wseq, rpos, rseq, ring.rebase);
        if occ == 0 || occ > ring.capacity {
            return Err(Error::Empty);
        }

        let idx = (rpos & ring.mask) as usize;
        ring.publish(&ring.read.value, rpos);
        Ok(idx)
    }

    /// Batch read: drains up to `out.len()` slot indices with a single
    /// release store on the read cursor. Returns the number drained.
    pub fn read_batch(&mut self, out: &mut [usize]) -> usize {
        let ring = &*self.ring;
        if out.is_empty() {
            return 0;
        }
        let rpos = ring.read.value.pos.load(Ordering::Relaxed);
        let rseq = ring.read.value.seq.load(Ordering::Relaxed);
        let wseq = ring.write.value.seq.load(Ordering::Acquire);
        let wpos = ring.write.value.pos.load(Ordering::Acquire);
        let occ = occupancy_raw(wpos, wseq, rpos, rseq, ring.rebase);
        if occ == 0 || occ > ring.capacity {
            return 0;
        }
        let to_read = out.len().min(occ as usize);
        for (i, slot) in out[..to_read].iter_mut().enumerate() {
            *slot = ((rpos + i as u64) & ring.mask) as usize;
        }
        ring.publish_n(&ring.read.value, rpos, to_read as u64);
        to_read
    }

    /// Metadata of a slot returned by `read`.
    pub fn meta(&self, idx: usize) -> &PacketMeta {
        assert!(idx < self.ring.capacity());
        // SAFETY: idx is in bounds; the slot body was published before the
        // write position the consumer's acquire load observed.
        unsafe { &(*self.ring.slots.add(idx)).meta }
    }

    /// Borrowed payload of a slot returned by `read`.
    pub fn payload(&self, idx: usize) -> &[u8] {
        let (ptr, len) = self.payload_raw(idx);
        // SAFETY: ptr/len come from the slot the producer published; the
        // borrow rules on &self keep the view alive only while the consumer
        // handle is not advanced past wraparound.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    /// Raw payload pointer + length for handing to the crypto pool.
    pub fn payload_raw(&self, idx: usize) -> (*const u8, usize) {
        assert!(idx < self.ring.capacity());
        // SAFETY: idx is in bounds; see `meta`.
        let slot = unsafe { &*self.ring.slots.add(idx) };
        (slot.payload as *const u8, slot.meta.length as usize)
    }

    pub fn ring(&self) -> &Arc<PacketRing> {
        &self.ring
    }
}

// ============================================================================
// TESTS
// ============================================================================
