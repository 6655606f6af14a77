// FASTPATH — ENGINE: PACKET METADATA & RING SLOT LAYOUT
// Fixed, cache-line-sized records shared between the producer, the ring
// consumer and the crypto workers. The layout is contract-bound: field
// offsets are frozen, future fields live in the reserved padding.

use std::mem;
use bytemuck::{Pod, Zeroable};

// Packet flag bits (PacketMeta.flags).
pub const META_FLAG_CRYPTO: u16       = 0x0001; // payload requires the crypto pipeline
pub const META_FLAG_PRIO_HIGH: u16    = 0x0002; // priority class: latency-sensitive
pub const META_FLAG_END_OF_BURST: u16 = 0x0004; // last packet of a producer burst

/// Per-packet metadata. Exactly one cache line, no padding holes,
/// predictable ordering for vector loads.
#[repr(C, align(64))]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct PacketMeta {
    /// Monotonic nanoseconds, set by the producer at write time.
    pub timestamp_ns: u64,
    /// Payload byte count.
    pub length: u32,
    /// Bitfield: crypto-required, priority class, end-of-burst.
    pub flags: u16,
    /// Egress class selector.
    pub queue: u16,
    /// Reserved for future fields; existing offsets never move.
    pub reserved: [u8; 48],
}

const _: () = assert!(mem::size_of::<PacketMeta>() == 64);
const _: () = assert!(mem::offset_of!(PacketMeta, timestamp_ns) == 0);
const _: () = assert!(mem::offset_of!(PacketMeta, length) == 8);
const _: () = assert!(mem::offset_of!(PacketMeta, flags) == 12);
const _: () = assert!(mem::offset_of!(PacketMeta, queue) == 14);

impl PacketMeta {
    pub const EMPTY: PacketMeta = PacketMeta {
        timestamp_ns: 0,
        length: 0,
        flags: 0,
        queue: 0,
        reserved: [0u8; 48],
    };
}

/// One ring slot: embedded metadata plus an owning payload pointer.
/// The ring exclusively owns `payload` for the slot's entire lifetime —
/// it points into the ring slab (`heap_owned == 0`) or at a heap
/// allocation owned by this slot (`heap_owned == 1`, freed on overwrite
/// or ring drop). No external party may free it.
#[repr(C, align(64))]
pub struct RingSlot {
    pub meta: PacketMeta,
    pub payload: *mut u8,
    pub payload_cap: u64,
    pub heap_owned: u8,
    pub reserved: [u8; 47],
}

const _: () = assert!(mem::size_of::<RingSlot>() == 128);
const _: () = assert!(mem::offset_of!(RingSlot, meta) == 0);
const _: () = assert!(mem::offset_of!(RingSlot, payload) == 64);
const _: () = assert!(mem::offset_of!(RingSlot, payload_cap) == 72);

impl RingSlot {
    pub const fn empty() -> Self {
        RingSlot {
            meta: PacketMeta::EMPTY,
            payload: std::ptr::null_mut(),
            payload_cap: 0,
            heap_owned: 0,
            reserved: [0u8; 47],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_contract() {
        assert_eq!(mem::size_of::<PacketMeta>(), 64);
        assert_eq!(mem::size_of::<RingSlot>(), 128);
        assert_eq!(mem::align_of::<PacketMeta>(), 64);
        assert_eq!(mem::align_of::<RingSlot>(), 64);
    }

    #[test]
    fn flags_are_single_bits() {
        let flags = [META_FLAG_CRYPTO, META_FLAG_PRIO_HIGH, META_FLAG_END_OF_BURST];
        for (i, f) in flags.iter().enumerate() {
            assert!(f.is_power_of_two(), "flag 0x{:04X} not a single bit", f);
            for g in &flags[i + 1..] {
                assert_ne!(f, g, "duplicate flag value");
            }
        }
    }

    #[test]
    fn meta_is_pod() {
        let m = PacketMeta {
            timestamp_ns: 7,
            length: 1400,
            flags: META_FLAG_CRYPTO,
            queue: 1,
            reserved: [0u8; 48],
        };
        let bytes: &[u8] = bytemuck::bytes_of(&m);
        assert_eq!(bytes.len(), 64);
        let back: PacketMeta = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(back.timestamp_ns, 7);
        assert_eq!(back.length, 1400);
        assert_eq!(back.flags, META_FLAG_CRYPTO);
        assert_eq!(back.queue, 1);
    }
}
