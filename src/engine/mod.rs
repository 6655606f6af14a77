// FASTPATH — ENGINE MODULE
//   slot.rs    — PacketMeta / RingSlot layout (contract-bound, cache-aligned)
//   ring.rs    — SPSC packet ring with ABA-safe generation counters
//   burst.rs   — EWMA burst intensity tracker + discrete level classifier
//   caps.rs    — one-shot CPU capability probe (SIMD / AES / PMULL)
//   runtime.rs — clock, cache padding, core discovery, best-effort pinning

pub mod slot;
pub mod ring;
pub mod burst;
pub mod caps;
pub mod runtime;
