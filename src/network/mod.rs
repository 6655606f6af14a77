// FASTPATH — NETWORK MODULE
//   conn.rs   — fixed-class persistent TCP connection pool with liveness
//               probing and CAS-guarded invalidation
//   pacer.rs  — zero-spin EDT pacing gate driven by the burst level
//   sched.rs  — strict-priority egress scheduler gated on release times
//   egress.rs — non-blocking send path: chunk slicer + MSG_ZEROCOPY probe

pub mod conn;
pub mod pacer;
pub mod sched;
pub mod egress;
