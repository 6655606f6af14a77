// FASTPATH — CRYPTOGRAPHY MODULE
//   aead.rs — AES-256-GCM delegation to `ring` + HKDF job-key derivation
//   pool.rs — pinned crypto worker pool (job queue, await, telemetry)

pub mod aead;
pub mod pool;
