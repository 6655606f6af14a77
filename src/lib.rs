// FASTPATH — CRATE ROOT (LIBRARY)
// Packet-processing substrate for a mobile tunneling data plane.
//
// Module hierarchy:
//   engine/       — slot layout, SPSC packet ring, burst estimator,
//                   CPU capability probe, runtime support (clock, pinning)
//   cryptography/ — AES-256-GCM AEAD delegation + pinned crypto worker pool
//   network/      — persistent TCP connection pool, EDT pacing gate
//   boundary      — handle-based integer-return-code surface for the
//                   external data plane
//   config/error  — knobs and the crate-wide error taxonomy

pub mod engine;
pub mod cryptography;
pub mod network;
pub mod config;
pub mod error;
pub mod boundary;

pub use config::Config;
pub use error::{Error, Result};
