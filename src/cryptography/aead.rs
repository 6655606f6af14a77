// FASTPATH — AES-256-GCM AEAD
// Delegates to the `ring` crate unconditionally: the substrate carries no
// cipher of its own and refuses to run without real key material.
//
// Nonce layout: job_seq(8) || direction(1) || zeros(3) = 12 bytes.
// Job sequence numbers are monotonic per pool, so nonces never repeat
// under one derived key.

use hkdf::Hkdf;
use ring::aead;
use sha2::Sha512;

use crate::error::{Error, Result};

pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

/// Directions bind the nonce to the traffic side, preventing reflection
/// between the encrypt and decrypt pipelines under a shared master secret.
pub const DIR_EGRESS: u8 = 0x00;
pub const DIR_INGRESS: u8 = 0x01;

const JOB_KEY_INFO: &[u8] = b"FASTPATH-JOB-KEY-v1";

/// Derive the job AEAD key for one direction from the externally supplied
/// master secret (HKDF-SHA-512, the key-schedule the outer layer already
/// speaks). Key management itself stays outside the substrate.
pub fn derive_job_key(master: &[u8; KEY_LEN], direction: u8) -> Result<aead::LessSafeKey> {
    let hk = Hkdf::<Sha512>::new(Some(&[direction]), master);
    let mut key_bytes = [0u8; KEY_LEN];
    hk.expand(JOB_KEY_INFO, &mut key_bytes)
        .map_err(|_| Error::Unsupported)?;
    let ubk = aead::UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
        .map_err(|_| Error::Unsupported)?;
    Ok(aead::LessSafeKey::new(ubk))
}

#[inline(always)]
fn build_nonce(seq: u64, direction: u8) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0..8].copy_from_slice(&seq.to_le_bytes());
    nonce[8] = direction;
    nonce
}

/// Seal `payload` into `out` (ciphertext followed by the tag). Returns the
/// ciphertext length `payload.len() + TAG_LEN`; fails `InvalidArgument`
/// when `out` is too small and `Failed` on a cipher error.
pub fn seal_packet(
    lsk: &aead::LessSafeKey,
    seq: u64,
    direction: u8,
    payload: &[u8],
    out: &mut [u8],
) -> Result<usize> {
    let total = payload.len() + TAG_LEN;
    if out.len() < total {
        return Err(Error::InvalidArgument);
    }
    out[..payload.len()].copy_from_slice(payload);
    let nonce_bytes = build_nonce(seq, direction);
    let nonce = aead::Nonce::try_assume_unique_for_key(&nonce_bytes)
        .map_err(|_| Error::Failed)?;
    let tag = lsk
        .seal_in_place_separate_tag(nonce, aead::Aad::empty(), &mut out[..payload.len()])
        .map_err(|_| Error::Failed)?;
    out[payload.len()..total].copy_from_slice(tag.as_ref());
    Ok(total)
}

/// Open a sealed packet in place. Returns the plaintext length on success;
/// `Failed` on authentication failure.
pub fn open_packet(
    lsk: &aead::LessSafeKey,
    seq: u64,
    direction: u8,
    buf: &mut [u8],
) -> Result<usize> {
    if buf.len() < TAG_LEN {
        return Err(Error::InvalidArgument);
    }
    let nonce_bytes = build_nonce(seq, direction);
    let nonce = aead::Nonce::try_assume_unique_for_key(&nonce_bytes)
        .map_err(|_| Error::Failed)?;
    let plain = lsk
        .open_in_place(nonce, aead::Aad::empty(), buf)
        .map_err(|_| Error::Failed)?;
    Ok(plain.len())
}
