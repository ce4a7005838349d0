//! Thin wrappers over blake2b with the digest sizes used across the engine.
//!
//! Every durable identity in tessera (subset UUIDs, content hashes, schema
//! fingerprints, tamper-chain entries) is a blake2b digest with a 16-byte
//! output; writer routing uses an 8-byte variant. The wrappers exist so the
//! digest size is fixed in exactly one place.

use blake2::digest::consts::{U16, U8};
use blake2::{Blake2b, Digest};

/// blake2b with a 16-byte (128-bit) output.
pub type Blake2b128 = Blake2b<U16>;

/// blake2b with an 8-byte output, used only for writer routing.
pub type Blake2b64 = Blake2b<U8>;

/// One-shot blake2b-128 digest.
#[must_use]
pub fn blake2b_128(data: &[u8]) -> [u8; 16] {
    let mut h = Blake2b128::new();
    h.update(data);
    h.finalize().into()
}

/// One-shot blake2b-128 digest, hex encoded.
#[must_use]
pub fn blake2b_128_hex(data: &[u8]) -> String {
    hex::encode(blake2b_128(data))
}

/// One-shot blake2b-64 digest as a little-endian integer.
#[must_use]
pub fn blake2b_64_le(data: &[u8]) -> u64 {
    let mut h = Blake2b64::new();
    h.update(data);
    let out: [u8; 8] = h.finalize().into();
    u64::from_le_bytes(out)
}
