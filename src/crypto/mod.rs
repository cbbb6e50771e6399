//! Randomness and digests shared by the packet transformers
//!
//! This module provides:
//! - Secure random bytes for IVs, fragment ids and filler
//! - Random shift keys for the Caesar transformer
//! - SHA-1 for RC4 IV derivation (legacy interop only)

use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

/// Length of a SHA-1 digest in bytes
pub const SHA1_LEN: usize = 20;

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}

/// Allocate and fill a random buffer of `len` bytes
pub fn random_vec(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    random_bytes(&mut buf);
    buf
}

/// Generate a random u32
pub fn random_u32() -> u32 {
    let mut buf = [0u8; 4];
    random_bytes(&mut buf);
    u32::from_be_bytes(buf)
}

/// Generate a shift key in 1..=255, never the identity shift
pub fn random_caesar_key() -> u8 {
    ((random_u32() % 255) + 1) as u8
}

/// SHA-1 over the concatenation of `parts`
pub fn sha1(parts: &[&[u8]]) -> [u8; SHA1_LEN] {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    for part in parts {
        ctx.update(part);
    }
    let mut out = [0u8; SHA1_LEN];
    out.copy_from_slice(ctx.finish().as_ref());
    out
}
