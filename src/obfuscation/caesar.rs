//! Single-byte shift cipher
//!
//! Deliberately weak: it only breaks naive payload signature matching.

use super::{ObfuscationError, Transformer};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaesarConfig {
    pub key: u8,
}

impl CaesarConfig {
    pub fn sample() -> Self {
        Self { key: 1 }
    }

    /// A fresh key in 1..=255
    pub fn random() -> Self {
        Self {
            key: crate::crypto::random_caesar_key(),
        }
    }
}

/// Adds `key` to every byte, modulo 256
#[derive(Debug, Clone)]
pub struct CaesarCipher {
    key: u8,
}

impl CaesarCipher {
    pub fn new(config: &CaesarConfig) -> Self {
        Self { key: config.key }
    }

    pub fn transform_byte(&self, b: u8) -> u8 {
        b.wrapping_add(self.key)
    }

    pub fn restore_byte(&self, b: u8) -> u8 {
        b.wrapping_sub(self.key)
    }
}

impl Transformer for CaesarCipher {
    fn transform(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        let out: Vec<u8> = packet.iter().map(|&b| self.transform_byte(b)).collect();
        Ok(vec![Bytes::from(out)])
    }

    fn restore(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        let out: Vec<u8> = packet.iter().map(|&b| self.restore_byte(b)).collect();
        Ok(vec![Bytes::from(out)])
    }

    /// The key is the first byte of `key`
    fn set_key(&mut self, key: &[u8]) -> Result<(), ObfuscationError> {
        self.key = *key
            .first()
            .ok_or_else(|| ObfuscationError::InvalidKey("empty key".to_string()))?;
        Ok(())
    }
}
