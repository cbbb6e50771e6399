//! AES-128-CBC encryption shaper
//!
//! Wire format:
//! ```text
//! +------------------+-------------------------------------------+
//! |  IV (16B)        |  CBC( length u16 BE | payload | padding ) |
//! +------------------+-------------------------------------------+
//! ```
//!
//! Padding is random and fills the plaintext to a whole number of blocks.
//! The length prefix is what lets `restore` tell padding from payload.

use super::{decode_key, ObfuscationError, Transformer, CHUNK_SIZE, IV_SIZE};
use crate::crypto::{random_bytes, random_vec};
use aes::Aes128;
use bytes::{BufMut, Bytes, BytesMut};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::{Deserialize, Serialize};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES-128 key length in bytes
pub const KEY_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Hex-encoded 16-byte key
    pub key: String,
}

impl EncryptionConfig {
    pub fn sample() -> Self {
        Self {
            key: hex::encode([0u8; KEY_SIZE]),
        }
    }
}

pub struct EncryptionShaper {
    key: [u8; KEY_SIZE],
}

impl EncryptionShaper {
    pub fn new(config: &EncryptionConfig) -> Result<Self, ObfuscationError> {
        let mut shaper = Self { key: [0u8; KEY_SIZE] };
        shaper.set_key(&decode_key(&config.key, KEY_SIZE)?)?;
        Ok(shaper)
    }

    fn encrypt(&self, iv: &[u8; IV_SIZE], packet: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        let len = u16::try_from(packet.len())
            .map_err(|_| ObfuscationError::Corrupt(format!("{} byte packet", packet.len())))?;

        let remainder = (2 + packet.len()) % CHUNK_SIZE;
        let padding = if remainder == 0 { 0 } else { CHUNK_SIZE - remainder };

        let mut plaintext = BytesMut::with_capacity(2 + packet.len() + padding);
        plaintext.put_u16(len);
        plaintext.put_slice(packet);
        plaintext.put_slice(&random_vec(padding));

        let cipher = Aes128CbcEnc::new_from_slices(&self.key, iv)
            .map_err(|e| ObfuscationError::InvalidKey(e.to_string()))?;
        Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(&plaintext))
    }

    fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        if ciphertext.len() < CHUNK_SIZE || ciphertext.len() % CHUNK_SIZE != 0 {
            return Err(ObfuscationError::Corrupt(format!(
                "ciphertext of {} bytes is not whole blocks",
                ciphertext.len()
            )));
        }
        let cipher = Aes128CbcDec::new_from_slices(&self.key, iv)
            .map_err(|e| ObfuscationError::InvalidKey(e.to_string()))?;
        let plaintext = cipher
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|e| ObfuscationError::Corrupt(e.to_string()))?;

        let length = u16::from_be_bytes([plaintext[0], plaintext[1]]) as usize;
        let rest = &plaintext[2..];
        Ok(rest[..length.min(rest.len())].to_vec())
    }
}

impl Transformer for EncryptionShaper {
    fn transform(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        let mut iv = [0u8; IV_SIZE];
        random_bytes(&mut iv);
        let ciphertext = self.encrypt(&iv, packet)?;

        let mut wire = BytesMut::with_capacity(IV_SIZE + ciphertext.len());
        wire.put_slice(&iv);
        wire.put_slice(&ciphertext);
        Ok(vec![wire.freeze()])
    }

    fn restore(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        if packet.len() < IV_SIZE {
            return Err(ObfuscationError::Truncated {
                expected: IV_SIZE,
                actual: packet.len(),
            });
        }
        let (iv, ciphertext) = packet.split_at(IV_SIZE);
        Ok(vec![Bytes::from(self.decrypt(iv, ciphertext)?)])
    }

    fn set_key(&mut self, key: &[u8]) -> Result<(), ObfuscationError> {
        self.key = key.try_into().map_err(|_| {
            ObfuscationError::InvalidKey(format!("keys must be {} bytes in length", KEY_SIZE))
        })?;
        Ok(())
    }
}
