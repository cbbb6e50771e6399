//! RC4 with a fresh key per packet
//!
//! ```text
//! +-------------+-------------------------------+
//! | Nonce (8B)  |  RC4(SHA1(key | nonce)[..8])  |
//! +-------------+-------------------------------+
//! ```

use super::{decode_key, ObfuscationError, Transformer};
use crate::crypto::{random_bytes, sha1};
use bytes::{BufMut, Bytes, BytesMut};
use rc4::consts::U8;
use rc4::{KeyInit, Rc4, StreamCipher};
use serde::{Deserialize, Serialize};

pub const KEY_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rc4Config {
    /// Hex-encoded 16-byte key
    pub key: String,
}

impl Rc4Config {
    pub fn sample() -> Self {
        Self {
            key: hex::encode([0u8; KEY_SIZE]),
        }
    }
}

pub struct Rc4Transformer {
    key: Vec<u8>,
}

impl Rc4Transformer {
    pub fn new(config: &Rc4Config) -> Result<Self, ObfuscationError> {
        Ok(Self {
            key: decode_key(&config.key, KEY_SIZE)?,
        })
    }

    fn cipher(&self, nonce: &[u8]) -> Result<Rc4<U8>, ObfuscationError> {
        let digest = sha1(&[&self.key, nonce]);
        Rc4::<U8>::new_from_slice(&digest[..NONCE_SIZE])
            .map_err(|e| ObfuscationError::InvalidKey(e.to_string()))
    }
}

impl Transformer for Rc4Transformer {
    fn transform(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        let mut nonce = [0u8; NONCE_SIZE];
        random_bytes(&mut nonce);

        let mut body = packet.to_vec();
        self.cipher(&nonce)?.apply_keystream(&mut body);

        let mut out = BytesMut::with_capacity(NONCE_SIZE + body.len());
        out.put_slice(&nonce);
        out.put_slice(&body);
        Ok(vec![out.freeze()])
    }

    fn restore(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        if packet.len() < NONCE_SIZE {
            return Err(ObfuscationError::Truncated {
                expected: NONCE_SIZE,
                actual: packet.len(),
            });
        }
        let (nonce, body) = packet.split_at(NONCE_SIZE);
        let mut body = body.to_vec();
        self.cipher(nonce)?.apply_keystream(&mut body);
        Ok(vec![Bytes::from(body)])
    }

    fn set_key(&mut self, key: &[u8]) -> Result<(), ObfuscationError> {
        if key.len() != KEY_SIZE {
            return Err(ObfuscationError::InvalidKey(format!(
                "keys must be {} bytes in length, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        self.key = key.to_vec();
        Ok(())
    }
}
