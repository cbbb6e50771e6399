//! Fragment wire format
//!
//! ```text
//! +--------+----------+-------+-------+---------+---------+
//! | Length |    Id    | Index | Count | Payload | Padding |
//! |  (2B)  |  (32B)   | (1B)  | (1B)  | (Len B) |  (rest) |
//! +--------+----------+-------+-------+---------+---------+
//! ```
//!
//! `Length` is the payload length, big-endian. Everything after the payload
//! is padding and is ignored on decode.

use super::ObfuscationError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the random id shared by all fragments of one packet
pub const FRAGMENT_ID_SIZE: usize = 32;

/// Length + id + index + count
pub const HEADER_SIZE: usize = 2 + FRAGMENT_ID_SIZE + 1 + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub id: [u8; FRAGMENT_ID_SIZE],
    pub index: u8,
    pub count: u8,
    pub payload: Bytes,
    pub padding: Bytes,
}

impl Fragment {
    /// Encoded size
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + self.padding.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.id);
        buf.put_u8(self.index);
        buf.put_u8(self.count);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ObfuscationError> {
        if data.len() < HEADER_SIZE {
            return Err(ObfuscationError::Truncated {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let length = buf.get_u16() as usize;
        let mut id = [0u8; FRAGMENT_ID_SIZE];
        buf.copy_to_slice(&mut id);
        let index = buf.get_u8();
        let count = buf.get_u8();

        if buf.len() < length {
            return Err(ObfuscationError::Truncated {
                expected: HEADER_SIZE + length,
                actual: data.len(),
            });
        }

        Ok(Self {
            id,
            index,
            count,
            payload: Bytes::copy_from_slice(&buf[..length]),
            padding: Bytes::copy_from_slice(&buf[length..]),
        })
    }
}
