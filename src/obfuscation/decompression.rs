//! Entropy reshaping by running a range coder backwards
//!
//! `transform` feeds the packet to the decoder, which expands it into bytes
//! distributed according to the configured frequencies. `restore` encodes
//! them back.
//!
//! Decoder input layout: `header (1B) | length (2B) | packet | terminator (6B)`.
//! Re-encoding reproduces the input up to the coder's final range, which
//! always falls inside the terminator.

use super::arithmetic::{CodingTable, Decoder, Encoder, HEADER_BYTE};
use super::{ObfuscationError, Transformer};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

const LENGTH_SIZE: usize = 2;

/// Non-zero marker then a zero run wider than the coder's 32-bit window
const TERMINATOR: [u8; 6] = [0x80, 0, 0, 0, 0, 0];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompressionConfig {
    /// Target byte frequencies, one per byte value
    pub frequencies: Vec<u32>,
}

impl DecompressionConfig {
    pub fn sample() -> Self {
        Self {
            frequencies: vec![1; 256],
        }
    }
}

pub struct DecompressionShaper {
    encoder: Encoder,
    decoder: Decoder,
}

impl DecompressionShaper {
    pub fn new(config: &DecompressionConfig) -> Result<Self, ObfuscationError> {
        let table = CodingTable::new(&config.frequencies)?;
        Ok(Self {
            encoder: Encoder::new(table.clone()),
            decoder: Decoder::new(table),
        })
    }
}

impl Transformer for DecompressionShaper {
    fn transform(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        let length = u16::try_from(packet.len()).map_err(|_| {
            ObfuscationError::MissingParameter(format!(
                "packet of {} bytes exceeds the length field",
                packet.len()
            ))
        })?;
        let mut framed =
            BytesMut::with_capacity(1 + LENGTH_SIZE + packet.len() + TERMINATOR.len());
        framed.put_u8(HEADER_BYTE);
        framed.put_u16(length);
        framed.put_slice(packet);
        framed.put_slice(&TERMINATOR);

        let shaped = self.decoder.decode(&framed)?;
        Ok(vec![Bytes::from(shaped)])
    }

    fn restore(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        let encoded = self.encoder.encode(packet);
        let mut body = encoded.get(1..).unwrap_or_default();
        if body.len() < LENGTH_SIZE {
            return Err(ObfuscationError::Truncated {
                expected: 1 + LENGTH_SIZE,
                actual: encoded.len(),
            });
        }
        let length = body.get_u16() as usize;
        if body.len() < length {
            return Err(ObfuscationError::Truncated {
                expected: length,
                actual: body.len(),
            });
        }
        Ok(vec![Bytes::copy_from_slice(&body[..length])])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_lengths() {
        let mut shaper = DecompressionShaper::new(&DecompressionConfig::sample()).unwrap();
        for len in [0usize, 1, 5, 100, 1400] {
            let packet: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
            let shaped = shaper.transform(&packet).unwrap();
            assert_eq!(shaped.len(), 1);
            let restored = shaper.restore(&shaped[0]).unwrap();
            assert_eq!(restored, vec![Bytes::from(packet)], "length {}", len);
        }
    }

    #[test]
    fn test_round_trip_skewed_frequencies() {
        let mut frequencies = vec![1; 256];
        frequencies[0] = 200;
        frequencies[65] = 50;
        let mut shaper = DecompressionShaper::new(&DecompressionConfig { frequencies }).unwrap();
        for len in [0usize, 1, 5, 100, 1400] {
            let packet: Vec<u8> = (0..len).map(|i| (i * 131 % 256) as u8).collect();
            let shaped = shaper.transform(&packet).unwrap();
            let restored = shaper.restore(&shaped[0]).unwrap();
            assert_eq!(restored, vec![Bytes::from(packet)], "length {}", len);
        }
    }

    #[test]
    fn test_skewed_output_favours_frequent_bytes() {
        let mut frequencies = vec![1; 256];
        frequencies[0x41] = 255;
        let mut shaper = DecompressionShaper::new(&DecompressionConfig { frequencies }).unwrap();
        let packet: Vec<u8> = (0..1000).map(|i| (i * 7 % 256) as u8).collect();
        let shaped = shaper.transform(&packet).unwrap();
        let hits = shaped[0].iter().filter(|&&b| b == 0x41).count();
        assert!(hits * 4 > shaped[0].len(), "{} of {}", hits, shaped[0].len());
        assert_eq!(shaper.restore(&shaped[0]).unwrap(), vec![Bytes::from(packet)]);
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut shaper = DecompressionShaper::new(&DecompressionConfig::sample()).unwrap();
        assert!(shaper.transform(&vec![0u8; 70_000]).is_err());
    }

    #[test]
    fn test_frequencies_must_cover_every_byte() {
        let config = DecompressionConfig {
            frequencies: vec![1; 255],
        };
        assert!(DecompressionShaper::new(&config).is_err());
    }

    #[test]
    fn test_config_json_shape() {
        let config: DecompressionConfig =
            serde_json::from_str(&format!("{{\"frequencies\":{:?}}}", vec![3u32; 256])).unwrap();
        assert_eq!(config.frequencies.len(), 256);
    }
}
