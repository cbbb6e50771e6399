//! MTU-capped fragmentation
//!
//! Each packet is cut into fragments small enough that, once the encryption
//! shaper has added its IV and block padding, every wire packet still fits
//! in `max_length`. Fragments carry random fill so their sizes land on
//! cipher block boundaries.

use super::{
    Defragmenter, Fragment, ObfuscationError, Transformer, CHUNK_SIZE, FRAGMENT_ID_SIZE,
    HEADER_SIZE, IV_SIZE,
};
use crate::crypto::{random_bytes, random_vec};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Per-fragment overhead including the worst-case block fill
const OVERHEAD: usize = HEADER_SIZE + IV_SIZE + CHUNK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentationConfig {
    pub max_length: usize,
}

impl FragmentationConfig {
    pub fn sample() -> Self {
        Self { max_length: 1440 }
    }
}

pub struct FragmentationShaper {
    max_payload: usize,
    defragmenter: Defragmenter,
}

impl FragmentationShaper {
    pub fn new(config: &FragmentationConfig) -> Result<Self, ObfuscationError> {
        if config.max_length <= OVERHEAD {
            return Err(ObfuscationError::MissingParameter(format!(
                "maxLength must exceed {}, got {}",
                OVERHEAD, config.max_length
            )));
        }
        Ok(Self {
            max_payload: config.max_length - OVERHEAD,
            defragmenter: Defragmenter::new(),
        })
    }

    fn fill_for(payload_len: usize) -> usize {
        CHUNK_SIZE - (payload_len + HEADER_SIZE + IV_SIZE) % CHUNK_SIZE
    }
}

impl Transformer for FragmentationShaper {
    fn transform(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        let chunks: Vec<&[u8]> = if packet.is_empty() {
            vec![packet]
        } else {
            packet.chunks(self.max_payload).collect()
        };
        let count = u8::try_from(chunks.len())
            .map_err(|_| ObfuscationError::PacketTooLarge(chunks.len()))?;

        let mut id = [0u8; FRAGMENT_ID_SIZE];
        random_bytes(&mut id);

        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                Fragment {
                    id,
                    index: index as u8,
                    count,
                    payload: Bytes::copy_from_slice(chunk),
                    padding: Bytes::from(random_vec(Self::fill_for(chunk.len()))),
                }
                .encode()
            })
            .collect())
    }

    fn restore(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        self.defragmenter.add_fragment(Fragment::decode(packet)?);
        Ok(std::iter::from_fn(|| self.defragmenter.get_complete()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_packet_single_fragment() {
        let mut shaper = FragmentationShaper::new(&FragmentationConfig::sample()).unwrap();
        let out = shaper.transform(b"hello").unwrap();
        assert_eq!(out.len(), 1);
        // payload plus header lands on a block boundary once the IV is added
        assert_eq!((out[0].len() + IV_SIZE) % CHUNK_SIZE, 0);
        assert_eq!(shaper.restore(&out[0]).unwrap(), vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn test_large_packet_fragments_fit() {
        let config = FragmentationConfig { max_length: 200 };
        let mut sender = FragmentationShaper::new(&config).unwrap();
        let mut receiver = FragmentationShaper::new(&config).unwrap();

        let packet: Vec<u8> = (0..1000).map(|i| i as u8).collect();
        let out = sender.transform(&packet).unwrap();
        assert_eq!(out.len(), 1000usize.div_ceil(200 - OVERHEAD));

        let first = Fragment::decode(&out[0]).unwrap();
        for (i, wire) in out.iter().enumerate() {
            assert!(wire.len() + IV_SIZE <= config.max_length);
            let f = Fragment::decode(wire).unwrap();
            assert_eq!(f.id, first.id);
            assert_eq!(f.index as usize, i);
            assert_eq!(f.count as usize, out.len());
        }

        let mut restored = Vec::new();
        for wire in out.iter().rev() {
            restored.extend(receiver.restore(wire).unwrap());
        }
        assert_eq!(restored, vec![Bytes::from(packet)]);
    }

    #[test]
    fn test_too_many_fragments() {
        let mut shaper = FragmentationShaper::new(&FragmentationConfig { max_length: 69 }).unwrap();
        assert!(matches!(
            shaper.transform(&[0u8; 256]),
            Err(ObfuscationError::PacketTooLarge(256))
        ));
    }

    #[test]
    fn test_max_length_validated() {
        assert!(FragmentationShaper::new(&FragmentationConfig { max_length: OVERHEAD }).is_err());
    }

    #[test]
    fn test_restore_garbage() {
        let mut shaper = FragmentationShaper::new(&FragmentationConfig::sample()).unwrap();
        assert!(shaper.restore(b"short").is_err());
    }
}
