//! Byte-sequence injection shaper
//!
//! Injects decoy packets at configured positions of the outgoing packet
//! stream. Each decoy carries a known byte sequence at a known offset,
//! surrounded by random filler, so that simple length or content classifiers
//! see the shape they expect. The receiving side drops packets matching its
//! removal patterns.

use super::{ObfuscationError, Transformer};
use crate::crypto::random_vec;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// One decoy pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceModel {
    /// Position in the output stream at which the decoy is emitted
    pub index: u64,
    /// Number of random bytes before the sequence
    pub offset: usize,
    /// Hex-encoded byte sequence
    pub sequence: String,
    /// Total decoy length
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceConfig {
    pub add_sequences: Vec<SequenceModel>,
    pub remove_sequences: Vec<SequenceModel>,
}

impl SequenceConfig {
    pub fn sample() -> Self {
        let model = SequenceModel {
            index: 0,
            offset: 0,
            sequence: hex::encode("OH HELLO"),
            length: 256,
        };
        Self {
            add_sequences: vec![model.clone()],
            remove_sequences: vec![model],
        }
    }
}

#[derive(Debug, Clone)]
struct Pattern {
    index: u64,
    offset: usize,
    sequence: Vec<u8>,
    length: usize,
}

impl Pattern {
    fn decode(model: &SequenceModel) -> Result<Self, ObfuscationError> {
        let sequence = hex::decode(&model.sequence)
            .map_err(|e| ObfuscationError::MissingParameter(format!("sequence: {}", e)))?;
        Ok(Self {
            index: model.index,
            offset: model.offset,
            sequence,
            length: model.length,
        })
    }

    fn make_packet(&self) -> Bytes {
        let tail = self
            .length
            .saturating_sub(self.offset + self.sequence.len());
        let mut packet = BytesMut::with_capacity(self.offset + self.sequence.len() + tail);
        packet.put_slice(&random_vec(self.offset));
        packet.put_slice(&self.sequence);
        packet.put_slice(&random_vec(tail));
        packet.freeze()
    }

    fn matches(&self, packet: &[u8]) -> bool {
        packet
            .get(self.offset..self.offset + self.sequence.len())
            .map_or(false, |window| window == self.sequence.as_slice())
    }
}

pub struct ByteSequenceShaper {
    add: Vec<Pattern>,
    remove: Vec<Pattern>,
    first_index: Option<u64>,
    last_index: Option<u64>,
    output_index: u64,
}

impl ByteSequenceShaper {
    pub fn new(config: &SequenceConfig) -> Result<Self, ObfuscationError> {
        let add = config
            .add_sequences
            .iter()
            .map(Pattern::decode)
            .collect::<Result<Vec<_>, _>>()?;
        let remove = config
            .remove_sequences
            .iter()
            .map(Pattern::decode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            first_index: add.first().map(|p| p.index),
            last_index: add.last().map(|p| p.index),
            add,
            remove,
            output_index: 0,
        })
    }

    fn emit(&mut self, out: &mut Vec<Bytes>, packet: Bytes) {
        out.push(packet);
        self.output_index += 1;
    }

    /// Emit every decoy scheduled at the current position, advancing as we go
    fn inject(&mut self, out: &mut Vec<Bytes>) {
        loop {
            let decoy = match self.add.iter().find(|p| p.index == self.output_index) {
                Some(pattern) => pattern.make_packet(),
                None => break,
            };
            self.emit(out, decoy);
        }
    }
}

impl Transformer for ByteSequenceShaper {
    fn transform(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        let (Some(first), Some(last)) = (self.first_index, self.last_index) else {
            return Ok(vec![Bytes::copy_from_slice(packet)]);
        };
        if self.output_index > last {
            return Ok(vec![Bytes::copy_from_slice(packet)]);
        }

        let mut out = Vec::new();
        if self.output_index >= first {
            self.inject(&mut out);
            self.emit(&mut out, Bytes::copy_from_slice(packet));
            self.inject(&mut out);
        } else {
            self.emit(&mut out, Bytes::copy_from_slice(packet));
        }
        Ok(out)
    }

    /// Drops a packet matching a removal pattern; each pattern fires once
    fn restore(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        match self.remove.iter().position(|p| p.matches(packet)) {
            Some(i) => {
                self.remove.remove(i);
                Ok(Vec::new())
            }
            None => Ok(vec![Bytes::copy_from_slice(packet)]),
        }
    }
}
