//! Packet transformers
//!
//! Every datagram that crosses the obfuscation pipe goes through exactly one
//! `Transformer`. A transformer may expand one plaintext packet into several
//! wire packets, and a wire packet may restore to zero or more plaintext
//! packets:
//!
//! ```text
//! transform(plaintext) -> [wire, ...]
//! restore(wire)        -> [plaintext, ...]   (possibly empty)
//! ```
//!
//! Available transformers:
//! - `none`: pass-through
//! - `caesar`: single-byte shift cipher
//! - `encryptionShaper`: AES-128-CBC with a length prefix and random padding
//! - `sequenceShaper`: decoy packet injection at fixed stream positions
//! - `decompressionShaper`: range coder run backwards to reshape byte entropy
//! - `fragmentationShaper`: MTU-capped fragmentation with reassembly
//! - `rc4`: RC4 keyed per packet from a random nonce
//! - `protean`: fragmentation, encryption, decompression and injection chained

mod arithmetic;
mod caesar;
mod decompression;
mod defragmenter;
mod encryption;
mod fragment;
mod fragmentation;
mod passthrough;
mod protean;
mod rc4;
mod sequence;

pub use arithmetic::{CodingTable, Decoder, Encoder};
pub use caesar::{CaesarCipher, CaesarConfig};
pub use decompression::{DecompressionConfig, DecompressionShaper};
pub use defragmenter::{Defragmenter, REASSEMBLY_TIMEOUT};
pub use encryption::{EncryptionConfig, EncryptionShaper};
pub use fragment::{Fragment, FRAGMENT_ID_SIZE, HEADER_SIZE};
pub use fragmentation::{FragmentationConfig, FragmentationShaper};
pub use passthrough::PassThrough;
pub use protean::{Protean, ProteanConfig};
pub use rc4::{Rc4Config, Rc4Transformer};
pub use sequence::{ByteSequenceShaper, SequenceConfig, SequenceModel};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// AES block size, also the granularity of fragment fill
pub const CHUNK_SIZE: usize = 16;

/// Length of the per-packet IV prepended by the encryption shaper
pub const IV_SIZE: usize = 16;

/// Names accepted by `TransformerConfig::from_parts`
pub const TRANSFORMER_NAMES: [&str; 8] = [
    "caesar",
    "decompressionShaper",
    "encryptionShaper",
    "fragmentationShaper",
    "none",
    "protean",
    "rc4",
    "sequenceShaper",
];

/// Transformer errors
#[derive(Debug, Error)]
pub enum ObfuscationError {
    #[error("Unknown transformer: {0}")]
    UnknownTransformer(String),

    #[error("Missing or invalid parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Transformer does not accept a raw key")]
    KeyNotSupported,

    #[error("Packet truncated: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Packet too large: {0} fragments")]
    PacketTooLarge(usize),

    #[error("Corrupt packet: {0}")]
    Corrupt(String),
}

/// A reversible datagram transform
pub trait Transformer: Send {
    /// Turn one plaintext packet into one or more wire packets
    fn transform(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError>;

    /// Turn one wire packet back into zero or more plaintext packets
    fn restore(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError>;

    /// Replace the key from raw bytes, for transformers that have one
    fn set_key(&mut self, _key: &[u8]) -> Result<(), ObfuscationError> {
        Err(ObfuscationError::KeyNotSupported)
    }
}

/// Typed transformer configuration.
///
/// On the wire this is `{"name": "<transformer>", "config": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "config")]
pub enum TransformerConfig {
    #[serde(rename = "none")]
    PassThrough,
    #[serde(rename = "caesar")]
    Caesar(CaesarConfig),
    #[serde(rename = "encryptionShaper")]
    Encryption(EncryptionConfig),
    #[serde(rename = "sequenceShaper")]
    Sequence(SequenceConfig),
    #[serde(rename = "decompressionShaper")]
    Decompression(DecompressionConfig),
    #[serde(rename = "fragmentationShaper")]
    Fragmentation(FragmentationConfig),
    #[serde(rename = "rc4")]
    Rc4(Rc4Config),
    #[serde(rename = "protean")]
    Protean(ProteanConfig),
}

impl TransformerConfig {
    /// Registry name of this transformer
    pub fn name(&self) -> &'static str {
        match self {
            TransformerConfig::PassThrough => "none",
            TransformerConfig::Caesar(_) => "caesar",
            TransformerConfig::Encryption(_) => "encryptionShaper",
            TransformerConfig::Sequence(_) => "sequenceShaper",
            TransformerConfig::Decompression(_) => "decompressionShaper",
            TransformerConfig::Fragmentation(_) => "fragmentationShaper",
            TransformerConfig::Rc4(_) => "rc4",
            TransformerConfig::Protean(_) => "protean",
        }
    }

    /// Non-random sample configuration for a transformer name
    pub fn sample(name: &str) -> Result<Self, ObfuscationError> {
        Ok(match name {
            "none" => TransformerConfig::PassThrough,
            "caesar" => TransformerConfig::Caesar(CaesarConfig::sample()),
            "encryptionShaper" => TransformerConfig::Encryption(EncryptionConfig::sample()),
            "sequenceShaper" => TransformerConfig::Sequence(SequenceConfig::sample()),
            "decompressionShaper" => {
                TransformerConfig::Decompression(DecompressionConfig::sample())
            }
            "fragmentationShaper" => {
                TransformerConfig::Fragmentation(FragmentationConfig::sample())
            }
            "rc4" => TransformerConfig::Rc4(Rc4Config::sample()),
            "protean" => TransformerConfig::Protean(ProteanConfig::sample()),
            other => return Err(ObfuscationError::UnknownTransformer(other.to_string())),
        })
    }

    /// Build from a registry name and an optional JSON config string.
    ///
    /// Without a config string the transformer's sample config is used.
    pub fn from_parts(name: &str, config: Option<&str>) -> Result<Self, ObfuscationError> {
        let sample = Self::sample(name)?;
        let Some(json) = config else {
            return Ok(sample);
        };
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| ObfuscationError::MissingParameter(e.to_string()))?;
        serde_json::from_value(serde_json::json!({ "name": name, "config": value }))
            .map_err(|e| ObfuscationError::MissingParameter(e.to_string()))
    }

    /// Construct the configured transformer
    pub fn build(&self) -> Result<Box<dyn Transformer>, ObfuscationError> {
        Ok(match self {
            TransformerConfig::PassThrough => Box::new(PassThrough),
            TransformerConfig::Caesar(c) => Box::new(CaesarCipher::new(c)),
            TransformerConfig::Encryption(c) => Box::new(EncryptionShaper::new(c)?),
            TransformerConfig::Sequence(c) => Box::new(ByteSequenceShaper::new(c)?),
            TransformerConfig::Decompression(c) => Box::new(DecompressionShaper::new(c)?),
            TransformerConfig::Fragmentation(c) => Box::new(FragmentationShaper::new(c)?),
            TransformerConfig::Rc4(c) => Box::new(Rc4Transformer::new(c)?),
            TransformerConfig::Protean(c) => Box::new(Protean::new(c)?),
        })
    }
}

impl Default for TransformerConfig {
    fn default() -> Self {
        TransformerConfig::PassThrough
    }
}

/// Run `f` over every packet and concatenate the results
pub(crate) fn flat_map<F>(packets: Vec<Bytes>, mut f: F) -> Result<Vec<Bytes>, ObfuscationError>
where
    F: FnMut(&[u8]) -> Result<Vec<Bytes>, ObfuscationError>,
{
    let mut out = Vec::with_capacity(packets.len());
    for packet in packets {
        out.extend(f(&packet)?);
    }
    Ok(out)
}

/// Decode a hex key of exactly `len` bytes
pub(crate) fn decode_key(hex_key: &str, len: usize) -> Result<Vec<u8>, ObfuscationError> {
    let key = hex::decode(hex_key).map_err(|e| ObfuscationError::InvalidKey(e.to_string()))?;
    if key.len() != len {
        return Err(ObfuscationError::InvalidKey(format!(
            "keys must be {} bytes in length, got {}",
            len,
            key.len()
        )));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(config: &TransformerConfig, packet: &[u8]) {
        let mut sender = config.build().unwrap();
        let mut receiver = config.build().unwrap();
        let wire = sender.transform(packet).unwrap();
        let mut restored = Vec::new();
        for w in &wire {
            restored.extend(receiver.restore(w).unwrap());
        }
        assert_eq!(restored, vec![Bytes::copy_from_slice(packet)], "{}", config.name());
    }

    #[test]
    fn test_every_sample_round_trips() {
        let packets: [&[u8]; 4] = [b"", b"x", &[0xAB; 100], &[7u8; 3000]];
        for name in TRANSFORMER_NAMES {
            let config = TransformerConfig::sample(name).unwrap();
            for packet in packets {
                round_trip(&config, packet);
            }
        }
    }

    #[test]
    fn test_unknown_transformer() {
        assert!(matches!(
            TransformerConfig::sample("rot13"),
            Err(ObfuscationError::UnknownTransformer(_))
        ));
        assert!(matches!(
            TransformerConfig::from_parts("rot13", Some("{}")),
            Err(ObfuscationError::UnknownTransformer(_))
        ));
    }

    #[test]
    fn test_from_parts() {
        let config = TransformerConfig::from_parts("caesar", Some(r#"{"key":9}"#)).unwrap();
        assert_eq!(config, TransformerConfig::Caesar(CaesarConfig { key: 9 }));

        let missing = TransformerConfig::from_parts("fragmentationShaper", Some("{}"));
        assert!(matches!(missing, Err(ObfuscationError::MissingParameter(_))));

        let sample = TransformerConfig::from_parts("none", None).unwrap();
        assert_eq!(sample, TransformerConfig::PassThrough);
    }

    #[test]
    fn test_wire_format() {
        let config = TransformerConfig::Caesar(CaesarConfig { key: 42 });
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"name":"caesar","config":{"key":42}}"#);

        let none: TransformerConfig = serde_json::from_str(r#"{"name":"none"}"#).unwrap();
        assert_eq!(none, TransformerConfig::PassThrough);
    }

    #[test]
    fn test_set_key_unsupported() {
        let mut t = TransformerConfig::PassThrough.build().unwrap();
        assert!(matches!(t.set_key(&[1]), Err(ObfuscationError::KeyNotSupported)));
    }
}
