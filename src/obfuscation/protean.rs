//! Composite shaper
//!
//! Outbound: fragmentation, encryption, decompression, injection.
//! Inbound runs the same stages in reverse.

use super::{
    flat_map, ByteSequenceShaper, DecompressionConfig, DecompressionShaper, EncryptionConfig,
    EncryptionShaper, FragmentationConfig, FragmentationShaper, ObfuscationError,
    SequenceConfig, Transformer,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProteanConfig {
    pub decompression: DecompressionConfig,
    pub encryption: EncryptionConfig,
    pub fragmentation: FragmentationConfig,
    pub injection: SequenceConfig,
}

impl ProteanConfig {
    pub fn sample() -> Self {
        Self {
            decompression: DecompressionConfig::sample(),
            encryption: EncryptionConfig::sample(),
            fragmentation: FragmentationConfig::sample(),
            injection: SequenceConfig::sample(),
        }
    }
}

pub struct Protean {
    fragmenter: FragmentationShaper,
    encrypter: EncryptionShaper,
    decompressor: DecompressionShaper,
    injecter: ByteSequenceShaper,
}

impl Protean {
    pub fn new(config: &ProteanConfig) -> Result<Self, ObfuscationError> {
        Ok(Self {
            fragmenter: FragmentationShaper::new(&config.fragmentation)?,
            encrypter: EncryptionShaper::new(&config.encryption)?,
            decompressor: DecompressionShaper::new(&config.decompression)?,
            injecter: ByteSequenceShaper::new(&config.injection)?,
        })
    }
}

impl Transformer for Protean {
    fn transform(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        let fragments = self.fragmenter.transform(packet)?;
        let encrypted = flat_map(fragments, |p| self.encrypter.transform(p))?;
        let shaped = flat_map(encrypted, |p| self.decompressor.transform(p))?;
        flat_map(shaped, |p| self.injecter.transform(p))
    }

    fn restore(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        let extracted = self.injecter.restore(packet)?;
        let unshaped = flat_map(extracted, |p| self.decompressor.restore(p))?;
        let decrypted = flat_map(unshaped, |p| self.encrypter.restore(p))?;
        flat_map(decrypted, |p| self.fragmenter.restore(p))
    }
}
