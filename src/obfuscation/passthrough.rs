//! Identity transformer

use super::{ObfuscationError, Transformer};
use bytes::Bytes;

/// Sends packets unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl Transformer for PassThrough {
    fn transform(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        Ok(vec![Bytes::copy_from_slice(packet)])
    }

    fn restore(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, ObfuscationError> {
        Ok(vec![Bytes::copy_from_slice(packet)])
    }
}
