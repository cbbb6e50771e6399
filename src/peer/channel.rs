//! Data channels
//!
//! A channel is a labelled message stream over its peer connection. Sends
//! go to the connection task; received messages arrive on a per-channel
//! queue that ends when the connection closes.

use super::PeerError;
use bytes::Bytes;
use tokio::sync::mpsc;

pub struct DataChannel {
    label: String,
    outbound: mpsc::UnboundedSender<(String, Bytes)>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
}

impl DataChannel {
    pub fn new(
        label: impl Into<String>,
        outbound: mpsc::UnboundedSender<(String, Bytes)>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            label: label.into(),
            outbound,
            inbound,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), PeerError> {
        self.outbound
            .send((self.label.clone(), data.into()))
            .map_err(|_| PeerError::Closed)
    }

    /// Next message from the peer, or `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.label)
            .finish()
    }
}
