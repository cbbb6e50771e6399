//! Connection lifecycle
//!
//! State only moves forward: `New -> Connecting -> Connected -> Closed`,
//! and `Closed` is terminal. Whether the connection ever reached `Connected`
//! is remembered, so `once_connected` resolves the same way no matter when
//! it is awaited.

use super::PeerError;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: ConnectionState,
    was_connected: bool,
}

/// Write side, owned by the connection
#[derive(Debug)]
pub struct StateSender {
    tx: watch::Sender<Status>,
}

impl StateSender {
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_if_modified(|status| {
            if state <= status.state {
                return false;
            }
            status.state = state;
            if state == ConnectionState::Connected {
                status.was_connected = true;
            }
            true
        });
    }

    pub fn get(&self) -> ConnectionState {
        self.tx.borrow().state
    }
}

/// Read side, cloned freely
#[derive(Debug, Clone)]
pub struct StateWatch {
    rx: watch::Receiver<Status>,
}

impl StateWatch {
    pub fn channel() -> (StateSender, StateWatch) {
        let (tx, rx) = watch::channel(Status {
            state: ConnectionState::New,
            was_connected: false,
        });
        (StateSender { tx }, StateWatch { rx })
    }

    pub fn current(&self) -> ConnectionState {
        self.rx.borrow().state
    }

    /// Resolves once connected; fails if the connection closes first
    pub async fn once_connected(&self) -> Result<(), PeerError> {
        let mut rx = self.rx.clone();
        loop {
            let status = *rx.borrow_and_update();
            if status.was_connected {
                return Ok(());
            }
            if status.state == ConnectionState::Closed {
                return Err(PeerError::ClosedBeforeConnected);
            }
            if rx.changed().await.is_err() {
                // writer gone without ever connecting
                return Err(PeerError::ClosedBeforeConnected);
            }
        }
    }

    pub async fn once_closed(&self) {
        let mut rx = self.rx.clone();
        loop {
            if rx.borrow_and_update().state == ConnectionState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
