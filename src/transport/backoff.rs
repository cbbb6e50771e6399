//! Bind retry with exponential backoff
//!
//! Closing a peer connection releases its UDP port asynchronously, so binding
//! the same port right afterwards can race the release.

use super::TransportError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// Default first retry delay
pub const INITIAL_REBIND_INTERVAL: Duration = Duration::from_millis(10);

/// Default total time spent sleeping between attempts
pub const MAX_REBIND_INTERVAL: Duration = Duration::from_millis(2000);

/// Doubling delay schedule with a bounded total budget
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    budget: Duration,
    spent: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, budget: Duration) -> Self {
        Self {
            next: initial,
            budget,
            spent: Duration::ZERO,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    /// The last delay is clipped so the total never exceeds the budget.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let remaining = self.budget.saturating_sub(self.spent);
        if remaining.is_zero() {
            return None;
        }
        let delay = self.next.min(remaining);
        self.spent += delay;
        self.next = self.next.saturating_mul(2);
        Some(delay)
    }

    pub fn spent(&self) -> Duration {
        self.spent
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_REBIND_INTERVAL, MAX_REBIND_INTERVAL)
    }
}

/// Bind a UDP socket, retrying on failure until the backoff budget runs out
pub async fn bind_with_backoff(
    addr: SocketAddr,
    mut backoff: Backoff,
    name: &str,
) -> Result<UdpSocket, TransportError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        debug!("{}: trying to bind {} (attempt {})", name, addr, attempts);
        match UdpSocket::bind(addr).await {
            Ok(socket) => return Ok(socket),
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    debug!("{}: bind {} failed ({}), retrying in {:?}", name, addr, e, delay);
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(TransportError::BindFailed {
                        endpoint: addr.to_string(),
                        attempts,
                        source: e,
                    })
                }
            },
        }
    }
}
