//! Fragment reassembly
//!
//! Fragments are grouped by id. A packet is complete once every index in
//! `0..count` has arrived; incomplete packets are dropped once they are older
//! than `REASSEMBLY_TIMEOUT`. Expiry is checked lazily on every call.

use super::{Fragment, FRAGMENT_ID_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(60);

struct PendingPacket {
    slots: Vec<Option<Bytes>>,
    remaining: usize,
    first_seen: Instant,
}

impl PendingPacket {
    fn assemble(self) -> Bytes {
        let total = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for slot in self.slots.into_iter().flatten() {
            buf.put_slice(&slot);
        }
        buf.freeze()
    }
}

#[derive(Default)]
pub struct Defragmenter {
    pending: HashMap<[u8; FRAGMENT_ID_SIZE], PendingPacket>,
    complete: VecDeque<Bytes>,
}

impl Defragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fragment(&mut self, fragment: Fragment) {
        self.add_fragment_at(fragment, Instant::now());
    }

    pub fn add_fragment_at(&mut self, fragment: Fragment, now: Instant) {
        self.reap(now);

        let count = fragment.count as usize;
        let index = fragment.index as usize;
        if count == 0 || index >= count {
            warn!(
                "defragmenter: dropping fragment with index {} of {}",
                fragment.index, fragment.count
            );
            return;
        }

        let entry = self
            .pending
            .entry(fragment.id)
            .or_insert_with(|| PendingPacket {
                slots: vec![None; count],
                remaining: count,
                first_seen: now,
            });

        if entry.slots.len() != count {
            warn!(
                "defragmenter: fragment count {} disagrees with {} seen earlier",
                count,
                entry.slots.len()
            );
            return;
        }
        if entry.slots[index].is_some() {
            warn!("defragmenter: duplicate fragment {} of {}", index, count);
            return;
        }

        entry.slots[index] = Some(fragment.payload);
        entry.remaining -= 1;

        if entry.remaining == 0 {
            if let Some(done) = self.pending.remove(&fragment.id) {
                self.complete.push_back(done.assemble());
            }
        }
    }

    pub fn complete_count(&self) -> usize {
        self.complete.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pop the oldest reassembled packet
    pub fn get_complete(&mut self) -> Option<Bytes> {
        self.get_complete_at(Instant::now())
    }

    pub fn get_complete_at(&mut self, now: Instant) -> Option<Bytes> {
        self.reap(now);
        self.complete.pop_front()
    }

    fn reap(&mut self, now: Instant) {
        let before = self.pending.len();
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.first_seen) < REASSEMBLY_TIMEOUT);
        let expired = before - self.pending.len();
        if expired > 0 {
            debug!("defragmenter: expired {} incomplete packets", expired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(id: u8, index: u8, count: u8, payload: &'static [u8]) -> Fragment {
        Fragment {
            id: [id; FRAGMENT_ID_SIZE],
            index,
            count,
            payload: Bytes::from_static(payload),
            padding: Bytes::new(),
        }
    }

    #[test]
    fn test_single_fragment_completes() {
        let mut d = Defragmenter::new();
        d.add_fragment(frag(1, 0, 1, b"whole"));
        assert_eq!(d.complete_count(), 1);
        assert_eq!(d.get_complete().unwrap(), Bytes::from_static(b"whole"));
        assert!(d.get_complete().is_none());
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut d = Defragmenter::new();
        d.add_fragment(frag(2, 2, 3, b"c"));
        d.add_fragment(frag(2, 0, 3, b"a"));
        assert_eq!(d.complete_count(), 0);
        assert_eq!(d.pending_count(), 1);
        d.add_fragment(frag(2, 1, 3, b"b"));
        assert_eq!(d.pending_count(), 0);
        assert_eq!(d.get_complete().unwrap(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_interleaved_packets() {
        let mut d = Defragmenter::new();
        d.add_fragment(frag(1, 0, 2, b"1a"));
        d.add_fragment(frag(2, 0, 2, b"2a"));
        d.add_fragment(frag(2, 1, 2, b"2b"));
        d.add_fragment(frag(1, 1, 2, b"1b"));
        assert_eq!(d.get_complete().unwrap(), Bytes::from_static(b"2a2b"));
        assert_eq!(d.get_complete().unwrap(), Bytes::from_static(b"1a1b"));
    }

    #[test]
    fn test_duplicate_dropped() {
        let mut d = Defragmenter::new();
        d.add_fragment(frag(3, 0, 2, b"x"));
        d.add_fragment(frag(3, 0, 2, b"y"));
        d.add_fragment(frag(3, 1, 2, b"z"));
        assert_eq!(d.get_complete().unwrap(), Bytes::from_static(b"xz"));
    }

    #[test]
    fn test_invalid_fragments_dropped() {
        let mut d = Defragmenter::new();
        d.add_fragment(frag(4, 2, 2, b"x"));
        d.add_fragment(frag(4, 0, 0, b"x"));
        assert_eq!(d.pending_count(), 0);

        d.add_fragment(frag(5, 0, 2, b"x"));
        d.add_fragment(frag(5, 1, 3, b"y"));
        assert_eq!(d.pending_count(), 1);
        assert_eq!(d.complete_count(), 0);
    }

    #[test]
    fn test_expiry() {
        let mut d = Defragmenter::new();
        let start = Instant::now();
        d.add_fragment_at(frag(6, 0, 2, b"old"), start);

        let later = start + REASSEMBLY_TIMEOUT + Duration::from_secs(1);
        d.add_fragment_at(frag(6, 1, 2, b"new"), later);
        // the first half expired, so the second starts a fresh packet
        assert_eq!(d.complete_count(), 0);
        assert_eq!(d.pending_count(), 1);

        assert!(d.get_complete_at(later + REASSEMBLY_TIMEOUT).is_none());
        assert_eq!(d.pending_count(), 0);
    }
}
