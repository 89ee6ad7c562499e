//! Observer fan-out with tombstoned slots.

use std::time::Duration;

use tracing::{debug, warn};

use crate::daemon::transport::Observer;

/// Lists shorter than this are never compacted.
const COMPACT_MIN_LEN: usize = 16;

/// Observers attached to one session, owned by its fan-out loop.
///
/// A failed observer leaves an empty slot behind instead of shifting the
/// rest, and the list is compacted once dead slots outnumber live ones.
#[derive(Default)]
pub struct ObserverSet {
    slots: Vec<Option<Observer>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, observer: Observer) {
        debug!("Attached observer {}", observer.peer());
        self.slots.push(Some(observer));
    }

    /// Number of live observers.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Number of slots including tombstones.
    #[cfg(test)]
    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    /// Deliver `data` to every live observer in attach order.
    ///
    /// Observers that fail or miss `deadline` are closed and their slot is
    /// emptied; the rest still receive the block. Returns how many were dropped.
    pub async fn broadcast(&mut self, data: &[u8], deadline: Duration) -> usize {
        let mut dropped = 0;

        for slot in self.slots.iter_mut() {
            let Some(observer) = slot else {
                continue;
            };
            if let Err(e) = observer.send(data, deadline).await {
                warn!("Dropping observer {}: {}", observer.peer(), e);
                if let Some(observer) = slot.take() {
                    observer.close().await;
                }
                dropped += 1;
            }
        }

        if dropped > 0 {
            self.compact();
        }
        dropped
    }

    fn compact(&mut self) {
        let live = self.live();
        let dead = self.slots.len() - live;
        if self.slots.len() > COMPACT_MIN_LEN && dead > live {
            self.slots.retain(Option::is_some);
            debug!("Compacted observer list to {} slots", self.slots.len());
        }
    }

    /// Close every live observer. Returns how many were closed.
    pub async fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for observer in self.slots.drain(..).flatten() {
            observer.close().await;
            closed += 1;
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::transport::mock::{pair, MockPeer, Sent};

    const DEADLINE: Duration = Duration::from_millis(200);

    fn observer(name: &str) -> (Observer, MockPeer) {
        let (transport, peer) = pair(name);
        (transport.into_observer(), peer)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_in_order() {
        let mut set = ObserverSet::new();
        let (a, mut peer_a) = observer("a");
        let (b, mut peer_b) = observer("b");
        set.attach(a);
        set.attach(b);

        set.broadcast(b"one", DEADLINE).await;
        set.broadcast(b"two", DEADLINE).await;

        let expected = vec![Sent::Data(b"one".to_vec()), Sent::Data(b"two".to_vec())];
        assert_eq!(peer_a.drain(), expected);
        assert_eq!(peer_b.drain(), expected);
    }

    #[tokio::test]
    async fn test_failed_observer_is_tombstoned_and_closed() {
        let mut set = ObserverSet::new();
        let (a, mut peer_a) = observer("a");
        let (b, peer_b) = observer("b");
        let (c, mut peer_c) = observer("c");
        set.attach(a);
        set.attach(b);
        set.attach(c);

        peer_b.break_writes();
        assert_eq!(set.broadcast(b"x", DEADLINE).await, 1);
        assert_eq!(set.broadcast(b"y", DEADLINE).await, 0);

        assert_eq!(set.live(), 2);
        assert_eq!(set.slots(), 3);
        assert_eq!(peer_a.drain().len(), 2);
        assert_eq!(peer_c.drain().len(), 2);
    }

    #[tokio::test]
    async fn test_stalled_observer_does_not_block_others() {
        let mut set = ObserverSet::new();
        let (slow, slow_peer) = observer("slow");
        let (fast, mut fast_peer) = observer("fast");
        set.attach(slow);
        set.attach(fast);
        slow_peer.stall_writes();

        assert_eq!(set.broadcast(b"x", Duration::from_millis(50)).await, 1);
        assert_eq!(fast_peer.drain(), vec![Sent::Data(b"x".to_vec())]);
        assert_eq!(set.live(), 1);
    }

    #[tokio::test]
    async fn test_compaction_when_mostly_dead() {
        let mut set = ObserverSet::new();
        let mut peers = Vec::new();
        for i in 0..20 {
            let (o, p) = observer(&format!("o{i}"));
            set.attach(o);
            peers.push(p);
        }
        for peer in peers.iter().take(15) {
            peer.break_writes();
        }

        assert_eq!(set.broadcast(b"x", DEADLINE).await, 15);
        assert_eq!(set.live(), 5);
        assert_eq!(set.slots(), 5);
    }

    #[tokio::test]
    async fn test_close_all() {
        let mut set = ObserverSet::new();
        let (a, mut peer_a) = observer("a");
        set.attach(a);

        assert_eq!(set.close_all().await, 1);
        assert_eq!(set.slots(), 0);
        assert_eq!(peer_a.drain(), vec![Sent::Shutdown]);
    }
}
