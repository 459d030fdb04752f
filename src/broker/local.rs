use crate::broker::{FrameHandler, MessageBroker, SubscriptionId};
use crate::identity::PeerIdentity;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-process broker with synchronous delivery.
///
/// Handlers run on the publisher's thread in subscription order. With
/// `with_duplicates` every frame is delivered twice.
pub struct LocalBroker {
    rooms: DashMap<String, Vec<(SubscriptionId, FrameHandler)>>,
    next_id: AtomicU64,
    duplicate_delivery: bool,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            next_id: AtomicU64::new(1),
            duplicate_delivery: false,
        }
    }

    /// Broker that re-delivers every frame once
    pub fn with_duplicates() -> Self {
        Self {
            duplicate_delivery: true,
            ..Self::new()
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.rooms.get(channel).map_or(0, |room| room.len())
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBroker for LocalBroker {
    fn subscribe(&self, channel: &str, handler: FrameHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.rooms
            .entry(channel.to_string())
            .or_default()
            .push((id, handler));
        log::trace!("{} joined channel {}", id, channel);
        id
    }

    fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        let removed = match self.rooms.get_mut(channel) {
            Some(mut room) => {
                let before = room.len();
                room.retain(|(sub, _)| *sub != id);
                room.len() != before
            }
            None => false,
        };
        self.rooms.remove_if(channel, |_, room| room.is_empty());
        removed
    }

    fn publish(&self, channel: &str, target: &PeerIdentity, payload: &[u8]) {
        // Snapshot so handlers may (un)subscribe without holding the shard lock
        let handlers: Vec<FrameHandler> = match self.rooms.get(channel) {
            Some(room) => room.iter().map(|(_, h)| h.clone()).collect(),
            None => {
                log::trace!("No subscribers on {} for frame to {}", channel, target);
                return;
            }
        };

        let rounds = if self.duplicate_delivery { 2 } else { 1 };
        for _ in 0..rounds {
            for handler in &handlers {
                handler(payload);
            }
        }
    }
}
