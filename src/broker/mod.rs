//! Pub/sub message broker interface
//!
//! The overlay never touches a transport directly: frames are published to a
//! named channel and every current subscriber of that channel receives them.
//! Delivery is at-least-once and ordered per sender.

pub mod local;

pub use local::LocalBroker;

use crate::identity::PeerIdentity;
use std::fmt;
use std::sync::Arc;

/// Handle identifying one registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Callback invoked for every frame published on a channel.
///
/// Runs on the broker's delivery context; it must not touch overlay state and
/// should only hand the frame over to the processing loop.
pub type FrameHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

pub trait MessageBroker: Send + Sync {
    fn subscribe(&self, channel: &str, handler: FrameHandler) -> SubscriptionId;

    /// Returns `false` if the handler was not registered
    fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool;

    /// Publish `payload` on `channel`, addressed to `target`
    fn publish(&self, channel: &str, target: &PeerIdentity, payload: &[u8]);
}

/// Scoped registration; dropping it unsubscribes the handler
pub struct Subscription {
    broker: Arc<dyn MessageBroker>,
    channel: String,
    id: SubscriptionId,
}

impl Subscription {
    pub fn new(broker: Arc<dyn MessageBroker>, channel: &str, handler: FrameHandler) -> Self {
        let id = broker.subscribe(channel, handler);
        Self {
            broker,
            channel: channel.to_string(),
            id,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.broker.unsubscribe(&self.channel, self.id) {
            log::warn!("{} was already gone from channel {}", self.id, self.channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let broker = Arc::new(LocalBroker::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let target = PeerIdentity::parse("AAAAAAAA").unwrap();

        let counter = hits.clone();
        let handler: FrameHandler = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let subscription = Subscription::new(broker.clone(), "room", handler);
        assert_eq!(subscription.channel(), "room");
        assert_eq!(broker.subscriber_count("room"), 1);

        broker.publish("room", &target, b"one");
        drop(subscription);
        broker.publish("room", &target, b"two");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(broker.subscriber_count("room"), 0);
    }
}
