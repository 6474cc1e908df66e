//! Typed network events.
//!
//! Publishers never wait for subscribers. A single channel carries every
//! event so subscribers observe them in publication order.

use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Network-level events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A peer passed acceptance and joined the peer set.
    PeerAdded(SocketAddr),
    /// A peer left the peer set.
    PeerRemoved(SocketAddr),
    /// A peer should be disconnected.
    PeerDisconnect { addr: SocketAddr, reason: String },
    /// Our chain caught up with the network.
    ChainSynced { height: u32 },
    /// A round was applied to our state.
    RoundApplied { round: u32 },
}

/// Broadcast bus for [`NetworkEvent`].
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NetworkEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish without waiting. Events with no subscribers are dropped.
    pub fn publish(&self, event: NetworkEvent) {
        trace!(event = ?event, "Publishing network event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(NetworkEvent::RoundApplied { round: 4 });
        bus.publish(NetworkEvent::ChainSynced { height: 200 });

        assert_eq!(rx.recv().await.unwrap(), NetworkEvent::RoundApplied { round: 4 });
        assert_eq!(rx.recv().await.unwrap(), NetworkEvent::ChainSynced { height: 200 });
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(NetworkEvent::ChainSynced { height: 1 });
    }
}
