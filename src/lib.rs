//! Peer Overlay: a peer-to-peer overlay on top of a shared message broker
//!
//! This crate provides:
//! - Fixed-width app and peer identities
//! - A persistent peer directory with exponential backoff and random sampling
//! - Connections with a two-message handshake, per-connection sequencing and
//!   two-phase shutdown
//! - An overlay manager that accepts, dials and gossips peers on a single
//!   processing loop
//!
//! # Example
//!
//! ```rust
//! use peer_overlay::broker::LocalBroker;
//! use peer_overlay::directory::PeerDirectory;
//! use peer_overlay::identity::{PeerIdentity, RandomnessSource};
//! use peer_overlay::overlay::{OverlayConfig, OverlayManager};
//! use std::sync::Arc;
//!
//! let broker = Arc::new(LocalBroker::new());
//! let config = |name: &str| OverlayConfig {
//!     peer_identity: PeerIdentity::parse(name).unwrap(),
//!     idle_timeout: None,
//!     ..Default::default()
//! };
//!
//! let directory = PeerDirectory::in_memory(RandomnessSource::seeded(1));
//! let (mut alice, _) = OverlayManager::new(config("AAAAAAAA"), broker.clone(), directory);
//! let directory = PeerDirectory::in_memory(RandomnessSource::seeded(2));
//! let (mut bob, mut inbox) = OverlayManager::new(config("BBBBBBBB"), broker.clone(), directory);
//! alice.start();
//! bob.start();
//!
//! // Handshake
//! alice.connect_to(bob.local_peer()).unwrap();
//! while alice.run_until_idle() + bob.run_until_idle() > 0 {}
//!
//! alice.send_to(&bob.local_peer(), b"hello".to_vec()).unwrap();
//! while alice.run_until_idle() + bob.run_until_idle() > 0 {}
//! assert_eq!(inbox.try_recv().unwrap().data, b"hello".to_vec());
//! ```

pub mod broker;
pub mod cli;
pub mod directory;
pub mod identity;
pub mod overlay;

// Re-export commonly used types
pub use broker::{LocalBroker, MessageBroker, Subscription};
pub use directory::{JsonPeerStore, MemoryPeerStore, PeerDirectory, PeerStore, RandomPeerSampler};
pub use identity::{AppIdentity, FullIdentity, PeerIdentity, RandomnessSource};
pub use overlay::{InboundMessage, OverlayConfig, OverlayError, OverlayHandle, OverlayManager};
