//! Peer directory
//!
//! Persistent record of every peer ever seen, its reconnection schedule and
//! randomized sampling for gossip fanout and outbound dialing.

pub mod manager;
pub mod record;
pub mod sampler;
pub mod store;

pub use manager::{PeerDirectory, BATCH_SIZE, MAX_FAILURES, REALLY_DEAD_NUM_FAILURES_CUTOFF};
pub use record::{
    compute_backoff, BackoffUpdate, PeerQuery, PeerRecord, PeerType, PeerTypeFilter, TypeUpdate,
    UnknownPeerType,
};
pub use sampler::RandomPeerSampler;
pub use store::{
    Condition, JsonPeerStore, MemoryPeerStore, PeerFilter, PeerStore, StorageError,
    StorageResult, StoreConfig,
};
