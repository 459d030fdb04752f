//! Predicate-filtered random peer selection over the directory

use crate::directory::manager::{PeerDirectory, REALLY_DEAD_NUM_FAILURES_CUTOFF};
use crate::directory::record::{PeerQuery, PeerType, PeerTypeFilter};
use crate::identity::PeerIdentity;

/// A fixed query plus a cache of identities fetched for it but not yet handed out
#[derive(Debug, Clone)]
pub struct RandomPeerSampler {
    query: PeerQuery,
    cache: Vec<PeerIdentity>,
}

impl RandomPeerSampler {
    pub fn new(query: PeerQuery) -> Self {
        Self {
            query,
            cache: Vec::new(),
        }
    }

    /// Peers with at most `max_failures` failures, outbound/preferred or inbound only
    pub fn max_failures(max_failures: u32, outbound: bool) -> PeerQuery {
        PeerQuery {
            use_next_attempt: false,
            max_num_failures: Some(max_failures),
            type_filter: if outbound {
                PeerTypeFilter::AnyOutbound
            } else {
                PeerTypeFilter::InboundOnly
            },
        }
    }

    /// Peers due for a reconnection attempt, excluding the ones considered dead
    pub fn next_attempt_cutoff(peer_type: PeerType) -> PeerQuery {
        PeerQuery {
            use_next_attempt: true,
            max_num_failures: Some(REALLY_DEAD_NUM_FAILURES_CUTOFF),
            type_filter: if peer_type == PeerType::Preferred {
                PeerTypeFilter::PreferredOnly
            } else {
                PeerTypeFilter::AnyOutbound
            },
        }
    }

    pub fn query(&self) -> &PeerQuery {
        &self.query
    }

    /// Up to `size` cached identities accepted by `pred`.
    ///
    /// The cache is refilled from the directory when it holds fewer than `size`
    /// entries. Every entry inspected is consumed, accepted or not.
    pub fn get_random_peers<F>(
        &mut self,
        directory: &PeerDirectory,
        size: usize,
        mut pred: F,
    ) -> Vec<PeerIdentity>
    where
        F: FnMut(&PeerIdentity) -> bool,
    {
        if size == 0 {
            return Vec::new();
        }

        if self.cache.len() < size {
            self.cache = directory.load_random_peers(&self.query, size);
        }

        let mut result = Vec::with_capacity(size.min(self.cache.len()));
        let mut consumed = 0;
        for peer in &self.cache {
            consumed += 1;
            if pred(peer) {
                result.push(*peer);
                if result.len() == size {
                    break;
                }
            }
        }
        self.cache.drain(..consumed);

        result
    }
}
