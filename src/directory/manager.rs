//! Peer directory
//!
//! Fail-safe access to the peer table: storage errors are logged and turned
//! into "absent" / no-op results so that directory trouble never takes the
//! node down.

use crate::directory::record::{BackoffUpdate, PeerQuery, PeerRecord, TypeUpdate};
use crate::directory::sampler::RandomPeerSampler;
use crate::directory::store::{MemoryPeerStore, PeerFilter, PeerStore};
use crate::identity::{PeerIdentity, RandomnessSource};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;

/// Rows fetched per random batch
pub const BATCH_SIZE: usize = 1000;

/// Failure cap for gossip fanout candidates
pub const MAX_FAILURES: u32 = 10;

/// Peers failing this often are pruned on start and never dialed
pub const REALLY_DEAD_NUM_FAILURES_CUTOFF: u32 = 120;

struct FanoutSamplers {
    outbound: RandomPeerSampler,
    inbound: RandomPeerSampler,
}

/// Cloneable handle to the peer table
#[derive(Clone)]
pub struct PeerDirectory {
    store: Arc<dyn PeerStore>,
    rng: RandomnessSource,
    fanout: Arc<Mutex<FanoutSamplers>>,
}

impl PeerDirectory {
    pub fn new(store: Arc<dyn PeerStore>, rng: RandomnessSource) -> Self {
        let fanout = FanoutSamplers {
            outbound: RandomPeerSampler::new(RandomPeerSampler::max_failures(MAX_FAILURES, true)),
            inbound: RandomPeerSampler::new(RandomPeerSampler::max_failures(MAX_FAILURES, false)),
        };
        Self {
            store,
            rng,
            fanout: Arc::new(Mutex::new(fanout)),
        }
    }

    /// Directory over a fresh in-memory table
    pub fn in_memory(rng: RandomnessSource) -> Self {
        Self::new(Arc::new(MemoryPeerStore::new()), rng)
    }

    pub fn rng(&self) -> &RandomnessSource {
        &self.rng
    }

    /// The stored record and `true`, or a fresh inbound record and `false`
    pub fn load(&self, peer: &PeerIdentity) -> (PeerRecord, bool) {
        match self.store.select(peer) {
            Ok(Some(record)) => (record, true),
            Ok(None) => (PeerRecord::fresh(Utc::now()), false),
            Err(e) => {
                log::error!("PeerDirectory::load error: {} on {}", e, peer);
                (PeerRecord::fresh(Utc::now()), false)
            }
        }
    }

    /// Insert when `existed` is false, update otherwise
    pub fn store(&self, peer: &PeerIdentity, record: &PeerRecord, existed: bool) {
        let result = if existed {
            self.store.update(peer, record)
        } else {
            self.store.insert(peer, record)
        };

        match result {
            Ok(1) => {}
            Ok(affected) => {
                log::error!(
                    "PeerDirectory::store affected {} rows for {} (expected 1)",
                    affected,
                    peer
                );
            }
            Err(e) => {
                log::error!("PeerDirectory::store error: {} on {}", e, peer);
            }
        }
    }

    pub fn ensure_exists(&self, peer: &PeerIdentity) {
        let (record, existed) = self.load(peer);
        if !existed {
            log::trace!("Learned peer {}", peer);
            self.store(peer, &record, false);
        }
    }

    pub fn update_type(&self, peer: &PeerIdentity, update: TypeUpdate) {
        let (mut record, existed) = self.load(peer);
        record.apply_type(update);
        self.store(peer, &record, existed);
    }

    pub fn update_backoff(&self, peer: &PeerIdentity, update: BackoffUpdate) {
        let (mut record, existed) = self.load(peer);
        record.apply_backoff(update, Utc::now(), &self.rng);
        self.store(peer, &record, existed);
    }

    /// Apply a type and a backoff transition with a single load/store
    pub fn update(&self, peer: &PeerIdentity, type_update: TypeUpdate, backoff: BackoffUpdate) {
        let (mut record, existed) = self.load(peer);
        record.apply_type(type_update);
        record.apply_backoff(backoff, Utc::now(), &self.rng);
        self.store(peer, &record, existed);
    }

    /// A shuffled batch of at least `size` matching peers (fewer if the table
    /// is smaller), starting from a random offset
    pub fn load_random_peers(&self, query: &PeerQuery, size: usize) -> Vec<PeerIdentity> {
        let size = size.max(BATCH_SIZE);
        let filter = PeerFilter::from_query(query, Utc::now());

        let count = match self.store.count(&filter) {
            Ok(count) => count,
            Err(e) => {
                log::error!("PeerDirectory::count_peers error: {}", e);
                return Vec::new();
            }
        };
        if count == 0 {
            return Vec::new();
        }

        let max_offset = count.saturating_sub(size);
        let offset = self.rng.uniform(0..=max_offset as u64) as usize;

        let mut peers = match self.store.select_page(&filter, size, offset) {
            Ok(peers) => peers,
            Err(e) => {
                log::error!("PeerDirectory::load_peers error: {}", e);
                return Vec::new();
            }
        };
        self.rng.shuffle(&mut peers);
        peers
    }

    /// Delete peers with at least `min_failures` failures, or just `peer` if given
    pub fn remove_peers_with_many_failures(&self, min_failures: u32, peer: Option<&PeerIdentity>) {
        match self.store.delete_failing(min_failures, peer) {
            Ok(0) => {}
            Ok(removed) => log::debug!("Removed {} peers with {}+ failures", removed, min_failures),
            Err(e) => log::error!("PeerDirectory::remove_peers_with_many_failures error: {}", e),
        }
    }

    /// Up to `size` peers to gossip to `exclude`, outbound/preferred first
    pub fn get_peers_to_send(&self, size: usize, exclude: &PeerIdentity) -> Vec<PeerIdentity> {
        let keep = |p: &PeerIdentity| p != exclude;
        let mut fanout = self.fanout.lock();

        let mut peers = fanout.outbound.get_random_peers(self, size, keep);
        if peers.len() < size {
            let inbound = fanout
                .inbound
                .get_random_peers(self, size - peers.len(), keep);
            peers.extend(inbound);
        }
        peers
    }

    /// Every row, ordered by identity
    pub fn all_peers(&self) -> Vec<(PeerIdentity, PeerRecord)> {
        self.store.select_all().unwrap_or_else(|e| {
            log::error!("PeerDirectory::all_peers error: {}", e);
            Vec::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::record::{PeerType, PeerTypeFilter};
    use crate::directory::store::{JsonPeerStore, StoreConfig};
    use chrono::Duration;
    use std::collections::{BTreeMap, BTreeSet};

    fn peer(s: &str) -> PeerIdentity {
        PeerIdentity::parse(s).unwrap()
    }

    fn directory() -> PeerDirectory {
        PeerDirectory::in_memory(RandomnessSource::seeded(17))
    }

    #[test]
    fn test_directory_roundtrip() {
        for peer_type in [PeerType::Inbound, PeerType::Outbound, PeerType::Preferred] {
            let dir = directory();
            let id = peer("00000256");

            let (mut record, existed) = dir.load(&id);
            assert!(!existed);
            assert_eq!(record.peer_type, PeerType::Inbound);

            record.peer_type = peer_type;
            dir.store(&id, &record, false);
            assert_eq!(dir.load(&id), (record, true));
        }
    }

    #[test]
    fn test_ensure_exists_is_idempotent() {
        let dir = directory();
        let id = peer("00000007");
        dir.update(&id, TypeUpdate::SetPreferred, BackoffUpdate::Increase);
        let before = dir.load(&id);

        dir.ensure_exists(&id);
        assert_eq!(dir.load(&id), before);
        assert_eq!(dir.all_peers().len(), 1);
    }

    #[test]
    fn test_update_backoff_increase() {
        let dir = directory();
        let id = peer("00000001");
        let start = Utc::now();
        for k in 1..=4 {
            dir.update_backoff(&id, BackoffUpdate::Increase);
            let (record, existed) = dir.load(&id);
            assert!(existed);
            assert_eq!(record.num_failures, k);
            assert!(record.next_attempt >= start);
        }

        dir.update_backoff(&id, BackoffUpdate::HardReset);
        assert_eq!(dir.load(&id).0.num_failures, 0);
    }

    #[test]
    fn test_update_type_promotes() {
        let dir = directory();
        let id = peer("00000001");
        dir.ensure_exists(&id);
        dir.update_type(&id, TypeUpdate::UpdateToOutbound);
        assert_eq!(dir.load(&id).0.peer_type, PeerType::Outbound);
        dir.update_type(&id, TypeUpdate::SetPreferred);
        dir.update_type(&id, TypeUpdate::UpdateToOutbound);
        assert_eq!(dir.load(&id).0.peer_type, PeerType::Preferred);
        dir.update_type(&id, TypeUpdate::RemovePreferred);
        assert_eq!(dir.load(&id).0.peer_type, PeerType::Outbound);
    }

    #[test]
    fn test_load_random_peers_empty() {
        let dir = directory();
        let query = RandomPeerSampler::max_failures(10, true);
        assert!(dir.load_random_peers(&query, 10).is_empty());
    }

    #[test]
    fn test_load_random_peers_matches_query() {
        let dir = directory();
        let now = Utc::now();
        let past = now - Duration::seconds(60);
        let future = now + Duration::hours(1);

        let mut id = peer("00000000");
        let mut records = BTreeMap::new();
        for time in [past, now, future] {
            for failures in [0, 1] {
                for peer_type in [PeerType::Inbound, PeerType::Outbound, PeerType::Preferred] {
                    let record = PeerRecord::new(time, failures, peer_type);
                    dir.store(&id, &record, false);
                    records.insert(id, record);
                    id = id.increment();
                }
            }
        }

        let check_time = Utc::now();
        let valid = |query: &PeerQuery, record: &PeerRecord| {
            if query.use_next_attempt && record.next_attempt > check_time {
                return false;
            }
            if let Some(max) = query.max_num_failures {
                if record.num_failures > max {
                    return false;
                }
            }
            query.type_filter.accepts(record.peer_type)
        };

        for use_next_attempt in [false, true] {
            for max_num_failures in [None, Some(0)] {
                for type_filter in [
                    PeerTypeFilter::InboundOnly,
                    PeerTypeFilter::OutboundOnly,
                    PeerTypeFilter::PreferredOnly,
                    PeerTypeFilter::AnyOutbound,
                ] {
                    let query = PeerQuery {
                        use_next_attempt,
                        max_num_failures,
                        type_filter,
                    };
                    let found: BTreeSet<_> =
                        dir.load_random_peers(&query, 1000).into_iter().collect();
                    for (id, record) in &records {
                        assert_eq!(found.contains(id), valid(&query, record), "{:?} {}", query, id);
                    }
                }
            }
        }
    }

    /// Creates peers numbered upwards from `00000001`
    fn create_peers(
        dir: &PeerDirectory,
        normal_inbound: usize,
        failed_inbound: usize,
        normal_outbound: usize,
        failed_outbound: usize,
    ) {
        let mut id = peer("00000001");
        let mut next = || {
            let current = id;
            id = id.increment();
            current
        };
        let failed = |peer_type| PeerRecord::new(Utc::now(), 11, peer_type);

        for _ in 0..normal_inbound {
            dir.ensure_exists(&next());
        }
        for _ in 0..failed_inbound {
            dir.store(&next(), &failed(PeerType::Inbound), false);
        }
        for _ in 0..normal_outbound {
            dir.update_type(&next(), TypeUpdate::SetOutbound);
        }
        for _ in 0..failed_outbound {
            dir.store(&next(), &failed(PeerType::Outbound), false);
        }
    }

    fn peers_to_send(counts: (usize, usize, usize, usize), sizes: &[(usize, usize)]) {
        let dir = directory();
        create_peers(&dir, counts.0, counts.1, counts.2, counts.3);
        let me = peer("00000000");
        for &(requested, expected) in sizes {
            let peers = dir.get_peers_to_send(requested, &me);
            assert_eq!(peers.len(), expected, "{:?} requested {}", counts, requested);
            let unique: BTreeSet<_> = peers.iter().collect();
            assert_eq!(unique.len(), peers.len());
        }
    }

    #[test]
    fn test_get_peers_to_send_empty() {
        peers_to_send((0, 0, 0, 0), &[(0, 0), (10, 0), (50, 0)]);
    }

    #[test]
    fn test_get_peers_to_send_fewer_than_requested() {
        peers_to_send((8, 0, 0, 0), &[(10, 8), (50, 8)]);
        peers_to_send((0, 0, 8, 0), &[(10, 8), (50, 8)]);
        peers_to_send((4, 0, 4, 0), &[(10, 8), (50, 8)]);
    }

    #[test]
    fn test_get_peers_to_send_exactly_requested() {
        peers_to_send((8, 0, 0, 0), &[(8, 8)]);
        peers_to_send((0, 0, 8, 0), &[(8, 8)]);
        peers_to_send((4, 0, 4, 0), &[(8, 8)]);
    }

    #[test]
    fn test_get_peers_to_send_more_than_requested() {
        peers_to_send((50, 0, 0, 0), &[(30, 30)]);
        peers_to_send((0, 0, 50, 0), &[(30, 30)]);
        peers_to_send((25, 0, 25, 0), &[(30, 30)]);
    }

    #[test]
    fn test_get_peers_to_send_skips_failed() {
        peers_to_send((25, 25, 0, 0), &[(30, 25)]);
        peers_to_send((0, 0, 25, 25), &[(30, 25)]);
        peers_to_send((13, 12, 13, 12), &[(30, 26)]);
    }

    #[test]
    fn test_get_peers_to_send_excludes_target() {
        let dir = directory();
        create_peers(&dir, 8, 0, 0, 0);
        let target = peer("00000003");
        let peers = dir.get_peers_to_send(10, &target);
        assert_eq!(peers.len(), 7);
        assert!(!peers.contains(&target));
    }

    fn type_of(dir: &PeerDirectory, p: &PeerIdentity) -> PeerType {
        dir.load(p).0.peer_type
    }

    #[test]
    fn test_get_peers_to_send_prefers_outbound() {
        let dir = directory();
        create_peers(&dir, 20, 0, 5, 0);
        let peers = dir.get_peers_to_send(10, &peer("00000000"));
        assert_eq!(peers.len(), 10);

        let outbound: BTreeSet<_> = peers[..5].iter().copied().collect();
        let expected: BTreeSet<_> = (21..=25).map(|n| peer(&format!("{:08}", n))).collect();
        assert_eq!(outbound, expected);
        assert!(peers[5..]
            .iter()
            .all(|p| type_of(&dir, p) == PeerType::Inbound));

        // enough outbound peers leaves no room for inbound ones
        let dir = directory();
        create_peers(&dir, 20, 0, 15, 0);
        let peers = dir.get_peers_to_send(10, &peer("00000000"));
        assert_eq!(peers.len(), 10);
        assert!(peers.iter().all(|p| type_of(&dir, p) == PeerType::Outbound));
    }

    #[test]
    fn test_get_peers_to_send_counts_preferred_as_outbound() {
        let dir = directory();
        create_peers(&dir, 20, 0, 4, 0);
        for n in 90..93 {
            dir.update_type(&peer(&format!("{:08}", n)), TypeUpdate::SetPreferred);
        }

        let peers = dir.get_peers_to_send(10, &peer("00000000"));
        assert_eq!(peers.len(), 10);
        let head: Vec<_> = peers[..7].iter().map(|p| type_of(&dir, p)).collect();
        assert_eq!(head.iter().filter(|t| **t == PeerType::Preferred).count(), 3);
        assert_eq!(head.iter().filter(|t| **t == PeerType::Outbound).count(), 4);
        assert!(peers[7..]
            .iter()
            .all(|p| type_of(&dir, p) == PeerType::Inbound));
    }

    #[test]
    fn test_purge_peer_table() {
        let dir = directory();
        for (name, failures) in [
            ("00000001", 1),
            ("00000002", 2),
            ("00000003", 3),
            ("00000004", 4),
            ("00000005", 5),
        ] {
            dir.store(
                &peer(name),
                &PeerRecord::new(Utc::now(), failures, PeerType::Inbound),
                false,
            );
        }

        dir.remove_peers_with_many_failures(3, None);
        assert!(dir.load(&peer("00000001")).1);
        assert!(dir.load(&peer("00000002")).1);
        assert!(!dir.load(&peer("00000003")).1);
        assert!(!dir.load(&peer("00000004")).1);
        assert!(!dir.load(&peer("00000005")).1);

        let second = peer("00000002");
        dir.remove_peers_with_many_failures(3, Some(&second));
        assert!(dir.load(&second).1);

        dir.remove_peers_with_many_failures(2, Some(&second));
        assert!(!dir.load(&second).1);
    }

    #[test]
    fn test_duplicate_store_is_logged_not_fatal() {
        let dir = directory();
        let id = peer("00000001");
        let record = PeerRecord::new(Utc::now(), 3, PeerType::Outbound);
        dir.store(&id, &record, false);
        dir.store(&id, &PeerRecord::fresh(Utc::now()), false);
        assert_eq!(dir.load(&id), (record, true));
    }

    #[test]
    fn test_update_of_vanished_row_is_not_fatal() {
        let dir = directory();
        let id = peer("00000001");
        dir.store(&id, &PeerRecord::fresh(Utc::now()), true);
        assert!(!dir.load(&id).1);
    }

    #[test]
    fn test_json_backed_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let id = peer("ABCDEFGH");
        {
            let store = Arc::new(JsonPeerStore::open(config.clone()).unwrap());
            let dir = PeerDirectory::new(store, RandomnessSource::seeded(4));
            dir.update(&id, TypeUpdate::SetPreferred, BackoffUpdate::Increase);
        }

        let store = Arc::new(JsonPeerStore::open(config).unwrap());
        let dir = PeerDirectory::new(store, RandomnessSource::seeded(4));
        let (record, existed) = dir.load(&id);
        assert!(existed);
        assert_eq!(record.peer_type, PeerType::Preferred);
        assert_eq!(record.num_failures, 1);
    }
}
