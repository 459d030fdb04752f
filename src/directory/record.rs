//! Peer records and the transitions applied to them

use crate::identity::RandomnessSource;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Seconds in one backoff unit
pub const SECONDS_PER_BACKOFF: u64 = 10;

/// Exponent cap for the backoff window (2^10 units)
pub const MAX_BACKOFF_EXPONENT: u32 = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown peer type: {0}")]
pub struct UnknownPeerType(pub i32);

/// Role a peer plays for us; persisted as an integer column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum PeerType {
    Inbound = 0,
    Outbound = 1,
    Preferred = 2,
}

impl From<PeerType> for i32 {
    fn from(peer_type: PeerType) -> Self {
        peer_type as i32
    }
}

impl TryFrom<i32> for PeerType {
    type Error = UnknownPeerType;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PeerType::Inbound),
            1 => Ok(PeerType::Outbound),
            2 => Ok(PeerType::Preferred),
            other => Err(UnknownPeerType(other)),
        }
    }
}

/// Which peer types a query accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTypeFilter {
    InboundOnly,
    OutboundOnly,
    PreferredOnly,
    /// Outbound or preferred
    AnyOutbound,
}

impl PeerTypeFilter {
    pub fn accepts(self, peer_type: PeerType) -> bool {
        match self {
            PeerTypeFilter::InboundOnly => peer_type == PeerType::Inbound,
            PeerTypeFilter::OutboundOnly => peer_type == PeerType::Outbound,
            PeerTypeFilter::PreferredOnly => peer_type == PeerType::Preferred,
            PeerTypeFilter::AnyOutbound => peer_type != PeerType::Inbound,
        }
    }
}

/// Filter descriptor for directory queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerQuery {
    /// Require `next_attempt <= now`
    pub use_next_attempt: bool,
    /// `None` means unbounded
    pub max_num_failures: Option<u32>,
    pub type_filter: PeerTypeFilter,
}

/// Role change requested for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeUpdate {
    SetOutbound,
    SetPreferred,
    /// Preferred becomes outbound; anything else is untouched
    RemovePreferred,
    /// Inbound becomes outbound; never demotes preferred
    UpdateToOutbound,
}

/// Reconnection schedule change requested for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffUpdate {
    /// Zero failures, retry immediately
    HardReset,
    /// Zero failures, retry after the base window
    Reset,
    /// One more failure, retry after a wider window
    Increase,
}

/// Persisted reputation and schedule for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub next_attempt: DateTime<Utc>,
    pub num_failures: u32,
    pub peer_type: PeerType,
}

impl PeerRecord {
    pub fn new(next_attempt: DateTime<Utc>, num_failures: u32, peer_type: PeerType) -> Self {
        Self {
            next_attempt,
            num_failures,
            peer_type,
        }
    }

    /// Record for a peer we have never stored
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self::new(now, 0, PeerType::Inbound)
    }

    pub fn apply_type(&mut self, update: TypeUpdate) {
        match update {
            TypeUpdate::SetOutbound => self.peer_type = PeerType::Outbound,
            TypeUpdate::SetPreferred => self.peer_type = PeerType::Preferred,
            TypeUpdate::RemovePreferred => {
                if self.peer_type == PeerType::Preferred {
                    self.peer_type = PeerType::Outbound;
                }
            }
            TypeUpdate::UpdateToOutbound => {
                if self.peer_type == PeerType::Inbound {
                    self.peer_type = PeerType::Outbound;
                }
            }
        }
    }

    pub fn apply_backoff(
        &mut self,
        update: BackoffUpdate,
        now: DateTime<Utc>,
        rng: &RandomnessSource,
    ) {
        match update {
            BackoffUpdate::HardReset => {
                self.num_failures = 0;
                self.next_attempt = now;
            }
            BackoffUpdate::Reset | BackoffUpdate::Increase => {
                self.num_failures = if update == BackoffUpdate::Reset {
                    0
                } else {
                    self.num_failures.saturating_add(1)
                };
                self.next_attempt = now + compute_backoff(self.num_failures, rng);
            }
        }
    }
}

/// Random delay in `[1, 2^min(failures, 10) * 10]` seconds
pub fn compute_backoff(num_failures: u32, rng: &RandomnessSource) -> Duration {
    let exponent = num_failures.min(MAX_BACKOFF_EXPONENT);
    let window = (1u64 << exponent) * SECONDS_PER_BACKOFF;
    Duration::seconds(rng.uniform(1..=window) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_type_integer_mapping() {
        for peer_type in [PeerType::Inbound, PeerType::Outbound, PeerType::Preferred] {
            assert_eq!(PeerType::try_from(i32::from(peer_type)), Ok(peer_type));
        }
        assert_eq!(PeerType::try_from(7), Err(UnknownPeerType(7)));
        assert_eq!(serde_json::to_string(&PeerType::Preferred).unwrap(), "2");
    }

    #[test]
    fn test_type_transitions() {
        let now = Utc::now();
        let with = |peer_type, update| {
            let mut record = PeerRecord::new(now, 0, peer_type);
            record.apply_type(update);
            record.peer_type
        };

        use PeerType::*;
        use TypeUpdate::*;
        for from in [Inbound, Outbound, Preferred] {
            assert_eq!(with(from, SetOutbound), Outbound);
            assert_eq!(with(from, SetPreferred), Preferred);
        }
        assert_eq!(with(Inbound, RemovePreferred), Inbound);
        assert_eq!(with(Outbound, RemovePreferred), Outbound);
        assert_eq!(with(Preferred, RemovePreferred), Outbound);
        assert_eq!(with(Inbound, UpdateToOutbound), Outbound);
        assert_eq!(with(Outbound, UpdateToOutbound), Outbound);
        assert_eq!(with(Preferred, UpdateToOutbound), Preferred);
    }

    #[test]
    fn test_backoff_window() {
        let rng = RandomnessSource::seeded(5);
        for failures in 0..16u32 {
            let cap = (1i64 << failures.min(MAX_BACKOFF_EXPONENT)) * 10;
            for _ in 0..50 {
                let secs = compute_backoff(failures, &rng).num_seconds();
                assert!(secs >= 1 && secs <= cap, "{} failures -> {}s", failures, secs);
            }
        }
    }

    #[test]
    fn test_increase_then_reset() {
        let rng = RandomnessSource::seeded(9);
        let now = Utc::now();
        let mut record = PeerRecord::fresh(now);

        for k in 1..=5 {
            record.apply_backoff(BackoffUpdate::Increase, now, &rng);
            assert_eq!(record.num_failures, k);
            assert!(record.next_attempt > now);
        }

        record.apply_backoff(BackoffUpdate::Reset, now, &rng);
        assert_eq!(record.num_failures, 0);
        assert!(record.next_attempt > now);
        assert!(record.next_attempt <= now + Duration::seconds(10));

        record.apply_backoff(BackoffUpdate::HardReset, now, &rng);
        assert_eq!(record.num_failures, 0);
        assert_eq!(record.next_attempt, now);
    }
}
