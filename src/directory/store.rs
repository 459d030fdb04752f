//! Peer table storage
//!
//! The directory talks to its backing table through [`PeerStore`], a small
//! row-oriented interface (select / insert / update / count / page / delete).
//! Two implementations are provided: an in-memory table and the same table
//! persisted to a JSON file after every mutation.

use crate::directory::record::{PeerQuery, PeerRecord, PeerType};
use crate::identity::PeerIdentity;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Duplicate key: {0}")]
    DuplicateKey(PeerIdentity),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

// =============================================================================
// Filters
// =============================================================================

/// One predicate of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    NextAttemptAtOrBefore(DateTime<Utc>),
    MaxFailures(u32),
    TypeIs(PeerType),
    TypeIsNot(PeerType),
}

impl Condition {
    fn matches(&self, record: &PeerRecord) -> bool {
        match *self {
            Condition::NextAttemptAtOrBefore(cutoff) => record.next_attempt <= cutoff,
            Condition::MaxFailures(max) => record.num_failures <= max,
            Condition::TypeIs(peer_type) => record.peer_type == peer_type,
            Condition::TypeIsNot(peer_type) => record.peer_type != peer_type,
        }
    }
}

/// Conjunction of conditions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerFilter {
    conditions: Vec<Condition>,
}

impl PeerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition joined with AND
    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Translate a query into its predicates, evaluated against `now`
    pub fn from_query(query: &PeerQuery, now: DateTime<Utc>) -> Self {
        use crate::directory::record::PeerTypeFilter::*;

        let mut filter = Self::new();
        if query.use_next_attempt {
            filter = filter.and(Condition::NextAttemptAtOrBefore(now));
        }
        if let Some(max) = query.max_num_failures {
            filter = filter.and(Condition::MaxFailures(max));
        }
        let type_condition = match query.type_filter {
            InboundOnly => Condition::TypeIs(PeerType::Inbound),
            OutboundOnly => Condition::TypeIs(PeerType::Outbound),
            PreferredOnly => Condition::TypeIs(PeerType::Preferred),
            AnyOutbound => Condition::TypeIsNot(PeerType::Inbound),
        };
        filter.and(type_condition)
    }

    pub fn matches(&self, record: &PeerRecord) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

// =============================================================================
// Store interface
// =============================================================================

/// Row-level access to the peer table.
///
/// Methods take `&self`; implementations resolve concurrent writers with
/// last-write-wins per row.
pub trait PeerStore: Send + Sync {
    fn select(&self, peer: &PeerIdentity) -> StorageResult<Option<PeerRecord>>;

    /// Insert a new row; fails with `DuplicateKey` if the key exists
    fn insert(&self, peer: &PeerIdentity, record: &PeerRecord) -> StorageResult<usize>;

    /// Update an existing row; returns the number of affected rows
    fn update(&self, peer: &PeerIdentity, record: &PeerRecord) -> StorageResult<usize>;

    fn count(&self, filter: &PeerFilter) -> StorageResult<usize>;

    /// Matching identities in key order, `limit` rows from `offset`
    fn select_page(
        &self,
        filter: &PeerFilter,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<PeerIdentity>>;

    /// Delete rows with at least `min_failures` failures, optionally only `peer`
    fn delete_failing(
        &self,
        min_failures: u32,
        peer: Option<&PeerIdentity>,
    ) -> StorageResult<usize>;

    fn select_all(&self) -> StorageResult<Vec<(PeerIdentity, PeerRecord)>>;
}

// =============================================================================
// In-memory table
// =============================================================================

type Table = BTreeMap<PeerIdentity, PeerRecord>;

/// Ordered in-memory peer table
#[derive(Debug, Default)]
pub struct MemoryPeerStore {
    rows: RwLock<Table>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_rows(rows: Table) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

fn insert_row(rows: &mut Table, peer: &PeerIdentity, record: &PeerRecord) -> StorageResult<usize> {
    if rows.contains_key(peer) {
        return Err(StorageError::DuplicateKey(*peer));
    }
    rows.insert(*peer, *record);
    Ok(1)
}

fn update_row(rows: &mut Table, peer: &PeerIdentity, record: &PeerRecord) -> usize {
    match rows.get_mut(peer) {
        Some(row) => {
            *row = *record;
            1
        }
        None => 0,
    }
}

fn delete_rows(rows: &mut Table, min_failures: u32, peer: Option<&PeerIdentity>) -> usize {
    let before = rows.len();
    rows.retain(|name, record| {
        let targeted = peer.map_or(true, |p| p == name);
        !(targeted && record.num_failures >= min_failures)
    });
    before - rows.len()
}

impl PeerStore for MemoryPeerStore {
    fn select(&self, peer: &PeerIdentity) -> StorageResult<Option<PeerRecord>> {
        Ok(self.rows.read().get(peer).copied())
    }

    fn insert(&self, peer: &PeerIdentity, record: &PeerRecord) -> StorageResult<usize> {
        insert_row(&mut self.rows.write(), peer, record)
    }

    fn update(&self, peer: &PeerIdentity, record: &PeerRecord) -> StorageResult<usize> {
        Ok(update_row(&mut self.rows.write(), peer, record))
    }

    fn count(&self, filter: &PeerFilter) -> StorageResult<usize> {
        Ok(self.rows.read().values().filter(|r| filter.matches(r)).count())
    }

    fn select_page(
        &self,
        filter: &PeerFilter,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<PeerIdentity>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|(_, r)| filter.matches(r))
            .skip(offset)
            .take(limit)
            .map(|(name, _)| *name)
            .collect())
    }

    fn delete_failing(
        &self,
        min_failures: u32,
        peer: Option<&PeerIdentity>,
    ) -> StorageResult<usize> {
        Ok(delete_rows(&mut self.rows.write(), min_failures, peer))
    }

    fn select_all(&self) -> StorageResult<Vec<(PeerIdentity, PeerRecord)>> {
        Ok(self.rows.read().iter().map(|(k, v)| (*k, *v)).collect())
    }
}

// =============================================================================
// JSON-file table
// =============================================================================

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub table_file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".overlay_data"),
            table_file: "peers.json".to_string(),
        }
    }
}

/// On-disk row; field names are the table's column names
#[derive(Debug, Serialize, Deserialize)]
struct PeerRow {
    #[serde(rename = "peerName")]
    peer_name: PeerIdentity,
    nextattempt: DateTime<Utc>,
    numfailures: u32,
    #[serde(rename = "type")]
    peer_type: PeerType,
}

/// Peer table persisted as a JSON array of rows
pub struct JsonPeerStore {
    config: StoreConfig,
    table: MemoryPeerStore,
}

impl JsonPeerStore {
    /// Open the table, loading existing rows if the file exists
    pub fn open(config: StoreConfig) -> StorageResult<Self> {
        fs::create_dir_all(&config.data_dir)?;

        let path = config.data_dir.join(&config.table_file);
        let mut rows = Table::new();
        if path.exists() {
            let reader = BufReader::new(fs::File::open(&path)?);
            let stored: Vec<PeerRow> = serde_json::from_reader(reader)?;
            for row in stored {
                let record = PeerRecord::new(row.nextattempt, row.numfailures, row.peer_type);
                if rows.insert(row.peer_name, record).is_some() {
                    return Err(StorageError::InvalidData(format!(
                        "duplicate row for {} in {}",
                        row.peer_name,
                        path.display()
                    )));
                }
            }
            log::debug!("Loaded {} peers from {}", rows.len(), path.display());
        }

        Ok(Self {
            config,
            table: MemoryPeerStore::from_rows(rows),
        })
    }

    /// Open with default configuration
    pub fn with_defaults() -> StorageResult<Self> {
        Self::open(StoreConfig::default())
    }

    fn table_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.table_file)
    }

    fn persist(&self, rows: &Table) -> StorageResult<()> {
        let stored: Vec<PeerRow> = rows
            .iter()
            .map(|(name, record)| PeerRow {
                peer_name: *name,
                nextattempt: record.next_attempt,
                numfailures: record.num_failures,
                peer_type: record.peer_type,
            })
            .collect();

        // Write to temporary file first
        let temp_path = self
            .config
            .data_dir
            .join(format!("{}.tmp", self.config.table_file));
        let writer = BufWriter::new(fs::File::create(&temp_path)?);
        serde_json::to_writer_pretty(writer, &stored)?;

        // Atomic rename
        fs::rename(&temp_path, self.table_path())?;
        Ok(())
    }

    /// Apply a mutation and persist the table while still holding the write
    /// lock. A failed write restores the rows so memory matches the file.
    fn mutate<T>(&self, op: impl FnOnce(&mut Table) -> StorageResult<T>) -> StorageResult<T> {
        let mut rows = self.table.rows.write();
        let snapshot = rows.clone();
        let result = op(&mut rows)?;
        if let Err(e) = self.persist(&rows) {
            *rows = snapshot;
            return Err(e);
        }
        Ok(result)
    }
}

impl PeerStore for JsonPeerStore {
    fn select(&self, peer: &PeerIdentity) -> StorageResult<Option<PeerRecord>> {
        self.table.select(peer)
    }

    fn insert(&self, peer: &PeerIdentity, record: &PeerRecord) -> StorageResult<usize> {
        self.mutate(|rows| insert_row(rows, peer, record))
    }

    fn update(&self, peer: &PeerIdentity, record: &PeerRecord) -> StorageResult<usize> {
        self.mutate(|rows| Ok(update_row(rows, peer, record)))
    }

    fn count(&self, filter: &PeerFilter) -> StorageResult<usize> {
        self.table.count(filter)
    }

    fn select_page(
        &self,
        filter: &PeerFilter,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<PeerIdentity>> {
        self.table.select_page(filter, limit, offset)
    }

    fn delete_failing(
        &self,
        min_failures: u32,
        peer: Option<&PeerIdentity>,
    ) -> StorageResult<usize> {
        self.mutate(|rows| Ok(delete_rows(rows, min_failures, peer)))
    }

    fn select_all(&self) -> StorageResult<Vec<(PeerIdentity, PeerRecord)>> {
        self.table.select_all()
    }
}
