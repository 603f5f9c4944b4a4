//! Where completed metadata ends up.
//!
//! The crawler core only depends on the narrow [`MetadataStore`] contract;
//! [`TorrentStore`] is the concrete append-only index shipped with the
//! binary. Validation of the decoded `info` dict happens here, late: the
//! fetcher guarantees only that the bytes hash to the infohash.
use crate::types::InfoHash;
use std::collections::HashSet;
use thiserror::Error;

pub mod store;

pub use store::TorrentStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("index serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub trait MetadataStore {
    /// `false` means the infohash is already indexed and need not be
    /// fetched again.
    fn is_new(&self, info_hash: &InfoHash) -> bool;

    /// Validates and indexes the metadata. `Ok(false)` means the decoded
    /// `info` dict was malformed; the caller should treat the infohash as
    /// completed anyway so the corrupt copy is never refetched.
    fn add(&mut self, info_hash: InfoHash, metadata: &[u8]) -> Result<bool, StoreError>;

    /// Infohashes already indexed; seeds the coordinator's completed set
    /// at startup.
    fn completed_info_hashes(&self) -> HashSet<InfoHash>;

    /// Flushes anything pending. Called once at shutdown.
    fn close(&mut self) -> Result<(), StoreError>;
}
