//! Arbitration between the DHT node and the fetchers.
//!
//! The coordinator owns the completed set and the per-infohash fetch
//! groups. It is the only task that touches either, so the "exactly one
//! store per infohash" guarantee needs no locks: a winning fetcher removes
//! its group before anything else happens, and a sibling success already
//! queued behind it finds no group to resolve.
use crate::dht::Announcement;
use crate::peer::fetcher::{self, FetchError};
use crate::persistence::{MetadataStore, StoreError};
use crate::types::InfoHash;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Inclusive bound on concurrently running fetchers per infohash.
pub const MAX_ACTIVE_PEERS_PER_INFO_HASH: usize = 5;

/// Wall-clock budget for one fetch job.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(120);

/// Live fetch jobs for one infohash, keyed by the peer being dialled.
struct FetchGroup {
    jobs: HashMap<SocketAddrV4, JoinHandle<()>>,
}

/// What a finished fetch job reports back.
struct Outcome {
    info_hash: InfoHash,
    peer: SocketAddrV4,
    result: Result<Vec<u8>, FetchError>,
}

pub struct Coordinator<S: MetadataStore> {
    store: S,
    /// Infohashes with accepted metadata (valid or proven corrupt) that
    /// must never grow a fetch group again.
    completed: HashSet<InfoHash>,
    groups: HashMap<InfoHash, FetchGroup>,
    outcome_tx: mpsc::Sender<Outcome>,
    outcome_rx: mpsc::Receiver<Outcome>,
    max_metadata_size: usize,
    peer_timeout: Duration,
}

impl<S: MetadataStore> Coordinator<S> {
    pub fn new(store: S, max_metadata_size: usize) -> Self {
        let completed = store.completed_info_hashes();
        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        Self {
            store,
            completed,
            groups: HashMap::new(),
            outcome_tx,
            outcome_rx,
            max_metadata_size,
            peer_timeout: PEER_TIMEOUT,
        }
    }

    /// Multiplexes announcements and job outcomes until the announcement
    /// stream closes (the DHT node is gone) or `shutdown` fires; then
    /// aborts every live job and flushes the store.
    pub async fn run(
        mut self,
        mut announcements: mpsc::Receiver<Announcement>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), StoreError> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                announcement = announcements.recv() => match announcement {
                    Some(announcement) => self.on_announcement(announcement),
                    None => break,
                },
                outcome = self.outcome_rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.on_outcome(outcome);
                    }
                }
                _ = &mut shutdown => break,
            }
        }
        self.finish()
    }

    /// Admission control: known infohashes are dropped, groups are bounded,
    /// one socket per (infohash, peer).
    fn on_announcement(&mut self, announcement: Announcement) {
        let Announcement { info_hash, peer } = announcement;
        if self.completed.contains(&info_hash) || !self.store.is_new(&info_hash) {
            return;
        }

        let group = self
            .groups
            .entry(info_hash)
            .or_insert_with(|| FetchGroup { jobs: HashMap::new() });
        if group.jobs.len() >= MAX_ACTIVE_PEERS_PER_INFO_HASH || group.jobs.contains_key(&peer) {
            return;
        }

        let outcome_tx = self.outcome_tx.clone();
        let max_metadata_size = self.max_metadata_size;
        let timeout = self.peer_timeout;
        let handle = tokio::spawn(async move {
            let result = fetcher::fetch_metadata(info_hash, peer, max_metadata_size, timeout).await;
            let _ = outcome_tx
                .send(Outcome {
                    info_hash,
                    peer,
                    result,
                })
                .await;
        });
        group.jobs.insert(peer, handle);
    }

    fn on_outcome(&mut self, outcome: Outcome) {
        let Outcome {
            info_hash,
            peer,
            result,
        } = outcome;
        if !self.groups.contains_key(&info_hash) {
            // A sibling already resolved this group while the outcome sat
            // in the queue.
            return;
        }
        match result {
            Ok(metadata) => {
                // First success wins: tear the group down before storing so
                // no sibling can double-deliver.
                if let Some(mut group) = self.groups.remove(&info_hash) {
                    group.jobs.remove(&peer);
                    for sibling in group.jobs.into_values() {
                        sibling.abort();
                    }
                }
                self.accept(info_hash, &metadata);
            }
            Err(err) => {
                debug!("fetching {info_hash} from {peer} failed: {err}");
                let exhausted = match self.groups.get_mut(&info_hash) {
                    Some(group) => {
                        group.jobs.remove(&peer);
                        group.jobs.is_empty()
                    }
                    None => false,
                };
                if exhausted {
                    self.groups.remove(&info_hash);
                }
            }
        }
    }

    fn accept(&mut self, info_hash: InfoHash, metadata: &[u8]) {
        match self.store.add(info_hash, metadata) {
            Ok(true) => {
                self.completed.insert(info_hash);
            }
            Ok(false) => {
                info!("corrupt metadata for {info_hash}, ignoring");
                // Completed-but-corrupt: refetching would yield the same
                // bytes, since they did hash to the infohash.
                self.completed.insert(info_hash);
            }
            Err(err) => {
                // Storage hiccup, not a metadata problem: leave the
                // infohash open so another peer can deliver later.
                error!("could not store metadata for {info_hash}: {err}");
            }
        }
    }

    fn finish(mut self) -> Result<(), StoreError> {
        let groups = std::mem::take(&mut self.groups);
        for group in groups.into_values() {
            for job in group.jobs.into_values() {
                job.abort();
            }
        }
        self.store.close()
    }
}
