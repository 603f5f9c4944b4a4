//! The sybil Mainline DHT node (BEP 5).
//!
//! This is an infohash-harvesting sensor, not a well-behaved DHT citizen:
//! it keeps no real routing table, answers `get_peers` with an empty node
//! list and a valid-looking token, and exists solely to attract
//! `announce_peer` traffic from which it extracts (infohash, peer) pairs.
use crate::types::InfoHash;
use std::net::SocketAddrV4;
use std::time::Duration;

pub mod krpc;
pub mod node;

pub use node::SybilNode;

/// A peer that told us it is downloading a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub info_hash: InfoHash,
    pub peer: SocketAddrV4,
}

/// Queried once per tick, and only while the routing table is empty.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
];

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Starting neighbour budget; adapted up and down from here by AIMD.
pub const INITIAL_MAX_NEIGHBOURS: usize = 2000;

/// Below this the budget stops shrinking and congestion is only reported.
pub const MIN_MAX_NEIGHBOURS: usize = 200;
