//! Library root for rs-dht-crawler, an autonomous BitTorrent DHT crawler.
//!
//! The crate is built from three cooperating subsystems: a sybil DHT node
//! that harvests `announce_peer` traffic (`dht`), per-peer metadata fetchers
//! speaking BEP 9 over TCP (`peer`), and the coordinator that arbitrates
//! between them and routes completed metadata into the torrent index
//! (`coordinator`, `persistence`).
pub mod bencode;
pub mod coordinator;
pub mod dht;
pub mod peer;
pub mod persistence;
pub mod types;
