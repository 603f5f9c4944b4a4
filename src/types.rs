//! Identifiers shared by the DHT node, the fetchers, and the coordinator.
use std::fmt;

/// SHA-1 of a torrent's bencoded `info` dictionary. Equality is by bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Builds an infohash from a wire field; `None` unless exactly 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", hex::encode(self.0))
    }
}

/// Identifier of a DHT node. The crawler owns one true id for its whole
/// lifetime and synthesises per-query neighbour ids from it.
pub type NodeId = [u8; 20];
