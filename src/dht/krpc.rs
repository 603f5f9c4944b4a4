//! KRPC wire format (BEP 5): classifying inbound datagrams and crafting the
//! handful of messages the crawler emits.
//!
//! Outbound messages are built as pre-formatted byte templates rather than
//! going through the encoder; they sit on the hot path of the tick loop.
//! The bytes must stay identical to what `bencode::encode` would produce
//! for the equivalent dict, keys in lexicographic order; the tests at the
//! bottom pin that down.
use crate::bencode::{self, BencodeValue};
use crate::types::{InfoHash, NodeId};
use byteorder::{BigEndian, ByteOrder};
use sha1::{Digest, Sha1};
use std::net::{Ipv4Addr, SocketAddrV4};

/// A compact node info record: 20-byte id, 4-byte IPv4, 2-byte port.
pub const COMPACT_NODE_LEN: usize = 26;

/// The three inbound message shapes the crawler cares about. Everything
/// else (other queries, errors, responses without `r.nodes`) is noise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A response carrying `r.nodes`, already split into records with
    /// port-0 entries dropped.
    Nodes(Vec<(NodeId, SocketAddrV4)>),
    GetPeers {
        transaction_id: Vec<u8>,
        info_hash: InfoHash,
    },
    AnnouncePeer {
        transaction_id: Vec<u8>,
        node_id: NodeId,
        info_hash: InfoHash,
        port: u16,
        implied_port: bool,
    },
}

/// Classifies one datagram. Any malformed field, at any level, yields
/// `None`: on UDP the only sensible reaction to garbage is silence.
pub fn parse(datagram: &[u8]) -> Option<Incoming> {
    let message = bencode::decode(datagram).ok()?;
    let dict = message.as_dict()?;

    if let Some(nodes) = message
        .get(b"r")
        .and_then(|r| r.get(b"nodes"))
        .and_then(BencodeValue::as_bytes)
    {
        return decode_nodes(nodes).map(Incoming::Nodes);
    }

    let query = dict.get(b"q".as_slice()).and_then(BencodeValue::as_bytes)?;
    let transaction_id = dict.get(b"t".as_slice()).and_then(BencodeValue::as_bytes)?;
    if transaction_id.is_empty() {
        return None;
    }
    let args = dict.get(b"a".as_slice())?;

    if query == b"get_peers" {
        let info_hash = InfoHash::from_bytes(args.get(b"info_hash")?.as_bytes()?)?;
        Some(Incoming::GetPeers {
            transaction_id: transaction_id.to_vec(),
            info_hash,
        })
    } else if query == b"announce_peer" {
        let node_id: NodeId = args.get(b"id")?.as_bytes()?.try_into().ok()?;
        let info_hash = InfoHash::from_bytes(args.get(b"info_hash")?.as_bytes()?)?;
        // The token is required but deliberately not validated; any token
        // is good enough for harvesting.
        args.get(b"token")?.as_bytes()?;
        let port = args.get(b"port")?.as_integer()?;
        let port = u16::try_from(port).ok().filter(|&p| p > 0)?;
        let implied_port = match args.get(b"implied_port") {
            None => false,
            Some(value) => match value.as_integer()? {
                0 => false,
                1 => true,
                _ => return None,
            },
        };
        Some(Incoming::AnnouncePeer {
            transaction_id: transaction_id.to_vec(),
            node_id,
            info_hash,
            port,
            implied_port,
        })
    } else {
        None
    }
}

/// Splits an `r.nodes` blob into records. The blob must be a whole number
/// of 26-byte records; records advertising port 0 are dropped.
fn decode_nodes(raw: &[u8]) -> Option<Vec<(NodeId, SocketAddrV4)>> {
    if raw.len() % COMPACT_NODE_LEN != 0 {
        return None;
    }
    let mut nodes = Vec::with_capacity(raw.len() / COMPACT_NODE_LEN);
    for record in raw.chunks_exact(COMPACT_NODE_LEN) {
        let mut id: NodeId = [0u8; 20];
        id.copy_from_slice(&record[..20]);
        let ip = Ipv4Addr::new(record[20], record[21], record[22], record[23]);
        let port = BigEndian::read_u16(&record[24..26]);
        if port == 0 {
            continue;
        }
        nodes.push((id, SocketAddrV4::new(ip, port)));
    }
    Some(nodes)
}

/// `of[..15]` plus `true_id[..5]`: an id that looks close to `of` under
/// the XOR metric while remaining recognisably ours in the last five bytes.
pub fn neighbour_id(of: &[u8; 20], true_id: &NodeId) -> NodeId {
    let mut id = [0u8; 20];
    id[..15].copy_from_slice(&of[..15]);
    id[15..].copy_from_slice(&true_id[..5]);
    id
}

/// Opaque token handed out in `get_peers` replies: the first four bytes of
/// `sha1(secret + ip + port + infohash)`. Deterministic per (source,
/// infohash) for the process lifetime, meaningless to everyone else.
pub fn make_token(secret: &[u8; 4], addr: &SocketAddrV4, info_hash: &InfoHash) -> [u8; 4] {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    hasher.update(addr.ip().octets());
    hasher.update(addr.port().to_be_bytes());
    hasher.update(info_hash.as_bytes());
    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2], digest[3]]
}

/// `find_node` query with a fixed `aa` transaction id.
///
/// Equivalent dict: `{a: {id, target}, q: "find_node", t: "aa", y: "q"}`.
pub fn find_node_query(id: &NodeId, target: &NodeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(92);
    out.extend_from_slice(b"d1:ad2:id20:");
    out.extend_from_slice(id);
    out.extend_from_slice(b"6:target20:");
    out.extend_from_slice(target);
    out.extend_from_slice(b"e1:q9:find_node1:t2:aa1:y1:qe");
    out
}

/// `get_peers` response with an empty `nodes` string and a token.
///
/// Never returns peers; the empty-handed-but-tokened reply is what nudges
/// the asker into a subsequent `announce_peer`.
/// Equivalent dict: `{r: {id, nodes: "", token}, t, y: "r"}`.
pub fn get_peers_response(id: &NodeId, transaction_id: &[u8], token: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + transaction_id.len() + token.len());
    out.extend_from_slice(b"d1:rd2:id20:");
    out.extend_from_slice(id);
    out.extend_from_slice(b"5:nodes0:5:token");
    push_bytes(&mut out, token);
    out.extend_from_slice(b"e1:t");
    push_bytes(&mut out, transaction_id);
    out.extend_from_slice(b"1:y1:re");
    out
}

/// `announce_peer` response. Equivalent dict: `{r: {id}, t, y: "r"}`.
pub fn announce_peer_response(id: &NodeId, transaction_id: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(44 + transaction_id.len());
    out.extend_from_slice(b"d1:rd2:id20:");
    out.extend_from_slice(id);
    out.extend_from_slice(b"e1:t");
    push_bytes(&mut out, transaction_id);
    out.extend_from_slice(b"1:y1:re");
    out
}

fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}
