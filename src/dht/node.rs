//! The sybil node itself: one UDP socket, a one-second tick, and an
//! AIMD-governed neighbour budget.
//!
//! Each datagram is handled independently; the only state carried across
//! datagrams is the per-tick routing table scratch set and the adaptive
//! `max_neighbours` threshold.
use super::krpc::{self, Incoming};
use super::{
    Announcement, BOOTSTRAP_NODES, INITIAL_MAX_NEIGHBOURS, MIN_MAX_NEIGHBOURS, TICK_INTERVAL,
};
use crate::types::NodeId;
use anyhow::{Context, Result};
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

pub struct SybilNode {
    socket: UdpSocket,
    true_id: NodeId,
    token_secret: [u8; 4],
    /// One-tick scratch set, not a Kademlia table: filled from `r.nodes`
    /// records between ticks, drained and cleared by the refresh pass.
    routing_table: HashMap<NodeId, SocketAddrV4>,
    max_neighbours: usize,
    /// Whether the kernel pushed back on any send since the last tick.
    congested: bool,
    announcements: mpsc::Sender<Announcement>,
}

impl SybilNode {
    /// Binds the UDP socket and initialises the process-lifetime secrets.
    pub async fn bind(addr: SocketAddr, announcements: mpsc::Sender<Announcement>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("could not bind the DHT socket to {addr}"))?;
        let mut rng = rand::rng();
        let mut true_id: NodeId = [0u8; 20];
        rng.fill(&mut true_id[..]);
        let mut token_secret = [0u8; 4];
        rng.fill(&mut token_secret[..]);
        info!(
            "sybil node {} listening on {}",
            hex::encode_upper(true_id),
            socket.local_addr()?
        );
        Ok(Self {
            socket,
            true_id,
            token_secret,
            routing_table: HashMap::new(),
            max_neighbours: INITIAL_MAX_NEIGHBOURS,
            congested: false,
            announcements,
        })
    }

    /// Receive loop plus tick loop. Only returns on a fatal socket error;
    /// shutdown is dropping the task, which closes the socket.
    pub async fn run(mut self) -> Result<()> {
        let mut tick = time::interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
        let mut last_tick = Instant::now();
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                now = tick.tick() => {
                    let delta = now.duration_since(last_tick);
                    if delta >= TICK_INTERVAL * 2 {
                        warn!("belated tick (Δ = {:.1?})", delta);
                    }
                    last_tick = now;
                    self.on_tick().await;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, SocketAddr::V4(src))) => self.on_datagram(&buf[..len], src).await,
                    // IPv4 only, as with the bootstrap resolution.
                    Ok((_, SocketAddr::V6(_))) => {}
                    Err(err) => return Err(err).context("DHT socket lost"),
                },
            }
        }
    }

    /// Once per second: bootstrap if lonely, refresh neighbours, clear the
    /// table, and grow the budget if the path stayed calm.
    async fn on_tick(&mut self) {
        if self.routing_table.is_empty() {
            self.bootstrap().await;
        }
        self.make_neighbours().await;
        if !self.congested {
            self.max_neighbours = self.max_neighbours * 101 / 100;
        }
        self.congested = false;
    }

    /// Queries the public bootstrap servers. Deliberately reached only when
    /// the routing table is empty, so those servers are not hammered every
    /// second.
    async fn bootstrap(&mut self) {
        for &host in BOOTSTRAP_NODES {
            let resolved = match lookup_host(host).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    warn!("could not resolve bootstrap node {host}: {err}");
                    continue;
                }
            };
            for addr in resolved {
                if let SocketAddr::V4(addr) = addr {
                    let query = krpc::find_node_query(&self.true_id, &random_id());
                    self.send(&query, addr).await;
                }
            }
        }
    }

    /// Sends every node in the scratch table a `find_node` from an id
    /// spliced to look like its close neighbour, then drops the table.
    async fn make_neighbours(&mut self) {
        let table = std::mem::take(&mut self.routing_table);
        for (node_id, addr) in &table {
            let id = krpc::neighbour_id(node_id, &self.true_id);
            let query = krpc::find_node_query(&id, &random_id());
            self.send(&query, *addr).await;
        }
    }

    async fn on_datagram(&mut self, datagram: &[u8], src: SocketAddrV4) {
        // Nodes "using" port 0 cannot be replied to reliably.
        if src.port() == 0 {
            return;
        }
        let Some(message) = krpc::parse(datagram) else {
            return;
        };
        match message {
            Incoming::Nodes(nodes) => self.on_nodes(nodes),
            Incoming::GetPeers {
                transaction_id,
                info_hash,
            } => {
                let id = krpc::neighbour_id(info_hash.as_bytes(), &self.true_id);
                let token = krpc::make_token(&self.token_secret, &src, &info_hash);
                let reply = krpc::get_peers_response(&id, &transaction_id, &token);
                self.send(&reply, src).await;
            }
            Incoming::AnnouncePeer {
                transaction_id,
                node_id,
                info_hash,
                port,
                implied_port,
            } => {
                let id = krpc::neighbour_id(&node_id, &self.true_id);
                let reply = krpc::announce_peer_response(&id, &transaction_id);
                self.send(&reply, src).await;

                let peer = if implied_port {
                    src
                } else {
                    SocketAddrV4::new(*src.ip(), port)
                };
                if self
                    .announcements
                    .send(Announcement { info_hash, peer })
                    .await
                    .is_err()
                {
                    debug!("announcement channel closed, dropping {info_hash}");
                }
            }
        }
    }

    fn on_nodes(&mut self, nodes: Vec<(NodeId, SocketAddrV4)>) {
        if self.routing_table.len() >= self.max_neighbours {
            return;
        }
        let room = self.max_neighbours - self.routing_table.len();
        for (id, addr) in nodes.into_iter().take(room) {
            self.routing_table.insert(id, addr);
        }
    }

    /// The uniform send primitive: kernel pushback of any flavour is fed to
    /// the AIMD logic, other errors are merely noted. Endpoints with port 0
    /// are never dialled.
    async fn send(&mut self, data: &[u8], addr: SocketAddrV4) {
        if addr.port() == 0 {
            return;
        }
        match self.socket.send_to(data, SocketAddr::V4(addr)).await {
            Ok(_) => {}
            Err(err) if is_congestion(&err) => self.on_congestion(),
            Err(err) => debug!("sendto {addr} failed: {err}"),
        }
    }

    /// Multiplicative decrease: congestion costs 10% of the neighbour
    /// budget, down to the floor where it only warns.
    fn on_congestion(&mut self) {
        self.congested = true;
        if self.max_neighbours < MIN_MAX_NEIGHBOURS {
            warn!(
                "congestion with fewer than {MIN_MAX_NEIGHBOURS} neighbours; \
                 check your network connection if this recurs"
            );
        } else {
            self.max_neighbours = self.max_neighbours * 9 / 10;
            debug!("maximum number of neighbours now {}", self.max_neighbours);
        }
    }
}

/// EPERM and ENOBUFS are the kernel's way of saying "far too fast, chill";
/// the latter also covers ICMP source quench on some systems.
fn is_congestion(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::PermissionDenied
    ) || err.raw_os_error() == Some(libc::ENOBUFS)
}

fn random_id() -> NodeId {
    let mut id = [0u8; 20];
    rand::rng().fill(&mut id[..]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encode, BencodeValue};
    use crate::types::InfoHash;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn by(s: &[u8]) -> BencodeValue {
        BencodeValue::Bytes(s.to_vec())
    }

    fn dict(entries: Vec<(&[u8], BencodeValue)>) -> BencodeValue {
        BencodeValue::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_vec(), v))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn announce_datagram(info_hash: &InfoHash, port: i64, implied_port: Option<i64>) -> Vec<u8> {
        let mut args = vec![
            (b"id".as_slice(), by(&[0x07; 20])),
            (b"info_hash".as_slice(), by(info_hash.as_bytes())),
            (b"port".as_slice(), BencodeValue::Integer(port)),
            (b"token".as_slice(), by(b"x")),
        ];
        if let Some(implied) = implied_port {
            args.push((b"implied_port".as_slice(), BencodeValue::Integer(implied)));
        }
        encode(&dict(vec![
            (b"a", dict(args)),
            (b"q", by(b"announce_peer")),
            (b"t", by(b"aa")),
            (b"y", by(b"q")),
        ]))
    }

    async fn test_node() -> (SybilNode, mpsc::Receiver<Announcement>) {
        let (tx, rx) = mpsc::channel(8);
        let node = SybilNode::bind("127.0.0.1:0".parse().unwrap(), tx)
            .await
            .unwrap();
        (node, rx)
    }

    /// Binds a scratch socket standing in for the querying DHT node, so the
    /// reply sent by the sybil node can be observed.
    async fn scratch_peer() -> (UdpSocket, SocketAddrV4) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = match socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };
        (socket, addr)
    }

    async fn recv_reply(socket: &UdpSocket) -> BencodeValue {
        let mut buf = [0u8; 1024];
        let (len, _) = time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
            .await
            .expect("no reply within a second")
            .unwrap();
        crate::bencode::decode(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn announce_peer_is_answered_and_emitted() {
        let (mut node, mut announcements) = test_node().await;
        let (peer_socket, src) = scratch_peer().await;
        let info_hash = InfoHash([0xAB; 20]);

        node.on_datagram(&announce_datagram(&info_hash, 6881, None), src)
            .await;

        let reply = recv_reply(&peer_socket).await;
        assert_eq!(reply.get(b"y").unwrap().as_bytes().unwrap(), b"r");
        assert_eq!(reply.get(b"t").unwrap().as_bytes().unwrap(), b"aa");
        let id = reply.get(b"r").unwrap().get(b"id").unwrap().as_bytes().unwrap();
        assert_eq!(&id[..15], &[0x07; 15]);
        assert_eq!(&id[15..], &node.true_id[..5]);

        let announcement = announcements.try_recv().unwrap();
        assert_eq!(announcement.info_hash, info_hash);
        assert_eq!(announcement.peer, SocketAddrV4::new(*src.ip(), 6881));
    }

    #[tokio::test]
    async fn implied_port_uses_the_source_port() {
        let (mut node, mut announcements) = test_node().await;
        let (peer_socket, src) = scratch_peer().await;
        let info_hash = InfoHash([0xCD; 20]);

        node.on_datagram(&announce_datagram(&info_hash, 6881, Some(1)), src)
            .await;

        recv_reply(&peer_socket).await;
        let announcement = announcements.try_recv().unwrap();
        assert_eq!(announcement.peer, src);
    }

    #[tokio::test]
    async fn source_port_zero_is_dropped() {
        let (mut node, mut announcements) = test_node().await;
        let info_hash = InfoHash([0xEF; 20]);
        let src = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 0);

        node.on_datagram(&announce_datagram(&info_hash, 6881, None), src)
            .await;

        assert!(announcements.try_recv().is_err());
    }

    #[tokio::test]
    async fn get_peers_is_answered_with_empty_nodes_and_a_token() {
        let (mut node, _announcements) = test_node().await;
        let (peer_socket, src) = scratch_peer().await;
        let info_hash = InfoHash([0x11; 20]);

        let datagram = encode(&dict(vec![
            (b"a", dict(vec![(b"info_hash", by(info_hash.as_bytes()))])),
            (b"q", by(b"get_peers")),
            (b"t", by(b"tx")),
            (b"y", by(b"q")),
        ]));
        node.on_datagram(&datagram, src).await;

        let reply = recv_reply(&peer_socket).await;
        let r = reply.get(b"r").unwrap();
        assert_eq!(r.get(b"nodes").unwrap().as_bytes().unwrap(), b"");
        let expected = krpc::make_token(&node.token_secret, &src, &info_hash);
        assert_eq!(r.get(b"token").unwrap().as_bytes().unwrap(), expected);
        let id = r.get(b"id").unwrap().as_bytes().unwrap();
        assert_eq!(&id[..15], &info_hash.as_bytes()[..15]);
        assert_eq!(&id[15..], &node.true_id[..5]);
    }

    #[tokio::test]
    async fn nodes_responses_fill_the_table_up_to_the_budget() {
        let (mut node, _announcements) = test_node().await;
        node.max_neighbours = 3;

        let mut blob = Vec::new();
        for i in 1..=5u8 {
            blob.extend_from_slice(&[i; 20]);
            blob.extend_from_slice(&[10, 0, 0, i]);
            blob.extend_from_slice(&6881u16.to_be_bytes());
        }
        let datagram = encode(&dict(vec![
            (b"r", dict(vec![(b"id", by(&[0x09; 20])), (b"nodes", by(&blob))])),
            (b"t", by(b"aa")),
            (b"y", by(b"r")),
        ]));
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 99), 6881);
        node.on_datagram(&datagram, src).await;

        assert_eq!(node.routing_table.len(), 3);
    }

    #[tokio::test]
    async fn tick_refreshes_then_clears_the_table_and_grows_the_budget() {
        let (mut node, _announcements) = test_node().await;
        let (_peer_socket, addr) = scratch_peer().await;
        // A loopback neighbour keeps the tick off the bootstrap path.
        node.routing_table.insert([0x55; 20], addr);

        node.on_tick().await;

        assert!(node.routing_table.is_empty());
        assert_eq!(node.max_neighbours, INITIAL_MAX_NEIGHBOURS * 101 / 100);
    }

    #[tokio::test]
    async fn congestion_shrinks_the_budget_down_to_the_floor() {
        let (mut node, _announcements) = test_node().await;

        let mut previous = node.max_neighbours;
        for _ in 0..40 {
            node.on_congestion();
            assert!(node.max_neighbours <= previous);
            previous = node.max_neighbours;
        }
        // 2000 · 0.9^k sinks below 200 well within 40 rounds, after which
        // the budget must hold steady instead of collapsing to zero.
        assert!(node.max_neighbours < MIN_MAX_NEIGHBOURS);
        assert!(node.max_neighbours >= MIN_MAX_NEIGHBOURS * 9 / 10);
        let frozen = node.max_neighbours;
        node.on_congestion();
        assert_eq!(node.max_neighbours, frozen);
    }

    #[tokio::test]
    async fn congested_tick_does_not_grow_the_budget() {
        let (mut node, _announcements) = test_node().await;
        let (_peer_socket, addr) = scratch_peer().await;
        node.routing_table.insert([0x55; 20], addr);
        node.congested = true;
        let before = node.max_neighbours;

        node.on_tick().await;

        assert_eq!(node.max_neighbours, before);
        // The flag resets each tick.
        assert!(!node.congested);
    }
}
