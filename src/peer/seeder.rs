//! A scripted loopback peer for exercising the fetcher and coordinator.
//!
//! Serves one connection: answers the BitTorrent handshake, advertises
//! ut_metadata under a configurable id, and then serves, rejects, or
//! ignores piece requests. Compiled for tests only.
use super::handshake::{Handshake, HANDSHAKE_LEN};
use super::{message, METADATA_PIECE_LEN, UT_METADATA_LOCAL_ID};
use crate::bencode::{self, BencodeValue};
use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub struct Seeder {
    pub metadata: Vec<u8>,
    /// The extended id this peer assigns to ut_metadata.
    pub ut_metadata_id: u8,
    /// Overrides the advertised `metadata_size` (defaults to the real one).
    pub advertised_size: Option<i64>,
    /// Answer every piece request with a reject.
    pub reject: bool,
    /// Never answer anything after the BitTorrent handshake.
    pub silent: bool,
}

impl Seeder {
    pub fn serving(metadata: Vec<u8>) -> Self {
        Self {
            metadata,
            ut_metadata_id: 7,
            advertised_size: None,
            reject: false,
            silent: false,
        }
    }

    pub fn muted() -> Self {
        let mut seeder = Self::serving(Vec::new());
        seeder.silent = true;
        seeder
    }

    /// Binds a loopback listener and serves a single connection in the
    /// background. The handle resolves with every ut_metadata request frame
    /// received (sans length prefix), for assertions on the request wire
    /// format.
    pub async fn spawn(self) -> (SocketAddrV4, JoinHandle<io::Result<Vec<Vec<u8>>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            self.serve(stream).await
        });
        (addr, handle)
    }

    async fn serve(self, mut stream: TcpStream) -> io::Result<Vec<Vec<u8>>> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await?;
        let theirs = Handshake::deserialize(&buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad handshake"))?;
        stream
            .write_all(&Handshake::new(theirs.info_hash, *b"-SD0001-ssssssssssss").serialize())
            .await?;

        if self.silent {
            // Hold the connection open without ever answering.
            loop {
                let mut sink = [0u8; 4096];
                if stream.read(&mut sink).await? == 0 {
                    return Ok(Vec::new());
                }
            }
        }

        let advertised = self
            .advertised_size
            .unwrap_or(self.metadata.len() as i64);
        let mut requests = Vec::new();
        loop {
            let body = match message::read_frame(&mut stream, 1 << 20).await {
                Ok(body) => body,
                // The fetcher hangs up once it has what it wants.
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(requests),
                Err(err) => return Err(err),
            };
            if body.len() < 2 || body[0] != message::EXTENDED {
                continue;
            }
            if body[1] == message::EXT_HANDSHAKE_ID {
                let mut m = BTreeMap::new();
                m.insert(
                    b"ut_metadata".to_vec(),
                    BencodeValue::Integer(i64::from(self.ut_metadata_id)),
                );
                let mut dict = BTreeMap::new();
                dict.insert(b"m".to_vec(), BencodeValue::Dict(m));
                dict.insert(
                    b"metadata_size".to_vec(),
                    BencodeValue::Integer(advertised),
                );
                let frame = message::extended_frame(
                    message::EXT_HANDSHAKE_ID,
                    &bencode::encode(&BencodeValue::Dict(dict)),
                );
                stream.write_all(&frame).await?;
                continue;
            }
            if body[1] != self.ut_metadata_id {
                continue;
            }
            requests.push(body.clone());

            let (header, _) = bencode::decode_prefix(&body[2..])
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad request"))?;
            let piece = header
                .get(b"piece")
                .and_then(BencodeValue::as_integer)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad request"))?
                as usize;

            let mut reply = BTreeMap::new();
            reply.insert(b"piece".to_vec(), BencodeValue::Integer(piece as i64));
            if self.reject {
                reply.insert(b"msg_type".to_vec(), BencodeValue::Integer(message::MSG_REJECT));
                let frame = message::extended_frame(
                    UT_METADATA_LOCAL_ID,
                    &bencode::encode(&BencodeValue::Dict(reply)),
                );
                stream.write_all(&frame).await?;
                continue;
            }

            reply.insert(b"msg_type".to_vec(), BencodeValue::Integer(message::MSG_DATA));
            reply.insert(b"total_size".to_vec(), BencodeValue::Integer(advertised));
            let start = (piece * METADATA_PIECE_LEN).min(self.metadata.len());
            let end = (start + METADATA_PIECE_LEN).min(self.metadata.len());
            let mut payload = bencode::encode(&BencodeValue::Dict(reply));
            payload.extend_from_slice(&self.metadata[start..end]);
            stream
                .write_all(&message::extended_frame(UT_METADATA_LOCAL_ID, &payload))
                .await?;
        }
    }
}
