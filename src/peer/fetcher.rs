//! The per-peer metadata fetcher.
//!
//! One fetcher is one disposable TCP connection: dial, handshake, ask for
//! every 16 KiB piece of the info dict, assemble, verify against the
//! infohash, and report a single `Result` back to the coordinator. Peers
//! are plentiful and interchangeable, so every failure mode simply ends
//! the job.
use super::handshake::{Handshake, HANDSHAKE_LEN};
use super::{message, METADATA_PIECE_LEN, UT_METADATA_LOCAL_ID};
use crate::bencode::{self, BencodeValue};
use crate::types::InfoHash;
use rand::Rng;
use sha1::{Digest, Sha1};
use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info};

/// Everything that can end a fetch job. The coordinator does not
/// distinguish between these beyond logging; peers are disposable.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("peer sent a malformed handshake")]
    MalformedHandshake,

    #[error("peer sent a malformed extension handshake")]
    MalformedExtensionHandshake,

    #[error("peer does not offer ut_metadata")]
    UtMetadataNotOffered,

    #[error("metadata size {0} out of bounds (limit {1})")]
    MetadataSizeOutOfBounds(i64, usize),

    #[error("could not allocate {0} bytes for the metadata")]
    Allocation(usize),

    #[error("peer sent a malformed ut_metadata message")]
    MalformedMessage,

    #[error("piece {0} overflows the metadata buffer")]
    PieceOutOfBounds(usize),

    #[error("peer rejected our metadata request")]
    Rejected,

    #[error("metadata does not hash to the infohash")]
    HashMismatch,

    #[error("peer did not deliver the metadata in time")]
    Timeout,
}

/// Downloads the torrent's info dict from one peer over BEP 9.
///
/// The whole exchange, connect included, is bounded by `timeout`
/// wall-clock; a peer that goes silent after the extension handshake is
/// killed by it.
#[tracing::instrument(level = "debug", skip(max_metadata_size, timeout))]
pub async fn fetch_metadata(
    info_hash: InfoHash,
    peer: SocketAddrV4,
    max_metadata_size: usize,
    timeout: Duration,
) -> Result<Vec<u8>, FetchError> {
    match time::timeout(timeout, fetch(info_hash, peer, max_metadata_size)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout),
    }
}

async fn fetch(
    info_hash: InfoHash,
    peer: SocketAddrV4,
    max_metadata_size: usize,
) -> Result<Vec<u8>, FetchError> {
    let mut stream = TcpStream::connect(peer).await?;
    stream.set_nodelay(true)?;

    stream
        .write_all(&Handshake::new(info_hash, peer_id()).serialize())
        .await?;

    let mut reply = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut reply).await?;
    let theirs = Handshake::deserialize(&reply).ok_or(FetchError::MalformedHandshake)?;
    if !theirs.supports_extension_protocol() {
        // Some clients leave the bit unset yet still answer extended
        // messages, so this is not fatal.
        info!("peer {peer} does not advertise the extension protocol");
    }

    stream.write_all(&message::extension_handshake()).await?;

    // Frames can carry a bencode header plus one full piece.
    let frame_limit = max_metadata_size + METADATA_PIECE_LEN;
    let mut transfer: Option<Transfer> = None;
    loop {
        let body = message::read_frame(&mut stream, frame_limit).await?;
        if body.len() < 2 || body[0] != message::EXTENDED {
            // Keep-alives and regular BitTorrent traffic are of no
            // interest to a metadata-only client.
            continue;
        }
        match body[1] {
            message::EXT_HANDSHAKE_ID => {
                if transfer.is_some() {
                    // Subsequent extension handshakes may re-tune other
                    // extensions; the first one fixed our parameters.
                    continue;
                }
                let started = Transfer::from_handshake(&body[2..], max_metadata_size)?;
                for piece in 0..started.piece_count() {
                    stream
                        .write_all(&message::metadata_request(started.ut_metadata_id, piece))
                        .await?;
                }
                transfer = Some(started);
            }
            UT_METADATA_LOCAL_ID => {
                let Some(transfer) = transfer.as_mut() else {
                    return Err(FetchError::MalformedMessage);
                };
                if let Some(metadata) = transfer.on_message(&body[2..])? {
                    return if Sha1::digest(&metadata)[..] == info_hash.as_bytes()[..] {
                        Ok(metadata)
                    } else {
                        debug!("invalid metadata for {info_hash}, discarding");
                        Err(FetchError::HashMismatch)
                    };
                }
            }
            other => debug!("ignoring extended message {other} from {peer}"),
        }
    }
}

/// Transfer parameters fixed by the peer's extension handshake, plus the
/// assembly buffer.
struct Transfer {
    ut_metadata_id: u8,
    metadata: Vec<u8>,
    received: usize,
}

impl Transfer {
    fn from_handshake(payload: &[u8], max_metadata_size: usize) -> Result<Self, FetchError> {
        let handshake =
            bencode::decode(payload).map_err(|_| FetchError::MalformedExtensionHandshake)?;
        if handshake.as_dict().is_none() {
            return Err(FetchError::MalformedExtensionHandshake);
        }

        let ut_metadata_id = handshake
            .get(b"m")
            .and_then(|m| m.get(b"ut_metadata"))
            .and_then(BencodeValue::as_integer)
            .ok_or(FetchError::UtMetadataNotOffered)?;
        let ut_metadata_id =
            u8::try_from(ut_metadata_id).map_err(|_| FetchError::MalformedExtensionHandshake)?;

        let metadata_size = handshake
            .get(b"metadata_size")
            .and_then(BencodeValue::as_integer)
            .ok_or(FetchError::MalformedExtensionHandshake)?;
        if metadata_size <= 0 || metadata_size as usize >= max_metadata_size {
            return Err(FetchError::MetadataSizeOutOfBounds(
                metadata_size,
                max_metadata_size,
            ));
        }
        let size = metadata_size as usize;

        let mut metadata = Vec::new();
        metadata
            .try_reserve_exact(size)
            .map_err(|_| FetchError::Allocation(size))?;
        metadata.resize(size, 0);

        Ok(Self {
            ut_metadata_id,
            metadata,
            received: 0,
        })
    }

    fn piece_count(&self) -> usize {
        self.metadata.len().div_ceil(METADATA_PIECE_LEN)
    }

    /// Handles one ut_metadata payload (header dict, then raw piece bytes).
    /// Returns the assembled metadata once every byte has arrived.
    fn on_message(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>, FetchError> {
        let (header, consumed) =
            bencode::decode_prefix(payload).map_err(|_| FetchError::MalformedMessage)?;
        let msg_type = header
            .get(b"msg_type")
            .and_then(BencodeValue::as_integer)
            .ok_or(FetchError::MalformedMessage)?;
        match msg_type {
            message::MSG_DATA => {
                let piece = header
                    .get(b"piece")
                    .and_then(BencodeValue::as_integer)
                    .and_then(|piece| usize::try_from(piece).ok())
                    .ok_or(FetchError::MalformedMessage)?;
                let bytes = &payload[consumed..];
                let offset = piece
                    .checked_mul(METADATA_PIECE_LEN)
                    .ok_or(FetchError::PieceOutOfBounds(piece))?;
                let end = offset
                    .checked_add(bytes.len())
                    .filter(|&end| end <= self.metadata.len())
                    .ok_or(FetchError::PieceOutOfBounds(piece))?;
                self.metadata[offset..end].copy_from_slice(bytes);
                self.received += bytes.len();
                if self.received == self.metadata.len() {
                    Ok(Some(std::mem::take(&mut self.metadata)))
                } else {
                    Ok(None)
                }
            }
            message::MSG_REJECT => Err(FetchError::Rejected),
            // Requests (we never serve) and unknown types are ignored.
            _ => Ok(None),
        }
    }
}

/// Azureus-style peer id: client prefix plus random tail.
fn peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    let prefix = b"-RD0001-";
    id[..prefix.len()].copy_from_slice(prefix);
    rand::rng().fill(&mut id[prefix.len()..]);
    id
}
