//! Message framing and the extension-protocol payloads.
//!
//! Every BitTorrent message after the handshake is a u32 length prefix
//! followed by the body;
//! extended messages (type 20) add one more id byte selecting the
//! extension. TCP delivers all of this in arbitrary fragments, so reads go
//! through [`read_frame`], which blocks until a whole message is buffered.
use super::UT_METADATA_LOCAL_ID;
use crate::bencode::{self, BencodeValue};
use std::collections::BTreeMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// BitTorrent message type of every BEP 10 extended message.
pub const EXTENDED: u8 = 20;
/// Extended id 0 is the extension handshake itself.
pub const EXT_HANDSHAKE_ID: u8 = 0;

/// ut_metadata `msg_type` values (BEP 9).
pub const MSG_REQUEST: i64 = 0;
pub const MSG_DATA: i64 = 1;
pub const MSG_REJECT: i64 = 2;

/// Reads one length-prefixed message and returns its body. An empty body
/// is a keep-alive. `max_len` bounds what a hostile peer can make us
/// allocate.
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_len: usize,
) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {max_len} byte limit"),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Frames an extended-message payload: `len, 20, extended_id, payload`.
pub fn extended_frame(extended_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(6 + payload.len());
    frame.extend_from_slice(&((2 + payload.len()) as u32).to_be_bytes());
    frame.push(EXTENDED);
    frame.push(extended_id);
    frame.extend_from_slice(payload);
    frame
}

/// Our extension handshake: `{"m": {"ut_metadata": 1}}`, declaring the id
/// under which we expect the peer's ut_metadata messages.
pub fn extension_handshake() -> Vec<u8> {
    let mut m = BTreeMap::new();
    m.insert(
        b"ut_metadata".to_vec(),
        BencodeValue::Integer(i64::from(UT_METADATA_LOCAL_ID)),
    );
    let mut dict = BTreeMap::new();
    dict.insert(b"m".to_vec(), BencodeValue::Dict(m));
    extended_frame(EXT_HANDSHAKE_ID, &bencode::encode(&BencodeValue::Dict(dict)))
}

/// A ut_metadata piece request, `{"msg_type": 0, "piece": i}`, addressed
/// with the id the peer advertised for ut_metadata.
pub fn metadata_request(ut_metadata_id: u8, piece: usize) -> Vec<u8> {
    let mut dict = BTreeMap::new();
    dict.insert(b"msg_type".to_vec(), BencodeValue::Integer(MSG_REQUEST));
    dict.insert(b"piece".to_vec(), BencodeValue::Integer(piece as i64));
    extended_frame(
        ut_metadata_id,
        &bencode::encode(&BencodeValue::Dict(dict)),
    )
}
