//! Bencode codec (BEP 3 encoding layer).
//!
//! Both KRPC datagrams and the BitTorrent extension protocol carry bencoded
//! dictionaries, and the KRPC wire format additionally requires dictionary
//! keys to be serialised in lexicographic byte order. Dictionaries are held
//! in a `BTreeMap` keyed by byte-strings, so encoding is canonical by
//! construction and `decode(encode(v)) == v` holds for every value.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

pub use decoder::{decode, decode_prefix};
pub use encoder::encode;

/// A bencode value: integer, byte-string, list, or dictionary keyed by
/// byte-strings.
///
/// Byte-strings are raw bytes, not UTF-8; torrent names and node ids travel
/// through the same variant.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` when `self` is not a dict or lacks the key.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict()?.get(key)
    }
}

/// Custom error type for bencode decoding.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid integer format")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("trailing bytes after value")]
    TrailingBytes,

    #[error("dictionary keys must be byte-strings")]
    DictKeyNotString,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
