use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::collections::BTreeMap;

/// Decodes a complete bencode value.
///
/// The whole input must be consumed; leftover bytes are an error. Use
/// [`decode_prefix`] for payloads where a value is followed by raw data.
pub fn decode(input: &[u8]) -> BencodeResult<BencodeValue> {
    let (value, consumed) = decode_prefix(input)?;
    if consumed != input.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

/// Decodes one bencode value from the front of `input`, returning the value
/// and the number of bytes it occupied.
///
/// This is the form ut_metadata needs: a `data` message is a bencoded
/// header dict immediately followed by raw piece bytes, with no delimiter
/// in between.
pub fn decode_prefix(input: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    let mut decoder = Decoder { input, pos: 0 };
    let value = decoder.decode_value()?;
    Ok((value, decoder.pos))
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> BencodeResult<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn next(&mut self) -> BencodeResult<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.input.len())
            .ok_or(BencodeError::UnexpectedEof)?;
        let bytes = &self.input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn decode_value(&mut self) -> BencodeResult<BencodeValue> {
        match self.peek()? {
            b'0'..=b'9' => self.decode_bytes().map(BencodeValue::Bytes),
            b'i' => self.decode_integer().map(BencodeValue::Integer),
            b'l' => self.decode_list().map(BencodeValue::List),
            b'd' => self.decode_dict().map(BencodeValue::Dict),
            other => Err(BencodeError::InvalidFormat(format!(
                "unexpected byte 0x{other:02x}"
            ))),
        }
    }

    /// `<length>:<bytes>`, e.g. `4:spam`.
    fn decode_bytes(&mut self) -> BencodeResult<Vec<u8>> {
        let length_str = self.read_until(b':')?;
        let length = length_str
            .parse::<usize>()
            .map_err(|_| BencodeError::InvalidStringLength)?;
        Ok(self.take(length)?.to_vec())
    }

    /// `i<number>e`. Leading zeros, `-0`, and the empty number are rejected;
    /// the KRPC peers this crawler talks to never produce them and accepting
    /// them would break the canonical-encoding round trip.
    fn decode_integer(&mut self) -> BencodeResult<i64> {
        self.next()?; // 'i'
        let num_str = self.read_until(b'e')?;

        if num_str.is_empty() || num_str == "-" {
            return Err(BencodeError::InvalidInteger);
        }
        if num_str == "-0" {
            return Err(BencodeError::InvalidInteger);
        }
        let digits = num_str.strip_prefix('-').unwrap_or(&num_str);
        if digits.len() > 1 && digits.starts_with('0') {
            return Err(BencodeError::InvalidInteger);
        }

        num_str
            .parse::<i64>()
            .map_err(|_| BencodeError::InvalidInteger)
    }

    /// `l<items>e`.
    fn decode_list(&mut self) -> BencodeResult<Vec<BencodeValue>> {
        self.next()?; // 'l'
        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.decode_value()?);
        }
        self.next()?; // 'e'
        Ok(list)
    }

    /// `d<key><value>...e`. Keys must be byte-strings; key ordering is not
    /// enforced on decode (peers in the wild are sloppy), only on encode.
    fn decode_dict(&mut self) -> BencodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
        self.next()?; // 'd'
        let mut dict = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::DictKeyNotString);
            }
            let key = self.decode_bytes()?;
            let value = self.decode_value()?;
            dict.insert(key, value);
        }
        self.next()?; // 'e'
        Ok(dict)
    }

    /// Collects ASCII bytes up to (and consuming) `delimiter`.
    fn read_until(&mut self, delimiter: u8) -> BencodeResult<String> {
        let mut buffer = Vec::new();
        loop {
            let byte = self.next()?;
            if byte == delimiter {
                break;
            }
            buffer.push(byte);
        }
        String::from_utf8(buffer).map_err(|err| {
            BencodeError::InvalidFormat(format!("non-ASCII bytes in length/integer: {err}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::encode;
    use super::*;

    fn bytes(s: &[u8]) -> BencodeValue {
        BencodeValue::Bytes(s.to_vec())
    }

    #[test]
    fn decodes_primitives() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-13e").unwrap(), BencodeValue::Integer(-13));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
        assert_eq!(decode(b"4:spam").unwrap(), bytes(b"spam"));
        assert_eq!(decode(b"0:").unwrap(), bytes(b""));
    }

    #[test]
    fn decodes_nested_structures() {
        let value = decode(b"d1:ad2:id2:hie1:q4:ping1:lli1ei2eee").unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict[b"q".as_slice()], bytes(b"ping"));
        assert_eq!(
            dict[b"a".as_slice()].get(b"id"),
            Some(&bytes(b"hi"))
        );
        assert_eq!(
            dict[b"l".as_slice()],
            BencodeValue::List(vec![BencodeValue::Integer(1), BencodeValue::Integer(2)])
        );
    }

    #[test]
    fn rejects_malformed_integers() {
        assert!(matches!(
            decode(b"i03e"),
            Err(BencodeError::InvalidInteger)
        ));
        assert!(matches!(
            decode(b"i-0e"),
            Err(BencodeError::InvalidInteger)
        ));
        assert!(matches!(decode(b"ie"), Err(BencodeError::InvalidInteger)));
        assert!(matches!(decode(b"i-e"), Err(BencodeError::InvalidInteger)));
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(matches!(decode(b"5:spam"), Err(BencodeError::UnexpectedEof)));
        assert!(matches!(decode(b"i42"), Err(BencodeError::UnexpectedEof)));
        assert!(matches!(decode(b"li1e"), Err(BencodeError::UnexpectedEof)));
        assert!(matches!(decode(b""), Err(BencodeError::UnexpectedEof)));
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert!(matches!(
            decode(b"i1egarbage"),
            Err(BencodeError::TrailingBytes)
        ));
    }

    #[test]
    fn rejects_non_string_dict_keys() {
        assert!(matches!(
            decode(b"di1e1:ve"),
            Err(BencodeError::DictKeyNotString)
        ));
    }

    #[test]
    fn decode_prefix_reports_consumed_bytes() {
        // A ut_metadata data message: header dict, then raw piece bytes.
        let payload = b"d8:msg_typei1e5:piecei0ee\xde\xad\xbe\xef";
        let (header, consumed) = decode_prefix(payload).unwrap();
        assert_eq!(consumed, 25);
        assert_eq!(&payload[consumed..], b"\xde\xad\xbe\xef");
        assert_eq!(
            header.get(b"msg_type").and_then(BencodeValue::as_integer),
            Some(1)
        );
    }

    #[test]
    fn round_trips_nested_values() {
        let mut inner = BTreeMap::new();
        inner.insert(b"id".to_vec(), bytes(b"\x00\xffid"));
        inner.insert(b"port".to_vec(), BencodeValue::Integer(6881));
        let mut outer = BTreeMap::new();
        outer.insert(b"a".to_vec(), BencodeValue::Dict(inner));
        outer.insert(
            b"list".to_vec(),
            BencodeValue::List(vec![bytes(b""), BencodeValue::Integer(-7)]),
        );
        let value = BencodeValue::Dict(outer);

        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }
}
