use super::BencodeValue;

/// Encodes a value to canonical bencode bytes.
///
/// Dictionary keys come out in lexicographic byte order because the value
/// model stores them in a `BTreeMap`; the wire-format templates in
/// `dht::krpc` are checked against this encoder in tests.
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_value(&mut out, value);
    out
}

fn encode_value(out: &mut Vec<u8>, value: &BencodeValue) {
    match value {
        BencodeValue::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        BencodeValue::Bytes(bytes) => encode_bytes(out, bytes),
        BencodeValue::List(items) => {
            out.push(b'l');
            for item in items {
                encode_value(out, item);
            }
            out.push(b'e');
        }
        BencodeValue::Dict(dict) => {
            out.push(b'd');
            for (key, item) in dict {
                encode_bytes(out, key);
                encode_value(out, item);
            }
            out.push(b'e');
        }
    }
}

fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}
