//! Canonical bencode codec for the RTPEngine NG protocol (spec.md §4.6,
//! §9, §8 P6).
//!
//! Encoding is always canonical: dictionary keys in lexicographic byte
//! order, no leading zeros in integers. Decoding is tolerant by default
//! (accepts non-canonical key order for forward compatibility per
//! spec.md §9) with a strict mode that rejects it.
//!
//! No bencode crate exists anywhere in the reference corpus; per spec.md
//! §9's explicit instruction not to reuse a generic JSON-like codec, this
//! is hand-rolled the way the teacher hand-rolls its other wire codecs
//! (PRI/SIGTRAN framing) rather than reaching for a generic parsing
//! crate.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BValue {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<BValue>),
    /// Canonical storage is a `BTreeMap` so keys are always lexicographic
    /// on `Vec<u8>` byte order when iterated for encoding.
    Dict(BTreeMap<Vec<u8>, BValue>),
}

impl BValue {
    pub fn str<S: Into<Vec<u8>>>(s: S) -> Self {
        BValue::Bytes(s.into())
    }

    pub fn dict() -> BTreeMap<Vec<u8>, BValue> {
        BTreeMap::new()
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BValue>> {
        match self {
            BValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BValue]> {
        match self {
            BValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&BValue> {
        self.as_dict()?.get(key.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BencodeError {
    pub message: String,
    pub offset: usize,
}

impl fmt::Display for BencodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bencode error at offset {}: {}", self.offset, self.message)
    }
}

impl std::error::Error for BencodeError {}

/// Encodes `value` to canonical bencode bytes.
pub fn encode(value: &BValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &BValue, out: &mut Vec<u8>) {
    match value {
        BValue::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        BValue::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        BValue::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        BValue::Dict(map) => {
            out.push(b'd');
            // BTreeMap<Vec<u8>, _> iterates in ascending byte order already,
            // which is exactly canonical bencode key order.
            for (k, v) in map {
                encode_into(&BValue::Bytes(k.clone()), out);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

/// Decodes one bencode value starting at the beginning of `input`.
/// Tolerant mode: does not reject non-canonical dict key order.
pub fn decode(input: &[u8]) -> Result<BValue, BencodeError> {
    let mut pos = 0;
    let value = decode_value(input, &mut pos, false)?;
    Ok(value)
}

/// Decodes one bencode value, rejecting non-canonical dictionary key
/// ordering or leading-zero integers (spec.md §8 P6).
pub fn decode_strict(input: &[u8]) -> Result<BValue, BencodeError> {
    let mut pos = 0;
    decode_value(input, &mut pos, true)
}

fn decode_value(input: &[u8], pos: &mut usize, strict: bool) -> Result<BValue, BencodeError> {
    let tag = *input.get(*pos).ok_or_else(|| err("unexpected end of input", *pos))?;
    match tag {
        b'i' => decode_int(input, pos, strict).map(BValue::Int),
        b'l' => decode_list(input, pos, strict),
        b'd' => decode_dict(input, pos, strict),
        b'0'..=b'9' => decode_bytes(input, pos).map(BValue::Bytes),
        _ => Err(err(format!("unexpected tag byte '{}'", tag as char), *pos)),
    }
}

fn decode_int(input: &[u8], pos: &mut usize, strict: bool) -> Result<i64, BencodeError> {
    debug_assert_eq!(input[*pos], b'i');
    *pos += 1;
    let start = *pos;
    let end = find(input, b'e', *pos).ok_or_else(|| err("unterminated integer", start))?;
    let digits = &input[start..end];
    let text = std::str::from_utf8(digits).map_err(|_| err("non-UTF8 integer", start))?;

    if strict {
        let unsigned = text.strip_prefix('-').unwrap_or(text);
        if unsigned.len() > 1 && unsigned.starts_with('0') {
            return Err(err("leading zero in integer", start));
        }
        if text == "-0" {
            return Err(err("negative zero is not canonical", start));
        }
    }

    let value: i64 = text.parse().map_err(|_| err(format!("invalid integer '{text}'"), start))?;
    *pos = end + 1;
    Ok(value)
}

fn decode_bytes(input: &[u8], pos: &mut usize) -> Result<Vec<u8>, BencodeError> {
    let start = *pos;
    let colon = find(input, b':', start).ok_or_else(|| err("missing ':' in byte string", start))?;
    let len_str = std::str::from_utf8(&input[start..colon]).map_err(|_| err("non-UTF8 length", start))?;
    let len: usize = len_str.parse().map_err(|_| err(format!("invalid byte-string length '{len_str}'"), start))?;
    let data_start = colon + 1;
    let data_end = data_start + len;
    if data_end > input.len() {
        return Err(err("byte string runs past end of input", data_start));
    }
    *pos = data_end;
    Ok(input[data_start..data_end].to_vec())
}

fn decode_list(input: &[u8], pos: &mut usize, strict: bool) -> Result<BValue, BencodeError> {
    debug_assert_eq!(input[*pos], b'l');
    *pos += 1;
    let mut items = Vec::new();
    loop {
        match input.get(*pos) {
            Some(b'e') => {
                *pos += 1;
                return Ok(BValue::List(items));
            }
            Some(_) => items.push(decode_value(input, pos, strict)?),
            None => return Err(err("unterminated list", *pos)),
        }
    }
}

fn decode_dict(input: &[u8], pos: &mut usize, strict: bool) -> Result<BValue, BencodeError> {
    debug_assert_eq!(input[*pos], b'd');
    *pos += 1;
    let mut map = BTreeMap::new();
    let mut last_key: Option<Vec<u8>> = None;
    loop {
        match input.get(*pos) {
            Some(b'e') => {
                *pos += 1;
                return Ok(BValue::Dict(map));
            }
            Some(_) => {
                let key_start = *pos;
                let key = decode_bytes(input, pos)?;
                if strict {
                    if let Some(prev) = &last_key {
                        if key.as_slice() <= prev.as_slice() {
                            return Err(err("dictionary keys not in canonical order", key_start));
                        }
                    }
                }
                let value = decode_value(input, pos, strict)?;
                last_key = Some(key.clone());
                map.insert(key, value);
            }
            None => return Err(err("unterminated dictionary", *pos)),
        }
    }
}

fn find(haystack: &[u8], needle: u8, from: usize) -> Option<usize> {
    haystack[from..].iter().position(|&b| b == needle).map(|p| p + from)
}

fn err(message: impl Into<String>, offset: usize) -> BencodeError {
    BencodeError { message: message.into(), offset }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ping_command() {
        let mut dict = BValue::dict();
        dict.insert(b"command".to_vec(), BValue::str("ping"));
        let encoded = encode(&BValue::Dict(dict));
        assert_eq!(encoded, b"d7:command4:pinge");

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.get("command").and_then(|v| v.as_str()), Some("ping"));
    }

    #[test]
    fn encodes_keys_in_lexicographic_order_regardless_of_insertion() {
        let mut dict = BValue::dict();
        dict.insert(b"sdp".to_vec(), BValue::str("v=0"));
        dict.insert(b"command".to_vec(), BValue::str("offer"));
        dict.insert(b"call-id".to_vec(), BValue::str("abc"));
        let encoded = encode(&BValue::Dict(dict));
        // call-id < command < sdp lexicographically.
        let text = String::from_utf8_lossy(&encoded);
        assert!(text.find("call-id").unwrap() < text.find("command").unwrap());
        assert!(text.find("command").unwrap() < text.find("sdp").unwrap());
    }

    #[test]
    fn decodes_list_of_flags() {
        let decoded = decode(b"l14:trust-address8:symmetrice").unwrap();
        let items = decoded.as_list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_str(), Some("trust-address"));
    }

    #[test]
    fn decodes_non_ascii_byte_string_values() {
        let raw_value: &[u8] = &[0xff, 0xfe, 0x00, 0x41];
        let mut payload = format!("d3:sdp{}:", raw_value.len()).into_bytes();
        payload.extend_from_slice(raw_value);
        payload.push(b'e');
        let decoded = decode(&payload).unwrap();
        assert_eq!(decoded.get("sdp").and_then(|v| v.as_bytes()), Some(raw_value));
    }

    #[test]
    fn strict_decode_rejects_leading_zero() {
        assert!(decode_strict(b"i04e").is_err());
        assert!(decode(b"i04e").is_ok());
    }

    #[test]
    fn strict_decode_rejects_out_of_order_keys() {
        assert!(decode_strict(b"d3:sdp3:abc7:command4:pinge").is_err());
        assert!(decode(b"d3:sdp3:abc7:command4:pinge").is_ok());
    }

    #[test]
    fn decode_rejects_truncated_byte_string() {
        assert!(decode(b"10:short").is_err());
    }
}
