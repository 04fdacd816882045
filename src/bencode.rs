//! A minimal bencode decoder/encoder.
//!
//! `serde_bencode` is not used here (unlike most of the rest of this crate's
//! dependency stack) because two things this crate needs cannot be
//! expressed through its derive-based model:
//!
//! - the info-hash must be the SHA-1 of the *exact bytes* of the `info`
//!   dict as they appeared in the `.torrent` file, not a re-encoding of a
//!   deserialized struct (re-encoding can differ in key order or integer
//!   formatting from a hand-written or buggy producer);
//! - the decoder must enforce the resource caps a hostile or malformed
//!   metainfo/tracker response could otherwise use to exhaust memory: a
//!   maximum string length, a maximum integer digit count, and a maximum
//!   nesting depth.
//!
//! Decoded values are a small tagged sum type, keeping dict keys as raw
//! byte strings (BitTorrent dict keys are not guaranteed to be valid UTF-8,
//! though in practice they always are).

use std::{
    collections::BTreeMap,
    fmt,
    ops::Range,
};

/// Bencoded byte strings longer than this are rejected.
pub const MAX_STRING_LEN: usize = 16 * 1024 * 1024;
/// Bencoded integers (and string length prefixes) with more digits than
/// this are rejected.
pub const MAX_INT_DIGITS: usize = 19;
/// Maximum list/dict nesting depth.
pub const MAX_DEPTH: usize = 2048;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    UnexpectedEof,
    InvalidToken(u8),
    InvalidInteger,
    IntegerOverflow,
    LeadingZero,
    NegativeZero,
    StringTooLong,
    NegativeLength,
    NestingTooDeep,
    TrailingData,
    WrongType(&'static str),
    MissingKey(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnexpectedEof => write!(f, "unexpected end of input"),
            Error::InvalidToken(b) => write!(f, "invalid token: {:#04x}", b),
            Error::InvalidInteger => write!(f, "invalid integer literal"),
            Error::IntegerOverflow => write!(f, "integer out of i64 range"),
            Error::LeadingZero => write!(f, "integer has a leading zero"),
            Error::NegativeZero => write!(f, "integer is negative zero"),
            Error::StringTooLong => {
                write!(f, "byte string exceeds {} bytes", MAX_STRING_LEN)
            }
            Error::NegativeLength => write!(f, "byte string length is negative"),
            Error::NestingTooDeep => {
                write!(f, "nesting exceeds {} levels", MAX_DEPTH)
            }
            Error::TrailingData => write!(f, "trailing data after top-level value"),
            Error::WrongType(expected) => write!(f, "expected {}", expected),
            Error::MissingKey(key) => write!(f, "missing required key: {}", key),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` in a dict value, returning `None` if this isn't a
    /// dict or the key is absent.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Canonically re-encodes this value: dict keys in ascending byte
    /// order, length-prefixed strings, no redundant leading zeroes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(n) => {
                out.push(b'i');
                out.extend_from_slice(n.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                // BTreeMap iterates in ascending key order already.
                for (k, v) in map {
                    Value::Bytes(k.clone()).encode_into(out);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

/// Decodes a single top-level bencode value, rejecting any trailing bytes.
pub fn decode(buf: &[u8]) -> Result<Value> {
    let mut dec = Decoder { buf, pos: 0 };
    let value = dec.decode_value(0)?;
    if dec.pos != buf.len() {
        return Err(Error::TrailingData);
    }
    Ok(value)
}

/// Decodes the top-level dict in `buf` and returns the exact byte range
/// (relative to `buf`) of the value stored under `key`, without
/// constructing a [`Value`] for it.
///
/// This is how the metainfo parser obtains the bytes to hash for the
/// info-hash: the range is re-sliced directly out of the original file
/// bytes, so the hash is unaffected by how (or whether) we'd re-encode the
/// dict ourselves.
pub fn top_level_key_span(buf: &[u8], key: &[u8]) -> Result<Range<usize>> {
    let mut dec = Decoder { buf, pos: 0 };
    if dec.current()? != b'd' {
        return Err(Error::WrongType("dict"));
    }
    dec.pos += 1;
    loop {
        match dec.current()? {
            b'e' => {
                dec.pos += 1;
                return Err(Error::MissingKey("info"));
            }
            _ => {
                let k = dec.decode_bytes()?;
                let start = dec.pos;
                dec.decode_value(0)?;
                let end = dec.pos;
                if k == key {
                    return Ok(start..end);
                }
            }
        }
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn current(&self) -> Result<u8> {
        self.buf.get(self.pos).copied().ok_or(Error::UnexpectedEof)
    }

    fn decode_value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::NestingTooDeep);
        }
        match self.current()? {
            b'i' => self.decode_int().map(Value::Int),
            b'l' => self.decode_list(depth).map(Value::List),
            b'd' => self.decode_dict(depth).map(Value::Dict),
            b'0'..=b'9' => self.decode_bytes().map(Value::Bytes),
            other => Err(Error::InvalidToken(other)),
        }
    }

    fn decode_int(&mut self) -> Result<i64> {
        debug_assert_eq!(self.current()?, b'i');
        self.pos += 1;
        let start = self.pos;
        while self.current()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.buf[start..self.pos];
        self.pos += 1; // consume 'e'

        let value = parse_signed_digits(digits)?;
        Ok(value)
    }

    /// Parses the unsigned decimal length prefix of a byte string (the part
    /// before the `:`).
    fn decode_len(&mut self) -> Result<usize> {
        let start = self.pos;
        if self.current()? == b'-' {
            return Err(Error::NegativeLength);
        }
        loop {
            if self.current()? == b':' {
                break;
            }
            self.pos += 1;
        }
        let digits = &self.buf[start..self.pos];
        self.pos += 1; // consume ':'

        if digits.is_empty() {
            return Err(Error::InvalidInteger);
        }
        if digits.len() > MAX_INT_DIGITS {
            return Err(Error::IntegerOverflow);
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(Error::LeadingZero);
        }
        let mut len: u64 = 0;
        for &b in digits {
            if !b.is_ascii_digit() {
                return Err(Error::InvalidInteger);
            }
            len = len
                .checked_mul(10)
                .and_then(|n| n.checked_add((b - b'0') as u64))
                .ok_or(Error::IntegerOverflow)?;
        }
        let len = len as usize;
        if len > MAX_STRING_LEN {
            return Err(Error::StringTooLong);
        }
        Ok(len)
    }

    fn decode_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.decode_len()?;
        if self.pos + len > self.buf.len() {
            return Err(Error::UnexpectedEof);
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn decode_list(&mut self, depth: usize) -> Result<Vec<Value>> {
        debug_assert_eq!(self.current()?, b'l');
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            if self.current()? == b'e' {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.decode_value(depth + 1)?);
        }
    }

    fn decode_dict(&mut self, depth: usize) -> Result<BTreeMap<Vec<u8>, Value>> {
        debug_assert_eq!(self.current()?, b'd');
        self.pos += 1;
        let mut map = BTreeMap::new();
        loop {
            if self.current()? == b'e' {
                self.pos += 1;
                return Ok(map);
            }
            let key = self.decode_bytes()?;
            let value = self.decode_value(depth + 1)?;
            map.insert(key, value);
        }
    }
}

/// Parses a (possibly negative) bencode integer literal, enforcing no
/// leading zero (except the literal `0`), no `-0`, no empty digit run, and
/// no more than [`MAX_INT_DIGITS`] digits.
fn parse_signed_digits(digits: &[u8]) -> Result<i64> {
    if digits.is_empty() {
        return Err(Error::InvalidInteger);
    }
    let (neg, digits) = if digits[0] == b'-' {
        (true, &digits[1..])
    } else {
        (false, digits)
    };
    if digits.is_empty() {
        return Err(Error::InvalidInteger);
    }
    if digits.len() > MAX_INT_DIGITS {
        return Err(Error::IntegerOverflow);
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(Error::LeadingZero);
    }
    if neg && digits == b"0" {
        return Err(Error::NegativeZero);
    }
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(Error::InvalidInteger);
        }
        value = value
            .checked_mul(10)
            .and_then(|n| n.checked_add((b - b'0') as i64))
            .ok_or(Error::IntegerOverflow)?;
    }
    Ok(if neg { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_scalar_types() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-42e").unwrap(), Value::Int(-42));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
        assert_eq!(decode(b"4:spam").unwrap(), Value::Bytes(b"spam".to_vec()));
    }

    #[test]
    fn decode_list_and_dict() {
        let v = decode(b"l4:spam4:eggse").unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::Bytes(b"spam".to_vec()),
                Value::Bytes(b"eggs".to_vec()),
            ])
        );

        let v = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        let dict = v.as_dict().unwrap();
        assert_eq!(dict.get(b"cow".as_ref()).unwrap().as_bytes(), Some(&b"moo"[..]));
        assert_eq!(dict.get(b"spam".as_ref()).unwrap().as_bytes(), Some(&b"eggs"[..]));
    }

    #[test]
    fn decodes_nested_dict_with_mixed_value_types() {
        let input = b"d8:announce14:http://tracker4:infod6:lengthi1024e4:name10:ubuntu.iso6:piecesl3:abc3:defeee";
        let v = decode(input).unwrap();
        let dict = v.as_dict().unwrap();
        assert_eq!(dict.get(b"announce".as_ref()).unwrap().as_str(), Some("http://tracker"));
        let info = dict.get(b"info".as_ref()).unwrap().as_dict().unwrap();
        assert_eq!(info.get(b"length".as_ref()).unwrap().as_int(), Some(1024));
        assert_eq!(info.get(b"name".as_ref()).unwrap().as_str(), Some("ubuntu.iso"));
        let pieces = info.get(b"pieces".as_ref()).unwrap().as_list().unwrap();
        assert_eq!(pieces[0].as_bytes(), Some(&b"abc"[..]));
        assert_eq!(pieces[1].as_bytes(), Some(&b"def"[..]));
    }

    #[test]
    fn rejects_leading_zero() {
        assert!(matches!(decode(b"i03e"), Err(Error::LeadingZero)));
    }

    #[test]
    fn rejects_negative_zero() {
        assert!(matches!(decode(b"i-0e"), Err(Error::NegativeZero)));
    }

    #[test]
    fn rejects_empty_integer() {
        assert!(matches!(decode(b"ie"), Err(Error::InvalidInteger)));
    }

    #[test]
    fn rejects_excess_digits() {
        // 20 digits, one more than the cap.
        let s = format!("i{}e", "1".repeat(20));
        assert!(matches!(decode(s.as_bytes()), Err(Error::IntegerOverflow)));
        // exactly 19 digits (within int64 range) is fine
        let s = format!("i{}e", "1".repeat(19));
        assert!(decode(s.as_bytes()).is_ok());
    }

    #[test]
    fn rejects_trailing_data() {
        assert!(matches!(decode(b"i1eX"), Err(Error::TrailingData)));
    }

    #[test]
    fn rejects_excess_nesting() {
        let mut s = Vec::new();
        for _ in 0..(MAX_DEPTH + 10) {
            s.push(b'l');
        }
        s.extend_from_slice(b"i1e");
        for _ in 0..(MAX_DEPTH + 10) {
            s.push(b'e');
        }
        assert!(matches!(decode(&s), Err(Error::NestingTooDeep)));
    }

    #[test]
    fn round_trip_canonical() {
        let input = b"d3:bar4:spam3:fooi42ee";
        let v = decode(input).unwrap();
        let encoded = v.encode();
        let v2 = decode(&encoded).unwrap();
        assert_eq!(v, v2);
        // keys come out sorted ascending regardless of decode order
        assert_eq!(encoded, input.to_vec());
    }

    #[test]
    fn top_level_key_span_matches_raw_bytes() {
        let input = b"d8:announce14:http://tracker4:infod6:lengthi1024e4:name4:abcdeee";
        let span = top_level_key_span(input, b"info").unwrap();
        let raw = &input[span];
        let decoded_directly = decode(raw).unwrap();
        let whole = decode(input).unwrap();
        assert_eq!(&decoded_directly, whole.get(b"info").unwrap());
    }
}
