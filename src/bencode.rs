use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

// Nested lists/dicts deeper than this are rejected instead of recursing without bound.
const MAX_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("malformed bencode at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("integer does not fit in 64 bits at offset {offset}")]
    IntegerOverflow { offset: usize },
}

/// A decoded bencode value. Dicts are kept in a `BTreeMap` so encoding always
/// emits keys in ascending byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(b.into())
    }

    pub fn dict<const N: usize>(entries: [(&str, Value); N]) -> Self {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect(),
        )
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
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

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Bytes(b) => benc_bytes(out, b),
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(entries) => {
                out.push(b'd');
                for (k, v) in entries {
                    benc_bytes(out, k);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

fn benc_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// Decodes exactly one value; trailing bytes are an error.
pub fn decode(raw: &[u8]) -> Result<Value, BencodeError> {
    let (value, tail) = decode_prefix(raw)?;
    if !tail.is_empty() {
        return Err(BencodeError::Malformed {
            offset: raw.len() - tail.len(),
            reason: "trailing data after value",
        });
    }
    Ok(value)
}

/// Decodes one value from the front of `raw` and returns the unconsumed tail.
///
/// ut_metadata data messages are a bencoded dict immediately followed by the
/// raw piece bytes, so the tail is part of the result rather than an error.
pub fn decode_prefix(raw: &[u8]) -> Result<(Value, &[u8]), BencodeError> {
    let mut p = BencParser::new(raw);
    let value = p.parse_value(0)?;
    Ok((value, &raw[p.pos..]))
}

struct BencParser<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> BencParser<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self { raw, pos: 0 }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.raw
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn malformed(&self, reason: &'static str) -> BencodeError {
        BencodeError::Malformed {
            offset: self.pos,
            reason,
        }
    }

    fn expect_byte(&mut self, b: u8) -> Result<(), BencodeError> {
        if self.peek()? != b {
            return Err(self.malformed("unexpected byte"));
        }
        self.pos += 1;
        Ok(())
    }

    fn parse_value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(self.malformed("nesting too deep"));
        }
        match self.peek()? {
            b'i' => self.parse_int().map(Value::Int),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.parse_value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut entries = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key_offset = self.pos;
                    let key = self.parse_bytes()?.to_vec();
                    let value = self.parse_value(depth + 1)?;
                    match entries.entry(key) {
                        Entry::Vacant(slot) => {
                            slot.insert(value);
                        }
                        Entry::Occupied(_) => {
                            return Err(BencodeError::Malformed {
                                offset: key_offset,
                                reason: "duplicate dict key",
                            });
                        }
                    }
                }
                self.pos += 1;
                Ok(Value::Dict(entries))
            }
            b'0'..=b'9' => self.parse_bytes().map(|b| Value::Bytes(b.to_vec())),
            _ => Err(self.malformed("unknown value type")),
        }
    }

    fn parse_bytes(&mut self) -> Result<&'a [u8], BencodeError> {
        let len = self.parse_usize()?;
        self.expect_byte(b':')?;
        let start = self.pos;
        let end = start
            .checked_add(len)
            .ok_or_else(|| self.malformed("string length overflows"))?;
        let out = self.raw.get(start..end).ok_or(BencodeError::UnexpectedEof)?;
        self.pos = end;
        Ok(out)
    }

    fn parse_usize(&mut self) -> Result<usize, BencodeError> {
        let start = self.pos;
        let mut n: usize = 0;
        while let Some(&b) = self.raw.get(self.pos) {
            if !b.is_ascii_digit() {
                break;
            }
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add((b - b'0') as usize))
                .ok_or(BencodeError::IntegerOverflow { offset: start })?;
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.peek().err().unwrap_or(self.malformed("expected string length")));
        }
        Ok(n)
    }

    fn parse_int(&mut self) -> Result<i64, BencodeError> {
        let start = self.pos;
        self.expect_byte(b'i')?;
        let negative = self.peek()? == b'-';
        if negative {
            self.pos += 1;
        }
        let digits_start = self.pos;
        let mut n: i64 = 0;
        loop {
            let b = self.peek()?;
            if b == b'e' {
                break;
            }
            if !b.is_ascii_digit() {
                return Err(self.malformed("invalid integer digit"));
            }
            let digit = (b - b'0') as i64;
            // Accumulate towards the sign so i64::MIN is representable.
            n = n
                .checked_mul(10)
                .and_then(|n| if negative { n.checked_sub(digit) } else { n.checked_add(digit) })
                .ok_or(BencodeError::IntegerOverflow { offset: start })?;
            self.pos += 1;
        }
        let digits = &self.raw[digits_start..self.pos];
        if digits.is_empty() {
            return Err(self.malformed("empty integer"));
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(self.malformed("leading zero in integer"));
        }
        if negative && digits == b"0" {
            return Err(self.malformed("negative zero"));
        }
        self.pos += 1;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_extension_handshake_and_keeps_tail() {
        let raw = b"d1:md11:ut_metadatai1ee13:metadata_sizei22528eeDENEME";
        let (value, tail) = decode_prefix(raw).unwrap();

        assert_eq!(
            value,
            Value::dict([
                ("m", Value::dict([("ut_metadata", Value::Int(1))])),
                ("metadata_size", Value::Int(22528)),
            ])
        );
        assert_eq!(tail, b"DENEME");
    }

    #[test]
    fn tail_may_itself_be_bencode() {
        let raw = b"d1:md11:ut_metadatai1ee13:metadata_sizei22528eed3:inti1337ee";
        let (_, tail) = decode_prefix(raw).unwrap();
        assert_eq!(tail, b"d3:inti1337ee");

        let (_, tail) = decode_prefix(b"d1:md11:ut_metadatai1ee13:metadata_sizei22528ee").unwrap();
        assert!(tail.is_empty());
    }

    #[test]
    fn encodes_dict_keys_in_ascending_order() {
        let msg = Value::dict([
            ("y", Value::bytes(*b"q")),
            ("t", Value::bytes(*b"aa")),
            ("q", Value::bytes(*b"ping")),
            ("a", Value::dict([("id", Value::bytes(*b"abcdefghij0123456789"))])),
        ]);
        assert_eq!(
            msg.encode(),
            b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe".to_vec()
        );
    }

    #[test]
    fn round_trips_nested_values() {
        let value = Value::dict([
            ("", Value::bytes(Vec::new())),
            (
                "list",
                Value::List(vec![
                    Value::Int(i64::MIN),
                    Value::Int(i64::MAX),
                    Value::Int(0),
                    Value::List(Vec::new()),
                    Value::Dict(BTreeMap::new()),
                ]),
            ),
            ("raw", Value::bytes(vec![0u8, 255, 10, b':', b'e'])),
        ]);
        assert_eq!(decode(&value.encode()).unwrap(), value);
    }

    #[test]
    fn accepts_unsorted_keys_but_rejects_duplicates() {
        let value = decode(b"d1:bi2e1:ai1ee").unwrap();
        assert_eq!(value.get(b"a").and_then(Value::as_int), Some(1));
        assert_eq!(value.get(b"b").and_then(Value::as_int), Some(2));

        assert!(matches!(
            decode(b"d1:ai1e1:ai2ee"),
            Err(BencodeError::Malformed { reason: "duplicate dict key", .. })
        ));
    }

    #[test]
    fn reports_error_kinds() {
        assert_eq!(decode(b"d1:a"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"5:abc"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"li1e"), Err(BencodeError::UnexpectedEof));
        assert!(matches!(
            decode(b"i9223372036854775808e"),
            Err(BencodeError::IntegerOverflow { .. })
        ));
        assert_eq!(decode(b"i-9223372036854775808e"), Ok(Value::Int(i64::MIN)));
        assert!(matches!(decode(b"i03e"), Err(BencodeError::Malformed { .. })));
        assert!(matches!(decode(b"i-0e"), Err(BencodeError::Malformed { .. })));
        assert!(matches!(decode(b"ie"), Err(BencodeError::Malformed { .. })));
        assert!(matches!(decode(b"x"), Err(BencodeError::Malformed { .. })));
        assert!(matches!(decode(b"i1ei2e"), Err(BencodeError::Malformed { .. })));
    }

    #[test]
    fn rejects_runaway_nesting() {
        let mut raw = vec![b'l'; MAX_DEPTH + 2];
        raw.extend(std::iter::repeat_n(b'e', MAX_DEPTH + 2));
        assert!(matches!(decode(&raw), Err(BencodeError::Malformed { .. })));
    }
}
