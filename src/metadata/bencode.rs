use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// A decoded bencode value.
///
/// Dictionaries are kept in a `BTreeMap`, so iteration (and therefore
/// encoding) always visits keys in ascending byte order. The info hash of a
/// torrent depends on that ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<BencodeValue>),
    Dictionary(BTreeMap<Vec<u8>, BencodeValue>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("input ended before the value at offset {pos} was complete")]
    Truncated { pos: usize },
    #[error("unknown type specifier {value:#04x} at offset {pos}")]
    UnknownType { pos: usize, value: u8 },
    #[error("malformed integer at offset {pos}")]
    IllegalInteger { pos: usize },
    #[error("malformed byte string length at offset {pos}")]
    IllegalStringLength { pos: usize },
    #[error("expected ':' after byte string length at offset {pos}")]
    StringMissingSeparator { pos: usize },
    #[error("duplicate dictionary key {name:?}")]
    DuplicateDictionaryKey { name: String },
    #[error("{num_remaining} unconsumed bytes after the value")]
    UnconsumedContents { num_remaining: usize },
    #[error("lists and dictionaries nested deeper than {MAX_DEPTH} levels at offset {pos}")]
    NestingTooDeep { pos: usize },
}

/// Deepest list/dictionary nesting accepted from untrusted input.
pub const MAX_DEPTH: usize = 64;

type Result<T> = std::result::Result<T, BencodeError>;

/// Decodes exactly one value; trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<BencodeValue> {
    let (value, consumed) = decode_prefix(bytes)?;
    if consumed != bytes.len() {
        return Err(BencodeError::UnconsumedContents { num_remaining: bytes.len() - consumed });
    }
    Ok(value)
}

/// Decodes the value at the start of `bytes` and returns it together with
/// the number of bytes it occupied.
pub fn decode_prefix(bytes: &[u8]) -> Result<(BencodeValue, usize)> {
    let mut parser = BencodeParser { contents: bytes, pos: 0, depth: 0 };
    let value = parser.parse_value()?;
    Ok((value, parser.pos))
}

/// Canonical encoding: dictionary keys are emitted in ascending order.
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &BencodeValue, out: &mut Vec<u8>) {
    match value {
        BencodeValue::Integer(i) => out.extend(format!("i{i}e").as_bytes()),
        BencodeValue::ByteString(bytes) => encode_bytes(bytes, out),
        BencodeValue::List(elements) => {
            out.push(b'l');
            for element in elements {
                encode_into(element, out);
            }
            out.push(b'e');
        }
        BencodeValue::Dictionary(items) => {
            out.push(b'd');
            for (key, value) in items {
                encode_bytes(key, out);
                encode_into(value, out);
            }
            out.push(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend(format!("{}:", bytes.len()).as_bytes());
    out.extend_from_slice(bytes);
}

impl From<&BencodeValue> for Vec<u8> {
    fn from(value: &BencodeValue) -> Vec<u8> {
        encode(value)
    }
}

impl TryFrom<&[u8]> for BencodeValue {
    type Error = BencodeError;
    fn try_from(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

impl From<i64> for BencodeValue {
    fn from(i: i64) -> Self {
        BencodeValue::Integer(i)
    }
}

impl From<&str> for BencodeValue {
    fn from(s: &str) -> Self {
        BencodeValue::ByteString(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for BencodeValue {
    fn from(bytes: Vec<u8>) -> Self {
        BencodeValue::ByteString(bytes)
    }
}

impl BencodeValue {
    /// Builds a dictionary from `(key, value)` pairs. Later pairs win on
    /// duplicate keys.
    pub fn dictionary<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, BencodeValue)>,
    {
        BencodeValue::Dictionary(
            pairs.into_iter().map(|(k, v)| (k.as_bytes().to_vec(), v)).collect(),
        )
    }

    pub fn as_dictionary(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dictionary(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::ByteString(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Looks up `key` when `self` is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dictionary().and_then(|items| items.get(key))
    }

    /// JSON rendering used by the `decode` command. Byte strings become
    /// (lossy) UTF-8 strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            BencodeValue::Integer(i) => serde_json::Value::from(*i),
            BencodeValue::ByteString(bytes) => {
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            BencodeValue::List(elements) => {
                serde_json::Value::Array(elements.iter().map(BencodeValue::to_json).collect())
            }
            BencodeValue::Dictionary(items) => serde_json::Value::Object(
                items
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn write_bytes(bytes: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    for byte in bytes {
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

fn write_byte_string(bytes: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(bytes) {
        Ok(s) if bytes.iter().all(|&byte| (0x20..=0x7e).contains(&byte)) => write!(f, "{}", s),
        _ => write_bytes(bytes, f),
    }
}

impl fmt::Display for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BencodeValue::Integer(num) => write!(f, "{}", num),
            BencodeValue::ByteString(bytes) => write_byte_string(bytes, f),
            BencodeValue::List(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, "]")
            }
            BencodeValue::Dictionary(items) => {
                write!(f, "{{")?;
                for (i, (key, value)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write_byte_string(key, f)?;
                    write!(f, " => {}", value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

struct BencodeParser<'a> {
    contents: &'a [u8],
    pos: usize,
    depth: usize,
}

impl BencodeParser<'_> {
    fn peek(&self) -> Result<u8> {
        self.contents
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::Truncated { pos: self.pos })
    }

    fn parse_value(&mut self) -> Result<BencodeValue> {
        let first = self.peek()?;
        match first {
            b'i' => self.parse_integer(),
            b'l' => self.nested(Self::parse_list),
            b'd' => self.nested(Self::parse_dictionary),
            b'0'..=b'9' => self.parse_string().map(BencodeValue::ByteString),
            _ => Err(BencodeError::UnknownType { pos: self.pos, value: first }),
        }
    }

    fn nested(&mut self, parse: fn(&mut Self) -> Result<BencodeValue>) -> Result<BencodeValue> {
        if self.depth >= MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep { pos: self.pos });
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    /// Advances to the next `terminator` and returns the bytes before it.
    fn take_until(&mut self, terminator: u8) -> Result<&[u8]> {
        let start = self.pos;
        loop {
            if self.peek()? == terminator {
                break;
            }
            self.pos += 1;
        }
        Ok(&self.contents[start..self.pos])
    }

    fn parse_integer(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let start = self.pos;
        let digits = self.take_until(b'e')?;
        let value = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BencodeError::IllegalInteger { pos: start })?;
        self.pos += 1;
        Ok(BencodeValue::Integer(value))
    }

    fn parse_string(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        if self.peek()? != b':' {
            return Err(BencodeError::StringMissingSeparator { pos: self.pos });
        }
        let length = std::str::from_utf8(&self.contents[start..self.pos])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(BencodeError::IllegalStringLength { pos: start })?;
        self.pos += 1;

        let end = self
            .pos
            .checked_add(length)
            .filter(|&end| end <= self.contents.len())
            .ok_or(BencodeError::Truncated { pos: self.contents.len() })?;
        let bytes = self.contents[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let mut values = Vec::new();
        while self.peek()? != b'e' {
            values.push(self.parse_value()?);
        }
        self.pos += 1;
        Ok(BencodeValue::List(values))
    }

    fn parse_dictionary(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let first = self.peek()?;
            if !first.is_ascii_digit() {
                return Err(BencodeError::UnknownType { pos: self.pos, value: first });
            }
            let key = self.parse_string()?;
            let value = self.parse_value()?;
            if map.contains_key(&key) {
                return Err(BencodeError::DuplicateDictionaryKey {
                    name: String::from_utf8_lossy(&key).into_owned(),
                });
            }
            map.insert(key, value);
        }
        self.pos += 1;
        Ok(BencodeValue::Dictionary(map))
    }
}
