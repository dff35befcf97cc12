use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;

use crate::metadata::bencode::{self, BencodeError, BencodeValue};

/// 20-byte SHA-1 of the canonical encoding of a torrent's info dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn of(bytes: &[u8]) -> Self {
        InfoHash(Sha1::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    pub tracker_url: Option<String>,
    pub name: Option<String>,
    pub total_length: u64,
    pub piece_length: u64,
    pub info_hash: InfoHash,
    pub piece_hashes: Vec<[u8; 20]>,
    comment: Option<String>,
    created_by: Option<String>,
    creation_date: Option<u64>,
}

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("torrent is not a bencoded dictionary")]
    FileIsNotDictionary,
    #[error("missing required key `{0}`")]
    MissingRequiredKey(&'static str),
    #[error("`{0}` is not a string")]
    KeyDoesNotMapToString(&'static str),
    #[error("`{0}` is not an integer")]
    KeyDoesNotMapToInteger(&'static str),
    #[error("`{0}` is not a dictionary")]
    KeyDoesNotMapToDictionary(&'static str),
    #[error("`{0}` is negative ({1})")]
    NegativeInteger(&'static str, i64),
    #[error("piece length must be positive")]
    ZeroPieceLength,
    #[error("piece length {0} exceeds the largest addressable piece ({max})", max = MAX_PIECE_LENGTH)]
    PieceLengthTooLarge(u64),
    #[error("pieces blob has length {0}, not a multiple of 20")]
    InvalidPiecesLength(usize),
    #[error("{actual} piece hashes but {expected} pieces of the given length")]
    PieceCountMismatch { expected: u64, actual: usize },
    #[error("multi-file torrents are not supported")]
    MultipleFilesUnsupported,
    #[error("invalid bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("unable to read torrent file: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, TorrentError>;

/// Block offsets within a piece travel as 32-bit integers.
pub const MAX_PIECE_LENGTH: u64 = u32::MAX as u64;

const ANNOUNCE: &[u8] = b"announce";
const COMMENT: &[u8] = b"comment";
const CREATED_BY: &[u8] = b"created by";
const CREATION_DATE: &[u8] = b"creation date";
const INFO: &[u8] = b"info";
const NAME: &[u8] = b"name";
const LENGTH: &[u8] = b"length";
const PIECE_LENGTH: &[u8] = b"piece length";
const PIECES: &[u8] = b"pieces";
const FILES: &[u8] = b"files";

impl TryFrom<&BencodeValue> for TorrentMetadata {
    type Error = TorrentError;

    fn try_from(value: &BencodeValue) -> Result<Self> {
        let items = value.as_dictionary().ok_or(TorrentError::FileIsNotDictionary)?;
        // Without an `info` key the dictionary itself is the info dictionary,
        // which is what a peer sends during metadata exchange.
        let (info, info_items) = match items.get(INFO) {
            Some(info) => {
                let info_items = info.as_dictionary().ok_or(TorrentError::KeyDoesNotMapToDictionary("info"))?;
                (info, info_items)
            }
            None => (value, items),
        };

        if info_items.contains_key(FILES) {
            return Err(TorrentError::MultipleFilesUnsupported);
        }

        let total_length = extract_uint(info_items.get(LENGTH), "length", true)?.unwrap_or_default();
        let piece_length = extract_uint(info_items.get(PIECE_LENGTH), "piece length", true)?.unwrap_or_default();
        if piece_length == 0 {
            return Err(TorrentError::ZeroPieceLength);
        }
        if piece_length > MAX_PIECE_LENGTH {
            return Err(TorrentError::PieceLengthTooLarge(piece_length));
        }
        let piece_hashes = extract_pieces(info_items.get(PIECES))?;
        let expected = total_length.div_ceil(piece_length);
        if expected != piece_hashes.len() as u64 {
            return Err(TorrentError::PieceCountMismatch { expected, actual: piece_hashes.len() });
        }

        let info_hash = InfoHash::of(&bencode::encode(info));
        debug!(%info_hash, total_length, piece_length, "extracted torrent metadata");

        Ok(TorrentMetadata {
            tracker_url: extract_string(items.get(ANNOUNCE), "announce")?,
            name: extract_string(info_items.get(NAME), "name")?,
            total_length,
            piece_length,
            info_hash,
            piece_hashes,
            comment: extract_string(items.get(COMMENT), "comment")?,
            created_by: extract_string(items.get(CREATED_BY), "created by")?,
            creation_date: extract_uint(items.get(CREATION_DATE), "creation date", false)?,
        })
    }
}

impl TorrentMetadata {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value = bencode::decode(bytes)?;
        TorrentMetadata::try_from(&value)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn with_tracker_url(mut self, url: Option<String>) -> Self {
        if url.is_some() {
            self.tracker_url = url;
        }
        self
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`; only the final piece may be shorter.
    pub fn piece_len(&self, index: u32) -> Option<u64> {
        let count = self.piece_count() as u64;
        let index = index as u64;
        if index >= count {
            None
        } else if index == count - 1 {
            Some(self.total_length - self.piece_length * (count - 1))
        } else {
            Some(self.piece_length)
        }
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }
}

impl fmt::Display for TorrentMetadata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(url) = &self.tracker_url {
            writeln!(f, "Tracker URL: {}", url)?;
        }
        writeln!(f, "Length: {}", self.total_length)?;
        writeln!(f, "Info Hash: {}", self.info_hash)?;
        writeln!(f, "Piece Length: {}", self.piece_length)?;
        writeln!(f, "Piece Hashes:")?;
        for hash in &self.piece_hashes {
            writeln!(f, "{}", hex::encode(hash))?;
        }
        Ok(())
    }
}

impl TorrentMetadata {
    /// The optional descriptive fields, one per line.
    pub fn details(&self) -> String {
        let mut lines = Vec::new();
        if let Some(name) = &self.name {
            lines.push(format!("name: {}", name));
        }
        if let Some(date) = self.creation_date {
            lines.push(format!("created: {} seconds since epoch", date));
        }
        if let Some(text) = &self.comment {
            lines.push(format!("comment: {}", text));
        }
        if let Some(author) = &self.created_by {
            lines.push(format!("created by: {}", author));
        }
        lines.join("\n")
    }
}

fn extract_string(value: Option<&BencodeValue>, name: &'static str) -> Result<Option<String>> {
    match value {
        Some(BencodeValue::ByteString(bytes)) => Ok(Some(String::from_utf8_lossy(bytes).into_owned())),
        Some(_) => Err(TorrentError::KeyDoesNotMapToString(name)),
        None => Ok(None),
    }
}

pub(crate) fn extract_uint(value: Option<&BencodeValue>, name: &'static str, mandatory: bool) -> Result<Option<u64>> {
    match value {
        Some(BencodeValue::Integer(num)) if *num < 0 => Err(TorrentError::NegativeInteger(name, *num)),
        Some(BencodeValue::Integer(num)) => Ok(Some(*num as u64)),
        Some(_) => Err(TorrentError::KeyDoesNotMapToInteger(name)),
        None if mandatory => Err(TorrentError::MissingRequiredKey(name)),
        None => Ok(None),
    }
}

fn extract_pieces(value: Option<&BencodeValue>) -> Result<Vec<[u8; 20]>> {
    match value {
        Some(BencodeValue::ByteString(s)) => {
            if s.len() % 20 != 0 {
                return Err(TorrentError::InvalidPiecesLength(s.len()));
            }
            Ok(s.chunks_exact(20)
                .map(|chunk| {
                    let mut hash = [0u8; 20];
                    hash.copy_from_slice(chunk);
                    hash
                })
                .collect())
        }
        Some(_) => Err(TorrentError::KeyDoesNotMapToString("pieces")),
        None => Err(TorrentError::MissingRequiredKey("pieces")),
    }
}

/// Builds the info dictionary for a single file with the given content.
/// Test fixtures use it to stand up torrents and seeders.
pub fn single_file_info(name: &str, piece_length: u64, content: &[u8]) -> BencodeValue {
    let pieces: Vec<u8> = content
        .chunks(piece_length.max(1) as usize)
        .flat_map(|piece| Sha1::digest(piece).to_vec())
        .collect();
    let mut items = BTreeMap::new();
    items.insert(LENGTH.to_vec(), BencodeValue::Integer(content.len() as i64));
    items.insert(NAME.to_vec(), BencodeValue::from(name));
    items.insert(PIECE_LENGTH.to_vec(), BencodeValue::Integer(piece_length as i64));
    items.insert(PIECES.to_vec(), BencodeValue::ByteString(pieces));
    BencodeValue::Dictionary(items)
}
