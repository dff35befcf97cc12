use std::fmt;
use std::str::FromStr;

use percent_encoding::percent_decode_str;
use thiserror::Error;

use crate::metadata::file::InfoHash;

const PREFIX: &str = "magnet:?";
const BTIH: &str = "urn:btih:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub trackers: Vec<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MagnetError {
    #[error("magnet links must start with `magnet:?`")]
    MissingPrefix,
    #[error("malformed query pair `{0}`")]
    MalformedPair(String),
    #[error("query pair `{0}` is not valid UTF-8 once decoded")]
    InvalidEncoding(String),
    #[error("missing `xt` parameter")]
    MissingInfoHash,
    #[error("`xt` must be urn:btih:<40 hex digits>, got `{0}`")]
    InvalidInfoHash(String),
}

impl FromStr for MagnetLink {
    type Err = MagnetError;

    fn from_str(uri: &str) -> Result<Self, MagnetError> {
        let query = uri.strip_prefix(PREFIX).ok_or(MagnetError::MissingPrefix)?;

        let mut info_hash = None;
        let mut trackers = Vec::new();
        let mut display_name = None;

        for pair in query.split('&') {
            let mut parts = pair.split('=');
            let (key, value) = match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) => (key, value),
                _ => return Err(MagnetError::MalformedPair(pair.to_string())),
            };
            let value = percent_decode_str(value)
                .decode_utf8()
                .map_err(|_| MagnetError::InvalidEncoding(pair.to_string()))?
                .into_owned();

            match key {
                "xt" => info_hash = Some(parse_btih(&value)?),
                "tr" => trackers.push(value),
                "dn" => display_name = Some(value),
                _ => tracing::debug!(key, "ignoring magnet parameter"),
            }
        }

        Ok(MagnetLink {
            info_hash: info_hash.ok_or(MagnetError::MissingInfoHash)?,
            trackers,
            display_name,
        })
    }
}

fn parse_btih(value: &str) -> Result<InfoHash, MagnetError> {
    let digits = value
        .strip_prefix(BTIH)
        .ok_or_else(|| MagnetError::InvalidInfoHash(value.to_string()))?;
    let mut hash = [0u8; 20];
    hex::decode_to_slice(digits, &mut hash).map_err(|_| MagnetError::InvalidInfoHash(value.to_string()))?;
    Ok(InfoHash(hash))
}

impl MagnetLink {
    pub fn tracker(&self) -> Option<&str> {
        self.trackers.first().map(String::as_str)
    }
}

impl fmt::Display for MagnetLink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(url) = self.tracker() {
            writeln!(f, "Tracker URL: {}", url)?;
        }
        writeln!(f, "Info Hash: {}", self.info_hash)
    }
}
