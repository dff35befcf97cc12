use std::fmt;
use std::net::SocketAddrV4;

use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::get;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::config::PeerId;
use crate::metadata::bencode::{BencodeError, BencodeValue};
use crate::metadata::file::{InfoHash, TorrentError, extract_uint};

/// `left` sent while the file length is still unknown (magnet links).
pub const UNKNOWN_LEFT: u64 = 999;

#[derive(Debug, Clone)]
pub struct TrackerResponse {
    pub interval: u64,
    pub peers: Vec<SocketAddrV4>,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid announce url `{0}`")]
    InvalidAnnounceUrl(String),
    #[error("tracker response is invalid bencode data: {0}")]
    NonBencodedTrackerResponse(#[from] BencodeError),
    #[error("tracker response is not a bencoded dictionary")]
    TrackerResponseNotADictionary,
    #[error("tracker reported failure: {0}")]
    Failure(String),
    #[error("peers list byte length ({0}) is not a multiple of 6")]
    IllegalPeersLength(usize),
    #[error("tracker response missing interval key")]
    MissingInterval,
    #[error("tracker response interval malformed: {0}")]
    MalformedInterval(TorrentError),
    #[error("tracker response missing peers key")]
    MissingPeers,
    #[error("tracker response peers list is not a byte string")]
    MalformedPeersList,
    #[error("no response received from tracker: {0}")]
    NoTrackerResponse(reqwest::Error),
    #[error("tracker response contains no body: {0}")]
    NoTrackerResponseBody(reqwest::Error),
}

const INTERVAL: &[u8] = b"interval";
const PEERS: &[u8] = b"peers";
const FAILURE_REASON: &[u8] = b"failure reason";

/// Parses the compact peer format: 4 bytes of IPv4 address followed by a
/// 2-byte port, both big-endian.
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddrV4>, TrackerError> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::IllegalPeersLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|entry| {
            let ip = [entry[0], entry[1], entry[2], entry[3]];
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            SocketAddrV4::new(ip.into(), port)
        })
        .collect())
}

impl TryFrom<&BencodeValue> for TrackerResponse {
    type Error = TrackerError;

    fn try_from(value: &BencodeValue) -> Result<Self, TrackerError> {
        let items = value.as_dictionary().ok_or(TrackerError::TrackerResponseNotADictionary)?;
        if let Some(reason) = items.get(FAILURE_REASON) {
            return Err(TrackerError::Failure(reason.to_string()));
        }
        let interval = extract_uint(items.get(INTERVAL), "interval", true)
            .map_err(|e| match e {
                TorrentError::MissingRequiredKey(_) => TrackerError::MissingInterval,
                _ => TrackerError::MalformedInterval(e),
            })?
            .unwrap_or_default();
        let peers = match items.get(PEERS) {
            Some(BencodeValue::ByteString(bytes)) => parse_compact_peers(bytes)?,
            Some(_) => return Err(TrackerError::MalformedPeersList),
            None => return Err(TrackerError::MissingPeers),
        };
        Ok(TrackerResponse { interval, peers })
    }
}

impl fmt::Display for TrackerResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for socket in &self.peers {
            writeln!(f, "{socket}")?;
        }
        Ok(())
    }
}

/// Builds the announce request URL. `info_hash` and `peer_id` are raw bytes
/// and are percent-encoded by hand, since `Url` would re-encode them as UTF-8.
pub fn announce_url(
    announce: &str,
    info_hash: &InfoHash,
    peer_id: &PeerId,
    port: u16,
    left: u64,
) -> Result<Url, TrackerError> {
    let mut url = Url::parse(announce).map_err(|_| TrackerError::InvalidAnnounceUrl(announce.to_string()))?;

    url.query_pairs_mut()
        .append_pair("port", &port.to_string())
        .append_pair("uploaded", "0")
        .append_pair("downloaded", "0")
        .append_pair("left", &left.to_string())
        .append_pair("compact", "1");

    let encoded_hash = percent_encode(info_hash.as_bytes(), NON_ALPHANUMERIC).to_string();
    let encoded_id = percent_encode(peer_id.as_bytes(), NON_ALPHANUMERIC).to_string();
    let new_url_str = format!("{}&info_hash={}&peer_id={}", url, encoded_hash, encoded_id);
    Url::parse(&new_url_str).map_err(|_| TrackerError::InvalidAnnounceUrl(new_url_str))
}

pub async fn retrieve_peers(url: Url) -> Result<TrackerResponse, TrackerError> {
    debug!(%url, "announcing to tracker");
    let response = get(url).await.map_err(TrackerError::NoTrackerResponse)?;
    let response_bytes = response.bytes().await.map_err(TrackerError::NoTrackerResponseBody)?;

    let bencoded_response = BencodeValue::try_from(response_bytes.as_ref())?;
    let tracker_response = TrackerResponse::try_from(&bencoded_response)?;
    info!(peers = tracker_response.peers.len(), interval = tracker_response.interval, "tracker responded");

    Ok(tracker_response)
}
