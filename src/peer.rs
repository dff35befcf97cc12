pub mod connection;
pub mod downloader;
pub mod extension;
pub mod handshake;
pub mod message;
pub mod workqueue;

use std::net::SocketAddr;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::metadata::bencode::BencodeError;
use crate::metadata::file::{InfoHash, TorrentError};

pub use connection::PeerConnection;
pub use handshake::Reserved;
pub use message::MessageId;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out connecting to peer")]
    Timeout,
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("peer answered for a different info hash ({0})")]
    InfoHashMismatch(InfoHash),
    #[error("peer reserved bytes {received:02x?} lack requested capabilities {requested:02x?}")]
    Capability { requested: Reserved, received: Reserved },
    #[error("expected {expected} message, received {received}")]
    UnexpectedMessage { expected: MessageId, received: MessageId },
    #[error("unknown message id {0}")]
    UnknownMessage(u8),
    #[error("message of {0} bytes exceeds the {max} byte frame limit", max = message::MAX_MESSAGE_LEN)]
    MessageTooLarge(usize),
    #[error("{what} payload has {actual} bytes, expected {expected}")]
    UnexpectedLength { what: &'static str, expected: usize, actual: usize },
    #[error("received block ({index}, {begin}) while waiting for ({expected_index}, {expected_begin})")]
    BlockMismatch { expected_index: u32, expected_begin: u32, index: u32, begin: u32 },
    #[error("piece index {index} out of range (torrent has {count} pieces)")]
    InvalidPieceIndex { index: u32, count: u64 },
    #[error("piece {index} does not match its expected hash")]
    HashMismatch { index: u32 },
    #[error("extension protocol error: {0}")]
    Extension(String),
    #[error("bencode error in extension message: {0}")]
    Bencode(#[from] BencodeError),
    #[error("peer rejected the metadata request")]
    MetadataRejected,
    #[error("received metadata hashes to {actual}, expected {expected}")]
    MetadataHashMismatch { expected: InfoHash, actual: InfoHash },
    #[error("unusable torrent metadata: {0}")]
    Torrent(#[from] TorrentError),
}

impl PeerError {
    /// Whether the connection is unusable after this error. A hash mismatch
    /// leaves the stream in sync, so the worker may move on to another piece.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PeerError::HashMismatch { .. } | PeerError::InvalidPieceIndex { .. })
    }
}

/// Connects to up to `config.max_peers` of `peers` concurrently. Peers that
/// fail to connect or handshake are logged and skipped.
pub async fn connect_peers(
    peers: &[SocketAddr],
    info_hash: InfoHash,
    config: &ClientConfig,
    reserved: Reserved,
) -> Vec<PeerConnection> {
    let mut attempts = JoinSet::new();
    for &address in peers {
        let peer_id = config.peer_id;
        let timeout = config.connect_timeout;
        attempts.spawn(async move {
            (address, PeerConnection::connect(address, info_hash, &peer_id, reserved, timeout).await)
        });
    }

    let mut connections = Vec::with_capacity(config.max_peers.min(peers.len()));
    while let Some(joined) = attempts.join_next().await {
        match joined {
            Ok((_, Ok(connection))) => {
                connections.push(connection);
                if connections.len() >= config.max_peers {
                    break;
                }
            }
            Ok((address, Err(e))) => warn!(%address, error = %e, "unable to connect to peer"),
            Err(e) => warn!(error = %e, "connection task failed"),
        }
    }
    // dropping the set aborts attempts still in flight
    debug!(connected = connections.len(), candidates = peers.len(), "peer connections ready");
    connections
}
