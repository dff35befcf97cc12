use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use indicatif::ProgressBar;
use tracing::{debug, info, warn};

pub mod config;
pub mod error;
pub mod metadata;
pub mod peer;
pub mod util;

pub use config::{ClientConfig, PeerId};
pub use error::{DownloadError, Error, Result};

use crate::metadata::bencode::{self, BencodeValue};
use crate::metadata::file::{InfoHash, TorrentMetadata};
use crate::metadata::magnet::MagnetLink;
use crate::metadata::tracker::{self, UNKNOWN_LEFT};
use crate::peer::downloader::{self, PeerWorker};
use crate::peer::workqueue::{self, WorkQueue, WorkerPool};
use crate::peer::{PeerConnection, Reserved, extension};

/// Decodes a bencoded value given on the command line.
pub fn decode_value(encoded: &str) -> Result<BencodeValue> {
    Ok(bencode::decode(encoded.as_bytes())?)
}

pub fn parse_torrent<P: AsRef<Path>>(path: P) -> Result<TorrentMetadata> {
    let torrent = TorrentMetadata::from_path(path)?;
    debug!(details = %torrent.details(), "parsed torrent");
    Ok(torrent)
}

pub fn parse_magnet(uri: &str) -> Result<MagnetLink> {
    Ok(uri.parse()?)
}

/// Asks the tracker at `announce` for peers sharing `info_hash`.
pub async fn discover_peers(
    announce: Option<&str>,
    info_hash: &InfoHash,
    left: u64,
    config: &ClientConfig,
) -> Result<Vec<SocketAddr>> {
    let announce = announce.ok_or(DownloadError::MissingTracker)?;
    let url = tracker::announce_url(announce, info_hash, &config.peer_id, config.port, left)?;
    let response = tracker::retrieve_peers(url).await?;
    Ok(response.peers.into_iter().map(SocketAddr::V4).collect())
}

pub async fn torrent_peers(torrent: &TorrentMetadata, config: &ClientConfig) -> Result<Vec<SocketAddr>> {
    discover_peers(torrent.tracker_url.as_deref(), &torrent.info_hash, torrent.total_length, config).await
}

pub async fn handshake(
    address: SocketAddr,
    info_hash: InfoHash,
    reserved: Reserved,
    config: &ClientConfig,
) -> Result<PeerConnection> {
    let connection =
        PeerConnection::connect(address, info_hash, &config.peer_id, reserved, config.connect_timeout).await?;
    Ok(connection)
}

/// Downloads one piece, trying `peers` in order until one delivers it.
pub async fn download_piece(
    torrent: &TorrentMetadata,
    index: u32,
    peers: &[SocketAddr],
    config: &ClientConfig,
) -> Result<Vec<u8>> {
    if index as usize >= torrent.piece_count() {
        return Err(DownloadError::InvalidPieceIndex { index, count: torrent.piece_count() }.into());
    }
    let mut last_error = None;
    for &address in peers {
        match fetch_piece_from(address, torrent, index, config).await {
            Ok(piece) => return Ok(piece),
            Err(e) => {
                warn!(%address, index, error = %e, "piece download failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| DownloadError::NoPeers.into()))
}

async fn fetch_piece_from(
    address: SocketAddr,
    torrent: &TorrentMetadata,
    index: u32,
    config: &ClientConfig,
) -> Result<Vec<u8>> {
    let mut conn = handshake(address, torrent.info_hash, Reserved::NONE, config).await?;
    conn.prepare_download().await?;
    let piece = downloader::download_piece(&mut conn, torrent.piece_length, index, torrent.total_length).await?;
    if config.verify_pieces {
        if let Some(expected) = torrent.piece_hash(index) {
            downloader::verify_piece(index, &piece, expected)?;
        }
    }
    Ok(piece)
}

/// Downloads the whole file with one worker per connected peer.
pub async fn download_file(
    torrent: &TorrentMetadata,
    peers: &[SocketAddr],
    config: &ClientConfig,
    progress: ProgressBar,
) -> Result<Vec<u8>> {
    let connections = peer::connect_peers(peers, torrent.info_hash, config, Reserved::NONE).await;
    if connections.is_empty() {
        return Err(DownloadError::NoPeers.into());
    }

    let piece_count = torrent.piece_count() as u32;
    let shared = Arc::new(torrent.clone());
    let workers = connections
        .into_iter()
        .map(|conn| PeerWorker::new(conn, Arc::clone(&shared), config.verify_pieces))
        .collect();

    progress.set_length(piece_count as u64);
    let results = WorkerPool::new(Arc::new(WorkQueue::seeded(piece_count)), workers)
        .with_progress(progress)
        .run()
        .await;
    let file = workqueue::assemble(results, piece_count)?;
    info!(len = file.len(), "download complete");
    Ok(file)
}

/// Finds a peer for `link` that speaks the extension protocol and completes
/// the extension handshake with it.
pub async fn magnet_handshake(link: &MagnetLink, config: &ClientConfig) -> Result<(PeerConnection, Vec<SocketAddr>)> {
    let peers = discover_peers(link.tracker(), &link.info_hash, UNKNOWN_LEFT, config).await?;
    let conn = extension_peer(&peers, link.info_hash, config).await?;
    Ok((conn, peers))
}

/// Connects to `peers` in order and returns the first connection whose
/// extension handshake succeeds.
pub async fn extension_peer(peers: &[SocketAddr], info_hash: InfoHash, config: &ClientConfig) -> Result<PeerConnection> {
    let mut last_error = None;
    for &address in peers {
        let attempt = async {
            let mut conn = handshake(address, info_hash, Reserved::EXTENSIONS, config).await?;
            extension::handshake(&mut conn).await?;
            Ok::<_, Error>(conn)
        };
        match attempt.await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(%address, error = %e, "extension handshake failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| DownloadError::NoPeers.into()))
}

/// Fetches the info dictionary for `link` from the swarm. Also returns the
/// peers the tracker reported, for a subsequent download.
pub async fn magnet_metadata(link: &MagnetLink, config: &ClientConfig) -> Result<(TorrentMetadata, Vec<SocketAddr>)> {
    let (mut conn, peers) = magnet_handshake(link, config).await?;
    let torrent = extension::request_metadata(&mut conn, link.info_hash)
        .await?
        .with_tracker_url(link.tracker().map(str::to_string));
    info!(info_hash = %torrent.info_hash, pieces = torrent.piece_count(), "metadata received");
    Ok((torrent, peers))
}

pub async fn save<P: AsRef<Path>>(path: P, bytes: &[u8]) -> Result<()> {
    let written = util::io::write_chunks(&path, [bytes]).await?;
    debug!(path = %path.as_ref().display(), written, "output written");
    Ok(())
}
