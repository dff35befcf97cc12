use thiserror::Error;

use crate::metadata::bencode::BencodeError;
use crate::metadata::file::TorrentError;
use crate::metadata::magnet::MagnetError;
use crate::metadata::tracker::TrackerError;
use crate::peer::PeerError;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no peer could be connected")]
    NoPeers,
    #[error("pieces {0:?} could not be downloaded")]
    MissingPieces(Vec<u32>),
    #[error("piece index {index} out of range (torrent has {count} pieces)")]
    InvalidPieceIndex { index: u32, count: usize },
    #[error("no tracker url to announce to")]
    MissingTracker,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    #[error(transparent)]
    Torrent(#[from] TorrentError),
    #[error(transparent)]
    Magnet(#[from] MagnetError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("unable to write output: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
