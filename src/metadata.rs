pub mod bencode;
pub mod file;
pub mod magnet;
pub mod tracker;

pub use bencode::{BencodeError, BencodeValue};
pub use file::{InfoHash, TorrentError, TorrentMetadata};
pub use magnet::{MagnetError, MagnetLink};
pub use tracker::{TrackerError, TrackerResponse};
