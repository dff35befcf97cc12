use std::fmt;
use std::time::Duration;

/// Default listening port reported to the tracker.
pub const DEFAULT_PORT: u16 = 6881;
pub const DEFAULT_MAX_PEERS: usize = 5;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The 20-byte identifier this client presents to trackers and peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// 10 random bytes rendered as 20 lowercase hex characters, so the id is
    /// printable and needs no escaping in the announce URL.
    pub fn generate() -> Self {
        let random: [u8; 10] = rand::random();
        let mut id = [0u8; 20];
        // hex of 10 bytes is exactly 20 bytes long
        if hex::encode_to_slice(random, &mut id).is_err() {
            id = [b'0'; 20];
        }
        PeerId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Settings shared by every command.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub peer_id: PeerId,
    pub port: u16,
    /// Upper bound on simultaneous peer connections during a download.
    pub max_peers: usize,
    pub connect_timeout: Duration,
    /// Check each downloaded piece against its SHA-1 from the metadata.
    pub verify_pieces: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            peer_id: PeerId::generate(),
            port: DEFAULT_PORT,
            max_peers: DEFAULT_MAX_PEERS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            verify_pieces: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_ids_are_hex_and_distinct() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert!(a.as_bytes().iter().all(u8::is_ascii_hexdigit));
        assert_ne!(a, b);
    }

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 6881);
        assert!(config.verify_pieces);
        assert!(config.max_peers > 0);
    }
}
