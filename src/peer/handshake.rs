use crate::config::PeerId;
use crate::metadata::file::InfoHash;
use crate::peer::PeerError;

pub const HANDSHAKE_LEN: usize = 68;
const P_STR: &[u8] = b"BitTorrent protocol";

/// The 8 reserved handshake bytes, used as capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reserved(pub [u8; 8]);

impl Reserved {
    /// Advertises support for the extension protocol (bit 0x10 of byte 5).
    pub const EXTENSIONS: Reserved = Reserved([0, 0, 0, 0, 0, 0x10, 0, 0]);
    pub const NONE: Reserved = Reserved([0; 8]);

    /// True when every bit set in `requested` is also set in `self`.
    pub fn contains(&self, requested: &Reserved) -> bool {
        self.0.iter().zip(requested.0.iter()).all(|(have, want)| have & want == *want)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: Reserved,
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: &PeerId, reserved: Reserved) -> Self {
        Handshake { reserved, info_hash, peer_id: *peer_id.as_bytes() }
    }
}

impl TryFrom<&[u8]> for Handshake {
    type Error = PeerError;
    fn try_from(bytes: &[u8]) -> Result<Self, PeerError> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake(format!("expected {HANDSHAKE_LEN} bytes, got {}", bytes.len())));
        }
        if bytes[0] as usize != P_STR.len() || &bytes[1..20] != P_STR {
            return Err(PeerError::InvalidHandshake(format!(
                "unexpected protocol identifier {:?}",
                String::from_utf8_lossy(&bytes[1..20])
            )));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);
        Ok(Handshake { reserved: Reserved(reserved), info_hash: InfoHash(info_hash), peer_id })
    }
}

impl From<&Handshake> for [u8; HANDSHAKE_LEN] {
    fn from(handshake: &Handshake) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0] = P_STR.len() as u8;
        bytes[1..20].copy_from_slice(P_STR);
        bytes[20..28].copy_from_slice(&handshake.reserved.0);
        bytes[28..48].copy_from_slice(handshake.info_hash.as_bytes());
        bytes[48..68].copy_from_slice(&handshake.peer_id);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_layout() {
        let handshake = Handshake::new(InfoHash([7; 20]), &PeerId([9; 20]), Reserved::EXTENSIONS);
        let bytes = <[u8; HANDSHAKE_LEN]>::from(&handshake);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(bytes[25], 0x10);
        assert_eq!(&bytes[28..48], &[7; 20]);
        assert_eq!(&bytes[48..68], &[9; 20]);
        assert_eq!(Handshake::try_from(bytes.as_slice()).unwrap(), handshake);
    }

    #[test]
    fn rejects_foreign_protocols() {
        let mut bytes = <[u8; HANDSHAKE_LEN]>::from(&Handshake::new(InfoHash([0; 20]), &PeerId([0; 20]), Reserved::NONE));
        bytes[1] = b'b';
        assert!(matches!(Handshake::try_from(bytes.as_slice()), Err(PeerError::InvalidHandshake(_))));
        assert!(matches!(Handshake::try_from(&bytes[..67]), Err(PeerError::InvalidHandshake(_))));
    }

    #[test]
    fn reserved_superset_check() {
        let mut remote = Reserved::EXTENSIONS;
        remote.0[7] = 0x05;
        assert!(remote.contains(&Reserved::EXTENSIONS));
        assert!(remote.contains(&Reserved::NONE));
        assert!(!Reserved::NONE.contains(&Reserved::EXTENSIONS));
    }
}
