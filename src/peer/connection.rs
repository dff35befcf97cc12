use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::PeerId;
use crate::metadata::file::InfoHash;
use crate::peer::PeerError;
use crate::peer::handshake::{HANDSHAKE_LEN, Handshake, Reserved};
use crate::peer::message::{self, MessageHeader, MessageId};

/// An established, handshaken connection to one peer. The socket is closed
/// when the value is dropped.
#[derive(Debug)]
pub struct PeerConnection {
    address: SocketAddr,
    stream: TcpStream,
    requested: Reserved,
    remote: Handshake,
    pub(crate) metadata_extension_id: Option<u8>,
    pub(crate) metadata_size: Option<u64>,
}

/// Writes our handshake and reads the peer's. The peer must speak the same
/// protocol and answer for the same info hash.
pub async fn exchange_handshake<S>(stream: &mut S, ours: &Handshake) -> Result<Handshake, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&<[u8; HANDSHAKE_LEN]>::from(ours)).await?;
    stream.flush().await?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    let theirs = Handshake::try_from(buf.as_slice())?;
    if theirs.info_hash != ours.info_hash {
        return Err(PeerError::InfoHashMismatch(theirs.info_hash));
    }
    Ok(theirs)
}

impl PeerConnection {
    pub async fn connect(
        address: SocketAddr,
        info_hash: InfoHash,
        peer_id: &PeerId,
        reserved: Reserved,
        connect_timeout: Duration,
    ) -> Result<Self, PeerError> {
        debug!(%address, "connecting");
        let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| PeerError::Timeout)??;

        let ours = Handshake::new(info_hash, peer_id, reserved);
        let remote = exchange_handshake(&mut stream, &ours).await?;
        info!(%address, peer_id = %hex::encode(remote.peer_id), "handshake complete");

        Ok(PeerConnection {
            address,
            stream,
            requested: reserved,
            remote,
            metadata_extension_id: None,
            metadata_size: None,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn peer_id(&self) -> &[u8; 20] {
        &self.remote.peer_id
    }

    pub fn remote_reserved(&self) -> Reserved {
        self.remote.reserved
    }

    pub fn supports_extensions(&self) -> bool {
        self.remote.reserved.contains(&Reserved::EXTENSIONS)
    }

    /// Fails when the peer did not echo every capability bit we asked for.
    pub fn ensure_extensions(&self) -> Result<(), PeerError> {
        if self.remote.reserved.contains(&self.requested) {
            Ok(())
        } else {
            Err(PeerError::Capability { requested: self.requested, received: self.remote.reserved })
        }
    }

    /// The peer's `ut_metadata` message id, once the extension handshake ran.
    pub fn metadata_extension_id(&self) -> Option<u8> {
        self.metadata_extension_id
    }

    pub fn metadata_size(&self) -> Option<u64> {
        self.metadata_size
    }

    pub async fn send(&mut self, id: MessageId, payload: &[u8]) -> Result<(), PeerError> {
        message::write_message(&mut self.stream, id, payload).await
    }

    pub async fn receive_header(&mut self) -> Result<MessageHeader, PeerError> {
        message::read_header(&mut self.stream).await
    }

    pub async fn read_payload(&mut self, len: usize) -> Result<Vec<u8>, PeerError> {
        message::read_payload(&mut self.stream, len).await
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), PeerError> {
        self.stream.read_exact(buf).await?;
        Ok(())
    }

    pub async fn discard(&mut self, len: usize) -> Result<(), PeerError> {
        message::discard(&mut self.stream, len).await
    }

    /// Receives the next message, which must have id `expected`, and returns
    /// its payload.
    pub async fn expect(&mut self, expected: MessageId) -> Result<Vec<u8>, PeerError> {
        let header = self.receive_header().await?;
        if header.id != expected {
            return Err(PeerError::UnexpectedMessage { expected, received: header.id });
        }
        self.read_payload(header.payload_len).await
    }

    /// bitfield, interested, unchoke: the exchange that must precede any
    /// piece request.
    pub async fn prepare_download(&mut self) -> Result<(), PeerError> {
        let bitfield = self.expect(MessageId::Bitfield).await?;
        debug!(address = %self.address, len = bitfield.len(), "received bitfield");

        self.send(MessageId::Interested, &[]).await?;

        let header = self.receive_header().await?;
        if header.id != MessageId::Unchoke {
            return Err(PeerError::UnexpectedMessage { expected: MessageId::Unchoke, received: header.id });
        }
        if header.payload_len != 0 {
            return Err(PeerError::UnexpectedLength { what: "unchoke", expected: 0, actual: header.payload_len });
        }
        debug!(address = %self.address, "unchoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn handshake_exchange_checks_info_hash() {
        let (mut client, mut server) = duplex(256);
        let ours = Handshake::new(InfoHash([1; 20]), &PeerId([b'a'; 20]), Reserved::EXTENSIONS);
        let theirs = Handshake::new(InfoHash([2; 20]), &PeerId([b'b'; 20]), Reserved::NONE);
        server.write_all(&<[u8; HANDSHAKE_LEN]>::from(&theirs)).await.unwrap();

        let result = exchange_handshake(&mut client, &ours).await;
        assert!(matches!(result, Err(PeerError::InfoHashMismatch(hash)) if hash == InfoHash([2; 20])));
    }

    #[tokio::test]
    async fn handshake_exchange_returns_remote() {
        let (mut client, mut server) = duplex(256);
        let ours = Handshake::new(InfoHash([1; 20]), &PeerId([b'a'; 20]), Reserved::NONE);
        let theirs = Handshake::new(InfoHash([1; 20]), &PeerId([b'b'; 20]), Reserved::EXTENSIONS);
        server.write_all(&<[u8; HANDSHAKE_LEN]>::from(&theirs)).await.unwrap();

        let remote = exchange_handshake(&mut client, &ours).await.unwrap();
        assert_eq!(remote, theirs);

        let mut sent = [0u8; HANDSHAKE_LEN];
        server.read_exact(&mut sent).await.unwrap();
        assert_eq!(Handshake::try_from(sent.as_slice()).unwrap(), ours);
    }
}
