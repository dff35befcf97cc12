use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::peer::PeerError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke         = 0,
    Unchoke       = 1,
    Interested    = 2,
    NotInterested = 3,
    Have          = 4,
    Bitfield      = 5,
    Request       = 6,
    Piece         = 7,
    Cancel        = 8,
    Extension     = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, PeerError> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            20 => Ok(MessageId::Extension),
            _ => Err(PeerError::UnknownMessage(value)),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u8)
    }
}

/// Largest frame accepted from a peer, counting the id byte. Blocks are 16 KiB
/// and metadata pieces smaller still.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Length prefix and id of a framed message. The payload (`payload_len`
/// bytes) is still on the wire and must be drained by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: MessageId,
    pub payload_len: usize,
}

/// `request` payload: piece index, byte offset, block length.
pub fn request_payload(index: u32, begin: u32, length: u32) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&index.to_be_bytes());
    buf[4..8].copy_from_slice(&begin.to_be_bytes());
    buf[8..12].copy_from_slice(&length.to_be_bytes());
    buf
}

pub fn encode_message(id: MessageId, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
    buf.push(id as u8);
    buf.extend_from_slice(payload);
    buf
}

pub async fn write_message<W>(stream: &mut W, id: MessageId, payload: &[u8]) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    trace!(%id, len = payload.len(), "sending message");
    stream.write_all(&encode_message(id, payload)).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads the next length prefix and id, skipping keep-alives. `read_exact`
/// loops over short reads, so a header split across segments is fine.
pub async fn read_header<R>(stream: &mut R) -> Result<MessageHeader, PeerError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let total_length = u32::from_be_bytes(len_buf) as usize;
        if total_length == 0 {
            trace!("keep-alive");
            continue;
        }
        if total_length > MAX_MESSAGE_LEN {
            return Err(PeerError::MessageTooLarge(total_length));
        }
        let id = MessageId::try_from(stream.read_u8().await?)?;
        trace!(%id, len = total_length - 1, "received message header");
        return Ok(MessageHeader { id, payload_len: total_length - 1 });
    }
}

pub async fn read_payload<R>(stream: &mut R, len: usize) -> Result<Vec<u8>, PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Drains and drops `len` payload bytes.
pub async fn discard<R>(stream: &mut R, len: usize) -> Result<(), PeerError>
where
    R: AsyncRead + Unpin,
{
    let copied = tokio::io::copy(&mut stream.take(len as u64), &mut tokio::io::sink()).await?;
    if copied < len as u64 {
        return Err(PeerError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn encodes_frame() {
        let frame = encode_message(MessageId::Request, &request_payload(1, 16384, 3616));
        assert_eq!(
            frame,
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x0e, 0x20]
        );
        assert_eq!(encode_message(MessageId::Interested, &[]), vec![0, 0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn reads_frames_split_across_writes() {
        let (mut client, mut server) = duplex(64);
        let frame = encode_message(MessageId::Bitfield, &[0xff, 0xf0, 0x0f]);
        tokio::spawn(async move {
            // keep-alive, then the frame in three uneven chunks
            client.write_all(&[0, 0, 0, 0]).await.unwrap();
            client.write_all(&frame[..2]).await.unwrap();
            client.write_all(&frame[2..6]).await.unwrap();
            client.write_all(&frame[6..]).await.unwrap();
        });

        let header = read_header(&mut server).await.unwrap();
        assert_eq!(header, MessageHeader { id: MessageId::Bitfield, payload_len: 3 });
        assert_eq!(read_payload(&mut server, 3).await.unwrap(), vec![0xff, 0xf0, 0x0f]);
    }

    #[tokio::test]
    async fn discard_drains_exactly() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[1, 2, 3, 4, 5]).await.unwrap();
        discard(&mut server, 3).await.unwrap();
        assert_eq!(read_payload(&mut server, 2).await.unwrap(), vec![4, 5]);
    }

    #[tokio::test]
    async fn discard_reports_eof() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[1, 2]).await.unwrap();
        drop(client);
        assert!(matches!(discard(&mut server, 3).await, Err(PeerError::Io(_))));
    }

    #[tokio::test]
    async fn unknown_ids_are_protocol_errors() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0, 0, 0, 1, 99]).await.unwrap();
        assert!(matches!(read_header(&mut server).await, Err(PeerError::UnknownMessage(99))));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_before_reading_payload() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0xff, 0xff, 0xff, 0xff, 7]).await.unwrap();
        assert!(matches!(read_header(&mut server).await, Err(PeerError::MessageTooLarge(0xffff_ffff))));

        let (mut client, mut server) = duplex(64);
        client.write_all(&(MAX_MESSAGE_LEN as u32).to_be_bytes()).await.unwrap();
        client.write_all(&[7]).await.unwrap();
        let header = read_header(&mut server).await.unwrap();
        assert_eq!(header, MessageHeader { id: MessageId::Piece, payload_len: MAX_MESSAGE_LEN - 1 });
    }

    #[tokio::test]
    async fn writes_flush_whole_frame() {
        let (mut client, mut server) = duplex(64);
        write_message(&mut client, MessageId::Have, &7u32.to_be_bytes()).await.unwrap();
        let header = read_header(&mut server).await.unwrap();
        assert_eq!(header.id, MessageId::Have);
        assert_eq!(read_payload(&mut server, header.payload_len).await.unwrap(), vec![0, 0, 0, 7]);
    }
}
