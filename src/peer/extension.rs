//! Extension protocol handshake and single-piece metadata exchange, used to
//! obtain the info dictionary for a magnet link.

use tracing::{debug, info};

use crate::metadata::bencode::{self, BencodeValue};
use crate::metadata::file::{InfoHash, TorrentMetadata};
use crate::peer::PeerError;
use crate::peer::connection::PeerConnection;
use crate::peer::message::MessageId;

/// Extended message id reserved for the extension handshake itself.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;
/// The id we ask peers to use when sending us `ut_metadata` messages.
pub const LOCAL_METADATA_ID: u8 = 16;
pub const UT_METADATA: &str = "ut_metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl TryFrom<i64> for MetadataMessageType {
    type Error = PeerError;

    fn try_from(value: i64) -> Result<Self, PeerError> {
        match value {
            0 => Ok(MetadataMessageType::Request),
            1 => Ok(MetadataMessageType::Data),
            2 => Ok(MetadataMessageType::Reject),
            _ => Err(PeerError::Extension(format!("unknown metadata msg_type {value}"))),
        }
    }
}

/// Contents of an extension handshake: which extended message ids the sender
/// wants to receive, and how large its metadata is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    pub metadata_id: Option<u8>,
    pub metadata_size: Option<u64>,
}

impl ExtensionHandshake {
    /// Payload of the extension message, including the leading handshake id.
    pub fn encode(&self) -> Vec<u8> {
        let mut m = Vec::new();
        if let Some(id) = self.metadata_id {
            m.push((UT_METADATA, BencodeValue::Integer(id as i64)));
        }
        let mut items = vec![("m", BencodeValue::dictionary(m))];
        if let Some(size) = self.metadata_size {
            items.push(("metadata_size", BencodeValue::Integer(size as i64)));
        }
        let mut payload = vec![EXTENSION_HANDSHAKE_ID];
        payload.extend(bencode::encode(&BencodeValue::dictionary(items)));
        payload
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (&id, body) = payload
            .split_first()
            .ok_or_else(|| PeerError::Extension("empty extension message".into()))?;
        if id != EXTENSION_HANDSHAKE_ID {
            return Err(PeerError::Extension(format!("expected extension handshake, got extended id {id}")));
        }
        let value = bencode::decode(body)?;
        if value.as_dictionary().is_none() {
            return Err(PeerError::Extension("extension handshake is not a dictionary".into()));
        }
        let metadata_id = value
            .get(b"m")
            .and_then(|m| m.get(UT_METADATA.as_bytes()))
            .and_then(BencodeValue::as_integer)
            .filter(|id| (1..=255).contains(id))
            .map(|id| id as u8);
        let metadata_size = value
            .get(b"metadata_size")
            .and_then(BencodeValue::as_integer)
            .and_then(|size| u64::try_from(size).ok());
        Ok(ExtensionHandshake { metadata_id, metadata_size })
    }
}

/// A `ut_metadata` message. For data messages `data` holds the bytes that
/// follow the bencoded header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMessage {
    pub msg_type: MetadataMessageType,
    pub piece: u32,
    pub total_size: Option<u64>,
    pub data: Vec<u8>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        MetadataMessage { msg_type: MetadataMessageType::Request, piece, total_size: None, data: Vec::new() }
    }

    pub fn data(piece: u32, data: Vec<u8>) -> Self {
        let total_size = Some(data.len() as u64);
        MetadataMessage { msg_type: MetadataMessageType::Data, piece, total_size, data }
    }

    /// Payload of the extension message addressed to extended id `id`.
    pub fn encode(&self, id: u8) -> Vec<u8> {
        let mut items = vec![
            ("msg_type", BencodeValue::Integer(self.msg_type as i64)),
            ("piece", BencodeValue::Integer(self.piece as i64)),
        ];
        if let Some(size) = self.total_size {
            items.push(("total_size", BencodeValue::Integer(size as i64)));
        }
        let mut payload = vec![id];
        payload.extend(bencode::encode(&BencodeValue::dictionary(items)));
        payload.extend_from_slice(&self.data);
        payload
    }

    /// Parses a payload whose extended id byte is already checked by the
    /// caller. The header dictionary is followed by raw metadata bytes, so
    /// only a prefix is decoded.
    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let body = payload
            .get(1..)
            .ok_or_else(|| PeerError::Extension("empty extension message".into()))?;
        let (header, consumed) = bencode::decode_prefix(body)?;
        let msg_type = header
            .get(b"msg_type")
            .and_then(BencodeValue::as_integer)
            .ok_or_else(|| PeerError::Extension("metadata message without msg_type".into()))?;
        let piece = header
            .get(b"piece")
            .and_then(BencodeValue::as_integer)
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| PeerError::Extension("metadata message without piece".into()))?;
        let total_size = header
            .get(b"total_size")
            .and_then(BencodeValue::as_integer)
            .and_then(|size| u64::try_from(size).ok());
        Ok(MetadataMessage {
            msg_type: MetadataMessageType::try_from(msg_type)?,
            piece,
            total_size,
            data: body[consumed..].to_vec(),
        })
    }
}

/// Receives the next extension message, draining `bitfield` and `have`
/// messages that may arrive ahead of it.
async fn receive_extension(conn: &mut PeerConnection) -> Result<Vec<u8>, PeerError> {
    loop {
        let header = conn.receive_header().await?;
        match header.id {
            MessageId::Extension => return conn.read_payload(header.payload_len).await,
            MessageId::Bitfield | MessageId::Have => conn.discard(header.payload_len).await?,
            received => return Err(PeerError::UnexpectedMessage { expected: MessageId::Extension, received }),
        }
    }
}

/// Runs the extension handshake and returns the peer's `ut_metadata` id,
/// which is also remembered on the connection.
pub async fn handshake(conn: &mut PeerConnection) -> Result<u8, PeerError> {
    conn.ensure_extensions()?;
    let ours = ExtensionHandshake { metadata_id: Some(LOCAL_METADATA_ID), metadata_size: None };
    conn.send(MessageId::Extension, &ours.encode()).await?;

    let theirs = ExtensionHandshake::decode(&receive_extension(conn).await?)?;
    let id = theirs
        .metadata_id
        .ok_or_else(|| PeerError::Extension(format!("peer does not support {UT_METADATA}")))?;
    info!(address = %conn.address(), id, size = ?theirs.metadata_size, "extension handshake complete");
    conn.metadata_extension_id = Some(id);
    conn.metadata_size = theirs.metadata_size;
    Ok(id)
}

/// Requests metadata piece 0 and returns the info dictionary it carries,
/// after checking that it hashes to `info_hash`.
pub async fn request_metadata(conn: &mut PeerConnection, info_hash: InfoHash) -> Result<TorrentMetadata, PeerError> {
    let id = match conn.metadata_extension_id() {
        Some(id) => id,
        None => handshake(conn).await?,
    };
    conn.send(MessageId::Extension, &MetadataMessage::request(0).encode(id)).await?;

    let reply = receive_extension(conn).await?;
    match reply.first() {
        Some(&LOCAL_METADATA_ID) => (),
        Some(other) => return Err(PeerError::Extension(format!("reply addressed to extended id {other}"))),
        None => return Err(PeerError::Extension("empty extension message".into())),
    }
    let message = MetadataMessage::decode(&reply)?;
    match message.msg_type {
        MetadataMessageType::Data => (),
        MetadataMessageType::Reject => return Err(PeerError::MetadataRejected),
        MetadataMessageType::Request => {
            return Err(PeerError::Extension("peer answered with a metadata request".into()));
        }
    }
    debug!(address = %conn.address(), len = message.data.len(), total = ?message.total_size, "received metadata");

    let actual = InfoHash::of(&message.data);
    if actual != info_hash {
        return Err(PeerError::MetadataHashMismatch { expected: info_hash, actual });
    }
    Ok(TorrentMetadata::from_bytes(&message.data)?)
}
