use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use indicatif::ProgressBar;
use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use torrent::metadata::bencode::{BencodeValue, encode};
use torrent::metadata::file::{InfoHash, TorrentMetadata, single_file_info};
use torrent::peer::extension::{self, EXTENSION_HANDSHAKE_ID, ExtensionHandshake, LOCAL_METADATA_ID, MetadataMessage};
use torrent::peer::handshake::{HANDSHAKE_LEN, Handshake};
use torrent::peer::message::{MessageId, read_header, read_payload, write_message};
use torrent::peer::{PeerError, Reserved};
use torrent::{ClientConfig, DownloadError, Error};

const SEEDER_ID: [u8; 20] = *b"-TS0001-fakeseeder01";
const SEEDER_METADATA_ID: u8 = 3;
const PIECE_LENGTH: u64 = 32 * 1024;

/// A peer that has the whole file and serves it to anyone who asks.
struct Seeder {
    content: Vec<u8>,
    extensions: bool,
    corrupt_piece: Option<u32>,
    tamper_metadata: bool,
}

impl Seeder {
    fn new(content: &[u8]) -> Self {
        Seeder { content: content.to_vec(), extensions: false, corrupt_piece: None, tamper_metadata: false }
    }

    fn info(&self) -> BencodeValue {
        single_file_info("data.bin", PIECE_LENGTH, &self.content)
    }

    fn metadata(&self) -> TorrentMetadata {
        TorrentMetadata::try_from(&self.info()).unwrap()
    }

    async fn spawn_meta(self) -> (SocketAddr, TorrentMetadata) {
        let meta = self.metadata();
        (self.spawn().await, meta)
    }

    async fn spawn(self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let seeder = Arc::new(self);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seeder = Arc::clone(&seeder);
                tokio::spawn(async move {
                    let _ = seeder.serve(stream).await;
                });
            }
        });
        address
    }

    async fn serve(&self, mut stream: TcpStream) -> Result<(), PeerError> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await?;
        Handshake::try_from(buf.as_slice())?;

        let reserved = if self.extensions { Reserved::EXTENSIONS } else { Reserved::NONE };
        let ours = Handshake { reserved, info_hash: self.metadata().info_hash, peer_id: SEEDER_ID };
        stream.write_all(&<[u8; HANDSHAKE_LEN]>::from(&ours)).await?;

        let bitfield = vec![0xff; self.metadata().piece_count().div_ceil(8)];
        write_message(&mut stream, MessageId::Bitfield, &bitfield).await?;

        loop {
            let header = read_header(&mut stream).await?;
            let payload = read_payload(&mut stream, header.payload_len).await?;
            match header.id {
                MessageId::Interested => write_message(&mut stream, MessageId::Unchoke, &[]).await?,
                MessageId::Request => {
                    let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                    let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap()) as usize;
                    let len = u32::from_be_bytes(payload[8..12].try_into().unwrap()) as usize;
                    let start = index as usize * PIECE_LENGTH as usize + begin;
                    let mut block = self.content[start..start + len].to_vec();
                    if self.corrupt_piece == Some(index) {
                        block[0] ^= 0xff;
                    }
                    let mut reply = payload[0..8].to_vec();
                    reply.extend(block);
                    // have messages are allowed to arrive between blocks
                    write_message(&mut stream, MessageId::Have, &index.to_be_bytes()).await?;
                    write_message(&mut stream, MessageId::Piece, &reply).await?;
                }
                MessageId::Extension if payload[0] == EXTENSION_HANDSHAKE_ID => {
                    let reply = ExtensionHandshake {
                        metadata_id: Some(SEEDER_METADATA_ID),
                        metadata_size: Some(encode(&self.info()).len() as u64),
                    };
                    write_message(&mut stream, MessageId::Extension, &reply.encode()).await?;
                }
                MessageId::Extension => {
                    assert_eq!(payload[0], SEEDER_METADATA_ID);
                    let request = MetadataMessage::decode(&payload)?;
                    let info = if self.tamper_metadata {
                        encode(&single_file_info("other.bin", PIECE_LENGTH, &self.content))
                    } else {
                        encode(&self.info())
                    };
                    let reply = MetadataMessage::data(request.piece, info).encode(LOCAL_METADATA_ID);
                    write_message(&mut stream, MessageId::Extension, &reply).await?;
                }
                _ => {}
            }
        }
    }
}

/// An HTTP tracker on `127.0.0.1:0` that answers every announce with
/// `peers` in compact form. Returns the announce URL and the request lines.
async fn spawn_tracker(peers: Vec<SocketAddr>) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let announce = format!("http://{}/announce", listener.local_addr().unwrap());
    let (requests, received) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let line = String::from_utf8_lossy(&request).lines().next().unwrap_or_default().to_string();
            let _ = requests.send(line);

            let mut compact = Vec::new();
            for peer in &peers {
                if let SocketAddr::V4(v4) = peer {
                    compact.extend(v4.ip().octets());
                    compact.extend(v4.port().to_be_bytes());
                }
            }
            let mut body = format!("d8:intervali60e5:peers{}:", compact.len()).into_bytes();
            body.extend(compact);
            body.push(b'e');
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len());
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(&body).await;
            let _ = stream.shutdown().await;
        }
    });
    (announce, received)
}

fn content() -> Vec<u8> {
    // three full pieces and a short final one
    (0..(3 * PIECE_LENGTH as usize + 20000)).map(|i| (i * 7 % 253) as u8).collect()
}

fn config() -> ClientConfig {
    ClientConfig { connect_timeout: Duration::from_secs(2), ..ClientConfig::default() }
}

#[tokio::test]
async fn handshake_reports_remote_peer_id() {
    let seeder = Seeder::new(&content());
    let meta = seeder.metadata();
    let address = seeder.spawn().await;

    let conn = torrent::handshake(address, meta.info_hash, Reserved::NONE, &config()).await.unwrap();
    assert_eq!(conn.peer_id(), &SEEDER_ID);
    assert_eq!(conn.address(), address);
    assert!(!conn.supports_extensions());
    assert!(conn.ensure_extensions().is_ok());
}

#[tokio::test]
async fn handshake_rejects_other_torrents() {
    let address = Seeder::new(&content()).spawn().await;
    let result = torrent::handshake(address, InfoHash([0; 20]), Reserved::NONE, &config()).await;
    assert!(matches!(result, Err(Error::Peer(PeerError::InfoHashMismatch(_)))));
}

#[tokio::test]
async fn missing_capability_is_reported_but_connection_stays_usable() {
    let seeder = Seeder::new(&content());
    let meta = seeder.metadata();
    let address = seeder.spawn().await;

    let mut conn = torrent::handshake(address, meta.info_hash, Reserved::EXTENSIONS, &config()).await.unwrap();
    assert!(matches!(conn.ensure_extensions(), Err(PeerError::Capability { .. })));

    conn.prepare_download().await.unwrap();
    let piece = torrent::peer::downloader::download_piece(&mut conn, PIECE_LENGTH, 0, meta.total_length)
        .await
        .unwrap();
    assert_eq!(piece, content()[..PIECE_LENGTH as usize]);
}

#[tokio::test]
async fn downloads_single_pieces() {
    let data = content();
    let seeder = Seeder::new(&data);
    let meta = seeder.metadata();
    let address = seeder.spawn().await;

    let piece = torrent::download_piece(&meta, 1, &[address], &config()).await.unwrap();
    assert_eq!(piece, data[PIECE_LENGTH as usize..2 * PIECE_LENGTH as usize]);

    let last = torrent::download_piece(&meta, 3, &[address], &config()).await.unwrap();
    assert_eq!(last.len(), 20000);
    assert_eq!(last, data[3 * PIECE_LENGTH as usize..]);

    let out_of_range = torrent::download_piece(&meta, 4, &[address], &config()).await;
    assert!(matches!(out_of_range, Err(Error::Download(DownloadError::InvalidPieceIndex { index: 4, count: 4 }))));
}

#[tokio::test]
async fn corrupt_pieces_fail_verification() {
    let mut seeder = Seeder::new(&content());
    seeder.corrupt_piece = Some(2);
    let meta = seeder.metadata();
    let address = seeder.spawn().await;

    let result = torrent::download_piece(&meta, 2, &[address], &config()).await;
    assert!(matches!(result, Err(Error::Peer(PeerError::HashMismatch { index: 2 }))));

    let unverified = ClientConfig { verify_pieces: false, ..config() };
    let piece = torrent::download_piece(&meta, 2, &[address], &unverified).await.unwrap();
    assert_ne!(piece, content()[2 * PIECE_LENGTH as usize..3 * PIECE_LENGTH as usize]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn downloads_whole_file_from_several_peers() {
    let data = content();
    let meta = Seeder::new(&data).metadata();
    let mut peers = Vec::new();
    for _ in 0..3 {
        peers.push(Seeder::new(&data).spawn().await);
    }

    let file = torrent::download_file(&meta, &peers, &config(), ProgressBar::hidden()).await.unwrap();
    assert_eq!(file, data);

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("data.bin");
    torrent::save(&path, &file).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), data);
}

#[tokio::test]
async fn missing_pieces_abort_assembly() {
    let mut seeder = Seeder::new(&content());
    seeder.corrupt_piece = Some(1);
    let meta = seeder.metadata();
    let address = seeder.spawn().await;

    let result = torrent::download_file(&meta, &[address], &config(), ProgressBar::hidden()).await;
    assert!(matches!(result, Err(Error::Download(DownloadError::MissingPieces(missing))) if missing == vec![1]));
}

#[tokio::test]
async fn unreachable_peers_are_skipped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed = listener.local_addr().unwrap();
    drop(listener);

    let meta = Seeder::new(&content()).metadata();
    let result = torrent::download_file(&meta, &[closed], &config(), ProgressBar::hidden()).await;
    assert!(matches!(result, Err(Error::Download(DownloadError::NoPeers))));
}

#[tokio::test]
async fn fetches_metadata_over_extension_protocol() {
    let data = content();
    let mut seeder = Seeder::new(&data);
    seeder.extensions = true;
    let expected = seeder.metadata();
    let address = seeder.spawn().await;

    let mut conn = torrent::extension_peer(&[address], expected.info_hash, &config()).await.unwrap();
    assert!(conn.supports_extensions());
    assert_eq!(conn.metadata_extension_id(), Some(SEEDER_METADATA_ID));
    assert_eq!(conn.metadata_size(), Some(encode(&single_file_info("data.bin", PIECE_LENGTH, &data)).len() as u64));

    let meta = extension::request_metadata(&mut conn, expected.info_hash).await.unwrap();
    assert_eq!(meta.info_hash, expected.info_hash);
    assert_eq!(meta.total_length, expected.total_length);
    assert_eq!(meta.piece_hashes, expected.piece_hashes);
    assert!(meta.tracker_url.is_none());
    drop(conn);

    // a fresh connection can then download with the received metadata
    let piece = torrent::download_piece(&meta, 0, &[address], &config()).await.unwrap();
    assert_eq!(piece, data[..PIECE_LENGTH as usize]);
}

#[tokio::test]
async fn tampered_metadata_is_rejected() {
    let mut seeder = Seeder::new(&content());
    seeder.extensions = true;
    seeder.tamper_metadata = true;
    let info_hash = seeder.metadata().info_hash;
    let address = seeder.spawn().await;

    let mut conn = torrent::extension_peer(&[address], info_hash, &config()).await.unwrap();
    let result = extension::request_metadata(&mut conn, info_hash).await;
    assert!(matches!(result, Err(PeerError::MetadataHashMismatch { .. })));
}

#[tokio::test]
async fn extension_handshake_needs_capable_peer() {
    let seeder = Seeder::new(&content());
    let info_hash = seeder.metadata().info_hash;
    let address = seeder.spawn().await;

    let result = torrent::extension_peer(&[address], info_hash, &config()).await;
    assert!(matches!(result, Err(Error::Peer(PeerError::Capability { .. }))));
}

#[tokio::test]
async fn tracker_peers_serve_torrent_download() {
    let data = content();
    let (address, meta) = Seeder::new(&data).spawn_meta().await;
    let (announce, mut requests) = spawn_tracker(vec![address]).await;
    let meta = meta.with_tracker_url(Some(announce));

    let peers = torrent::torrent_peers(&meta, &config()).await.unwrap();
    assert_eq!(peers, vec![address]);

    let request = requests.recv().await.unwrap();
    assert!(request.starts_with("GET /announce?"));
    assert!(request.contains(&format!("left={}", data.len())));
    assert!(request.contains("compact=1"));
    let encoded_hash = percent_encode(meta.info_hash.as_bytes(), NON_ALPHANUMERIC).to_string();
    assert!(request.contains(&format!("info_hash={}", encoded_hash)));

    let piece = torrent::download_piece(&meta, 0, &peers, &config()).await.unwrap();
    assert_eq!(piece, data[..PIECE_LENGTH as usize]);
}

#[tokio::test]
async fn torrent_without_tracker_has_no_peers_to_ask() {
    let meta = Seeder::new(&content()).metadata();
    let result = torrent::torrent_peers(&meta, &config()).await;
    assert!(matches!(result, Err(Error::Download(DownloadError::MissingTracker))));
}

#[tokio::test]
async fn magnet_link_resolves_through_tracker_and_swarm() {
    let data = content();
    let mut seeder = Seeder::new(&data);
    seeder.extensions = true;
    let (address, expected) = seeder.spawn_meta().await;
    let (announce, mut requests) = spawn_tracker(vec![address]).await;

    let uri = format!(
        "magnet:?xt=urn:btih:{}&dn=data.bin&tr={}",
        expected.info_hash,
        percent_encode(announce.as_bytes(), NON_ALPHANUMERIC)
    );
    let link = torrent::parse_magnet(&uri).unwrap();
    assert_eq!(link.tracker(), Some(announce.as_str()));

    let (conn, peers) = torrent::magnet_handshake(&link, &config()).await.unwrap();
    assert_eq!(peers, vec![address]);
    assert_eq!(conn.peer_id(), &SEEDER_ID);
    assert_eq!(conn.metadata_extension_id(), Some(SEEDER_METADATA_ID));
    drop(conn);
    // length is unknown before the metadata arrives
    assert!(requests.recv().await.unwrap().contains("left=999"));

    let (meta, peers) = torrent::magnet_metadata(&link, &config()).await.unwrap();
    assert_eq!(peers, vec![address]);
    assert_eq!(meta.info_hash, expected.info_hash);
    assert_eq!(meta.total_length, data.len() as u64);
    assert_eq!(meta.tracker_url.as_deref(), Some(announce.as_str()));
    assert!(requests.recv().await.unwrap().contains("left=999"));

    let last = torrent::download_piece(&meta, 3, &peers, &config()).await.unwrap();
    assert_eq!(last, data[3 * PIECE_LENGTH as usize..]);
}
