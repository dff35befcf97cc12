use std::sync::Arc;

use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use crate::metadata::file::{MAX_PIECE_LENGTH, TorrentError, TorrentMetadata};
use crate::peer::PeerError;
use crate::peer::connection::PeerConnection;
use crate::peer::message::{MessageId, request_payload};
use crate::peer::workqueue::PieceWorker;

pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Size of block `block_index` within piece `piece_index`, and whether it is
/// the final block of the final piece. `(0, true)` means out of range.
///
/// Blocks are `max_block` bytes except the trailing block of a piece whose
/// length is not a multiple of `max_block`, which holds the remainder.
pub fn block_length(
    total_length: u64,
    piece_length: u64,
    max_block: u32,
    piece_index: u32,
    block_index: u32,
) -> (u32, bool) {
    let max_block = max_block as u64;
    if piece_length == 0 || max_block == 0 {
        return (0, true);
    }
    let num_pieces = total_length.div_ceil(piece_length);
    let blocks_per_full_piece = piece_length.div_ceil(max_block);
    let (piece_index, block_index) = (piece_index as u64, block_index as u64);
    if piece_index >= num_pieces || block_index >= blocks_per_full_piece {
        return (0, true);
    }

    if piece_index == num_pieces - 1 {
        let last_piece_length = total_length - piece_length * (num_pieces - 1);
        let blocks_in_last_piece = last_piece_length.div_ceil(max_block);
        if block_index >= blocks_in_last_piece {
            return (0, true);
        }
        if block_index == blocks_in_last_piece - 1 {
            return ((last_piece_length - max_block * block_index) as u32, true);
        }
        return (max_block as u32, false);
    }

    let begin = block_index * max_block;
    ((piece_length - begin).min(max_block) as u32, false)
}

/// Number of bytes in piece `piece_index`, or `None` when the piece does not
/// exist. Only the final piece is shorter than `piece_length`.
pub fn piece_size(total_length: u64, piece_length: u64, piece_index: u32) -> Option<u64> {
    let start = (piece_index as u64).checked_mul(piece_length)?;
    if piece_length == 0 || start >= total_length {
        return None;
    }
    Some(piece_length.min(total_length - start))
}

/// Downloads piece `piece_index` block by block over an unchoked connection.
pub async fn download_piece(
    conn: &mut PeerConnection,
    piece_length: u64,
    piece_index: u32,
    total_length: u64,
) -> Result<Vec<u8>, PeerError> {
    if piece_length > MAX_PIECE_LENGTH {
        return Err(TorrentError::PieceLengthTooLarge(piece_length).into());
    }
    let Some(size) = piece_size(total_length, piece_length, piece_index) else {
        let count = total_length.div_ceil(piece_length.max(1));
        return Err(PeerError::InvalidPieceIndex { index: piece_index, count });
    };

    let num_blocks = size.div_ceil(BLOCK_SIZE as u64) as u32;
    let mut piece = Vec::with_capacity(size as usize);

    for block_index in 0..num_blocks {
        let (len, is_last) = block_length(total_length, piece_length, BLOCK_SIZE, piece_index, block_index);
        if len == 0 {
            break;
        }
        let begin = block_index * BLOCK_SIZE;
        conn.send(MessageId::Request, &request_payload(piece_index, begin, len)).await?;
        receive_block(conn, piece_index, begin, len, &mut piece).await?;
        trace!(piece_index, begin, len, "received block");
        if is_last {
            break;
        }
    }

    debug!(address = %conn.address(), piece_index, len = piece.len(), "downloaded piece");
    Ok(piece)
}

/// Reads one `piece` message and appends its block to `piece`. `have`
/// announcements arriving in between are drained.
async fn receive_block(
    conn: &mut PeerConnection,
    index: u32,
    begin: u32,
    len: u32,
    piece: &mut Vec<u8>,
) -> Result<(), PeerError> {
    let header = loop {
        let header = conn.receive_header().await?;
        match header.id {
            MessageId::Piece => break header,
            MessageId::Have => conn.discard(header.payload_len).await?,
            received => return Err(PeerError::UnexpectedMessage { expected: MessageId::Piece, received }),
        }
    };

    let expected = 8 + len as usize;
    if header.payload_len != expected {
        return Err(PeerError::UnexpectedLength { what: "piece", expected, actual: header.payload_len });
    }

    let mut block_header = [0u8; 8];
    conn.read_exact(&mut block_header).await?;
    let received_index = u32::from_be_bytes([block_header[0], block_header[1], block_header[2], block_header[3]]);
    let received_begin = u32::from_be_bytes([block_header[4], block_header[5], block_header[6], block_header[7]]);
    if received_index != index || received_begin != begin {
        return Err(PeerError::BlockMismatch {
            expected_index: index,
            expected_begin: begin,
            index: received_index,
            begin: received_begin,
        });
    }

    let start = piece.len();
    piece.resize(start + len as usize, 0);
    conn.read_exact(&mut piece[start..]).await
}

/// Checks `data` against the piece's expected SHA-1.
pub fn verify_piece(index: u32, data: &[u8], expected: &[u8; 20]) -> Result<(), PeerError> {
    let actual: [u8; 20] = Sha1::digest(data).into();
    if &actual == expected {
        Ok(())
    } else {
        Err(PeerError::HashMismatch { index })
    }
}

/// Downloads pieces of one torrent from one peer for the worker pool.
pub struct PeerWorker {
    conn: PeerConnection,
    metadata: Arc<TorrentMetadata>,
    verify: bool,
    prepared: bool,
}

impl PeerWorker {
    pub fn new(conn: PeerConnection, metadata: Arc<TorrentMetadata>, verify: bool) -> Self {
        PeerWorker { conn, metadata, verify, prepared: false }
    }
}

impl PieceWorker for PeerWorker {
    fn name(&self) -> String {
        self.conn.address().to_string()
    }

    async fn fetch(&mut self, index: u32) -> Result<Vec<u8>, PeerError> {
        if !self.prepared {
            self.conn.prepare_download().await?;
            self.prepared = true;
        }
        let meta = &self.metadata;
        let piece = download_piece(&mut self.conn, meta.piece_length, index, meta.total_length).await?;
        if self.verify {
            let expected = meta
                .piece_hash(index)
                .ok_or(PeerError::InvalidPieceIndex { index, count: meta.piece_count() as u64 })?;
            verify_piece(index, &piece, expected)?;
        }
        Ok(piece)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIECE: u64 = 65536;
    const TOTAL: u64 = 3 * PIECE + 20000;

    #[test]
    fn final_piece_ends_early() {
        assert_eq!(block_length(TOTAL, PIECE, BLOCK_SIZE, 3, 0), (16384, false));
        assert_eq!(block_length(TOTAL, PIECE, BLOCK_SIZE, 3, 1), (3616, true));
        assert_eq!(block_length(TOTAL, PIECE, BLOCK_SIZE, 3, 2), (0, true));
    }

    #[test]
    fn full_pieces_never_report_last() {
        for block in 0..4 {
            assert_eq!(block_length(TOTAL, PIECE, BLOCK_SIZE, 1, block), (16384, false));
        }
        assert_eq!(block_length(TOTAL, PIECE, BLOCK_SIZE, 1, 4), (0, true));
    }

    #[test]
    fn piece_sizes() {
        assert_eq!(piece_size(TOTAL, PIECE, 0), Some(PIECE));
        assert_eq!(piece_size(TOTAL, PIECE, 3), Some(20000));
        assert_eq!(piece_size(TOTAL, PIECE, 4), None);
        assert_eq!(piece_size(TOTAL, 0, 0), None);
        assert_eq!(piece_size(u64::MAX, u64::MAX, 2), None);
    }

    #[test]
    fn single_small_piece_is_not_sized_by_nominal_length() {
        // a 10 byte file with a 4 GiB nominal piece
        assert_eq!(piece_size(10, MAX_PIECE_LENGTH, 0), Some(10));
        assert_eq!(piece_size(10, MAX_PIECE_LENGTH, 1), None);
    }

    #[test]
    fn out_of_range_piece() {
        assert_eq!(block_length(TOTAL, PIECE, BLOCK_SIZE, 4, 0), (0, true));
    }

    #[test]
    fn odd_piece_length_tiles() {
        let piece = 40000u64;
        let total = 2 * piece;
        let lens: Vec<u32> = (0..3).map(|b| block_length(total, piece, BLOCK_SIZE, 0, b).0).collect();
        assert_eq!(lens, vec![16384, 16384, 40000 - 2 * 16384]);
        assert_eq!(lens.iter().map(|&l| l as u64).sum::<u64>(), piece);
        assert_eq!(block_length(total, piece, BLOCK_SIZE, 1, 2), (40000 - 2 * 16384, true));
    }

    #[test]
    fn final_block_exactly_full() {
        assert_eq!(block_length(2 * PIECE, PIECE, BLOCK_SIZE, 1, 3), (16384, true));
    }

    #[test]
    fn verification() {
        let data = b"piece data";
        let digest: [u8; 20] = Sha1::digest(data).into();
        assert!(verify_piece(0, data, &digest).is_ok());
        assert!(matches!(verify_piece(3, b"other", &digest), Err(PeerError::HashMismatch { index: 3 })));
    }
}
