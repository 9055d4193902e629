use thiserror::Error;

use crate::types::InfoHash;

/// Transfer block size: pieces move over the wire in fixed 16 KiB
/// sub-units, except for a shorter final block per piece.
pub const BLOCK_SIZE: u32 = 1 << 14;

/// One entry of the torrent's file layout: where a span of the byte
/// stream lands once persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: std::path::PathBuf,
    pub length: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetainfoError {
    #[error("piece length must be non-zero")]
    ZeroPieceLength,
    #[error("expected {expected} piece hashes for {total} bytes, got {actual}")]
    HashCountMismatch {
        expected: usize,
        actual: usize,
        total: u64,
    },
    #[error("file layout covers {files} bytes but total length is {total}")]
    LayoutMismatch { files: u64, total: u64 },
}

/// Validated, immutable torrent metadata as handed over by the metadata
/// decoder collaborator. The engine never mutates this; it is shared via
/// `Arc` between the swarm controller and its peer tasks.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    info_hash: InfoHash,
    piece_length: u32,
    total_length: u64,
    piece_hashes: Vec<[u8; 20]>,
    files: Vec<FileEntry>,
}

impl TorrentInfo {
    pub fn new(
        info_hash: InfoHash,
        piece_length: u32,
        total_length: u64,
        piece_hashes: Vec<[u8; 20]>,
        files: Vec<FileEntry>,
    ) -> Result<Self, MetainfoError> {
        if piece_length == 0 {
            return Err(MetainfoError::ZeroPieceLength);
        }

        let expected = total_length.div_ceil(piece_length as u64) as usize;
        if piece_hashes.len() != expected {
            return Err(MetainfoError::HashCountMismatch {
                expected,
                actual: piece_hashes.len(),
                total: total_length,
            });
        }

        let file_total: u64 = files.iter().map(|f| f.length).sum();
        if !files.is_empty() && file_total != total_length {
            return Err(MetainfoError::LayoutMismatch {
                files: file_total,
                total: total_length,
            });
        }

        Ok(Self {
            info_hash,
            piece_length,
            total_length,
            piece_hashes,
            files,
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Length of the given piece. Every piece is `piece_length` bytes
    /// except the last, which covers whatever remains.
    pub fn piece_len(&self, index: usize) -> u32 {
        debug_assert!(index < self.num_pieces());
        let start = index as u64 * self.piece_length as u64;
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(self.piece_length as u64) as u32
    }

    pub fn expected_hash(&self, index: usize) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index)
    }

    /// Number of transfer blocks in the given piece.
    pub fn block_count(&self, index: usize) -> usize {
        self.piece_len(index).div_ceil(BLOCK_SIZE) as usize
    }

    /// Length of one block within a piece; only the final block of a
    /// piece may be shorter than `BLOCK_SIZE`.
    pub fn block_len(&self, index: usize, block: usize) -> u32 {
        let begin = block as u32 * BLOCK_SIZE;
        BLOCK_SIZE.min(self.piece_len(index) - begin)
    }
}
