use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::debug;

use undertow_common::TorrentInfo;

use crate::error::StoreError;

pub use undertow_common::BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    Partial,
    Verifying,
    Verified,
}

/// Outcome of feeding one block into the store.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockWrite {
    /// Block stored; more blocks of the piece are still missing.
    Accepted,
    /// Every block of the piece is now buffered; caller should verify.
    Completed,
    /// We already had this block (endgame double-delivery); discarded.
    Duplicate,
}

/// Outcome of hashing an assembled piece.
#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Hash matched; the assembled bytes are handed back so the owner
    /// can persist them. The buffer is released either way.
    Verified(Bytes),
    /// Hash mismatch; blocks discarded, piece reset to missing.
    HashMismatch,
}

struct PieceBuffer {
    buf: Box<[u8]>,
    blocks: Vec<bool>,
    received: usize,
}

impl PieceBuffer {
    fn new(piece_len: u32) -> Self {
        let nblocks = piece_len.div_ceil(BLOCK_SIZE) as usize;
        Self {
            buf: vec![0; piece_len as usize].into_boxed_slice(),
            blocks: vec![false; nblocks],
            received: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.blocks.len()
    }
}

/// Per-piece buffering and verification state for one torrent. Owned
/// exclusively by the swarm controller task, which serializes all
/// mutations; buffers exist only for in-flight pieces, so memory is
/// bounded by however many pieces are partially downloaded at once.
pub struct PieceStore {
    torrent: Arc<TorrentInfo>,
    states: Vec<PieceState>,
    buffers: HashMap<u32, PieceBuffer>,
    verified: usize,
}

impl PieceStore {
    pub fn new(torrent: Arc<TorrentInfo>) -> Self {
        let states = vec![PieceState::Missing; torrent.num_pieces()];
        Self {
            torrent,
            states,
            buffers: HashMap::new(),
            verified: 0,
        }
    }

    pub fn state(&self, index: u32) -> Option<PieceState> {
        self.states.get(index as usize).copied()
    }

    pub fn verified_count(&self) -> usize {
        self.verified
    }

    pub fn remaining(&self) -> usize {
        self.torrent.num_pieces() - self.verified
    }

    pub fn all_verified(&self) -> bool {
        self.torrent.num_pieces() != 0 && self.remaining() == 0
    }

    /// Bytes not yet verified, the "left" figure an announce reports.
    /// Partial buffers do not count down until their piece passes the
    /// hash check.
    pub fn bytes_left(&self) -> u64 {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, state)| **state != PieceState::Verified)
            .map(|(i, _)| self.torrent.piece_len(i) as u64)
            .sum()
    }

    /// Allocate the buffer for a piece ahead of its first block. Called
    /// implicitly by `put_block`, exposed for symmetry and tests.
    pub fn begin_piece(&mut self, index: u32) -> Result<(), StoreError> {
        match self.state(index) {
            None => Err(StoreError::UnknownPiece(index)),
            Some(PieceState::Verified) => Err(StoreError::AlreadyVerified(index)),
            Some(_) => {
                let piece_len = self.torrent.piece_len(index as usize);
                self.buffers
                    .entry(index)
                    .or_insert_with(|| PieceBuffer::new(piece_len));
                Ok(())
            }
        }
    }

    /// Write one block into its piece buffer and mark its bit. Blocks
    /// must be aligned to the block grid and fit inside the piece;
    /// anything else came from a misbehaving peer.
    pub fn put_block(&mut self, index: u32, begin: u32, data: &[u8]) -> Result<BlockWrite, StoreError> {
        let state = self
            .state(index)
            .ok_or(StoreError::UnknownPiece(index))?;
        if state == PieceState::Verified {
            return Err(StoreError::AlreadyVerified(index));
        }

        let piece_len = self.torrent.piece_len(index as usize);
        let length = data.len() as u32;
        let block_idx = (begin / BLOCK_SIZE) as usize;
        let out_of_range = begin % BLOCK_SIZE != 0
            || begin >= piece_len
            || length != self.torrent.block_len(index as usize, block_idx);
        if out_of_range {
            return Err(StoreError::OutOfRangeBlock {
                index,
                begin,
                length,
            });
        }

        self.begin_piece(index)?;
        let piece = self
            .buffers
            .get_mut(&index)
            .ok_or(StoreError::UnknownPiece(index))?;

        if piece.blocks[block_idx] {
            return Ok(BlockWrite::Duplicate);
        }

        piece.buf[begin as usize..(begin + length) as usize].copy_from_slice(data);
        piece.blocks[block_idx] = true;
        piece.received += 1;
        self.states[index as usize] = PieceState::Partial;

        if piece.is_complete() {
            Ok(BlockWrite::Completed)
        } else {
            Ok(BlockWrite::Accepted)
        }
    }

    pub fn is_piece_complete(&self, index: u32) -> bool {
        self.buffers
            .get(&index)
            .map(PieceBuffer::is_complete)
            .unwrap_or(false)
    }

    /// Hash the assembled piece against its expected hash. The buffer is
    /// always released: on a match the bytes are returned for the owner
    /// to persist, on a mismatch the piece reverts to missing so its
    /// blocks can be re-fetched.
    pub fn verify(&mut self, index: u32) -> Result<Verdict, StoreError> {
        if self.state(index) == Some(PieceState::Verified) {
            return Err(StoreError::AlreadyVerified(index));
        }
        let piece = self
            .buffers
            .get(&index)
            .ok_or(StoreError::UnknownPiece(index))?;
        if !piece.is_complete() {
            return Err(StoreError::OutOfRangeBlock {
                index,
                begin: 0,
                length: 0,
            });
        }

        self.states[index as usize] = PieceState::Verifying;

        let expected = self
            .torrent
            .expected_hash(index as usize)
            .ok_or(StoreError::UnknownPiece(index))?;
        let piece = self
            .buffers
            .remove(&index)
            .ok_or(StoreError::UnknownPiece(index))?;

        let digest: [u8; 20] = Sha1::digest(&piece.buf).into();
        if &digest == expected {
            self.states[index as usize] = PieceState::Verified;
            self.verified += 1;
            Ok(Verdict::Verified(Bytes::from(piece.buf)))
        } else {
            debug!(piece = index, "hash mismatch, resetting piece");
            self.states[index as usize] = PieceState::Missing;
            Ok(Verdict::HashMismatch)
        }
    }

    /// Drop a partially buffered piece, e.g. when its only contributor
    /// disconnected and the swarm wants to reclaim the memory.
    pub fn drop_piece(&mut self, index: u32) {
        if self.state(index) != Some(PieceState::Verified) {
            self.buffers.remove(&index);
            if let Some(state) = self.states.get_mut(index as usize) {
                *state = PieceState::Missing;
            }
        }
    }
}
