use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tracing::debug;

use undertow_common::TorrentInfo;
use undertow_wire::BlockInfo;

use crate::{availability::AvailabilityTracker, bitfield::Bitfield, peer::Pid, store::BLOCK_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockStatus {
    Open,
    /// Requested from these peers. More than one entry only in endgame.
    Requested(Vec<Pid>),
    Received,
}

/// Decides which blocks to request from which peer: rarest-first piece
/// order, lowest-offset block order within a piece, and redundant
/// dispatch once the download enters endgame. All request bookkeeping
/// lives here so a disconnect or timeout can hand blocks back for
/// reassignment.
pub struct PieceScheduler {
    torrent: Arc<TorrentInfo>,
    blocks: Vec<Vec<BlockStatus>>,
    done: Vec<bool>,
    inflight: HashMap<Pid, HashSet<BlockInfo>>,
    pipeline_depth: usize,
    endgame_floor: usize,
    endgame: bool,
}

impl PieceScheduler {
    pub fn new(torrent: Arc<TorrentInfo>, pipeline_depth: usize, endgame_floor: usize) -> Self {
        let blocks = (0..torrent.num_pieces())
            .map(|i| vec![BlockStatus::Open; torrent.block_count(i)])
            .collect();
        let done = vec![false; torrent.num_pieces()];
        Self {
            torrent,
            blocks,
            done,
            inflight: HashMap::new(),
            pipeline_depth,
            endgame_floor,
            endgame: false,
        }
    }

    pub fn endgame(&self) -> bool {
        self.endgame
    }

    pub fn outstanding(&self, pid: Pid) -> usize {
        self.inflight.get(&pid).map(HashSet::len).unwrap_or(0)
    }

    pub fn remaining_pieces(&self) -> usize {
        self.done.iter().filter(|d| !**d).count()
    }

    fn block_info(&self, piece: usize, block: usize) -> BlockInfo {
        BlockInfo {
            index: piece as u32,
            begin: block as u32 * BLOCK_SIZE,
            length: self.torrent.block_len(piece, block),
        }
    }

    /// Re-evaluate endgame activation. Endgame turns on once the number
    /// of unverified pieces drops below min(connected peers, floor) and
    /// never turns back off.
    pub fn update_endgame(&mut self, connected_peers: usize) {
        if self.endgame {
            return;
        }
        let threshold = connected_peers.min(self.endgame_floor);
        let remaining = self.remaining_pieces();
        if remaining > 0 && remaining < threshold {
            debug!(remaining, threshold, "entering endgame");
            self.endgame = true;
        }
    }

    /// Pick the next blocks to request from `pid`, bounded by its spare
    /// pipeline capacity. Candidate pieces are those the peer advertises
    /// and we have not verified; outside endgame a block already
    /// requested from any peer is off the table.
    pub fn next_requests(
        &mut self,
        pid: Pid,
        peer_bitfield: &Bitfield,
        availability: &AvailabilityTracker,
    ) -> Vec<BlockInfo> {
        let capacity = self
            .pipeline_depth
            .saturating_sub(self.outstanding(pid));
        if capacity == 0 {
            return Vec::new();
        }

        let candidates = (0..self.torrent.num_pieces()).filter(|&i| {
            !self.done[i]
                && peer_bitfield.has(i)
                && self.blocks[i].iter().any(|b| match b {
                    BlockStatus::Open => true,
                    BlockStatus::Requested(peers) => self.endgame && !peers.contains(&pid),
                    BlockStatus::Received => false,
                })
        });

        let ordered: Vec<usize> = availability.rarest_first_order(candidates).collect();

        let mut picked = Vec::new();
        'outer: for piece in ordered {
            for block in 0..self.blocks[piece].len() {
                if picked.len() == capacity {
                    break 'outer;
                }
                let assignable = match &self.blocks[piece][block] {
                    BlockStatus::Open => true,
                    BlockStatus::Requested(peers) => self.endgame && !peers.contains(&pid),
                    BlockStatus::Received => false,
                };
                if assignable {
                    let info = self.block_info(piece, block);
                    match &mut self.blocks[piece][block] {
                        BlockStatus::Open => {
                            self.blocks[piece][block] = BlockStatus::Requested(vec![pid]);
                        }
                        BlockStatus::Requested(peers) => peers.push(pid),
                        BlockStatus::Received => unreachable!(),
                    }
                    self.inflight.entry(pid).or_default().insert(info);
                    picked.push(info);
                }
            }
        }
        picked
    }

    /// A block arrived from `pid`. Returns the duplicate in-flight
    /// requests (endgame) that should now be cancelled on other peers.
    /// A late duplicate arrival returns an empty list and the block is
    /// simply not re-counted. An arrival whose geometry does not match
    /// the request grid is ignored entirely; the slot keeps its state
    /// so the real block can still be fetched.
    pub fn block_received(&mut self, pid: Pid, info: BlockInfo) -> Vec<(Pid, BlockInfo)> {
        if let Some(set) = self.inflight.get_mut(&pid) {
            set.remove(&info);
        }

        let (piece, block) = (info.index as usize, (info.begin / BLOCK_SIZE) as usize);
        if piece >= self.blocks.len()
            || block >= self.blocks[piece].len()
            || info.begin % BLOCK_SIZE != 0
            || info.length != self.torrent.block_len(piece, block)
        {
            return Vec::new();
        }
        let status = &mut self.blocks[piece][block];

        match std::mem::replace(status, BlockStatus::Received) {
            BlockStatus::Requested(peers) => {
                let mut cancels = Vec::new();
                for other in peers {
                    if other != pid {
                        if let Some(set) = self.inflight.get_mut(&other) {
                            set.remove(&info);
                        }
                        cancels.push((other, info));
                    }
                }
                cancels
            }
            // late duplicate (already received) or unsolicited arrival
            _ => Vec::new(),
        }
    }

    /// Hand a request back (timeout, peer-sent choke, or our cancel).
    /// The block reopens once no peer has it in flight.
    pub fn release(&mut self, pid: Pid, info: BlockInfo) {
        if let Some(set) = self.inflight.get_mut(&pid) {
            set.remove(&info);
        }

        let (piece, block) = (info.index as usize, (info.begin / BLOCK_SIZE) as usize);
        if let Some(BlockStatus::Requested(peers)) = self
            .blocks
            .get_mut(piece)
            .and_then(|blocks| blocks.get_mut(block))
        {
            peers.retain(|&p| p != pid);
            if peers.is_empty() {
                self.blocks[piece][block] = BlockStatus::Open;
            }
        }
    }

    /// All of a departed peer's outstanding requests become reassignable.
    /// Returns exactly the blocks that were in flight to it.
    pub fn peer_gone(&mut self, pid: Pid) -> Vec<BlockInfo> {
        let outstanding: Vec<BlockInfo> = self
            .inflight
            .remove(&pid)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for info in &outstanding {
            let (piece, block) = (info.index as usize, (info.begin / BLOCK_SIZE) as usize);
            if let Some(BlockStatus::Requested(peers)) = self
                .blocks
                .get_mut(piece)
                .and_then(|blocks| blocks.get_mut(block))
            {
                peers.retain(|&p| p != pid);
                if peers.is_empty() {
                    self.blocks[piece][block] = BlockStatus::Open;
                }
            }
        }
        outstanding
    }

    pub fn piece_verified(&mut self, index: u32) {
        if let Some(done) = self.done.get_mut(index as usize) {
            *done = true;
        }
    }

    /// A piece failed its hash check: every block reopens for request.
    pub fn piece_invalid(&mut self, index: u32) {
        if let Some(blocks) = self.blocks.get_mut(index as usize) {
            for status in blocks.iter_mut() {
                *status = BlockStatus::Open;
            }
        }
    }

    /// True when any block of the piece is requested from some peer.
    pub fn piece_in_flight(&self, index: u32) -> bool {
        self.blocks
            .get(index as usize)
            .map(|blocks| {
                blocks
                    .iter()
                    .any(|b| matches!(b, BlockStatus::Requested(_)))
            })
            .unwrap_or(false)
    }

    /// True when every block of the piece has been received (the store
    /// should have it fully buffered).
    pub fn piece_received(&self, index: u32) -> bool {
        self.blocks
            .get(index as usize)
            .map(|blocks| blocks.iter().all(|b| *b == BlockStatus::Received))
            .unwrap_or(false)
    }
}
