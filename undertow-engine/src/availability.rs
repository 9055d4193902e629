use std::collections::HashMap;

use crate::{bitfield::Bitfield, peer::Pid};

/// Per-piece counts of how many connected peers advertise each piece,
/// maintained incrementally from bitfield/have updates and unwound when
/// a peer leaves. Rarest-first ordering for the scheduler comes from
/// here.
pub struct AvailabilityTracker {
    counts: Vec<u32>,
    /// What each peer has told us it has, so a disconnect can decrement
    /// exactly the right counts.
    peer_pieces: HashMap<Pid, Bitfield>,
    num_pieces: usize,
}

impl AvailabilityTracker {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            counts: vec![0; num_pieces],
            peer_pieces: HashMap::new(),
            num_pieces,
        }
    }

    pub fn count(&self, index: usize) -> u32 {
        self.counts.get(index).copied().unwrap_or(0)
    }

    pub fn peer_bitfield(&self, pid: Pid) -> Option<&Bitfield> {
        self.peer_pieces.get(&pid)
    }

    pub fn peer_has(&self, pid: Pid, index: usize) -> bool {
        self.peer_pieces
            .get(&pid)
            .map(|bf| bf.has(index))
            .unwrap_or(false)
    }

    /// Merge a full bitfield for a peer. Replaces whatever we had
    /// recorded for it (a bitfield arrives once, right after handshake).
    pub fn on_peer_bitfield(&mut self, pid: Pid, bitfield: Bitfield) {
        if let Some(old) = self.peer_pieces.remove(&pid) {
            for idx in old.iter_set() {
                self.counts[idx] = self.counts[idx].saturating_sub(1);
            }
        }
        for idx in bitfield.iter_set() {
            self.counts[idx] += 1;
        }
        self.peer_pieces.insert(pid, bitfield);
    }

    pub fn on_peer_have(&mut self, pid: Pid, index: usize) {
        if index >= self.num_pieces {
            return;
        }
        let bf = self
            .peer_pieces
            .entry(pid)
            .or_insert_with(|| Bitfield::new(self.num_pieces));
        if !bf.has(index) {
            // in range per the check above
            let _ = bf.set(index);
            self.counts[index] += 1;
        }
    }

    /// Unregister a peer, decrementing the count of every piece it had
    /// advertised.
    pub fn on_peer_gone(&mut self, pid: Pid) {
        if let Some(bf) = self.peer_pieces.remove(&pid) {
            for idx in bf.iter_set() {
                self.counts[idx] = self.counts[idx].saturating_sub(1);
            }
        }
    }

    /// Order candidate pieces by ascending availability, ties broken by
    /// lowest index so scheduling stays reproducible.
    pub fn rarest_first_order(
        &self,
        candidates: impl IntoIterator<Item = usize>,
    ) -> impl Iterator<Item = usize> {
        let mut ordered: Vec<usize> = candidates
            .into_iter()
            .filter(|&i| i < self.num_pieces)
            .collect();
        ordered.sort_by_key(|&i| (self.counts[i], i));
        ordered.into_iter()
    }
}
