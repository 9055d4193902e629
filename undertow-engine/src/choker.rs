use std::collections::{HashMap, HashSet};

use rand::seq::IndexedRandom;
use tracing::debug;

use crate::peer::Pid;

/// Delta produced by one choke round: which peers to newly choke and
/// which to newly unchoke. Peers absent from both keep their state.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChokeUpdate {
    pub to_unchoke: Vec<Pid>,
    pub to_choke: Vec<Pid>,
}

/// Decides which interested peers receive upload bandwidth. Top-K by
/// the contribution rate the swarm measured for each peer, plus one
/// optimistic slot that rotates to a random choked-but-interested peer
/// so better partners keep getting discovered. Purely local policy: the
/// only inputs are per-peer stats.
pub struct Choker {
    upload_slots: usize,
    optimistic_rounds: u32,
    unchoked: HashSet<Pid>,
    interested: HashSet<Pid>,
    optimistic: Option<Pid>,
    round: u32,
}

impl Choker {
    pub fn new(upload_slots: usize, optimistic_rounds: u32) -> Self {
        Self {
            upload_slots,
            optimistic_rounds: optimistic_rounds.max(1),
            unchoked: HashSet::new(),
            interested: HashSet::new(),
            optimistic: None,
            round: 0,
        }
    }

    pub fn set_interest(&mut self, pid: Pid, interested: bool) {
        if interested {
            self.interested.insert(pid);
        } else {
            self.interested.remove(&pid);
        }
    }

    pub fn peer_gone(&mut self, pid: Pid) {
        self.interested.remove(&pid);
        self.unchoked.remove(&pid);
        if self.optimistic == Some(pid) {
            self.optimistic = None;
        }
    }

    pub fn is_unchoked(&self, pid: Pid) -> bool {
        self.unchoked.contains(&pid)
    }

    /// One choke round. `rates` maps every connected peer to its recent
    /// contribution (download rate they give us while leeching, upload
    /// rate we give them while seeding).
    pub fn run_round(&mut self, rates: &HashMap<Pid, u64>) -> ChokeUpdate {
        self.round += 1;

        // drop peers that vanished between rounds
        self.interested.retain(|pid| rates.contains_key(pid));
        if self
            .optimistic
            .is_some_and(|pid| !rates.contains_key(&pid))
        {
            self.optimistic = None;
        }

        // regular slots: fastest interested peers, ties broken by pid so
        // rounds are reproducible
        let mut ranked: Vec<Pid> = self.interested.iter().copied().collect();
        ranked.sort_by_key(|pid| (std::cmp::Reverse(rates.get(pid).copied().unwrap_or(0)), pid.0));
        let mut next: HashSet<Pid> = ranked.iter().copied().take(self.upload_slots).collect();

        // optimistic slot rotates on its own cadence
        if (self.round - 1) % self.optimistic_rounds == 0 || self.optimistic.is_none() {
            let choked_interested: Vec<Pid> = self
                .interested
                .iter()
                .filter(|pid| !next.contains(pid))
                .copied()
                .collect();
            self.optimistic = choked_interested.choose(&mut rand::rng()).copied();
        }
        if let Some(pid) = self.optimistic {
            if self.interested.contains(&pid) {
                next.insert(pid);
            }
        }

        let to_choke: Vec<Pid> = self.unchoked.difference(&next).copied().collect();
        let to_unchoke: Vec<Pid> = next.difference(&self.unchoked).copied().collect();
        self.unchoked = next;

        if !to_choke.is_empty() || !to_unchoke.is_empty() {
            debug!(?to_unchoke, ?to_choke, "choke round");
        }

        ChokeUpdate {
            to_unchoke,
            to_choke,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates(entries: &[(Pid, u64)]) -> HashMap<Pid, u64> {
        entries.iter().copied().collect()
    }

    #[test]
    fn top_k_by_contribution_unchoked() {
        let mut choker = Choker::new(2, u32::MAX);
        let (a, b, c) = (Pid(1), Pid(2), Pid(3));
        for pid in [a, b, c] {
            choker.set_interest(pid, true);
        }

        let update = choker.run_round(&rates(&[(a, 100), (b, 50), (c, 10)]));

        assert!(choker.is_unchoked(a));
        assert!(choker.is_unchoked(b));
        // c stays choked unless it won the optimistic slot
        assert_eq!(choker.is_unchoked(c), choker.optimistic == Some(c));
        assert!(update.to_unchoke.contains(&a));
        assert!(update.to_unchoke.contains(&b));
        assert!(update.to_choke.is_empty());
    }

    #[test]
    fn uninterested_peers_never_unchoked() {
        let mut choker = Choker::new(4, u32::MAX);
        choker.set_interest(Pid(1), true);

        choker.run_round(&rates(&[(Pid(1), 10), (Pid(2), 1000)]));
        assert!(choker.is_unchoked(Pid(1)));
        assert!(!choker.is_unchoked(Pid(2)));
    }

    #[test]
    fn overtaken_peer_gets_choked() {
        let mut choker = Choker::new(1, u32::MAX);
        let (a, b) = (Pid(1), Pid(2));
        choker.set_interest(a, true);

        choker.run_round(&rates(&[(a, 100), (b, 0)]));
        assert!(choker.is_unchoked(a));

        // b becomes interested and faster; a loses its slot (a may keep
        // an optimistic slot, so force it off by clearing interest)
        choker.set_interest(a, false);
        choker.set_interest(b, true);
        let update = choker.run_round(&rates(&[(a, 100), (b, 200)]));

        assert!(update.to_choke.contains(&a));
        assert!(choker.is_unchoked(b));
    }

    #[test]
    fn optimistic_slot_comes_from_choked_interested() {
        let mut choker = Choker::new(1, 1);
        let (a, b, c) = (Pid(1), Pid(2), Pid(3));
        for pid in [a, b, c] {
            choker.set_interest(pid, true);
        }

        choker.run_round(&rates(&[(a, 100), (b, 5), (c, 5)]));

        let optimistic = choker.optimistic.unwrap();
        assert_ne!(optimistic, a);
        assert!(choker.is_unchoked(optimistic));
        assert_eq!(
            choker.unchoked.len(),
            2,
            "one regular slot plus the optimistic slot"
        );
    }

    #[test]
    fn departed_peer_is_forgotten() {
        let mut choker = Choker::new(2, u32::MAX);
        choker.set_interest(Pid(1), true);
        choker.run_round(&rates(&[(Pid(1), 10)]));
        assert!(choker.is_unchoked(Pid(1)));

        choker.peer_gone(Pid(1));
        assert!(!choker.is_unchoked(Pid(1)));

        // next round must not try to choke the departed peer
        let update = choker.run_round(&rates(&[]));
        assert!(update.to_choke.is_empty());
    }
}
