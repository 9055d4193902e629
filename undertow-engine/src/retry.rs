use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

const MAX_TRACKED: usize = 1000;
const MAX_ATTEMPTS: u32 = 5;
const INITIAL_DELAY: Duration = Duration::from_secs(5);
const MAX_DELAY: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct FailedPeer {
    attempts: u32,
    last_attempt: Instant,
    next_retry: Instant,
}

/// Candidates that failed to connect, retried with exponential backoff
/// and given up on after a handful of attempts. Keeps the swarm from
/// hammering dead addresses every tick.
#[derive(Debug, Default)]
pub struct RetryQueue {
    peers: HashMap<SocketAddr, FailedPeer>,
}

impl RetryQueue {
    pub fn record_failure(&mut self, addr: SocketAddr) {
        if self.peers.len() >= MAX_TRACKED && !self.peers.contains_key(&addr) {
            // evict the stalest entry to make room
            if let Some(oldest) = self
                .peers
                .iter()
                .min_by_key(|(_, entry)| entry.last_attempt)
                .map(|(addr, _)| *addr)
            {
                self.peers.remove(&oldest);
            }
        }

        let now = Instant::now();
        let entry = self.peers.entry(addr).or_insert(FailedPeer {
            attempts: 0,
            last_attempt: now,
            next_retry: now,
        });
        entry.attempts += 1;
        entry.last_attempt = now;
        entry.next_retry = now + Self::backoff(entry.attempts);
    }

    /// Addresses whose backoff has elapsed. Entries past the attempt cap
    /// are dropped instead of returned.
    pub fn take_ready(&mut self, now: Instant) -> Vec<SocketAddr> {
        let mut ready = Vec::new();
        self.peers.retain(|addr, entry| {
            if entry.attempts >= MAX_ATTEMPTS {
                return false;
            }
            if now >= entry.next_retry {
                ready.push(*addr);
            }
            true
        });
        ready
    }

    /// Forget an address, e.g. after a successful connection.
    pub fn forget(&mut self, addr: &SocketAddr) {
        self.peers.remove(addr);
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    fn backoff(attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(10);
        (INITIAL_DELAY * 2u32.pow(exp)).min(MAX_DELAY)
    }
}
