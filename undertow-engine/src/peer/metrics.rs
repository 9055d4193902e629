use std::sync::atomic::{AtomicU64, Ordering};

/// Byte counters for one peer, shared between its connection task
/// (writer) and the swarm controller (reader, for choke ranking and
/// aggregate stats). Only payload bytes count; protocol overhead does
/// not.
#[derive(Debug, Default)]
pub struct PeerMetrics {
    downloaded: AtomicU64,
    uploaded: AtomicU64,
}

impl PeerMetrics {
    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }
}

/// Exponentially weighted moving average over per-interval byte counts.
/// Smooths the bursty raw deltas into something usable for choke
/// ranking and the published transfer rates.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    value: f64,
    alpha: f64,
}

impl RateEstimator {
    pub fn new(alpha: f64) -> Self {
        Self {
            value: 0.0,
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    /// Feed one interval's byte count, returning the smoothed rate.
    pub fn update(&mut self, sample: u64) -> u64 {
        self.value = self.alpha * sample as f64 + (1.0 - self.alpha) * self.value;
        self.rate()
    }

    pub fn rate(&self) -> u64 {
        self.value as u64
    }
}

/// Render a bytes-per-second rate for log output, e.g. "1.2 MiB/s".
pub fn format_rate(bytes_per_sec: u64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bytes_per_sec as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes_per_sec} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
