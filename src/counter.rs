//! Throughput accounting for torrents and peer sessions.
//!
//! Byte counts are recorded from many tasks, so the counters are plain
//! atomics. Once a second the owning torrent calls [`ThruputCounters::tick`],
//! which folds the bytes of the elapsed round into a running average.

use std::sync::atomic::{AtomicU64, Ordering};

/// The weight used in the running average: the previous average counts for
/// `(AVG_WEIGHT - 1) / AVG_WEIGHT` of the new value.
const AVG_WEIGHT: f64 = 5.0;

/// A single byte counter with a per-second exponential moving average.
#[derive(Default)]
pub(crate) struct Counter {
    /// Total number of bytes recorded since the counter was created.
    total: AtomicU64,
    /// Bytes recorded in the current (not yet ticked) one second round.
    round: AtomicU64,
    /// The moving average, stored as `f64` bits.
    avg: AtomicU64,
}

impl Counter {
    /// Records `n` bytes in the current round.
    pub fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
        self.round.fetch_add(n, Ordering::Relaxed);
    }

    /// Finishes the current round, folding it into the moving average.
    pub fn tick(&self) {
        let round = self.round.swap(0, Ordering::Relaxed);
        let prev = f64::from_bits(self.avg.load(Ordering::Relaxed));
        let avg = prev * ((AVG_WEIGHT - 1.0) / AVG_WEIGHT) + round as f64 / AVG_WEIGHT;
        self.avg.store(avg.to_bits(), Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// The average number of bytes per second over the recent rounds.
    pub fn avg(&self) -> u64 {
        f64::from_bits(self.avg.load(Ordering::Relaxed)) as u64
    }

    /// Clears the round and the average but keeps the total.
    pub fn reset_rate(&self) {
        self.round.store(0, Ordering::Relaxed);
        self.avg.store(0, Ordering::Relaxed);
    }
}

/// A pair of counters for the two directions of a connection or torrent.
#[derive(Default)]
pub(crate) struct ThruputCounters {
    /// Payload bytes received (piece data only, not protocol chatter).
    pub down: Counter,
    /// Payload bytes sent.
    pub up: Counter,
    /// Bytes of hash-failed pieces; advances by the full piece length per
    /// failure.
    pub corrupted: Counter,
}

impl ThruputCounters {
    pub fn tick(&self) {
        self.down.tick();
        self.up.tick();
    }
}
