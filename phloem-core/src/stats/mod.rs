//! Worker statistics: counters, latency records, and online summaries
//!
//! Workers own the write side. Counters are atomics polled for interval
//! deltas by the monitor thread; raw latency measurements travel through a
//! two-lock record queue so a worker appending and the monitor draining never
//! contend for longer than an append or a swap.

pub mod aggregator;

pub use aggregator::{RunSummary, StatsAggregator, WorkerSummary};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// Monotonic event counter with interval polling
#[derive(Debug, Default)]
pub struct CountStat {
    total: AtomicU64,
    last_polled: AtomicU64,
}

impl CountStat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Count accumulated since the previous poll. Only the monitor thread
    /// polls, so the cursor is a plain swap.
    pub fn poll_change(&self) -> u64 {
        let current = self.total.load(Ordering::Relaxed);
        let previous = self.last_polled.swap(current, Ordering::Relaxed);
        current - previous
    }
}

/// Online summary of one sample stream
///
/// Cumulative-moving-average form: cheap per sample, adequate for
/// microsecond-scale latencies at the sample counts one reporting interval
/// produces.
#[derive(Debug, Clone, Copy)]
pub struct ValueStatistics {
    count: u64,
    average: f64,
    variance: f64,
    sum: f64,
    sum_of_squares: f64,
    max: f64,
    min: f64,
}

impl Default for ValueStatistics {
    fn default() -> Self {
        Self {
            count: 0,
            average: 0.0,
            variance: 0.0,
            sum: 0.0,
            sum_of_squares: 0.0,
            max: f64::NEG_INFINITY,
            min: f64::INFINITY,
        }
    }
}

impl ValueStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sample: f64) {
        self.count += 1;
        if sample > self.max {
            self.max = sample;
        }
        if sample < self.min {
            self.min = sample;
        }
        self.average = (sample + self.average * (self.count - 1) as f64) / self.count as f64;
        self.sum += sample;
        self.sum_of_squares += sample * sample;
        self.variance = if self.count > 1 {
            (self.sum_of_squares - self.sum * self.sum / self.count as f64)
                / (self.count - 1) as f64
        } else {
            0.0
        };
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold another stream's summary into this one
    pub fn merge(&mut self, other: &ValueStatistics) {
        if other.count == 0 {
            return;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.sum_of_squares += other.sum_of_squares;
        if other.max > self.max {
            self.max = other.max;
        }
        if other.min < self.min {
            self.min = other.min;
        }
        self.average = self.sum / self.count as f64;
        self.variance = if self.count > 1 {
            (self.sum_of_squares - self.sum * self.sum / self.count as f64)
                / (self.count - 1) as f64
        } else {
            0.0
        };
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn average(&self) -> f64 {
        self.average
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn min(&self) -> f64 {
        self.min
    }
}

/// One latency measurement as raw clock readings
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRecord {
    pub start_time: i64,
    pub end_time: i64,
    /// Clock ticks per microsecond for the stamps above
    pub ticks_per_usec: u64,
}

impl TimeRecord {
    pub fn latency_us(&self) -> f64 {
        (self.end_time - self.start_time) as f64 / self.ticks_per_usec as f64
    }
}

/// Latency records in flight between a worker and the monitor
///
/// `pending` and the free pool are separate locks: the worker appends while
/// the monitor processes its drained snapshot, and processed records come
/// back through [`TimeRecordQueue::recycle`].
#[derive(Debug, Default)]
pub struct TimeRecordQueue {
    pending: Mutex<VecDeque<TimeRecord>>,
    pool: Mutex<Vec<TimeRecord>>,
}

impl TimeRecordQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one measurement; worker thread only
    pub fn submit(&self, start_time: i64, end_time: i64, ticks_per_usec: u64) {
        let mut record = self.pool.lock().unwrap().pop().unwrap_or_default();
        record.start_time = start_time;
        record.end_time = end_time;
        record.ticks_per_usec = ticks_per_usec;
        self.pending.lock().unwrap().push_back(record);
    }

    /// Swap out everything pending; monitor thread only
    pub fn drain(&self) -> VecDeque<TimeRecord> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    /// Return processed records to the free pool
    pub fn recycle(&self, records: impl IntoIterator<Item = TimeRecord>) {
        self.pool.lock().unwrap().extend(records);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn pool_len(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}

/// Everything one worker shares with the monitor thread
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Item requests received (provider) or sent (consumer)
    pub item_requests: CountStat,
    /// Refresh images sent (provider) or completed (consumer)
    pub images: CountStat,
    /// Update messages sent (provider) or received (consumer)
    pub updates: CountStat,
    pub generics_sent: CountStat,
    pub generics_received: CountStat,
    /// Generic messages sent carrying a latency stamp
    pub latency_generics_sent: CountStat,
    /// Status messages observed
    pub statuses: CountStat,
    /// Bursts abandoned because the outbound queue was full
    pub out_of_buffers: CountStat,
    /// Messages put on the wire by the paced send paths
    pub msgs_sent: CountStat,
    /// One-way update latency (stamped update to receipt)
    pub update_latency: TimeRecordQueue,
    /// Generic message latency (stamped generic to receipt)
    pub generic_latency: TimeRecordQueue,
    image_start_us: AtomicI64,
    image_end_us: AtomicI64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp the start of image retrieval; only the first call sticks
    pub fn record_image_start(&self, stamp_us: i64) {
        let _ = self.image_start_us.compare_exchange(
            0,
            stamp_us,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Stamp the end of image retrieval; the last call wins
    pub fn record_image_end(&self, stamp_us: i64) {
        self.image_end_us.store(stamp_us, Ordering::Relaxed);
    }

    /// Start and end stamps once both exist
    pub fn image_window_us(&self) -> Option<(i64, i64)> {
        let start = self.image_start_us.load(Ordering::Relaxed);
        let end = self.image_end_us.load(Ordering::Relaxed);
        if start != 0 && end != 0 {
            Some((start, end))
        } else {
            None
        }
    }
}
