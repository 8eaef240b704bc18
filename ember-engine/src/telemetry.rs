//! Per-subsystem telemetry (§4.11): monotonic `AtomicU64` counters plus a
//! fixed-bucket latency histogram, read (never reset) by the ticker, matching
//! the teacher's counter-style statistics rather than a windowed metrics
//! library.

use std::sync::atomic::{AtomicU64, Ordering};

/// Power-of-two bucketed histogram up to a configurable ceiling. Bucket `i`
/// holds samples in `(2^i, 2^(i+1)]` microseconds; the last bucket also
/// absorbs anything at or above the ceiling.
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    ceiling_shift: u32,
}

impl Histogram {
    pub fn new(ceiling_shift: u32) -> Histogram {
        let count = ceiling_shift as usize + 1;
        Histogram { buckets: (0..count).map(|_| AtomicU64::new(0)).collect(), ceiling_shift }
    }

    /// Records one sample, in microseconds.
    pub fn record(&self, value_us: u64) {
        let bucket = if value_us == 0 { 0 } else { (64 - value_us.leading_zeros()) as usize };
        let bucket = bucket.min(self.ceiling_shift as usize);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// A snapshot dump suitable for the ticker: `(bucket_upper_bound_us, count)`.
    pub fn dump(&self) -> Vec<(u64, u64)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(idx, count)| (1u64 << idx, count.load(Ordering::Relaxed)))
            .collect()
    }
}

#[derive(Default)]
pub struct ConnectionStats {
    pub opened: AtomicU64,
    pub closed: AtomicU64,
    pub demarshal_errors: AtomicU64,
}

#[derive(Default)]
pub struct TimeoutStats {
    pub client: AtomicU64,
    pub proxy: AtomicU64,
    pub batch_sub: AtomicU64,
    pub internal_udf: AtomicU64,
}

impl TimeoutStats {
    fn counter(&self, origin: TimeoutOrigin) -> &AtomicU64 {
        match origin {
            TimeoutOrigin::Client => &self.client,
            TimeoutOrigin::Proxy => &self.proxy,
            TimeoutOrigin::BatchSub => &self.batch_sub,
            TimeoutOrigin::InternalUdf => &self.internal_udf,
        }
    }

    pub fn note(&self, origin: TimeoutOrigin) {
        self.counter(origin).fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimeoutOrigin {
    Client,
    Proxy,
    BatchSub,
    InternalUdf,
}

#[derive(Default)]
pub struct BatchStats {
    pub rows_processed: AtomicU64,
    pub rows_errored: AtomicU64,
}

#[derive(Default)]
pub struct UdfStats {
    pub success: AtomicU64,
    pub error: AtomicU64,
}

/// Process-wide telemetry; one instance shared behind an `Arc` by every
/// connection, batch worker, and UDF pipeline in the node.
pub struct Telemetry {
    pub connections: ConnectionStats,
    pub timeouts: TimeoutStats,
    pub batch: BatchStats,
    pub udf: UdfStats,
    pub transaction_latency_us: Histogram,
}

const DEFAULT_HISTOGRAM_CEILING_SHIFT: u32 = 30; // ~17 minutes in microseconds

impl Telemetry {
    pub fn new() -> Telemetry {
        Telemetry {
            connections: ConnectionStats::default(),
            timeouts: TimeoutStats::default(),
            batch: BatchStats::default(),
            udf: UdfStats::default(),
            transaction_latency_us: Histogram::new(DEFAULT_HISTOGRAM_CEILING_SHIFT),
        }
    }
}

impl Default for Telemetry {
    fn default() -> Telemetry {
        Telemetry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_by_power_of_two() {
        let hist = Histogram::new(10);
        hist.record(1);
        hist.record(3);
        hist.record(1000);
        let dump = hist.dump();
        assert!(dump.iter().any(|(_, count)| *count > 0));
    }

    #[test]
    fn histogram_clamps_values_past_the_ceiling() {
        let hist = Histogram::new(4);
        hist.record(u64::MAX);
        let dump = hist.dump();
        assert_eq!(dump.last().unwrap().1, 1);
    }

    #[test]
    fn timeout_stats_route_by_origin() {
        let stats = TimeoutStats::default();
        stats.note(TimeoutOrigin::Client);
        stats.note(TimeoutOrigin::Client);
        stats.note(TimeoutOrigin::BatchSub);
        assert_eq!(stats.client.load(Ordering::Relaxed), 2);
        assert_eq!(stats.batch_sub.load(Ordering::Relaxed), 1);
        assert_eq!(stats.proxy.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn telemetry_new_starts_at_zero() {
        let telemetry = Telemetry::new();
        assert_eq!(telemetry.connections.opened.load(Ordering::Relaxed), 0);
        assert_eq!(telemetry.udf.success.load(Ordering::Relaxed), 0);
    }
}
