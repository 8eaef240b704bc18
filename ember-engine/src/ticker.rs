//! The ticker (§4.9): a background thread that wakes once a second and, every
//! `ticker_interval` seconds, logs a snapshot of the node's vital statistics.
//! Cluster formation and migration are out of scope (§1), so the
//! cluster/migration fields below are fixed stand-ins rather than live state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_base::fault::{Context as LogContext, Fault, Severity};
use ember_net::HandleTable;

use crate::batch::BatchWorkerPool;
use crate::contracts::StorageEngine;
use crate::reqhash::RequestHash;
use crate::telemetry::Telemetry;

const WAKE_INTERVAL: Duration = Duration::from_secs(1);

/// One namespace's object-count contribution to a snapshot.
pub struct NamespaceSnapshot {
    pub name: String,
    pub object_count: usize,
}

/// Everything emitted for one tick (§4.9's field list). Cluster size and
/// migration state are always the single-node stand-in values since
/// clustering is out of scope; they are still reported so a snapshot's shape
/// matches what a clustered node would emit.
pub struct TickSnapshot {
    pub node_id: String,
    pub cluster_size: usize,
    pub fds_open: usize,
    pub fds_capacity: usize,
    pub request_hash_size: usize,
    pub batch_pool_size: usize,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub demarshal_errors: u64,
    pub timed_out_client: u64,
    pub timed_out_batch_sub: u64,
    pub udf_success: u64,
    pub udf_error: u64,
    pub namespaces: Vec<NamespaceSnapshot>,
    pub latency_histogram: Vec<(u64, u64)>,
}

struct NamespaceSource {
    name: String,
    storage: Arc<dyn StorageEngine>,
}

/// Owns everything a snapshot is sampled from. Constructed once by the
/// composition root and handed to [`spawn`].
pub struct Ticker {
    node_id: String,
    interval: Duration,
    fault: Arc<Fault>,
    handles: Arc<HandleTable>,
    reqhash: Arc<RequestHash>,
    batch_pool: Arc<BatchWorkerPool>,
    telemetry: Arc<Telemetry>,
    namespaces: Vec<NamespaceSource>,
}

impl Ticker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        interval: Duration,
        fault: Arc<Fault>,
        handles: Arc<HandleTable>,
        reqhash: Arc<RequestHash>,
        batch_pool: Arc<BatchWorkerPool>,
        telemetry: Arc<Telemetry>,
    ) -> Ticker {
        Ticker { node_id: node_id.into(), interval, fault, handles, reqhash, batch_pool, telemetry, namespaces: Vec::new() }
    }

    pub fn register_namespace(&mut self, name: impl Into<String>, storage: Arc<dyn StorageEngine>) {
        self.namespaces.push(NamespaceSource { name: name.into(), storage });
    }

    fn snapshot(&self) -> TickSnapshot {
        TickSnapshot {
            node_id: self.node_id.clone(),
            cluster_size: 1,
            fds_open: self.handles.open_count(),
            fds_capacity: self.handles.capacity(),
            request_hash_size: self.reqhash.len(),
            batch_pool_size: self.batch_pool.pool_size(),
            connections_opened: self.telemetry.connections.opened.load(Ordering::Relaxed),
            connections_closed: self.telemetry.connections.closed.load(Ordering::Relaxed),
            demarshal_errors: self.telemetry.connections.demarshal_errors.load(Ordering::Relaxed),
            timed_out_client: self.telemetry.timeouts.client.load(Ordering::Relaxed),
            timed_out_batch_sub: self.telemetry.timeouts.batch_sub.load(Ordering::Relaxed),
            udf_success: self.telemetry.udf.success.load(Ordering::Relaxed),
            udf_error: self.telemetry.udf.error.load(Ordering::Relaxed),
            namespaces: self
                .namespaces
                .iter()
                .map(|ns| NamespaceSnapshot { name: ns.name.clone(), object_count: ns.storage.record_count(&ns.name) })
                .collect(),
            latency_histogram: self.telemetry.transaction_latency_us.dump(),
        }
    }

    fn log_snapshot(&self, snapshot: &TickSnapshot) {
        let line = format!(
            "node={} cluster_size={} fds={}/{} req_hash={} batch_pool={} conns_opened={} conns_closed={} demarshal_err={} timeouts_client={} timeouts_batch={} udf_ok={} udf_err={} namespaces={}",
            snapshot.node_id,
            snapshot.cluster_size,
            snapshot.fds_open,
            snapshot.fds_capacity,
            snapshot.request_hash_size,
            snapshot.batch_pool_size,
            snapshot.connections_opened,
            snapshot.connections_closed,
            snapshot.demarshal_errors,
            snapshot.timed_out_client,
            snapshot.timed_out_batch_sub,
            snapshot.udf_success,
            snapshot.udf_error,
            snapshot.namespaces.len(),
        );
        self.fault.log(LogContext::Ticker, Severity::Info, &line);

        for ns in &snapshot.namespaces {
            self.fault.log(LogContext::Ticker, Severity::Detail, &format!("  ns={} objects={}", ns.name, ns.object_count));
        }
    }

    /// Spawns the background thread. Wakes every second; emits a snapshot
    /// only once `interval` has elapsed since the last one, and stops waking
    /// once `shutdown` is set (§4.9 "skips frames after shutdown").
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let mut last_tick = Instant::now();
            loop {
                std::thread::sleep(WAKE_INTERVAL);
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                let now = Instant::now();
                if now.duration_since(last_tick) < self.interval {
                    continue;
                }
                last_tick = now;
                let snapshot = self.snapshot();
                self.log_snapshot(&snapshot);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::memtable::MemStorage;

    fn build_ticker() -> Ticker {
        let fault = Arc::new(Fault::new());
        let handles = Arc::new(HandleTable::new(4));
        let reqhash = Arc::new(RequestHash::with_shards(2));
        let mut config = ember_base::config::Config::default();
        config.batch_index_threads = 1;
        let batch_pool = Arc::new(BatchWorkerPool::new(&config));
        let telemetry = Arc::new(Telemetry::new());
        Ticker::new("node-1", Duration::from_secs(10), fault, handles, reqhash, batch_pool, telemetry)
    }

    #[test]
    fn snapshot_reflects_registered_namespaces() {
        let mut ticker = build_ticker();
        let storage: Arc<dyn StorageEngine> = Arc::new(MemStorage::new());
        storage.commit("test", b"digest-a", Box::new(crate::contracts::memtable::MemRecord::new(false)));
        ticker.register_namespace("test", storage);

        let snapshot = ticker.snapshot();
        assert_eq!(snapshot.namespaces.len(), 1);
        assert_eq!(snapshot.namespaces[0].object_count, 1);
    }

    #[test]
    fn snapshot_reports_fd_and_queue_gauges() {
        let ticker = build_ticker();
        let snapshot = ticker.snapshot();
        assert_eq!(snapshot.fds_capacity, 4);
        assert_eq!(snapshot.request_hash_size, 0);
        assert_eq!(snapshot.batch_pool_size, 1);
    }

    #[test]
    fn shutdown_flag_stops_the_thread_without_a_final_tick_guarantee() {
        let ticker = build_ticker();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = ticker.spawn(shutdown.clone());
        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }
}
