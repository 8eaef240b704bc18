//! Node configuration, loaded once at startup into a typed struct. Nothing downstream
//! re-parses; components receive already-validated values through their constructors.

use serde_derive::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, ErrorKind, Result};

fn default_service_threads() -> usize {
    num_cpus_fallback()
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_transaction_queues() -> usize {
    4
}
fn default_threads_per_queue() -> usize {
    4
}
fn default_proto_fd_max() -> usize {
    15000
}
fn default_proto_fd_idle_ms() -> u64 {
    60_000
}
fn default_batch_index_threads() -> usize {
    4
}
fn default_batch_max_buffers_per_queue() -> usize {
    255
}
fn default_batch_max_unused_buffers() -> usize {
    64
}
fn default_batch_max_requests() -> usize {
    30_000
}
fn default_transaction_max_ms() -> u64 {
    1000
}
fn default_ticker_interval() -> u64 {
    10
}
fn default_bind_address() -> String {
    "0.0.0.0:3000".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub service_address: String,

    pub loopback_address: Option<String>,
    pub xdr_address: Option<String>,

    #[serde(default = "default_service_threads")]
    pub service_threads: usize,

    #[serde(default = "default_transaction_queues")]
    pub transaction_queues: usize,

    #[serde(default = "default_threads_per_queue")]
    pub transaction_threads_per_queue: usize,

    #[serde(default = "default_proto_fd_max")]
    pub proto_fd_max: usize,

    #[serde(default = "default_proto_fd_idle_ms")]
    pub proto_fd_idle_ms: u64,

    #[serde(default = "default_batch_index_threads")]
    pub batch_index_threads: usize,

    #[serde(default = "default_batch_max_buffers_per_queue")]
    pub batch_max_buffers_per_queue: usize,

    #[serde(default = "default_batch_max_unused_buffers")]
    pub batch_max_unused_buffers: usize,

    #[serde(default = "default_batch_max_requests")]
    pub batch_max_requests: usize,

    #[serde(default)]
    pub allow_inline_transactions: bool,

    #[serde(default = "default_transaction_max_ms")]
    pub transaction_max_ms: u64,

    #[serde(default)]
    pub respond_client_on_master_completion: bool,

    #[serde(default = "default_ticker_interval")]
    pub ticker_interval: u64,

    #[serde(default)]
    pub write_duplicate_resolution_disable: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            service_address: default_bind_address(),
            loopback_address: None,
            xdr_address: None,
            service_threads: default_service_threads(),
            transaction_queues: default_transaction_queues(),
            transaction_threads_per_queue: default_threads_per_queue(),
            proto_fd_max: default_proto_fd_max(),
            proto_fd_idle_ms: default_proto_fd_idle_ms(),
            batch_index_threads: default_batch_index_threads(),
            batch_max_buffers_per_queue: default_batch_max_buffers_per_queue(),
            batch_max_unused_buffers: default_batch_max_unused_buffers(),
            batch_max_requests: default_batch_max_requests(),
            allow_inline_transactions: false,
            transaction_max_ms: default_transaction_max_ms(),
            respond_client_on_master_completion: false,
            ticker_interval: default_ticker_interval(),
            write_duplicate_resolution_disable: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config> {
        serdeconv::from_toml_file(path)
            .map_err(|_| Error::Fatal(ErrorKind::Parameter("malformed config file")))
    }
}
