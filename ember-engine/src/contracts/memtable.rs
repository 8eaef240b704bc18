//! A deterministic in-memory stand-in for the storage engine, script runtime,
//! and dup-res/replication peers, used only by tests and the demonstration
//! binary (§4.8 "Implementation notes"). Nothing here is on the hot path of
//! a real node.

use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;
use hashbrown::HashMap;

use super::{DupResCoordinator, Generation, Record, RecordOp, ReplicationCoordinator, ScriptEngine, StorageEngine, VoidTime};

#[derive(Clone)]
pub struct MemRecord {
    pre_existed: bool,
    exists: bool,
    generation: Generation,
    void_time: VoidTime,
    bins: HashMap<String, Bytes>,
}

impl MemRecord {
    pub fn new(pre_existed: bool) -> MemRecord {
        MemRecord {
            pre_existed,
            exists: pre_existed,
            generation: if pre_existed { 1 } else { 0 },
            void_time: 0,
            bins: HashMap::new(),
        }
    }
}

impl Record for MemRecord {
    fn exists(&self) -> bool {
        self.exists
    }

    fn pre_existed(&self) -> bool {
        self.pre_existed
    }

    fn generation(&self) -> Generation {
        self.generation
    }

    fn void_time(&self) -> VoidTime {
        self.void_time
    }

    fn set_void_time(&mut self, void_time: VoidTime) {
        self.void_time = void_time;
    }

    fn bin(&self, name: &str) -> Option<Bytes> {
        self.bins.get(name).cloned()
    }

    fn bin_names(&self) -> Vec<String> {
        self.bins.keys().cloned().collect()
    }

    fn set_bin(&mut self, name: &str, value: Bytes) {
        self.exists = true;
        self.bins.insert(name.to_owned(), value);
    }

    fn remove_bin(&mut self, name: &str) {
        self.bins.remove(name);
    }

    fn bin_count(&self) -> usize {
        self.bins.len()
    }

    fn bump_generation(&mut self) {
        self.generation += 1;
    }
}

/// Keyed by `(namespace, digest)`; stands in for a partition tree.
pub struct MemStorage {
    records: Mutex<HashMap<(String, Vec<u8>), MemRecord>>,
}

impl MemStorage {
    pub fn new() -> MemStorage {
        MemStorage { records: Mutex::new(HashMap::new()) }
    }
}

impl StorageEngine for MemStorage {
    fn open(&self, namespace: &str, digest: &[u8]) -> Box<dyn Record> {
        let key = (namespace.to_owned(), digest.to_owned());
        match self.records.lock().unwrap().get(&key) {
            Some(existing) => Box::new(existing.clone()),
            None => Box::new(MemRecord::new(false)),
        }
    }

    fn commit(&self, namespace: &str, digest: &[u8], record: Box<dyn Record>) {
        let mut snapshot = MemRecord::new(record.pre_existed());
        snapshot.exists = record.exists();
        snapshot.generation = record.generation();
        snapshot.void_time = record.void_time();
        for name in record.bin_names() {
            if let Some(value) = record.bin(&name) {
                snapshot.bins.insert(name, value);
            }
        }

        let key = (namespace.to_owned(), digest.to_owned());
        self.records.lock().unwrap().insert(key, snapshot);
    }

    fn delete(&self, namespace: &str, digest: &[u8]) {
        let key = (namespace.to_owned(), digest.to_owned());
        self.records.lock().unwrap().remove(&key);
    }

    fn overloaded(&self) -> bool {
        false
    }

    fn record_count(&self, namespace: &str) -> usize {
        self.records.lock().unwrap().keys().filter(|(ns, _)| ns == namespace).count()
    }
}

/// Treats the UDF argument list as `bin_name=value` pairs separated by `;`
/// and writes each into the record. Deterministic and side-effect-free
/// beyond that, which is all the pipeline tests need from a "script".
pub struct EchoScriptEngine;

impl ScriptEngine for EchoScriptEngine {
    fn apply(&self, _package: &str, _function: &str, args: &Bytes, record: &mut dyn Record, _deadline: Instant) -> bool {
        let text = match std::str::from_utf8(args) {
            Ok(text) => text,
            Err(_) => return false,
        };

        for pair in text.split(';').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((name, value)) => record.set_bin(name, Bytes::copy_from_slice(value.as_bytes())),
                None => return false,
            }
        }

        true
    }
}

/// Resolves synchronously, on the calling thread, since an in-memory node
/// has no peers to race.
pub struct ImmediateDupRes;

impl DupResCoordinator for ImmediateDupRes {
    fn resolve(&self, _namespace: &str, _digest: &[u8], callback: Box<dyn FnOnce() + Send>) {
        callback();
    }
}

pub struct ImmediateReplication;

impl ReplicationCoordinator for ImmediateReplication {
    fn replicate(&self, _namespace: &str, _digest: &[u8], _op: RecordOp, callback: Box<dyn FnOnce() + Send>) {
        callback();
    }
}
