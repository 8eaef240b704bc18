//! Request hash & lifecycle (§4.6): at most one in-flight transaction per
//! `(namespace, digest)` key, with a timeout sweeper racing natural
//! completion for the right to respond.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::txn::{Digest, Origin};

const DEFAULT_SHARD_COUNT: usize = 32;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RequestKey {
    pub namespace_id: u16,
    pub digest: Digest,
}

impl RequestKey {
    pub fn new(namespace_id: u16, digest: Digest) -> RequestKey {
        RequestKey { namespace_id, digest }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InsertResult {
    InProgress,
    Waiting,
}

/// One in-flight slot. Guarded by its own mutex so the completion path and
/// the timeout sweeper can race over `from_any` without a shard-wide lock.
pub struct PendingEntry {
    from_any: Option<Origin>,
    end_time: Instant,
}

impl PendingEntry {
    fn new(origin: Origin, end_time: Instant) -> PendingEntry {
        PendingEntry { from_any: Some(origin), end_time }
    }

    /// Nulls `from_any` and returns whatever was there. The first caller to
    /// observe `Some` — whether the natural-completion path or the timeout
    /// sweeper — owns the response; the other observes `None` and no-ops
    /// (§4.6 "exactly one of {completion, timeout} wins").
    fn take_origin(&mut self) -> Option<Origin> {
        self.from_any.take()
    }
}

pub struct RequestHash {
    shards: Vec<Mutex<HashMap<RequestKey, Arc<Mutex<PendingEntry>>>>>,
}

impl RequestHash {
    pub fn new() -> RequestHash {
        RequestHash::with_shards(DEFAULT_SHARD_COUNT)
    }

    pub fn with_shards(shard_count: usize) -> RequestHash {
        let shard_count = shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Mutex::new(HashMap::new()));
        }
        RequestHash { shards }
    }

    fn shard_index(&self, key: &RequestKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Inserts a new in-flight entry for `key`, unless one is already
    /// active, in which case `Waiting` is returned and the caller applies
    /// its own chain-or-reject policy (§4.6).
    pub fn insert(&self, key: RequestKey, origin: Origin, end_time: Instant) -> InsertResult {
        let shard_idx = self.shard_index(&key);
        let mut shard = self.shards[shard_idx].lock().unwrap();
        if shard.contains_key(&key) {
            return InsertResult::Waiting;
        }
        shard.insert(key, Arc::new(Mutex::new(PendingEntry::new(origin, end_time))));
        InsertResult::InProgress
    }

    /// Natural completion: removes the entry and returns its origin if the
    /// timeout sweeper hasn't already claimed it.
    pub fn complete(&self, key: &RequestKey) -> Option<Origin> {
        let shard_idx = self.shard_index(key);
        let entry = {
            let mut shard = self.shards[shard_idx].lock().unwrap();
            shard.remove(key)
        };
        let entry = entry?;
        let mut pending = entry.lock().unwrap();
        pending.take_origin()
    }

    /// Walks every shard independently (§5 "sweeper walks shards
    /// independently"), removing and returning the origin of any entry whose
    /// deadline has passed and that the completion path hasn't already
    /// claimed.
    pub fn sweep_timeouts(&self, now: Instant) -> Vec<(RequestKey, Origin)> {
        let mut expired = Vec::new();
        for shard in &self.shards {
            let timed_out: Vec<RequestKey> = {
                let guard = shard.lock().unwrap();
                guard
                    .iter()
                    .filter(|(_, entry)| entry.lock().unwrap().end_time <= now)
                    .map(|(key, _)| key.clone())
                    .collect()
            };

            for key in timed_out {
                let entry = {
                    let mut guard = shard.lock().unwrap();
                    guard.remove(&key)
                };
                if let Some(entry) = entry {
                    if let Some(origin) = entry.lock().unwrap().take_origin() {
                        expired.push((key, origin));
                    }
                }
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
