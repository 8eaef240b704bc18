//! Reference-counted file-handle registry (§4.4). A handle wraps one accepted
//! connection; the last release closes the socket and releases its buffers back
//! to the shared chunk pool. Slot allocation/removal is guarded by a table-level
//! mutex, but refcounts and the "do not reap" flag are plain atomics so other
//! threads can inspect or bump them without taking it.

use std::collections::VecDeque;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use mio::net::TcpStream;

use ember_base::fault::{Context, Fault};

use crate::net::buffer::Buffer;
use crate::net::chunkpool::ChunkPool;

pub type HandleId = usize;

struct HandleInner {
    id: HandleId,
    stream: Mutex<Option<TcpStream>>,
    refcount: AtomicUsize,
    do_not_reap: AtomicBool,
    last_used: Mutex<Instant>,
    read_buffer: Mutex<Buffer>,
    write_buffer: Mutex<Buffer>,
    closed: AtomicBool,
}

/// A cloneable, ref-counted reference to one connection. Cloning acquires a
/// reference; `release` drops one.
#[derive(Clone)]
pub struct Handle(Arc<HandleInner>);

impl Handle {
    pub fn id(&self) -> HandleId {
        self.0.id
    }

    /// Acquires an additional reference.
    pub fn acquire(&self) -> Handle {
        self.0.refcount.fetch_add(1, Ordering::AcqRel);
        Handle(self.0.clone())
    }

    pub fn touch(&self, now: Instant) {
        *self.0.last_used.lock().unwrap() = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(*self.0.last_used.lock().unwrap())
    }

    pub fn set_do_not_reap(&self, value: bool) {
        self.0.do_not_reap.store(value, Ordering::Relaxed);
    }

    pub fn do_not_reap(&self) -> bool {
        self.0.do_not_reap.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    pub fn with_stream<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut TcpStream) -> T,
    {
        let mut guard = self.0.stream.lock().unwrap();
        guard.as_mut().map(f)
    }

    pub fn read_buffer(&self) -> std::sync::MutexGuard<Buffer> {
        self.0.read_buffer.lock().unwrap()
    }

    pub fn write_buffer(&self) -> std::sync::MutexGuard<Buffer> {
        self.0.write_buffer.lock().unwrap()
    }

    /// Releases one reference. Returns `true` if this release closed the
    /// handle (the refcount reached zero). Releasing an already-closed
    /// handle is a critical failure, not a no-op, since exactly-once close
    /// is an invariant of the registry.
    pub fn release(&self, pool: &mut ChunkPool, fault: &Fault) -> bool {
        let prior = self.0.refcount.fetch_sub(1, Ordering::AcqRel);

        if prior == 0 {
            fault.critical(Context::Handle, "handle released past zero refcount");
        }

        if prior == 1 {
            self.close(pool, fault);
            true
        } else {
            false
        }
    }

    fn close(&self, pool: &mut ChunkPool, fault: &Fault) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            fault.critical(Context::Handle, "handle closed twice");
        }

        if let Some(stream) = self.0.stream.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        self.0.read_buffer.lock().unwrap().clear(pool);
        self.0.write_buffer.lock().unwrap().clear(pool);
    }

    /// Forces the socket closed immediately, independent of refcount, so the
    /// peer observes EOF right away. Used by client-originating timeouts.
    /// A no-op if the handle already closed naturally.
    pub fn force_close(&self, pool: &mut ChunkPool, fault: &Fault) {
        if !self.0.closed.load(Ordering::Acquire) {
            self.close(pool, fault);
        }
    }
}

/// Process-wide slot table sized to the file-descriptor limit. Free slots are
/// tracked by a queue; insertion and removal take the table lock, but a handle's
/// own refcount/flag reads never do.
pub struct HandleTable {
    slots: Mutex<Vec<Option<Weak<HandleInner>>>>,
    free: Mutex<VecDeque<HandleId>>,
    open_count: AtomicUsize,
    capacity: usize,
}

impl HandleTable {
    pub fn new(capacity: usize) -> HandleTable {
        HandleTable {
            slots: Mutex::new((0..capacity).map(|_| None).collect()),
            free: Mutex::new((0..capacity).collect()),
            open_count: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::Relaxed)
    }

    /// Allocates a new handle for `stream`, or `None` if the table is at capacity.
    pub fn open(&self, stream: TcpStream, now: Instant) -> Option<Handle> {
        let id = self.free.lock().unwrap().pop_front()?;

        let inner = Arc::new(HandleInner {
            id,
            stream: Mutex::new(Some(stream)),
            refcount: AtomicUsize::new(1),
            do_not_reap: AtomicBool::new(false),
            last_used: Mutex::new(now),
            read_buffer: Mutex::new(Buffer::new()),
            write_buffer: Mutex::new(Buffer::new()),
            closed: AtomicBool::new(false),
        });

        self.slots.lock().unwrap()[id] = Some(Arc::downgrade(&inner));
        self.open_count.fetch_add(1, Ordering::Relaxed);

        Some(Handle(inner))
    }

    /// Returns a closed handle's slot to the free list. Callers invoke this
    /// exactly once, right after a `release`/`force_close` reports the handle
    /// as closed.
    pub fn reclaim(&self, id: HandleId) {
        self.slots.lock().unwrap()[id] = None;
        self.free.lock().unwrap().push_back(id);
        self.open_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Visits every currently live handle (skipping slots whose handle has
    /// already dropped to zero references elsewhere), for the idle reaper sweep.
    pub fn for_each_live<F: FnMut(Handle)>(&self, mut f: F) {
        let snapshot = self.slots.lock().unwrap().clone();
        for slot in snapshot.into_iter().flatten() {
            if let Some(inner) = slot.upgrade() {
                f(Handle(inner));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_base::fault::Fault;
    use mio::net::{TcpListener, TcpStream};
    use std::net::SocketAddr;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(&addr).unwrap();
        let (server, _) = loop {
            if let Ok(pair) = listener.accept() {
                break pair;
            }
        };
        (client, server)
    }

    #[test]
    fn open_assigns_a_free_slot_and_bumps_open_count() {
        let table = HandleTable::new(4);
        let (_client, server) = loopback_pair();

        let handle = table.open(server, Instant::now()).unwrap();
        assert_eq!(table.open_count(), 1);
        assert_eq!(handle.id(), 0);
    }

    #[test]
    fn release_to_zero_closes_and_reports_true() {
        let table = HandleTable::new(4);
        let (_client, server) = loopback_pair();
        let mut pool = ChunkPool::new();
        let fault = Fault::new();

        let handle = table.open(server, Instant::now()).unwrap();
        let closed = handle.release(&mut pool, &fault);

        assert!(closed);
        assert!(handle.is_closed());
        table.reclaim(handle.id());
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn acquire_defers_close_until_last_release() {
        let table = HandleTable::new(4);
        let (_client, server) = loopback_pair();
        let mut pool = ChunkPool::new();
        let fault = Fault::new();

        let handle = table.open(server, Instant::now()).unwrap();
        let second = handle.acquire();

        assert!(!handle.release(&mut pool, &fault));
        assert!(!handle.is_closed());

        assert!(second.release(&mut pool, &fault));
        assert!(handle.is_closed());
    }

    #[test]
    #[should_panic(expected = "handle released past zero refcount")]
    fn double_release_is_critical() {
        let table = HandleTable::new(4);
        let (_client, server) = loopback_pair();
        let mut pool = ChunkPool::new();
        let fault = Fault::new();

        let handle = table.open(server, Instant::now()).unwrap();
        handle.release(&mut pool, &fault);
        handle.release(&mut pool, &fault);
    }

    #[test]
    fn open_returns_none_at_capacity() {
        let table = HandleTable::new(1);
        let (_c1, s1) = loopback_pair();
        let (_c2, s2) = loopback_pair();

        let _first = table.open(s1, Instant::now()).unwrap();
        assert!(table.open(s2, Instant::now()).is_none());
    }
}
