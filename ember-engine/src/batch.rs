//! Batch engine (§4.7): splits a batch request into sub-transactions, fans
//! them out to a worker pool, and assembles per-worker response buffers with
//! a writers-refcounted flush algorithm so a buffer is enqueued for send
//! exactly when every contributor has finished writing into it.
//!
//! The teacher's in-place row rewrite (mutating the received buffer so a row
//! becomes a standalone sub-message header) assumed a mutable C byte buffer;
//! `bytes::Bytes` here is immutable and reference-counted, so the same
//! semantic effect — a batch row driving the ordinary per-transaction path —
//! is reached by parsing each row directly into a [`BatchRow`] value instead
//! of rewriting bytes in place.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};

use ember_base::config::Config;
use ember_net::{make_reply, Field, FieldType, Handle, Op};

use crate::reply::batch_trailer;
use crate::status::ResultCode;
use crate::txn::Digest;

pub const DEFAULT_BUFFER_CAPACITY: usize = 128 * 1024;
const RESIZE_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const RESIZE_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BatchError {
    Disabled,
    Parameter,
    MaxRequestsExceeded,
    QueuesFull,
    RecordTooBig,
}

impl BatchError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            BatchError::Disabled => ResultCode::BatchDisabled,
            BatchError::Parameter => ResultCode::Parameter,
            BatchError::MaxRequestsExceeded => ResultCode::BatchMaxRequests,
            BatchError::QueuesFull => ResultCode::BatchQueuesFull,
            BatchError::RecordTooBig => ResultCode::RecordTooBig,
        }
    }
}

/// One parsed batch row: either a full row carrying its own namespace,
/// fields and ops, or a repeat row that reuses the previous one's.
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub index: u32,
    pub digest: Digest,
    pub info1: u8,
    pub fields: Vec<Field>,
    pub ops: Vec<Op>,
}

impl BatchRow {
    pub fn namespace(&self) -> Option<&Bytes> {
        self.fields.iter().find(|f| f.field_type == FieldType::Namespace).map(|f| &f.value)
    }
}

fn read_digest(buf: &Bytes, offset: usize) -> Digest {
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&buf[offset..offset + 20]);
    digest
}

/// Walks the same field/op TLV layout `ember_net::parse_data_message` uses
/// for a full frame, starting at `cursor` within `buf`.
fn parse_fields_and_ops(buf: &Bytes, mut cursor: usize, n_fields: u16, n_ops: u16) -> Result<(Vec<Field>, Vec<Op>, usize), BatchError> {
    let mut fields = Vec::with_capacity(n_fields as usize);
    for _ in 0..n_fields {
        if cursor + 4 > buf.len() {
            return Err(BatchError::Parameter);
        }
        let size = BigEndian::read_u32(&buf[cursor..cursor + 4]) as usize;
        if size == 0 || cursor + 4 + size > buf.len() {
            return Err(BatchError::Parameter);
        }
        let field_type = FieldType::from(buf[cursor + 4]);
        let value = buf.slice(cursor + 5..cursor + 4 + size);
        fields.push(Field { field_type, value });
        cursor += 4 + size;
    }

    let mut ops = Vec::with_capacity(n_ops as usize);
    for _ in 0..n_ops {
        if cursor + 4 > buf.len() {
            return Err(BatchError::Parameter);
        }
        let op_sz = BigEndian::read_u32(&buf[cursor..cursor + 4]) as usize;
        if op_sz < 4 || cursor + 4 + op_sz > buf.len() {
            return Err(BatchError::Parameter);
        }
        let op_type = buf[cursor + 4].into();
        let particle_type = buf[cursor + 5];
        let name_sz = buf[cursor + 7] as usize;
        let name_start = cursor + 8;
        let name_end = name_start + name_sz;
        let op_end = cursor + 4 + op_sz;
        if name_end > op_end {
            return Err(BatchError::Parameter);
        }
        let name = buf.slice(name_start..name_end);
        let value = buf.slice(name_end..op_end);
        ops.push(Op { op_type, particle_type, name, value });
        cursor = op_end;
    }

    Ok((fields, ops, cursor))
}

/// Parses the batch field's payload (`count` rows) into [`BatchRow`]s.
pub fn parse_batch_rows(buf: &Bytes, count: u32, max_requests: usize) -> Result<Vec<BatchRow>, BatchError> {
    if count == 0 {
        return Err(BatchError::Parameter);
    }
    if count as usize > max_requests {
        return Err(BatchError::MaxRequestsExceeded);
    }

    let mut rows = Vec::with_capacity(count as usize);
    let mut last_fields: Option<Vec<Field>> = None;
    let mut last_ops: Option<Vec<Op>> = None;
    let mut cursor = 0usize;

    for _ in 0..count {
        if cursor + 25 > buf.len() {
            return Err(BatchError::Parameter);
        }
        let index = BigEndian::read_u32(&buf[cursor..cursor + 4]);
        let digest = read_digest(buf, cursor + 4);
        let repeat = buf[cursor + 24];
        cursor += 25;

        let (info1, fields, ops) = match repeat {
            0 => {
                if cursor + 5 > buf.len() {
                    return Err(BatchError::Parameter);
                }
                let info1 = buf[cursor];
                let n_fields = BigEndian::read_u16(&buf[cursor + 1..cursor + 3]);
                let n_ops = BigEndian::read_u16(&buf[cursor + 3..cursor + 5]);
                cursor += 5;
                let (fields, ops, next_cursor) = parse_fields_and_ops(buf, cursor, n_fields, n_ops)?;
                cursor = next_cursor;
                last_fields = Some(fields.clone());
                last_ops = Some(ops.clone());
                (info1, fields, ops)
            }
            1 => {
                let fields = last_fields.clone().ok_or(BatchError::Parameter)?;
                let ops = last_ops.clone().ok_or(BatchError::Parameter)?;
                (0u8, fields, ops)
            }
            _ => return Err(BatchError::Parameter),
        };

        rows.push(BatchRow { index, digest, info1, fields, ops });
    }

    Ok(rows)
}

/// A fixed-size block results are packed into (§3 "Batch Response Buffer").
/// `writers` starts at 1 for the implicit "buffer is still current" holder;
/// it reaches zero, and the buffer is sent, only once that implicit writer
/// has been released and every reserved slot has committed.
pub struct ResponseBuffer {
    pub capacity: usize,
    used: AtomicUsize,
    pub tran_count: AtomicU32,
    writers: AtomicU32,
    data: Mutex<Vec<u8>>,
    /// `None` once the owning connection has been force-closed by a prior
    /// send failure (§4.7 "further buffers for that batch are dropped");
    /// the worker then finishes the writers accounting without touching
    /// the wire.
    fd_h: Option<Handle>,
}

impl ResponseBuffer {
    fn new(capacity: usize, fd_h: Option<Handle>) -> ResponseBuffer {
        ResponseBuffer {
            capacity,
            used: AtomicUsize::new(0),
            tran_count: AtomicU32::new(0),
            writers: AtomicU32::new(1),
            data: Mutex::new(Vec::with_capacity(capacity)),
            fd_h,
        }
    }

    /// Reserves `len` bytes at the current tail, bumping the writer count.
    /// Returns `None` if the buffer cannot fit `len` more bytes.
    fn reserve(&self, len: usize) -> Option<usize> {
        let offset = self.used.fetch_add(len, Ordering::AcqRel);
        if offset + len > self.capacity {
            self.used.fetch_sub(len, Ordering::AcqRel);
            return None;
        }
        self.writers.fetch_add(1, Ordering::AcqRel);
        Some(offset)
    }

    fn write_at(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock().unwrap();
        if data.len() < offset + bytes.len() {
            data.resize(offset + bytes.len(), 0);
        }
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn into_bytes(self) -> Vec<u8> {
        self.data.into_inner().unwrap()
    }
}

/// Releases one writer slot on `buffer`, consuming its `Arc` clone; when the
/// count reaches zero, that same clone — not a fresh one — is handed to
/// `queue` for sending, so the worker never races an extra reference still
/// held somewhere else (§4.7 invariant 4).
fn release_writer(buffer: Arc<ResponseBuffer>, queue: &Sender<BatchMsg>) {
    if buffer.writers.fetch_sub(1, Ordering::AcqRel) == 1 {
        let _ = queue.send(BatchMsg::Send(buffer));
    }
}

struct BatchSharedInner {
    /// `None` only ever transiently, inside a call that is about to replace
    /// it or hand it to `release_writer`; a missing value never outlives the
    /// lock that observes it (§4.7 invariant 4).
    current_buffer: Option<Arc<ResponseBuffer>>,
    queue: Sender<BatchMsg>,
}

/// One per incoming batch request (§3). `tran_count_response` and
/// `result_code` are tracked with atomics outside the main lock (§5); the
/// lock itself protects only the current-buffer pointer and the decision of
/// whether a new slot continues the current buffer or opens a new one.
pub struct BatchSharedState {
    pub fd_h: Mutex<Option<Handle>>,
    inner: Mutex<BatchSharedInner>,
    pub tran_count: AtomicU32,
    pub tran_max: u32,
    pub tran_count_response: AtomicU32,
    result_code: AtomicU32,
    pub start: Instant,
}

impl BatchSharedState {
    pub fn new(fd_h: Handle, tran_max: u32, queue: Sender<BatchMsg>) -> Arc<BatchSharedState> {
        let first_buffer = Arc::new(ResponseBuffer::new(DEFAULT_BUFFER_CAPACITY, Some(fd_h.acquire())));
        Arc::new(BatchSharedState {
            fd_h: Mutex::new(Some(fd_h)),
            inner: Mutex::new(BatchSharedInner { current_buffer: Some(first_buffer), queue }),
            tran_count: AtomicU32::new(0),
            tran_max,
            tran_count_response: AtomicU32::new(0),
            result_code: AtomicU32::new(ResultCode::Ok.code() as u32),
            start: Instant::now(),
        })
    }

    /// First non-ok, non-not-found code sticks (§3 "Batch Shared State").
    pub fn note_result(&self, code: ResultCode) {
        if code == ResultCode::Ok || code == ResultCode::NotFound {
            return;
        }
        let _ = self.result_code.compare_exchange(
            ResultCode::Ok.code() as u32,
            code.code() as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn result_code(&self) -> ResultCode {
        ResultCode::from_wire(self.result_code.load(Ordering::Acquire) as u8)
    }

    /// Reserves a slot of `encoded_len` bytes, opening a fresh buffer if the
    /// current one cannot fit it. Returns the buffer to write into and the
    /// offset reserved within it.
    fn reserve_slot(&self, encoded_len: usize, capacity_hint: usize) -> (Arc<ResponseBuffer>, usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(current) = inner.current_buffer.as_ref() {
            if let Some(offset) = current.reserve(encoded_len) {
                return (current.clone(), offset);
            }
        }

        // Current buffer can't fit this slot (or there isn't one yet): take
        // the implicit "current" writer it was holding — not a clone of it —
        // and release that, so the reference the worker will see is the only
        // one left, then open a new buffer.
        if let Some(current) = inner.current_buffer.take() {
            release_writer(current, &inner.queue);
        }
        let capacity = encoded_len.max(capacity_hint);
        let handle = self.fd_h.lock().unwrap().as_ref().map(|h| h.acquire());
        let fresh = Arc::new(ResponseBuffer::new(capacity, handle));
        let offset = fresh.reserve(encoded_len).expect("fresh buffer sized for this slot");
        inner.current_buffer = Some(fresh.clone());
        (fresh, offset)
    }

    /// Atomically marks one more sub-transaction response as drained onto
    /// the wire, returning whether this call completed the batch (§4.7
    /// "the final sub-transaction ... triggers a complete flag"). Must be
    /// called once per row, before [`write_row`], so the caller knows
    /// whether to ask `write_row` to release the trailer-flushing writer.
    pub fn note_completion(&self) -> bool {
        self.tran_count_response.fetch_add(1, Ordering::AcqRel) + 1 >= self.tran_max
    }

    /// Writes one sub-transaction's encoded reply into the shared response
    /// stream and commits its slot. Does not flush the enclosing buffer; the
    /// caller asks for that explicitly via [`write_trailer`] once
    /// [`note_completion`] says the batch is done.
    ///
    /// [`write_trailer`]: BatchSharedState::write_trailer
    /// [`note_completion`]: BatchSharedState::note_completion
    pub fn write_row(&self, encoded: &[u8]) {
        let queue = self.inner.lock().unwrap().queue.clone();
        let (buffer, offset) = self.reserve_slot(encoded.len(), DEFAULT_BUFFER_CAPACITY);
        buffer.write_at(offset, encoded);
        buffer.tran_count.fetch_add(1, Ordering::AcqRel);
        release_writer(buffer, &queue);
    }

    /// Composes and writes the batch-completion trailer (§4.7/§4.10), then
    /// releases the enclosing buffer's implicit writer so its refcount can
    /// reach zero and it flushes to the wire. Clears `inner.current_buffer`
    /// via `Option::take` first, so the only reference the worker thread
    /// sees is the one this call hands to the send queue.
    pub fn write_trailer(&self) {
        let trailer = batch_trailer(self.result_code());
        let queue = self.inner.lock().unwrap().queue.clone();
        let (buffer, offset) = self.reserve_slot(trailer.len(), DEFAULT_BUFFER_CAPACITY);
        buffer.write_at(offset, &trailer);
        release_writer(buffer, &queue);

        let current = self.inner.lock().unwrap().current_buffer.take();
        if let Some(current) = current {
            release_writer(current, &queue);
        }
    }

    /// The terminate path (parsed row count fell short of `tran_max`):
    /// accounts for `missing` phantom responses and flushes the trailer,
    /// since every row actually written already released its own writer.
    pub fn abort_remaining(&self, missing: u32) {
        if missing == 0 {
            return;
        }
        self.tran_count_response.fetch_add(missing, Ordering::AcqRel);
        self.write_trailer();
    }

    pub fn is_complete(&self) -> bool {
        self.tran_count_response.load(Ordering::Acquire) >= self.tran_max
    }
}

pub enum BatchMsg {
    Send(Arc<ResponseBuffer>),
    Shutdown,
}

struct BatchQueue {
    sender: Sender<BatchMsg>,
    active: AtomicBool,
}

/// Fixed pool of response workers, each owning a bounded queue (§4.7
/// "Worker distribution" / "Thread pool resize").
pub struct BatchWorkerPool {
    queues: Mutex<Vec<Arc<BatchQueue>>>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    counter: AtomicU64,
    queue_capacity: usize,
}

impl BatchWorkerPool {
    pub fn new(config: &Config) -> BatchWorkerPool {
        let pool = BatchWorkerPool {
            queues: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
            queue_capacity: config.batch_max_buffers_per_queue,
        };
        pool.resize(config.batch_index_threads);
        pool
    }

    /// One thread per response queue (§4.7 "Send pipeline"): pops completed
    /// buffers and writes them to their batch's connection. Real `MSG_MORE`
    /// coalescing is a Linux sendmsg flag outside mio/std's safe surface;
    /// here every non-trailer buffer is still just an ordinary write, since
    /// each buffer is already a complete, self-delimited unit on the wire.
    fn spawn_worker(receiver: Receiver<BatchMsg>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            for msg in receiver {
                match msg {
                    BatchMsg::Send(buffer) => {
                        if let Some(buffer) = Arc::try_unwrap(buffer).ok() {
                            if let Some(handle) = buffer.fd_h.as_ref() {
                                let bytes = buffer.into_bytes();
                                let _ = handle.with_stream(|stream| {
                                    use std::io::Write;
                                    stream.write_all(&bytes)
                                });
                            }
                        }
                    }
                    BatchMsg::Shutdown => break,
                }
            }
        })
    }

    /// `BATCH_DISABLED` when the pool is empty (§4.7 error taxonomy).
    pub fn is_disabled(&self) -> bool {
        self.queues.lock().unwrap().is_empty()
    }

    /// Picks a worker's response queue by `counter mod pool_size`, then walks
    /// backward then forward past inactive or saturated queues before giving
    /// up with `BATCH_QUEUES_FULL`. The returned sender is handed to a new
    /// [`BatchSharedState`], which uses it to flush completed buffers.
    pub fn assign(&self) -> Result<Sender<BatchMsg>, BatchError> {
        let queues = self.queues.lock().unwrap();
        if queues.is_empty() {
            return Err(BatchError::Disabled);
        }
        let pool_size = queues.len();
        let start = (self.counter.fetch_add(1, Ordering::Relaxed) as usize) % pool_size;

        let mut order = Vec::with_capacity(pool_size * 2);
        for back in 0..pool_size {
            order.push((start + pool_size - back) % pool_size);
        }
        for fwd in 0..pool_size {
            order.push((start + fwd) % pool_size);
        }

        for idx in order {
            let queue = &queues[idx];
            if queue.active.load(Ordering::Acquire) && !queue.sender.is_full() {
                return Ok(queue.sender.clone());
            }
        }
        Err(BatchError::QueuesFull)
    }

    /// Grows immediately; shrinking deactivates surplus queues, waits up to
    /// 30s (polling every 500ms) for their backlog to drain, then sends each
    /// a `Shutdown` sentinel. A drain timeout re-activates the queues and
    /// aborts the resize.
    pub fn resize(&self, new_size: usize) {
        let mut queues = self.queues.lock().unwrap();
        let mut handles = self.handles.lock().unwrap();

        if new_size > queues.len() {
            while queues.len() < new_size {
                let (sender, receiver) = crossbeam_channel::bounded(self.queue_capacity);
                handles.push(Self::spawn_worker(receiver));
                queues.push(Arc::new(BatchQueue { sender, active: AtomicBool::new(true) }));
            }
            return;
        }

        let surplus: Vec<Arc<BatchQueue>> = queues.split_off(new_size);
        for queue in &surplus {
            queue.active.store(false, Ordering::Release);
        }

        let deadline = Instant::now() + RESIZE_DRAIN_TIMEOUT;
        let mut drained = false;
        while Instant::now() < deadline {
            if surplus.iter().all(|q| q.sender.len() == 0) {
                drained = true;
                break;
            }
            std::thread::sleep(RESIZE_POLL_INTERVAL);
        }

        if drained {
            for queue in &surplus {
                let _ = queue.sender.send(BatchMsg::Shutdown);
            }
        } else {
            for queue in surplus {
                queue.active.store(true, Ordering::Release);
                queues.push(queue);
            }
        }
    }

    pub fn pool_size(&self) -> usize {
        self.queues.lock().unwrap().len()
    }
}

/// Assigns a worker and runs every row through `process_row` inline on the
/// calling thread (§4.7 "processed inline ... when the namespace is fully
/// in-memory and inlining is enabled"), writing each result into the shared
/// response stream as it completes. A namespace backed by real storage would
/// instead enqueue rows to the normal transaction service queue; that path
/// belongs to the composition root, which owns the service queues.
pub fn dispatch_batch<F>(pool: &BatchWorkerPool, fd_h: Handle, rows: &[BatchRow], process_row: F) -> Result<Arc<BatchSharedState>, BatchError>
where
    F: Fn(&BatchRow) -> (ResultCode, Vec<Op>),
{
    if rows.is_empty() {
        return Err(BatchError::Parameter);
    }

    let queue = pool.assign()?;
    let shared = BatchSharedState::new(fd_h, rows.len() as u32, queue);

    for row in rows {
        shared.tran_count.fetch_add(1, Ordering::AcqRel);
        let (code, ops) = process_row(row);
        shared.note_result(code);
        let encoded = make_reply(code.code(), 0, 0, &ops, Some(row.index));
        shared.write_row(&encoded);
        if shared.note_completion() {
            shared.write_trailer();
        }
    }

    Ok(shared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_net::{HandleTable, OpType};
    use mio::net::{TcpListener, TcpStream};
    use std::io::Read;
    use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};

    fn loopback_handle() -> Handle {
        let listener = TcpListener::bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(&addr).unwrap();
        let (server, _) = loop {
            if let Ok(pair) = listener.accept() {
                break pair;
            }
        };
        let table = HandleTable::new(4);
        table.open(server, Instant::now()).unwrap()
    }

    /// A loopback pair whose client side is a blocking `std::net::TcpStream`,
    /// so a test can read back written bytes instead of only asserting on
    /// the batch's internal completion bookkeeping.
    fn loopback_pair() -> (Handle, StdTcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server_std, _) = listener.accept().unwrap();
        let server = TcpStream::from_stream(server_std).unwrap();
        let table = HandleTable::new(4);
        let handle = table.open(server, Instant::now()).unwrap();
        (handle, client)
    }

    fn encode_full_row(index: u32, digest: [u8; 20]) -> Vec<u8> {
        let mut row = Vec::new();
        row.extend_from_slice(&index.to_be_bytes());
        row.extend_from_slice(&digest);
        row.push(0); // repeat = 0
        row.push(0); // info1
        row.extend_from_slice(&0u16.to_be_bytes()); // n_fields
        row.extend_from_slice(&0u16.to_be_bytes()); // n_ops
        row
    }

    fn encode_repeat_row(index: u32, digest: [u8; 20]) -> Vec<u8> {
        let mut row = Vec::new();
        row.extend_from_slice(&index.to_be_bytes());
        row.extend_from_slice(&digest);
        row.push(1);
        row
    }

    #[test]
    fn parses_a_full_row_then_a_repeat_row() {
        let mut buf = encode_full_row(0, [1u8; 20]);
        buf.extend_from_slice(&encode_repeat_row(1, [2u8; 20]));
        let rows = parse_batch_rows(&Bytes::from(buf), 2, 100).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].digest, [1u8; 20]);
        assert_eq!(rows[1].digest, [2u8; 20]);
    }

    #[test]
    fn zero_row_count_is_a_parameter_error() {
        let buf = Bytes::new();
        assert_eq!(parse_batch_rows(&buf, 0, 100).unwrap_err(), BatchError::Parameter);
    }

    #[test]
    fn row_count_over_cap_is_rejected() {
        let buf = Bytes::from(encode_full_row(0, [1u8; 20]));
        assert_eq!(parse_batch_rows(&buf, 5, 1).unwrap_err(), BatchError::MaxRequestsExceeded);
    }

    #[test]
    fn repeat_row_before_any_full_row_is_rejected() {
        let buf = Bytes::from(encode_repeat_row(0, [1u8; 20]));
        assert_eq!(parse_batch_rows(&buf, 1, 100).unwrap_err(), BatchError::Parameter);
    }

    #[test]
    fn response_buffer_flushes_only_when_writers_reach_zero() {
        let buffer = Arc::new(ResponseBuffer::new(DEFAULT_BUFFER_CAPACITY, None));
        let (sender, receiver) = crossbeam_channel::unbounded();
        // implicit writer (1) + one reserved slot (2)
        buffer.writers.fetch_add(1, Ordering::AcqRel);
        release_writer(buffer.clone(), &sender); // commit the slot: still 1 left (implicit)
        assert!(receiver.try_recv().is_err());
        release_writer(buffer, &sender); // release the implicit writer: now flushes
        assert!(receiver.try_recv().is_ok());
    }

    #[test]
    fn pool_reports_disabled_when_empty() {
        let mut config = Config::default();
        config.batch_index_threads = 0;
        let pool = BatchWorkerPool::new(&config);
        assert!(pool.is_disabled());
    }

    #[test]
    fn pool_grows_to_requested_size() {
        let mut config = Config::default();
        config.batch_index_threads = 2;
        let pool = BatchWorkerPool::new(&config);
        assert_eq!(pool.pool_size(), 2);
        pool.resize(5);
        assert_eq!(pool.pool_size(), 5);
    }

    #[test]
    fn op_type_conversion_used_by_row_parser_is_exercised() {
        let op: OpType = 1u8.into();
        assert_eq!(op, OpType::Read);
    }

    #[test]
    fn dispatch_batch_processes_every_row_and_completes() {
        let mut config = Config::default();
        config.batch_index_threads = 1;
        let pool = BatchWorkerPool::new(&config);

        let mut buf = encode_full_row(0, [1u8; 20]);
        buf.extend_from_slice(&encode_full_row(1, [2u8; 20]));
        let rows = parse_batch_rows(&Bytes::from(buf), 2, 100).unwrap();

        let shared = dispatch_batch(&pool, loopback_handle(), &rows, |_row| (ResultCode::Ok, Vec::new())).unwrap();

        assert!(shared.is_complete());
        assert_eq!(shared.result_code(), ResultCode::Ok);
    }

    #[test]
    fn dispatch_batch_writes_row_replies_then_a_trailer_to_the_stream() {
        let mut config = Config::default();
        config.batch_index_threads = 1;
        let pool = BatchWorkerPool::new(&config);

        let mut buf = encode_full_row(0, [1u8; 20]);
        buf.extend_from_slice(&encode_full_row(1, [2u8; 20]));
        let rows = parse_batch_rows(&Bytes::from(buf), 2, 100).unwrap();

        let (handle, mut client) = loopback_pair();
        let shared = dispatch_batch(&pool, handle, &rows, |_row| (ResultCode::Ok, Vec::new())).unwrap();
        assert!(shared.is_complete());

        let expected_trailer = batch_trailer(ResultCode::Ok);

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while received.len() < expected_trailer.len() && Instant::now() < deadline {
            client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
            let mut chunk = [0u8; 4096];
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(_) => continue,
            }
        }

        assert!(received.ends_with(&expected_trailer), "expected trailer bytes at the end of the stream");
    }

    #[test]
    fn dispatch_batch_on_empty_pool_is_disabled() {
        let mut config = Config::default();
        config.batch_index_threads = 0;
        let pool = BatchWorkerPool::new(&config);

        let buf = encode_full_row(0, [1u8; 20]);
        let rows = parse_batch_rows(&Bytes::from(buf), 1, 100).unwrap();

        let err = dispatch_batch(&pool, loopback_handle(), &rows, |_row| (ResultCode::Ok, Vec::new())).unwrap_err();
        assert_eq!(err, BatchError::Disabled);
    }
}
