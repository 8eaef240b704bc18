//! The connection reactor (§4.3): one edge-triggered `mio::Poll` loop per worker,
//! pinned for the lifetime of each connection it accepts. Grounded on the
//! `server_poll`/`live_poll`/`housekeeping` pattern of `neutronium::net::endpoint`,
//! adapted to drive the wire codec and the ref-counted handle registry instead of
//! an encrypted channel handshake.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::net::TcpListener;

use ember_base::error::{Error, ErrorKind, ErrorUtils, Result};
use ember_base::fault::{Context as LogContext, Fault, Severity};

use crate::net::chunkpool::ChunkPool;
use crate::net::handle::{Handle, HandleId, HandleTable};
use crate::net::wire::{self, DataMessage, ProtoHeader, ProtoType, PROTO_HEADER_SIZE};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
const ZERO_TIME: Duration = Duration::from_secs(0);
const LISTEN_TOKEN: mio::Token = mio::Token(usize::max_value());

/// A connectivity transition the owner of a `Reactor` should react to, e.g. to
/// update connection-count telemetry or tear down in-flight transaction state.
#[derive(Debug, Copy, Clone)]
pub enum ConnectionChange {
    Connected(HandleId),
    Disconnected(HandleId),
}

/// A fully parsed request, still attached to the connection it arrived on so the
/// reply can find its way back.
pub struct ReadyFrame {
    pub handle: Handle,
    pub message: DataMessage,
}

struct ConnState {
    handle: Handle,
    /// Reads are paused while a transaction owns this connection, so a second
    /// request can't be parsed out from under the one in flight. Set by the
    /// owner via `pause`/`resume`.
    trans_active: bool,
}

/// One worker's connection reactor. A node runs a small pool of these; the
/// worker that owns the listener hands off freshly accepted connections to
/// its peers via `adopt` so load spreads evenly, but once adopted a connection
/// never migrates (§5, "pinned to one worker for its lifetime").
pub struct Reactor {
    poll: mio::Poll,
    listener: Option<TcpListener>,
    events: mio::Events,
    table: Arc<HandleTable>,
    conns: HashMap<HandleId, ConnState>,
    pool: ChunkPool,
    changes: Vec<ConnectionChange>,
    ready: Vec<ReadyFrame>,
    fault: Arc<Fault>,
    idle_budget: Duration,
    housekeeping_time: Instant,
    accept_backpressure: bool,
}

impl Reactor {
    /// Builds a worker that owns the accept loop for `address`. Only one
    /// reactor in a pool should be built this way per listener; the rest are
    /// built with `adopt_only` and receive connections via `adopt`.
    pub fn bind(
        address: &str,
        table: Arc<HandleTable>,
        fault: Arc<Fault>,
        idle_ms: u64,
    ) -> Result<Reactor> {
        let poll = mio::Poll::new()?;
        let addr: SocketAddr = address
            .parse()
            .map_err(|_| Error::Fatal(ErrorKind::Parameter("invalid bind address")))?;
        let listener = TcpListener::bind(&addr)?;
        poll.register(&listener, LISTEN_TOKEN, mio::Ready::readable(), mio::PollOpt::edge())?;

        Ok(Self::new_internal(poll, Some(listener), table, fault, idle_ms))
    }

    /// Builds a worker with no listener of its own, for workers that only
    /// service connections handed to them by `adopt`.
    pub fn adopt_only(table: Arc<HandleTable>, fault: Arc<Fault>, idle_ms: u64) -> Result<Reactor> {
        let poll = mio::Poll::new()?;
        Ok(Self::new_internal(poll, None, table, fault, idle_ms))
    }

    fn new_internal(
        poll: mio::Poll,
        listener: Option<TcpListener>,
        table: Arc<HandleTable>,
        fault: Arc<Fault>,
        idle_ms: u64,
    ) -> Reactor {
        let now = Instant::now();
        Reactor {
            poll,
            listener,
            events: mio::Events::with_capacity(4096),
            table,
            conns: HashMap::new(),
            pool: ChunkPool::new(),
            changes: Vec::new(),
            ready: Vec::new(),
            fault,
            idle_budget: Duration::from_millis(idle_ms),
            housekeeping_time: now,
            accept_backpressure: false,
        }
    }

    /// Registers a handle opened elsewhere (typically by the accepting worker's
    /// table lookup) for readable/writable events on this reactor's poll.
    pub fn adopt(&mut self, handle: Handle) -> Result<()> {
        let id = handle.id();
        let registered = handle
            .with_stream(|stream| {
                self.poll.register(
                    stream,
                    mio::Token(id),
                    mio::Ready::readable() | mio::Ready::writable(),
                    mio::PollOpt::edge(),
                )
            })
            .ok_or(Error::Fatal(ErrorKind::Invariant("adopted handle has no live stream")))?;
        registered?;

        self.conns.insert(id, ConnState { handle, trans_active: false });
        Ok(())
    }

    /// Takes every connectivity change observed since the last call.
    pub fn drain_changes(&mut self) -> Vec<ConnectionChange> {
        std::mem::take(&mut self.changes)
    }

    /// Takes every request parsed since the last call, ready for dispatch to
    /// the transaction pipeline.
    pub fn drain_ready(&mut self) -> Vec<ReadyFrame> {
        std::mem::take(&mut self.ready)
    }

    /// Pauses further reads on `id` once a transaction has taken ownership of
    /// its next reply, per the request/response lockstep of §4.3.
    pub fn pause(&mut self, id: HandleId) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.trans_active = true;
        }
    }

    /// Resumes reads on `id` once its in-flight transaction has replied.
    pub fn resume(&mut self, id: HandleId) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.trans_active = false;
        }
    }

    /// Queues reply bytes for delivery, to be flushed opportunistically by
    /// `sync`. Silently drops the write if the connection already closed.
    pub fn reply(&mut self, id: HandleId, bytes: Vec<u8>) {
        if let Some(conn) = self.conns.get(&id) {
            let mut buf = conn.handle.write_buffer();
            let _ = buf.ingress(&mut self.pool, &mut io::Cursor::new(bytes));
        }
    }

    /// One pass: runs housekeeping if its interval has elapsed, processes
    /// whatever the last `poll` turned up, then opportunistically flushes any
    /// queued replies even on connections with no fresh writable event (edge
    /// triggering won't refire on its own for data this reactor appended).
    pub fn sync(&mut self, now: Instant) {
        if now.duration_since(self.housekeeping_time) >= HOUSEKEEPING_INTERVAL {
            self.housekeeping(now);
            self.housekeeping_time = now;
        }

        self.poll.poll(&mut self.events, Some(ZERO_TIME)).expect("poll failed");

        let tokens: Vec<(mio::Token, mio::Ready)> = self.events.iter().map(|e| (e.token(), e.readiness())).collect();

        for (token, readiness) in tokens {
            if token == LISTEN_TOKEN {
                self.accept_loop(now);
                continue;
            }

            self.service(token.0, readiness, now);
        }

        self.flush_writes();
    }

    fn accept_loop(&mut self, now: Instant) {
        // Taken out of `self` for the duration of the loop so accepting a
        // connection can freely call back into `&mut self` (to adopt it)
        // without fighting a live borrow of the listener.
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => return,
        };

        loop {
            match listener.accept() {
                Ok((stream, _)) => match self.table.open(stream, now) {
                    Some(handle) => {
                        let id = handle.id();
                        if self.adopt(handle).is_ok() {
                            self.changes.push(ConnectionChange::Connected(id));
                            self.accept_backpressure = false;
                        }
                    }
                    None => {
                        self.fault.log(LogContext::Reactor, Severity::Warning, "connection rejected, handle table full");
                        self.accept_backpressure = true;
                    }
                },
                Err(err) => {
                    let outcome: Result<()> = Err(err.into());
                    if outcome.has_failed() {
                        self.fault.critical(LogContext::Reactor, "accept failed");
                    }
                    break;
                }
            }
        }

        self.listener = Some(listener);
    }

    fn service(&mut self, id: HandleId, readiness: mio::Ready, now: Instant) {
        let should_drop = {
            let conn = match self.conns.get(&id) {
                Some(conn) => conn,
                None => return,
            };

            if conn.trans_active {
                false
            } else if readiness.is_readable() {
                match Self::drain_and_parse(&conn.handle, &mut self.pool, now) {
                    Ok(frames) => {
                        for message in frames {
                            self.ready.push(ReadyFrame { handle: conn.handle.acquire(), message });
                        }
                        false
                    }
                    Err(Error::Wait) => false,
                    Err(err) => {
                        self.fault.log(LogContext::Reactor, Severity::Debug, &format!("{:?}", err));
                        true
                    }
                }
            } else {
                false
            }
        };

        if should_drop {
            self.drop_connection(id);
        }
    }

    /// Pulls whatever is available off the socket into the connection's read
    /// buffer, then peels off as many complete frames as are now buffered.
    /// Implements the peek-header / allocate-body / loop-drain algorithm of
    /// §4.3: a frame is only removed from the buffer once its full body has
    /// arrived, so a header spanning two reads is simply re-peeked next time.
    fn drain_and_parse(handle: &Handle, pool: &mut ChunkPool, now: Instant) -> Result<Vec<DataMessage>> {
        handle.touch(now);

        let ingress_result = {
            let mut buf = handle.read_buffer();
            handle.with_stream(|stream| buf.ingress(&mut *pool, stream))
        };

        match ingress_result {
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                let outcome: Result<()> = Err(err.into());
                if outcome.has_failed() {
                    return outcome.map(|_| Vec::new());
                }
            }
            None => return Err(Error::Fatal(ErrorKind::Invariant("readable event on a handle with no live stream"))),
        }

        let mut messages = Vec::new();

        loop {
            let mut buf = handle.read_buffer();

            let header_bytes = match buf.peek(PROTO_HEADER_SIZE) {
                Some(bytes) => bytes,
                None => break,
            };

            let header = ProtoHeader::parse(&header_bytes)?;

            if buf.len() < PROTO_HEADER_SIZE + header.size {
                break;
            }

            let frame = buf.drain(pool, PROTO_HEADER_SIZE + header.size);
            drop(buf);

            if header.ty != ProtoType::Message {
                // Info/security/compressed frames are out of scope for this
                // core; skip past them rather than aborting the connection.
                continue;
            }

            let body = Bytes::copy_from_slice(&frame[PROTO_HEADER_SIZE..]);
            messages.push(wire::parse_data_message(&body)?);
        }

        Ok(messages)
    }

    fn flush_writes(&mut self) {
        let pool = &mut self.pool;
        let mut dropped = Vec::new();

        for (&id, conn) in self.conns.iter() {
            let mut buf = conn.handle.write_buffer();
            if buf.is_empty() {
                continue;
            }

            let result = conn.handle.with_stream(|stream| buf.egress(&mut *pool, stream));
            drop(buf);

            match result {
                Some(Ok(_)) | None => {}
                Some(Err(err)) => {
                    let outcome: Result<()> = Err(err.into());
                    if outcome.has_failed() {
                        dropped.push(id);
                    }
                }
            }
        }

        for id in dropped {
            self.drop_connection(id);
        }
    }

    fn drop_connection(&mut self, id: HandleId) {
        if let Some(conn) = self.conns.remove(&id) {
            let _ = conn.handle.with_stream(|stream| self.poll.deregister(stream));
            if conn.handle.release(&mut self.pool, &self.fault) {
                self.table.reclaim(id);
            }
            self.changes.push(ConnectionChange::Disconnected(id));
        }
    }

    /// Once-a-second sweep closing connections idle past the configured
    /// budget, unless a pipeline stage has asked to keep them open via
    /// `do_not_reap`. Only reaps handles this reactor solely owns (refcount
    /// of 1), so a connection with a batch or UDF stage still in flight
    /// elsewhere is left alone even if it looks idle from here.
    fn housekeeping(&mut self, now: Instant) {
        let idle: Vec<HandleId> = self
            .conns
            .iter()
            .filter(|(_, conn)| {
                !conn.handle.do_not_reap() && !conn.trans_active && conn.handle.idle_for(now) >= self.idle_budget
            })
            .map(|(&id, _)| id)
            .collect();

        for id in idle {
            self.drop_connection(id);
        }
    }

    pub fn is_backpressured(&self) -> bool {
        self.accept_backpressure
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_base::fault::Fault;
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;
    use std::sync::Arc;

    fn bound_reactor(idle_ms: u64) -> (Reactor, SocketAddr) {
        let table = Arc::new(HandleTable::new(16));
        let fault = Arc::new(Fault::new());
        let reactor = Reactor::bind("127.0.0.1:0", table, fault, idle_ms).unwrap();
        let addr = reactor.listener.as_ref().unwrap().local_addr().unwrap();
        (reactor, addr)
    }

    #[test]
    fn accept_loop_registers_a_new_connection() {
        let (mut reactor, addr) = bound_reactor(60_000);
        let _client = StdTcpStream::connect(addr).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        reactor.sync(Instant::now());

        assert_eq!(reactor.connection_count(), 1);
        let changes = reactor.drain_changes();
        assert!(matches!(changes[0], ConnectionChange::Connected(_)));
    }

    #[test]
    fn full_frame_arrives_as_a_ready_message() {
        let (mut reactor, addr) = bound_reactor(60_000);
        let mut client = StdTcpStream::connect(addr).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        reactor.sync(Instant::now());
        reactor.drain_changes();

        let wire = wire::make_reply(0, 1, 0, &[], None);
        client.write_all(&wire).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        reactor.sync(Instant::now());

        let ready = reactor.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].message.header.generation, 1);
    }

    #[test]
    fn idle_connection_is_reaped_after_housekeeping() {
        let (mut reactor, addr) = bound_reactor(1);
        let _client = StdTcpStream::connect(addr).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        reactor.sync(Instant::now());
        reactor.drain_changes();
        assert_eq!(reactor.connection_count(), 1);

        std::thread::sleep(Duration::from_millis(10));
        reactor.sync(Instant::now() + Duration::from_secs(2));

        assert_eq!(reactor.connection_count(), 0);
        let changes = reactor.drain_changes();
        assert!(matches!(changes[0], ConnectionChange::Disconnected(_)));
    }

    #[test]
    fn do_not_reap_survives_idle_sweep() {
        let (mut reactor, addr) = bound_reactor(1);
        let _client = StdTcpStream::connect(addr).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        reactor.sync(Instant::now());
        reactor.drain_changes();

        for conn in reactor.conns.values() {
            conn.handle.set_do_not_reap(true);
        }

        std::thread::sleep(Duration::from_millis(10));
        reactor.sync(Instant::now() + Duration::from_secs(2));

        assert_eq!(reactor.connection_count(), 1);
    }
}
