//! The request-scoped transaction object (§4.5): carries origin, digest,
//! reservation, timing, and result code through the pipeline.

use std::time::Instant;

use bitflags::bitflags;
use bytes::Bytes;

use ember_net::{Handle, DIGEST_SIZE};

use crate::batch::BatchSharedState;
use crate::status::ResultCode;

pub type Digest = [u8; DIGEST_SIZE];

bitflags! {
    pub struct TxnFlags: u32 {
        const UDF_REQUEST = 0b0000_0001;
        const BATCH_SUB = 0b0000_0010;
        const RESPOND_ON_MASTER_COMPLETE = 0b0000_0100;
        const XDR_WRITE = 0b0000_1000;
    }
}

/// Callback supplied by the enclosing job for a scan/query-internal UDF
/// (`origin = internal-udf`); invoked exactly once when the transaction
/// reaches a terminal state.
pub trait UdfOriginCallback: Send + Sync {
    fn complete(&self, result_code: ResultCode);
}

/// Where a transaction came from, and therefore how its response (if any)
/// must be delivered. Every stage that emits a response dispatches on this
/// exactly once (§4.5).
pub enum Origin {
    /// A client connection; the reply goes straight back out that socket.
    Client(Handle),
    /// A proxied request from a peer node, tagged with that peer's
    /// transaction id so the proxy can correlate the reply.
    Proxy(u64),
    /// One row of a batch request; the reply is written into the shared
    /// response-buffer assembly instead of sent directly.
    BatchSub(std::sync::Arc<BatchSharedState>),
    /// A UDF invoked internally by a scan or query job.
    InternalUdf(std::sync::Arc<dyn UdfOriginCallback>),
    /// Namespace supervisor (eviction/expiry) internal work; fire-and-forget,
    /// never produces a wire reply.
    InternalNsup,
}

impl Origin {
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, Origin::InternalNsup)
    }
}

/// A minimal stand-in for the partition reservation the storage layer would
/// hand out: enough identity to guarantee the "released exactly once"
/// invariant (§3) without implementing partition placement, which is out of
/// scope (§1).
pub struct Reservation {
    pub namespace: String,
    pub partition_id: u16,
    released: bool,
}

impl Reservation {
    pub fn new(namespace: impl Into<String>, partition_id: u16) -> Reservation {
        Reservation { namespace: namespace.into(), partition_id, released: false }
    }

    pub fn release(&mut self) {
        self.released = true;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        debug_assert!(self.released, "reservation dropped without being released");
    }
}

/// The header-only portion of a transaction: everything needed to route and
/// account for it, but not the raw frame bytes. Split out so a recyclable
/// pipeline record (§4.8 dup-res/repl-write) can be moved between stages by
/// copying the header and re-attaching a body, without re-parsing the wire
/// frame.
pub struct TransactionHeader {
    pub msg_fields: u32,
    pub keyd: Digest,
    pub start_time: Instant,
    pub end_time: Option<Instant>,
    pub result_code: ResultCode,
    pub generation: u32,
    pub void_time: u32,
    pub last_update_time: u64,
    pub flags: TxnFlags,
}

pub struct Transaction {
    pub msgp: Bytes,
    pub header: TransactionHeader,
    pub origin: Option<Origin>,
    pub from_data: u64,
    pub rsv: Option<Reservation>,
    pub benchmark_time: Option<Instant>,
}

impl Transaction {
    pub fn new(msgp: Bytes, keyd: Digest, origin: Origin, from_data: u64) -> Transaction {
        Transaction {
            msgp,
            header: TransactionHeader {
                msg_fields: 0,
                keyd,
                start_time: Instant::now(),
                end_time: None,
                result_code: ResultCode::Ok,
                generation: 0,
                void_time: 0,
                last_update_time: 0,
                flags: TxnFlags::empty(),
            },
            origin: Some(origin),
            from_data,
            rsv: None,
            benchmark_time: None,
        }
    }

    /// Copies everything but the raw frame and the origin: the shape a
    /// recyclable repl-write record needs to carry forward from dup-res
    /// (§4.8 "the same record is reset for the repl-write phase").
    pub fn copy_header(&self) -> TransactionHeader {
        TransactionHeader {
            msg_fields: self.header.msg_fields,
            keyd: self.header.keyd,
            start_time: self.header.start_time,
            end_time: self.header.end_time,
            result_code: self.header.result_code,
            generation: self.header.generation,
            void_time: self.header.void_time,
            last_update_time: self.header.last_update_time,
            flags: self.header.flags,
        }
    }

    /// Re-attaches a body to a header produced by [`copy_header`], completing
    /// the move into the next pipeline stage.
    pub fn init_body(header: TransactionHeader, msgp: Bytes, origin: Origin, from_data: u64) -> Transaction {
        Transaction { msgp, header, origin: Some(origin), from_data, rsv: None, benchmark_time: None }
    }

    /// Clears `from` (origin ownership), returning whatever was there. Used
    /// by the natural-completion/timeout race (§4.6) and by the
    /// respond-on-master-complete optimization (§4.8): whichever caller
    /// observes `Some` wins the right to respond, the other sees `None` and
    /// no-ops.
    pub fn take_origin(&mut self) -> Option<Origin> {
        self.origin.take()
    }

    pub fn set_result_code(&mut self, code: ResultCode) {
        self.header.result_code = code;
    }

    pub fn is_udf(&self) -> bool {
        self.header.flags.contains(TxnFlags::UDF_REQUEST)
    }

    pub fn is_batch_sub(&self) -> bool {
        self.header.flags.contains(TxnFlags::BATCH_SUB)
    }

    /// Releases the reservation exactly once (§3 invariant 7); a no-op if
    /// there was none or it was already released.
    pub fn release_reservation(&mut self) {
        if let Some(rsv) = self.rsv.as_mut() {
            if !rsv.is_released() {
                rsv.release();
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.release_reservation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(byte: u8) -> Digest {
        [byte; DIGEST_SIZE]
    }

    #[test]
    fn take_origin_leaves_none_behind() {
        let mut txn = Transaction::new(Bytes::new(), digest(1), Origin::InternalNsup, 0);
        assert!(txn.take_origin().is_some());
        assert!(txn.take_origin().is_none());
    }

    #[test]
    fn copy_header_then_init_body_preserves_fields() {
        let mut txn = Transaction::new(Bytes::new(), digest(2), Origin::InternalNsup, 7);
        txn.header.generation = 3;
        let header = txn.copy_header();
        let rebuilt = Transaction::init_body(header, Bytes::new(), Origin::InternalNsup, 7);
        assert_eq!(rebuilt.header.generation, 3);
        assert_eq!(rebuilt.header.keyd, digest(2));
    }

    #[test]
    fn reservation_drop_without_release_panics_in_debug() {
        let rsv = Reservation::new("test", 0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| drop(rsv)));
        assert!(result.is_err());
    }

    #[test]
    fn transaction_drop_releases_its_reservation() {
        let mut txn = Transaction::new(Bytes::new(), digest(3), Origin::InternalNsup, 0);
        txn.rsv = Some(Reservation::new("test", 1));
        drop(txn);
    }

    #[test]
    fn fire_and_forget_origin_is_flagged() {
        assert!(Origin::InternalNsup.is_fire_and_forget());
        assert!(!Origin::Proxy(1).is_fire_and_forget());
    }
}
