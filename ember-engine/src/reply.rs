//! Reply shaping (§4.10): composes the reply frame for every terminal state
//! a transaction can reach, atop the wire codec's `make_reply` family.

use ember_net::{make_batch_trailer, make_error_reply, make_reply, Op};

use crate::batch::BatchSharedState;
use crate::status::ResultCode;
use crate::txn::{Origin, Transaction};

/// A single-record success or error reply, ready to write to a client or
/// proxy connection.
pub fn single_record_reply(txn: &Transaction, ops: &[Op]) -> Vec<u8> {
    make_reply(txn.header.result_code.code(), txn.header.generation, txn.header.void_time, ops, None)
}

/// The minimal reply used when a frame fails to parse into a transaction at
/// all (§7 "Parse failures before a transaction is created") — no
/// transaction object exists yet to carry generation/void-time.
pub fn parse_failure_reply(code: ResultCode) -> Vec<u8> {
    make_error_reply(code.code())
}

/// The batch end-of-stream trailer: a single result code with `info3 ==
/// LAST`, written once a batch's shared state reports every row delivered.
pub fn batch_trailer(code: ResultCode) -> Vec<u8> {
    make_batch_trailer(code.code())
}

/// Delivers a terminal transaction's reply by dispatching on its origin
/// exactly once (§4.5). Returns `false` if the origin was already taken
/// (a race with timeout or the respond-on-master-complete path) and this
/// call is therefore a no-op.
pub fn respond(txn: &mut Transaction, ops: &[Op]) -> bool {
    let origin = match txn.take_origin() {
        Some(origin) => origin,
        None => return false,
    };

    match origin {
        Origin::Client(handle) => {
            let bytes = single_record_reply(txn, ops);
            let _ = handle.with_stream(|stream| {
                use std::io::Write;
                stream.write_all(&bytes)
            });
        }
        Origin::Proxy(_proxy_trid) => {
            // Proxy fan-out/reply shipping is fabric-transport territory,
            // explicitly out of scope (§1); the reply bytes are still
            // composed identically so a proxy layer can ship them.
            let _ = single_record_reply(txn, ops);
        }
        Origin::BatchSub(shared) => {
            respond_batch_sub(&shared, txn, ops);
        }
        Origin::InternalUdf(callback) => {
            callback.complete(txn.header.result_code);
        }
        Origin::InternalNsup => {
            // fire-and-forget, no wire reply
        }
    }

    true
}

/// Writes a batch sub-transaction's reply into the shared response stream
/// instead of a freestanding frame, and flushes the trailer once the batch
/// is complete.
fn respond_batch_sub(shared: &BatchSharedState, txn: &Transaction, ops: &[Op]) {
    shared.note_result(txn.header.result_code);
    let encoded = make_reply(txn.header.result_code.code(), txn.header.generation, txn.header.void_time, ops, Some(txn.from_data as u32));
    shared.write_row(&encoded);
    if shared.note_completion() {
        shared.write_trailer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_net::DIGEST_SIZE;

    #[test]
    fn parse_failure_reply_carries_no_generation() {
        let bytes = parse_failure_reply(ResultCode::Parameter);
        assert!(!bytes.is_empty());
    }

    #[test]
    fn batch_trailer_sets_the_last_bit() {
        let bytes = batch_trailer(ResultCode::Ok);
        // proto header is 8 bytes; body offset 3 is info3.
        assert_eq!(bytes[8 + 3] & 0x01, 0x01);
    }

    #[test]
    fn respond_on_internal_nsup_is_a_noop_and_consumes_origin() {
        let mut txn = Transaction::new(bytes::Bytes::new(), [0u8; DIGEST_SIZE], Origin::InternalNsup, 0);
        assert!(respond(&mut txn, &[]));
        assert!(!respond(&mut txn, &[]));
    }
}
