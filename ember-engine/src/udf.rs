//! UDF pipeline (§4.8): master-apply classification plus the dup-res /
//! repl-write suspension points, advanced by explicit `step()` calls instead
//! of blocking (§5 "a reactor handler does not itself block").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;

use crate::contracts::{DupResCoordinator, Record, RecordOp, ReplicationCoordinator, ScriptEngine, StorageEngine};
use crate::reply;
use crate::status::ResultCode;
use crate::txn::Transaction;

/// Per-namespace counters updated after every apply (§4.8 "Statistics
/// update"). Plain `AtomicU64`s read by the ticker, never reset.
#[derive(Default)]
pub struct NamespaceUdfStats {
    pub read_reqs: AtomicU64,
    pub read_success: AtomicU64,
    pub write_reqs: AtomicU64,
    pub write_success: AtomicU64,
    pub delete_reqs: AtomicU64,
    pub delete_success: AtomicU64,
    pub lang_errors: AtomicU64,
}

impl NamespaceUdfStats {
    pub fn new() -> NamespaceUdfStats {
        NamespaceUdfStats::default()
    }

    fn note(&self, op: RecordOp, script_ok: bool) {
        let (reqs, success) = match op {
            RecordOp::Read => (&self.read_reqs, &self.read_success),
            RecordOp::Write => (&self.write_reqs, &self.write_success),
            RecordOp::Delete => (&self.delete_reqs, &self.delete_success),
            RecordOp::None => return,
        };
        reqs.fetch_add(1, Ordering::Relaxed);
        if script_ok {
            success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.lang_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The classification §4.8 derives from the script callback's verdict on the
/// record it was handed.
fn classify(had_updates: bool, record: &dyn Record) -> RecordOp {
    let op = if had_updates && record.exists() {
        RecordOp::Write
    } else if had_updates && !record.exists() && record.pre_existed() {
        RecordOp::Delete
    } else if had_updates && !record.exists() {
        RecordOp::None
    } else if !had_updates && record.pre_existed() && !record.exists() {
        RecordOp::Delete
    } else {
        RecordOp::Read
    };

    if op == RecordOp::Write && record.bin_count() == 0 {
        RecordOp::Delete
    } else {
        op
    }
}

/// What a UDF invocation asked the script engine to run.
pub struct UdfRequest {
    pub namespace: String,
    pub package: String,
    pub function: String,
    pub args: Bytes,
}

/// The recyclable pipeline record dup-res and repl-write share (§4.8 "reuse a
/// single recyclable pipeline record"). `reset_for_repl_write` clears whatever
/// dup-res left behind without discarding the classification it produced.
struct RwRequest {
    digest: Vec<u8>,
    op: RecordOp,
    script_ok: bool,
}

/// One UDF invocation's state machine. Advanced by `step()`; every exit path
/// (`Done`) has already delivered its reply via [`reply::respond`] before
/// `step()` returns, so the caller only needs to keep calling `step()` until
/// [`UdfPipeline::is_done`].
pub enum UdfStage {
    Start,
    AwaitingDupRes(RwRequest),
    MasterApply,
    AwaitingReplWrite(RwRequest),
    Done,
}

pub struct UdfPipeline<S, D, R> {
    stage: Mutex<UdfStage>,
    txn: Mutex<Transaction>,
    request: UdfRequest,
    script: Arc<dyn ScriptEngine>,
    storage: Arc<S>,
    dup_res: Arc<D>,
    repl: Arc<R>,
    stats: Arc<NamespaceUdfStats>,
    deadline: Instant,
    has_duplicates: bool,
    respond_on_master_complete: bool,
    xdr_rejected: bool,
}

impl<S, D, R> UdfPipeline<S, D, R>
where
    S: StorageEngine + 'static,
    D: DupResCoordinator + 'static,
    R: ReplicationCoordinator + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        txn: Transaction,
        request: UdfRequest,
        script: Arc<dyn ScriptEngine>,
        storage: Arc<S>,
        dup_res: Arc<D>,
        repl: Arc<R>,
        stats: Arc<NamespaceUdfStats>,
        deadline: Instant,
        has_duplicates: bool,
        respond_on_master_complete: bool,
        xdr_rejected: bool,
    ) -> UdfPipeline<S, D, R> {
        UdfPipeline {
            stage: Mutex::new(UdfStage::Start),
            txn: Mutex::new(txn),
            request,
            script,
            storage,
            dup_res,
            repl,
            stats,
            deadline,
            has_duplicates,
            respond_on_master_complete,
            xdr_rejected,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.stage.lock().unwrap(), UdfStage::Done)
    }

    /// Advances the state machine exactly one step, never blocking. The
    /// caller drives it forward: an initial call from the request handler,
    /// then one more call per dup-res / repl-write completion callback.
    ///
    /// Each handler below writes `self.stage` itself, *before* triggering any
    /// coordinator call that might complete synchronously and re-enter
    /// `step()` on this same thread — the stand-in coordinators in
    /// [`crate::contracts::memtable`] do exactly that. Writing the next stage
    /// first means a reentrant `step()` observes the correct stage instead of
    /// the placeholder `Done` this call installs while it works.
    pub fn step(self: &Arc<Self>) {
        let stage = std::mem::replace(&mut *self.stage.lock().unwrap(), UdfStage::Done);
        match stage {
            UdfStage::Start => self.on_start(),
            UdfStage::AwaitingDupRes(rw) => self.on_master_apply(Some(rw)),
            UdfStage::MasterApply => self.on_master_apply(None),
            UdfStage::AwaitingReplWrite(rw) => self.on_repl_write_done(rw),
            UdfStage::Done => {}
        }
    }

    fn on_start(self: &Arc<Self>) {
        if self.xdr_rejected {
            self.finish_with_error(ResultCode::Forbidden);
            return;
        }
        if self.storage.overloaded() {
            self.finish_with_error(ResultCode::DeviceOverload);
            return;
        }

        if self.has_duplicates {
            let digest = self.txn.lock().unwrap().header.keyd.to_vec();
            *self.stage.lock().unwrap() = UdfStage::AwaitingDupRes(RwRequest { digest: digest.clone(), op: RecordOp::None, script_ok: false });
            let this = self.clone();
            self.dup_res.resolve(&self.request.namespace, &digest, Box::new(move || this.step()));
            return;
        }

        self.on_master_apply(None);
    }

    /// Runs the script against the opened record and classifies the result
    /// (§4.8 "Master apply"). `carried` is the slot handed back from dup-res,
    /// if any; its digest is reused, its op/script_ok fields are overwritten.
    fn on_master_apply(self: &Arc<Self>, carried: Option<RwRequest>) {
        let digest = carried.map(|rw| rw.digest).unwrap_or_else(|| self.txn.lock().unwrap().header.keyd.to_vec());

        let mut record = self.storage.open(&self.request.namespace, &digest);
        let pre_existed = record.pre_existed();
        let pre_bin_count = record.bin_count();
        let script_ok = self.script.apply(&self.request.package, &self.request.function, &self.request.args, &mut *record, self.deadline);

        if !script_ok {
            self.stats.lang_errors.fetch_add(1, Ordering::Relaxed);
            self.storage.commit(&self.request.namespace, &digest, record);
            self.finish_with_error(ResultCode::UdfExecution);
            return;
        }

        // `Record` reports state, not edit history, so "the script touched
        // this record" is approximated by a change in its exists flag or bin
        // count between open and apply (§4.8 classification needs a true
        // has-updates signal a real as-rec façade would track directly).
        let had_updates = record.exists() != pre_existed || record.bin_count() != pre_bin_count;
        let op = classify(had_updates, &*record);
        self.stats.note(op, true);

        match op {
            RecordOp::Write => record.bump_generation(),
            RecordOp::Delete => self.storage.delete(&self.request.namespace, &digest),
            RecordOp::None | RecordOp::Read => {}
        }
        if op != RecordOp::Delete {
            self.storage.commit(&self.request.namespace, &digest, record);
        }

        self.txn.lock().unwrap().set_result_code(ResultCode::Ok);

        if op == RecordOp::Read || op == RecordOp::None {
            self.finish_with_success();
            return;
        }

        if self.respond_on_master_complete {
            self.finish_with_success();
        }

        *self.stage.lock().unwrap() = UdfStage::AwaitingReplWrite(RwRequest { digest: digest.clone(), op, script_ok: true });
        let this = self.clone();
        self.repl.replicate(&self.request.namespace, &digest, op, Box::new(move || this.step()));
    }

    /// Repl-write completed. If respond-on-master-complete already answered
    /// the client, `reply::respond` is a no-op here because `take_origin`
    /// already returned `None` (§4.8 "must not re-respond").
    fn on_repl_write_done(self: &Arc<Self>, rw: RwRequest) {
        if !self.respond_on_master_complete {
            self.finish_with_success_or_error(rw.script_ok);
        } else {
            let mut txn = self.txn.lock().unwrap();
            reply::respond(&mut txn, &[]);
        }
    }

    fn finish_with_success(self: &Arc<Self>) {
        let mut txn = self.txn.lock().unwrap();
        txn.set_result_code(ResultCode::Ok);
        reply::respond(&mut txn, &[]);
    }

    fn finish_with_success_or_error(self: &Arc<Self>, ok: bool) {
        if ok {
            self.finish_with_success();
        } else {
            self.finish_with_error(ResultCode::UdfExecution);
        }
    }

    fn finish_with_error(self: &Arc<Self>, code: ResultCode) {
        let mut txn = self.txn.lock().unwrap();
        txn.set_result_code(code);
        reply::respond(&mut txn, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::memtable::{EchoScriptEngine, ImmediateDupRes, ImmediateReplication, MemStorage};
    use crate::txn::Origin;
    use ember_net::DIGEST_SIZE;

    fn new_pipeline(
        has_duplicates: bool,
        respond_on_master_complete: bool,
        args: &'static [u8],
    ) -> (Arc<UdfPipeline<MemStorage, ImmediateDupRes, ImmediateReplication>>, Arc<NamespaceUdfStats>) {
        let txn = Transaction::new(Bytes::new(), [7u8; DIGEST_SIZE], Origin::InternalNsup, 0);
        let request = UdfRequest {
            namespace: "test".to_owned(),
            package: "pkg".to_owned(),
            function: "fn".to_owned(),
            args: Bytes::from_static(args),
        };
        let stats = Arc::new(NamespaceUdfStats::new());
        let pipeline = Arc::new(UdfPipeline::new(
            txn,
            request,
            Arc::new(EchoScriptEngine),
            Arc::new(MemStorage::new()),
            Arc::new(ImmediateDupRes),
            Arc::new(ImmediateReplication),
            stats.clone(),
            Instant::now() + std::time::Duration::from_secs(1),
            has_duplicates,
            respond_on_master_complete,
            false,
        ));
        (pipeline, stats)
    }

    #[test]
    fn write_udf_runs_to_done_and_counts_a_write() {
        let (pipeline, stats) = new_pipeline(false, false, b"a=1");
        while !pipeline.is_done() {
            pipeline.step();
        }
        assert_eq!(stats.write_reqs.load(Ordering::Relaxed), 1);
        assert_eq!(stats.write_success.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn no_op_udf_classifies_as_read() {
        let (pipeline, stats) = new_pipeline(false, false, b"");
        while !pipeline.is_done() {
            pipeline.step();
        }
        assert_eq!(stats.read_reqs.load(Ordering::Relaxed), 1);
        assert_eq!(stats.write_reqs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn malformed_args_counts_a_language_error() {
        let (pipeline, stats) = new_pipeline(false, false, b"not-a-pair");
        while !pipeline.is_done() {
            pipeline.step();
        }
        assert_eq!(stats.lang_errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn xdr_filter_reject_short_circuits_before_master_apply() {
        let txn = Transaction::new(Bytes::new(), [7u8; DIGEST_SIZE], Origin::InternalNsup, 0);
        let request = UdfRequest { namespace: "test".to_owned(), package: "pkg".to_owned(), function: "fn".to_owned(), args: Bytes::from_static(b"a=1") };
        let stats = Arc::new(NamespaceUdfStats::new());
        let pipeline = Arc::new(UdfPipeline::new(
            txn,
            request,
            Arc::new(EchoScriptEngine),
            Arc::new(MemStorage::new()),
            Arc::new(ImmediateDupRes),
            Arc::new(ImmediateReplication),
            stats.clone(),
            Instant::now() + std::time::Duration::from_secs(1),
            false,
            false,
            true,
        ));
        pipeline.step();
        assert!(pipeline.is_done());
        assert_eq!(stats.write_reqs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn duplicates_present_routes_through_dup_res_before_master_apply() {
        let (pipeline, stats) = new_pipeline(true, false, b"a=1");
        while !pipeline.is_done() {
            pipeline.step();
        }
        assert_eq!(stats.write_reqs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn respond_on_master_complete_answers_before_repl_write_and_does_not_re_respond() {
        // The stand-in coordinators resolve synchronously, so the whole
        // chain — master-apply, the early respond, and the repl-write
        // completion that must find the origin already gone — runs to
        // completion within this single step() call.
        let (pipeline, stats) = new_pipeline(false, true, b"a=1");
        pipeline.step();
        assert!(pipeline.is_done());
        assert_eq!(stats.write_success.load(Ordering::Relaxed), 1);
    }
}
