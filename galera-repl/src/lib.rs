//! Replication coordinator (§4.6): wires the local trx store, certification
//! index, ordered delivery queues, parallel applier, and GCS client together
//! into the local-commit path, the remote-apply path, and last-committed
//! reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use galera_apply::{JobCtx, JobQueue, WorkerId};
use galera_base::{err_kind, ErrorKind, Result};
use galera_cert::CertIndex;
use galera_gcs::{ActionKind, Delivery, Gcs};
use galera_queue::{GrabOutcome, OrderedQueue};
use galera_trxstore::{LocalTrxStore, TrxState};
use galera_wire::{decode, encode, ConfChange, QueryRecord, WriteSet, WsItem};

/// Callback surface the coordinator drives to actually run a write-set
/// against the host database. Executing SQL or touching storage is outside
/// this crate's scope (§4.6 treats the host DBMS commit/apply step as
/// external); this trait is the seam a real node implementation fills in.
pub trait Applier: Send + Sync {
    fn apply_query(&self, query: &QueryRecord) -> Result<()>;
    fn apply_item(&self, item: &WsItem) -> Result<()>;
    fn apply_rbr(&self, bytes: &[u8]) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
}

/// Outcome of [`ReplCoordinator::local_commit`]. `Ok` means the host may
/// report success to its client; the two failure variants both mean the host
/// must roll the local transaction back, but distinguish why for logging.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CommitOutcome {
    Ok,
    TrxFail,
    ConnectionFail,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Publish `last_committed` as soon as the commit order slot is
    /// acquired, rather than waiting for the host commit to finish.
    pub mark_commit_early: bool,
    /// Backoff between flow-control polls (§4.6.4, default 10ms).
    pub flow_control_delay_us: u64,
    /// Bound on flow-control retries before giving up with a transport
    /// error (§4.6.4 resolves this open question at 16).
    pub flow_control_retries: u32,
    /// Number of commit-queue releases between `set_last_applied` reports
    /// (§4.6.3, default 200).
    pub report_interval: u64,
    /// `save_keys` passed to every certification test this coordinator
    /// performs. Kept `false` (strict) by default: a soft table-level
    /// conflict fails the WS rather than being merely logged.
    pub save_keys: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mark_commit_early: false,
            flow_control_delay_us: 10_000,
            flow_control_retries: 16,
            report_interval: 200,
            save_keys: false,
        }
    }
}

/// All the in-process subsystems a running node wires together, plus the
/// GCS and host-apply hooks. One `ReplCoordinator` serves one node.
pub struct ReplCoordinator {
    trx_store: Arc<LocalTrxStore>,
    cert: Arc<CertIndex>,
    to_queue: Arc<OrderedQueue>,
    commit_queue: Arc<OrderedQueue>,
    job_queue: Arc<JobQueue>,
    gcs: Arc<dyn Gcs>,
    applier: Arc<dyn Applier>,
    config: Config,
    last_committed_trx: Mutex<i64>,
    report_counter: AtomicU64,
}

fn ws_last_seen(ws: &WriteSet) -> i64 {
    match ws {
        WriteSet::Trx(t) => t.last_seen_trx,
        // A connection WS carries no keys, so nothing in the certification
        // test's per-item loop ever reads this value; i64::MAX just keeps it
        // clear of the cert-bound check.
        WriteSet::Conn(_) => i64::MAX,
    }
}

/// Commit-cut payload: a little-endian `i64` cutoff seqno_global below which
/// the certification index may be purged. §6.1-§6.3 specify the WS/GTID/CC
/// wire layouts but not this one; a bare little-endian integer is the
/// simplest self-describing encoding for a single cutoff value.
pub fn encode_commit_cut(cutoff_seqno_global: i64) -> Vec<u8> {
    cutoff_seqno_global.to_le_bytes().to_vec()
}

fn decode_commit_cut(payload: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(i64::from_le_bytes(bytes))
}

impl ReplCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trx_store: Arc<LocalTrxStore>,
        cert: Arc<CertIndex>,
        to_queue: Arc<OrderedQueue>,
        commit_queue: Arc<OrderedQueue>,
        job_queue: Arc<JobQueue>,
        gcs: Arc<dyn Gcs>,
        applier: Arc<dyn Applier>,
        config: Config,
    ) -> Self {
        ReplCoordinator {
            trx_store,
            cert,
            to_queue,
            commit_queue,
            job_queue,
            gcs,
            applier,
            config,
            last_committed_trx: Mutex::new(-1),
            report_counter: AtomicU64::new(0),
        }
    }

    pub fn last_committed(&self) -> i64 {
        *self.last_committed_trx.lock()
    }

    /// Records a seqno as committed and runs the §4.6.3 report-interval
    /// check, without going through [`local_commit`](Self::local_commit) or
    /// the remote-apply dispatch. Used by callers (the wsrep façade's
    /// `to_execute_end`) that drive their own write-set through the queues
    /// directly, e.g. for total-order-isolated DDL.
    pub fn note_commit(&self, seqno_global: i64) {
        self.publish_last_committed(seqno_global);
    }

    /// §4.6.3: the highest seqno the certification index may be purged up
    /// to without discarding a fingerprint some in-flight WS still needs.
    pub fn safe_to_discard_seqno(&self) -> i64 {
        let lc = *self.last_committed_trx.lock();
        match self.trx_store.min_referenced_last_seen() {
            Some(m) => lc.min(m),
            None => lc,
        }
    }

    fn publish_last_committed(&self, seqno_global: i64) {
        {
            let mut g = self.last_committed_trx.lock();
            if seqno_global > *g {
                *g = seqno_global;
            }
        }
        // Deliberately unsynchronised with the update above (§9 Design Note
        // 3): an occasional skipped or doubled report-interval tick is
        // acceptable, and guarding this counter with the same mutex would
        // serialise every commit behind the reporting cadence rather than
        // just the count.
        let n = self.report_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.config.report_interval == 0 {
            let safe = self.safe_to_discard_seqno();
            if let Err(e) = self.gcs.set_last_applied(safe) {
                warn!(error = %e, "failed to report last-applied seqno");
            }
        }
    }

    fn wait_for_flow_control(&self) -> Result<()> {
        let mut attempts = 0;
        while self.gcs.flow_control_paused() {
            if attempts >= self.config.flow_control_retries {
                return Err(err_kind(
                    ErrorKind::Transport,
                    "flow control did not clear within the retry bound",
                ));
            }
            attempts += 1;
            thread::sleep(Duration::from_micros(self.config.flow_control_delay_us));
        }
        Ok(())
    }

    /// Local commit path (§4.6.1), steps 1-13. `conn` identifies the
    /// connection whose queued connection-context variables are attached to
    /// this trx's write-set.
    pub fn local_commit(&self, trx: u64, conn: u64) -> Result<CommitOutcome> {
        // 1. Respect flow control before sending anything new.
        self.wait_for_flow_control()?;

        // 2. A BF-abort may already have marked this trx aborted.
        if self.trx_store.state(trx) == Some(TrxState::Aborted) {
            self.trx_store.delete_trx(trx)?;
            return Ok(CommitOutcome::TrxFail);
        }

        // 3. Nothing to replicate: commit locally as a no-op.
        if self.trx_store.is_empty(trx)? {
            self.trx_store.delete_trx(trx)?;
            return Ok(CommitOutcome::Ok);
        }

        // 4-5. Build, encode, and broadcast the write-set.
        let last_committed = self.last_committed();
        let ws = self.trx_store.build_write_set(trx, conn, last_committed)?;
        let bytes = encode(&ws);
        let (seqno_global, seqno_local) = match self.gcs.repl(bytes) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(trx, error = %e, "gcs.repl failed, freeing trx");
                self.trx_store.delete_trx(trx)?;
                return Ok(CommitOutcome::ConnectionFail);
            }
        };

        // 6. A BF-abort may have landed while repl() was in flight.
        if self.trx_store.state(trx) == Some(TrxState::Aborted) {
            self.to_queue.self_cancel(seqno_local);
            self.commit_queue.self_cancel(seqno_local);
            self.trx_store.delete_trx(trx)?;
            return Ok(CommitOutcome::TrxFail);
        }

        // 7. Record the assigned seqnos on the trx descriptor.
        self.trx_store.assign_seqnos(trx, seqno_local, seqno_global)?;

        // 8. Enter total order.
        match self.to_queue.grab(seqno_local)? {
            GrabOutcome::Held => {}
            GrabOutcome::Cancelled | GrabOutcome::Interrupted => {
                self.commit_queue.self_cancel(seqno_local);
                self.trx_store.mark_aborted(trx)?;
                self.trx_store.delete_trx(trx)?;
                return Ok(CommitOutcome::TrxFail);
            }
        }

        // 9. Certify and, if it holds, install.
        let last_seen = ws_last_seen(&ws);
        let outcome = self.cert.test(&ws, last_seen, seqno_global, self.config.save_keys);
        if !outcome.is_certified() {
            self.to_queue.release(seqno_local)?;
            self.commit_queue.self_cancel(seqno_local);
            self.trx_store.mark_aborted(trx)?;
            self.trx_store.delete_trx(trx)?;
            return Ok(CommitOutcome::TrxFail);
        }
        self.cert.append(&ws, seqno_global);

        // 10. Release the certification order slot.
        self.to_queue.release(seqno_local)?;

        // 11. Enter commit order.
        self.commit_queue.grab(seqno_local)?;
        if self.config.mark_commit_early {
            self.publish_last_committed(seqno_global);
        }

        // 12-13. The host already executed the trx's statements locally
        // before calling this function; what remains is committing that
        // open transaction while still holding the commit-order slot, then
        // releasing it and publishing/reporting.
        let commit_result = self.applier.commit();
        self.commit_queue.release(seqno_local)?;
        match commit_result {
            Ok(()) => {
                self.publish_last_committed(seqno_global);
                self.trx_store.delete_trx(trx)?;
                Ok(CommitOutcome::Ok)
            }
            Err(e) => {
                warn!(trx, error = %e, "host commit failed after certification succeeded");
                self.trx_store.delete_trx(trx)?;
                Err(e)
            }
        }
    }

    /// Step 14: rolling back a trx that never entered replication touches
    /// neither queue.
    pub fn rollback_before_replication(&self, trx: u64) -> Result<()> {
        self.applier.rollback()?;
        self.trx_store.delete_trx(trx)
    }

    /// Remote apply path (§4.6.2): call once per delivery returned by
    /// `gcs.recv()`. `worker` is only consulted for `Data` actions carrying a
    /// trx write-set, where it identifies this caller's slot in the job
    /// queue.
    pub fn handle_delivery(&self, worker: WorkerId, delivery: Delivery) -> Result<()> {
        match delivery.action {
            ActionKind::Data => self.handle_data(worker, delivery),
            ActionKind::CommitCut => self.handle_commit_cut(delivery),
            ActionKind::Conf | ActionKind::Snapshot => self.handle_conf_or_snapshot(delivery),
        }
    }

    fn handle_data(&self, worker: WorkerId, delivery: Delivery) -> Result<()> {
        let seqno_local = delivery.seqno_local;
        let seqno_global = delivery.seqno_global;

        match self.to_queue.grab(seqno_local)? {
            GrabOutcome::Held => {}
            GrabOutcome::Cancelled | GrabOutcome::Interrupted => {
                self.commit_queue.self_cancel(seqno_local);
                return Ok(());
            }
        }

        let ws = match decode(&delivery.payload) {
            Ok(ws) => ws,
            Err(e) => {
                warn!(seqno_local, error = %e, "dropping malformed write-set");
                self.to_queue.release(seqno_local)?;
                self.commit_queue.self_cancel(seqno_local);
                return Ok(());
            }
        };

        let last_seen = ws_last_seen(&ws);
        let outcome = self.cert.test(&ws, last_seen, seqno_global, self.config.save_keys);
        if outcome.is_certified() {
            self.cert.append(&ws, seqno_global);
        }
        self.to_queue.release(seqno_local)?;

        if !outcome.is_certified() {
            debug!(seqno_local, seqno_global, ?outcome, "remote write-set failed certification, skipping apply");
            self.commit_queue.self_cancel(seqno_local);
            return Ok(());
        }

        match &ws {
            WriteSet::Trx(_) => self.apply_trx_ws(worker, seqno_local, seqno_global, ws),
            WriteSet::Conn(_) => self.apply_conn_ws(seqno_local, seqno_global, ws),
        }
    }

    /// Applies a trx write-set's statements/items/RBR bytes through the job
    /// queue (so disjoint write-sets overlap), then commits under
    /// `commit_queue` so commit order still matches certification order.
    fn apply_trx_ws(&self, worker: WorkerId, seqno_local: i64, seqno_global: i64, ws: WriteSet) -> Result<()> {
        let t = match &ws {
            WriteSet::Trx(t) => t,
            WriteSet::Conn(_) => unreachable!("apply_trx_ws called with a connection write-set"),
        };

        self.job_queue.start_job(worker, JobCtx { seqno: seqno_global, ws: ws.clone() });
        let apply_result: Result<()> = (|| {
            for q in &t.conn_queries {
                self.applier.apply_query(q)?;
            }
            for q in &t.trx_queries {
                self.applier.apply_query(q)?;
            }
            for item in &t.items {
                self.applier.apply_item(item)?;
            }
            if !t.rbr_buf.is_empty() {
                self.applier.apply_rbr(&t.rbr_buf)?;
            }
            Ok(())
        })();
        if let Err(e) = apply_result {
            // Apply never reached commit order, so release commit_queue's
            // slot via self-cancel rather than leaving its head stuck
            // behind this seqno forever (§8 P1/P5). end_job stays after
            // commit_queue is resolved either way, so a conflicting
            // write-set cannot start applying while this one is still
            // live in the job queue's bookkeeping.
            self.commit_queue.self_cancel(seqno_local);
            self.job_queue.end_job(worker);
            return Err(e);
        }

        self.commit_queue.grab(seqno_local)?;
        let commit_result = self.applier.commit();
        self.commit_queue.release(seqno_local)?;
        self.job_queue.end_job(worker);
        commit_result?;
        self.publish_last_committed(seqno_global);
        Ok(())
    }

    /// A connection WS carries a single DDL-like statement and no keys, so
    /// nothing can conflict with it; it is applied serialised under
    /// `commit_queue` directly, skipping the job queue entirely.
    fn apply_conn_ws(&self, seqno_local: i64, seqno_global: i64, ws: WriteSet) -> Result<()> {
        let stmt = match &ws {
            WriteSet::Conn(c) => &c.stmt,
            WriteSet::Trx(_) => unreachable!("apply_conn_ws called with a trx write-set"),
        };
        self.commit_queue.grab(seqno_local)?;
        let result: Result<()> = (|| {
            self.applier.apply_query(stmt)?;
            self.applier.commit()
        })();
        self.commit_queue.release(seqno_local)?;
        result?;
        self.publish_last_committed(seqno_global);
        Ok(())
    }

    fn handle_commit_cut(&self, delivery: Delivery) -> Result<()> {
        let seqno_local = delivery.seqno_local;
        match self.to_queue.grab(seqno_local)? {
            GrabOutcome::Held => {}
            GrabOutcome::Cancelled | GrabOutcome::Interrupted => {
                self.commit_queue.self_cancel(seqno_local);
                return Ok(());
            }
        }
        match decode_commit_cut(&delivery.payload) {
            Some(cutoff) => self.cert.purge_up_to(cutoff),
            None => warn!(seqno_local, "malformed commit-cut payload, ignoring"),
        }
        self.to_queue.release(seqno_local)?;
        self.commit_queue.self_cancel(seqno_local);
        Ok(())
    }

    fn handle_conf_or_snapshot(&self, delivery: Delivery) -> Result<()> {
        let seqno_local = delivery.seqno_local;
        match self.to_queue.grab(seqno_local)? {
            GrabOutcome::Held => {}
            GrabOutcome::Cancelled | GrabOutcome::Interrupted => {
                self.commit_queue.self_cancel(seqno_local);
                return Ok(());
            }
        }
        self.to_queue.release(seqno_local)?;
        self.commit_queue.self_cancel(seqno_local);

        if delivery.action == ActionKind::Conf {
            if let Ok(conf) = ConfChange::decode(&delivery.payload) {
                if conf.is_primary() {
                    if let Err(e) = self.gcs.join() {
                        warn!(error = %e, "failed to signal joined after becoming primary");
                    }
                }
            }
        }
        Ok(())
    }
}
