//! wsrep façade (§4.8): the function-table a host DBMS drives, returned by
//! [`load_provider`]. Its only non-trivial role is argument validation and
//! mapping core states onto [`WsrepStatus`] — the certification/ordering
//! work all happens in `galera-repl`/`galera-cert`/`galera-queue`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use galera_apply::{JobQueue, WorkerId};
use galera_base::{err_kind, Error, ErrorKind, Result};
use galera_cert::CertIndex;
use galera_gcs::Gcs;
use galera_queue::{GrabOutcome, OrderedQueue};
use galera_repl::{Applier, CommitOutcome, Config as CoordConfig, ReplCoordinator};
use galera_trxstore::LocalTrxStore;
use galera_wire::{encode, Action, ConnWs, QueryRecord, WriteSet, WsKeyRecord};

/// Status codes the façade maps every core result onto (§4.8).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WsrepStatus {
    Ok,
    Warning,
    TrxMissing,
    TrxFail,
    BfAbort,
    ConnFail,
    NodeFail,
    Fatal,
}

fn status_of_error(e: &Error) -> WsrepStatus {
    match e.kind() {
        Some(ErrorKind::MalformedWs) => WsrepStatus::Warning,
        Some(ErrorKind::Capacity) => WsrepStatus::Warning,
        Some(ErrorKind::CertificationFail) | Some(ErrorKind::CertBoundViolated) => WsrepStatus::TrxFail,
        Some(ErrorKind::BfAbort) => WsrepStatus::BfAbort,
        Some(ErrorKind::Transport) => WsrepStatus::ConnFail,
        Some(ErrorKind::Fatal) | None => WsrepStatus::Fatal,
    }
}

fn status_of_outcome(outcome: CommitOutcome) -> WsrepStatus {
    match outcome {
        CommitOutcome::Ok => WsrepStatus::Ok,
        CommitOutcome::TrxFail => WsrepStatus::TrxFail,
        CommitOutcome::ConnectionFail => WsrepStatus::ConnFail,
    }
}

/// Forwards [`Applier`] calls to whatever the host has registered via
/// [`Provider::configure_callbacks`]. `load_provider` needs a live `Applier`
/// to hand `ReplCoordinator::new` immediately, but the real apply callback
/// only arrives in a later, separate call — this is the seam that lets the
/// two-phase load/configure lifecycle work.
struct CallbackApplier {
    inner: Mutex<Option<Arc<dyn Applier>>>,
}

impl CallbackApplier {
    fn new() -> Self {
        CallbackApplier { inner: Mutex::new(None) }
    }

    fn current(&self) -> Result<Arc<dyn Applier>> {
        self.inner.lock().clone().ok_or_else(|| err_kind(ErrorKind::Fatal, "apply callback not configured"))
    }
}

impl Applier for CallbackApplier {
    fn apply_query(&self, query: &QueryRecord) -> Result<()> {
        self.current()?.apply_query(query)
    }
    fn apply_item(&self, item: &galera_wire::WsItem) -> Result<()> {
        self.current()?.apply_item(item)
    }
    fn apply_rbr(&self, bytes: &[u8]) -> Result<()> {
        self.current()?.apply_rbr(bytes)
    }
    fn commit(&self) -> Result<()> {
        self.current()?.commit()
    }
    fn rollback(&self) -> Result<()> {
        self.current()?.rollback()
    }
}

struct Hooks {
    start_ws: Option<Box<dyn Fn(i64) + Send + Sync>>,
    log: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

/// Sizing/behaviour knobs for the subsystem stack [`load_provider`] builds.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub local_cache_size: usize,
    pub to_queue_capacity: usize,
    pub commit_queue_capacity: usize,
    pub max_applier_workers: usize,
    pub coordinator: CoordConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            local_cache_size: 16 * 1024 * 1024,
            to_queue_capacity: 1024,
            commit_queue_capacity: 1024,
            max_applier_workers: 2,
            coordinator: CoordConfig::default(),
        }
    }
}

/// The façade itself: one `Provider` per node, holding every subsystem
/// `load_provider` wired together plus the host callbacks and in-flight
/// total-order-isolation state.
pub struct Provider {
    trx_store: Arc<LocalTrxStore>,
    job_queue: Arc<JobQueue>,
    to_queue: Arc<OrderedQueue>,
    commit_queue: Arc<OrderedQueue>,
    gcs: Arc<dyn Gcs>,
    coordinator: Arc<ReplCoordinator>,
    callback_applier: Arc<CallbackApplier>,
    hooks: Mutex<Hooks>,
    toi_in_flight: Mutex<HashMap<u64, (i64, i64)>>,
}

/// Builds the function-table-equivalent [`Provider`] a host process drives.
/// `name` is accepted for fidelity with the real loader contract
/// (`load_provider(path)`) but is not a filesystem path here — there is
/// nothing to `dlopen` in an in-process library, so it is only threaded into
/// the startup log line.
pub fn load_provider(name: &str, gcs: Arc<dyn Gcs>, config: ProviderConfig) -> Provider {
    info!(name, "loading wsrep provider");
    let trx_store = Arc::new(LocalTrxStore::new(config.local_cache_size));
    let cert = Arc::new(CertIndex::new());
    let to_queue = Arc::new(OrderedQueue::new(0, config.to_queue_capacity));
    let commit_queue = Arc::new(OrderedQueue::new(0, config.commit_queue_capacity));
    let job_queue = Arc::new(JobQueue::new(Arc::clone(&cert), config.max_applier_workers));
    let callback_applier = Arc::new(CallbackApplier::new());
    let coordinator = Arc::new(ReplCoordinator::new(
        Arc::clone(&trx_store),
        cert,
        Arc::clone(&to_queue),
        Arc::clone(&commit_queue),
        Arc::clone(&job_queue),
        Arc::clone(&gcs),
        Arc::clone(&callback_applier),
        config.coordinator,
    ));
    Provider {
        trx_store,
        job_queue,
        to_queue,
        commit_queue,
        gcs,
        coordinator,
        callback_applier,
        hooks: Mutex::new(Hooks { start_ws: None, log: None }),
        toi_in_flight: Mutex::new(HashMap::new()),
    }
}

impl Provider {
    /// Announces this node to the group (§4.7 `join`).
    pub fn init(&self) -> WsrepStatus {
        match self.gcs.join() {
            Ok(()) => WsrepStatus::Ok,
            Err(e) => status_of_error(&e),
        }
    }

    /// Registers one more applier-worker slot with the job queue. Call this
    /// once per thread that will run [`recv`](Self::recv) in a loop.
    pub fn spawn_applier_worker(&self) -> Result<WorkerId> {
        self.job_queue.spawn_worker()
    }

    /// One iteration of the receive loop: dequeues a delivery and runs it
    /// through the remote-apply path. The real wsrep contract has a single
    /// dedicated receive thread that does certification itself and
    /// dispatches apply to a separate worker pool; here certification and
    /// apply happen in one call, so running this from each of the process's
    /// N applier-worker threads (each with its own `WorkerId`) gets the same
    /// parallelism — certification still serialises through the to-queue
    /// regardless of which thread calls it, and disjoint write-sets still
    /// overlap in apply via the job queue's conflict predicate.
    pub fn recv(&self, worker: WorkerId) -> WsrepStatus {
        let delivery = match self.gcs.recv() {
            Ok(d) => d,
            Err(e) => return status_of_error(&e),
        };
        match self.coordinator.handle_delivery(worker, delivery) {
            Ok(()) => WsrepStatus::Ok,
            Err(e) => status_of_error(&e),
        }
    }

    /// Drives the local commit path for `trx` on `conn` (§4.6.1).
    pub fn pre_commit(&self, trx: u64, conn: u64) -> WsrepStatus {
        match self.coordinator.local_commit(trx, conn) {
            Ok(outcome) => status_of_outcome(outcome),
            Err(e) => status_of_error(&e),
        }
    }

    /// The host's own commit already ran inside `pre_commit`'s certified
    /// section; this only confirms the descriptor is gone.
    pub fn post_commit(&self, trx: u64) -> WsrepStatus {
        match self.trx_store.state(trx) {
            None => WsrepStatus::Ok,
            Some(_) => WsrepStatus::Warning,
        }
    }

    /// Rolls back a trx that never entered replication (§4.6.1 step 14).
    pub fn post_rollback(&self, trx: u64) -> WsrepStatus {
        match self.coordinator.rollback_before_replication(trx) {
            Ok(()) => WsrepStatus::Ok,
            Err(e) => status_of_error(&e),
        }
    }

    pub fn append_query(&self, trx: u64, sql: Vec<u8>, ts: i64, randseed: u32) -> WsrepStatus {
        match self.trx_store.append_query(trx, sql, ts, randseed) {
            Ok(()) => WsrepStatus::Ok,
            Err(e) => status_of_error(&e),
        }
    }

    pub fn append_row_key(&self, trx: u64, key_rec: WsKeyRecord, action: Action) -> WsrepStatus {
        match self.trx_store.append_row_key(trx, key_rec, action) {
            Ok(()) => WsrepStatus::Ok,
            Err(e) => status_of_error(&e),
        }
    }

    pub fn append_row(&self, trx: u64, bytes: Vec<u8>) -> WsrepStatus {
        match self.trx_store.append_row(trx, bytes) {
            Ok(()) => WsrepStatus::Ok,
            Err(e) => status_of_error(&e),
        }
    }

    pub fn set_variable(&self, conn: u64, sql_setter: Vec<u8>, ts: i64, randseed: u32) -> WsrepStatus {
        self.trx_store.set_connection_variable(conn, sql_setter, ts, randseed);
        WsrepStatus::Ok
    }

    /// `USE <db>` is a connection variable like any other from the trx
    /// store's point of view, so this just formats the setter statement
    /// rather than adding a second per-connection queue for what is the
    /// same "replay before the next WS" mechanism as `set_variable`.
    pub fn set_database(&self, conn: u64, db: &str, ts: i64, randseed: u32) -> WsrepStatus {
        let mut sql = Vec::with_capacity(4 + db.len());
        sql.extend_from_slice(b"USE ");
        sql.extend_from_slice(db.as_bytes());
        self.trx_store.set_connection_variable(conn, sql, ts, randseed);
        WsrepStatus::Ok
    }

    /// Total-order-isolation start: replicates `sql` as a connection
    /// write-set and blocks until `conn` holds certification order for it.
    /// The host executes `sql` locally once this returns `Ok`, then calls
    /// [`to_execute_end`](Self::to_execute_end).
    pub fn to_execute_start(&self, conn: u64, sql: Vec<u8>, ts: i64, randseed: u32) -> WsrepStatus {
        let ws = WriteSet::Conn(ConnWs { stmt: QueryRecord { sql, timestamp: ts, randseed } });
        let (seqno_global, seqno_local) = match self.gcs.repl(encode(&ws)) {
            Ok(pair) => pair,
            Err(e) => return status_of_error(&e),
        };
        match self.to_queue.grab(seqno_local) {
            Ok(GrabOutcome::Held) => {}
            Ok(GrabOutcome::Cancelled) | Ok(GrabOutcome::Interrupted) => {
                self.commit_queue.self_cancel(seqno_local);
                return WsrepStatus::TrxFail;
            }
            Err(e) => return status_of_error(&e),
        }
        if let Some(hook) = self.hooks.lock().start_ws.as_ref() {
            hook(seqno_global);
        }
        self.toi_in_flight.lock().insert(conn, (seqno_local, seqno_global));
        WsrepStatus::Ok
    }

    /// Total-order-isolation end: releases certification order, takes and
    /// releases commit order, and reports the completed seqno.
    pub fn to_execute_end(&self, conn: u64) -> WsrepStatus {
        let (seqno_local, seqno_global) = match self.toi_in_flight.lock().remove(&conn) {
            Some(pair) => pair,
            None => return WsrepStatus::TrxMissing,
        };
        if let Err(e) = self.to_queue.release(seqno_local) {
            return status_of_error(&e);
        }
        if let Err(e) = self.commit_queue.grab(seqno_local) {
            return status_of_error(&e);
        }
        if let Err(e) = self.commit_queue.release(seqno_local) {
            return status_of_error(&e);
        }
        self.coordinator.note_commit(seqno_global);
        WsrepStatus::Ok
    }

    /// Registers the host's apply callback and optional start-ws/log hooks.
    /// `start_ws` fires once per [`to_execute_start`](Self::to_execute_start)
    /// call, with the seqno assigned to that write-set.
    pub fn configure_callbacks(
        &self,
        apply: Arc<dyn Applier>,
        start_ws: Option<Box<dyn Fn(i64) + Send + Sync>>,
        log: Option<Box<dyn Fn(&str) + Send + Sync>>,
    ) {
        *self.callback_applier.inner.lock() = Some(apply);
        let mut hooks = self.hooks.lock();
        hooks.start_ws = start_ws;
        hooks.log = log;
    }
}
