//! Parallel applier job queue (§4.5): applies remote write-sets
//! concurrently when they do not conflict, preserving apply order only
//! within conflict sets.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use galera_base::{err_kind, ErrorKind, Result};
use galera_cert::CertIndex;
use galera_wire::WriteSet;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct WorkerId(pub usize);

/// The context a running job carries: its global seqno and the write-set it
/// is applying, which is all [`CertIndex::conflicts_with_running`] needs.
#[derive(Clone)]
pub struct JobCtx {
    pub seqno: i64,
    pub ws: WriteSet,
}

#[derive(Clone)]
enum WorkerState {
    Void,
    Running(JobCtx),
    Completed,
}

/// Bounded pool of worker slots plus one condvar per slot: a blocked worker
/// waits specifically on the condvar of the running worker it conflicts
/// with, so `end_job` only has to wake the workers actually parked on it.
pub struct JobQueue {
    cert: Arc<CertIndex>,
    max_workers: usize,
    slots: Mutex<Vec<WorkerState>>,
    condvars: Vec<Condvar>,
    next_worker: Mutex<usize>,
}

impl JobQueue {
    pub fn new(cert: Arc<CertIndex>, max_workers: usize) -> Self {
        JobQueue {
            cert,
            max_workers,
            slots: Mutex::new((0..max_workers).map(|_| WorkerState::Void).collect()),
            condvars: (0..max_workers).map(|_| Condvar::new()).collect(),
            next_worker: Mutex::new(0),
        }
    }

    /// Assigns a fresh worker id, bounded by `max_workers`.
    pub fn spawn_worker(&self) -> Result<WorkerId> {
        let mut next = self.next_worker.lock();
        if *next >= self.max_workers {
            return Err(err_kind(
                ErrorKind::Capacity,
                format!("job queue has no free workers (max_workers = {})", self.max_workers),
            ));
        }
        let id = *next;
        *next += 1;
        Ok(WorkerId(id))
    }

    /// Blocks until no currently-running worker conflicts with `ctx`, then
    /// transitions `worker` to running and returns.
    pub fn start_job(&self, worker: WorkerId, ctx: JobCtx) {
        let mut g = self.slots.lock();
        loop {
            let mut conflict_idx = None;
            for (i, slot) in g.iter().enumerate() {
                if i == worker.0 {
                    continue;
                }
                if let WorkerState::Running(running_ctx) = slot {
                    if self.cert.conflicts_with_running(&ctx.ws, ctx.seqno, running_ctx.seqno) {
                        conflict_idx = Some(i);
                        break;
                    }
                }
            }
            match conflict_idx {
                Some(i) => {
                    trace!(worker = worker.0, blocked_on = i, "start_job waiting on conflicting worker");
                    self.condvars[i].wait(&mut g);
                }
                None => {
                    g[worker.0] = WorkerState::Running(ctx);
                    return;
                }
            }
        }
    }

    /// Wakes every worker waiting on this one, transitions it to completed,
    /// and clears its context.
    pub fn end_job(&self, worker: WorkerId) {
        {
            let mut g = self.slots.lock();
            g[worker.0] = WorkerState::Completed;
        }
        self.condvars[worker.0].notify_all();
    }

    pub fn is_running(&self, worker: WorkerId) -> bool {
        matches!(self.slots.lock()[worker.0], WorkerState::Running(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use galera_wire::{Action, KeyPart, KeyPartType, TableKey, TrxWs, WsFlags, WsItem, WsKeyRecord, WsLevel};
    use std::thread;
    use std::time::Duration;
    use test_log::test;

    fn ws_with_key(dbtable: &str, k: &[u8]) -> WriteSet {
        WriteSet::Trx(TrxWs {
            local_trx_id: 1,
            last_seen_trx: 0,
            level: WsLevel::Row,
            flags: WsFlags::empty(),
            conn_queries: vec![],
            trx_queries: vec![],
            items: vec![WsItem {
                action: Action::Insert,
                key_rec: WsKeyRecord::new(
                    dbtable.to_string(),
                    TableKey::new(vec![KeyPart::new(KeyPartType::Blob, k.to_vec()).unwrap()]).unwrap(),
                )
                .unwrap(),
                row: None,
            }],
            rbr_buf: vec![],
        })
    }

    #[test]
    fn disjoint_jobs_run_concurrently() {
        let cert = Arc::new(CertIndex::new());
        let q = Arc::new(JobQueue::new(Arc::clone(&cert), 4));
        let w1 = q.spawn_worker().unwrap();
        let w2 = q.spawn_worker().unwrap();

        q.start_job(w1, JobCtx { seqno: 10, ws: ws_with_key("db1.t", b"k1") });
        // w2's write-set touches a disjoint key, so it must not block even
        // though w1 is still running.
        q.start_job(w2, JobCtx { seqno: 11, ws: ws_with_key("db1.t", b"k2") });
        assert!(q.is_running(w1));
        assert!(q.is_running(w2));
        q.end_job(w1);
        q.end_job(w2);
    }

    #[test]
    fn conflicting_job_blocks_until_predecessor_ends() {
        let cert = Arc::new(CertIndex::new());
        cert.append(&ws_with_key("db1.t", b"k1"), 10);
        let q = Arc::new(JobQueue::new(Arc::clone(&cert), 4));

        let w1 = q.spawn_worker().unwrap();
        let w2 = q.spawn_worker().unwrap();
        q.start_job(w1, JobCtx { seqno: 10, ws: ws_with_key("db1.t", b"k1") });

        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || {
            q2.start_job(w2, JobCtx { seqno: 20, ws: ws_with_key("db1.t", b"k1") });
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!q.is_running(w2));
        q.end_job(w1);
        handle.join().unwrap();
        assert!(q.is_running(w2));
        q.end_job(w2);
    }

    #[test]
    fn spawn_worker_bounded_by_max_workers() {
        let cert = Arc::new(CertIndex::new());
        let q = JobQueue::new(cert, 1);
        assert!(q.spawn_worker().is_ok());
        assert!(q.spawn_worker().is_err());
    }
}
