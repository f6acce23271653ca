//! Local trx store and connection-context store (§4.2): allocates a
//! per-connection trx descriptor on first reference, accumulates queries,
//! row keys, and optional row payloads in an append-only arena with a spill
//! threshold, assembles a write-set for replication, and maps local ids to
//! global seqnos.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::trace;

use galera_base::{err_kind, Error, ErrorKind, Result};
use galera_wire::{
    Action, ColRecord, QueryRecord, RowPayload, TrxWs, WriteSet, WsFlags, WsItem, WsKeyRecord,
    WsLevel,
};

/// `seqno_global` sentinel for an aborted trx. Distinct from
/// `galera_wire::SEQNO_UNDEFINED` (`-1`), which means "not yet assigned".
pub const SEQNO_ABORTED: i64 = -2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrxState {
    Building,
    Replicating,
    Replicated,
    Aborted,
}

struct TrxRecord {
    state: TrxState,
    level: WsLevel,
    flags: WsFlags,
    conn_queries: Vec<QueryRecord>,
    trx_queries: Vec<QueryRecord>,
    items: Vec<WsItem>,
    rbr_buf: Vec<u8>,
    bytes_used: usize,
    last_seen_trx: Option<i64>,
    last_seen_ref_held: bool,
    local_seqno: Option<i64>,
    global_seqno: Option<i64>,
}

impl TrxRecord {
    fn new() -> Self {
        TrxRecord {
            state: TrxState::Building,
            level: WsLevel::Query,
            flags: WsFlags::empty(),
            conn_queries: Vec::new(),
            trx_queries: Vec::new(),
            items: Vec::new(),
            rbr_buf: Vec::new(),
            bytes_used: 0,
            last_seen_trx: None,
            last_seen_ref_held: false,
            local_seqno: None,
            global_seqno: None,
        }
    }

    fn charge(&mut self, additional: usize, local_cache_size: usize) -> Result<()> {
        if self.bytes_used + additional > local_cache_size {
            return Err(err_kind(
                ErrorKind::Capacity,
                format!(
                    "trx arena spill: {} + {additional} > local_cache_size {local_cache_size}",
                    self.bytes_used
                ),
            ));
        }
        self.bytes_used += additional;
        Ok(())
    }
}

struct Inner {
    trxs: HashMap<u64, TrxRecord>,
    conn_vars: HashMap<u64, Vec<QueryRecord>>,
    /// Refcount of `last_seen_trx` values currently protecting an in-flight
    /// WS from purge (§4.2 "increments the reference count of
    /// `last_seen_trx`"). The coordinator must never purge the
    /// certification index past [`LocalTrxStore::min_referenced_last_seen`].
    last_seen_refs: BTreeMap<i64, u64>,
}

pub struct LocalTrxStore {
    inner: Mutex<Inner>,
    local_cache_size: usize,
}

impl LocalTrxStore {
    pub fn new(local_cache_size: usize) -> Self {
        LocalTrxStore {
            inner: Mutex::new(Inner {
                trxs: HashMap::new(),
                conn_vars: HashMap::new(),
                last_seen_refs: BTreeMap::new(),
            }),
            local_cache_size,
        }
    }

    /// Creates the trx on demand; atomic in the local store; unaffected by
    /// concurrent certification.
    pub fn append_query(&self, trx: u64, sql: Vec<u8>, ts: i64, randseed: u32) -> Result<()> {
        let mut g = self.inner.lock();
        let rec = g.trxs.entry(trx).or_insert_with(TrxRecord::new);
        require_building(rec, trx)?;
        rec.charge(sql.len(), self.local_cache_size)?;
        rec.trx_queries.push(QueryRecord { sql, timestamp: ts, randseed });
        Ok(())
    }

    /// `action` is insert, update, or delete; the `Action` type itself
    /// admits no other value, so the source's "bad action" failure mode
    /// cannot arise here.
    pub fn append_row_key(&self, trx: u64, key_rec: WsKeyRecord, action: Action) -> Result<()> {
        let mut g = self.inner.lock();
        let rec = g.trxs.entry(trx).or_insert_with(TrxRecord::new);
        require_building(rec, trx)?;
        if rec.level == WsLevel::RbrBlob {
            return Err(err_kind(ErrorKind::Fatal, "cannot mix row-key items into an RBR-blob trx"));
        }
        let approx_len = key_rec.dbtable.len() + 8;
        rec.charge(approx_len, self.local_cache_size)?;
        if rec.level == WsLevel::Query {
            rec.level = WsLevel::Row;
        }
        rec.items.push(WsItem { action, key_rec, row: None });
        Ok(())
    }

    /// Attaches a full-row payload to the most recently appended item.
    pub fn append_row(&self, trx: u64, bytes: Vec<u8>) -> Result<()> {
        let mut g = self.inner.lock();
        let rec = g.trxs.get_mut(&trx).ok_or_else(|| missing_trx(trx))?;
        require_building(rec, trx)?;
        rec.charge(bytes.len(), self.local_cache_size)?;
        let item = rec.items.last_mut().ok_or_else(|| {
            err_kind(ErrorKind::Fatal, format!("append_row({trx}) with no preceding append_row_key"))
        })?;
        item.row = Some(RowPayload::Row(bytes));
        Ok(())
    }

    /// Attaches a column-level payload to the most recently appended item,
    /// refining the trx's level to [`WsLevel::Column`].
    pub fn append_row_cols(&self, trx: u64, cols: Vec<ColRecord>) -> Result<()> {
        let mut g = self.inner.lock();
        let rec = g.trxs.get_mut(&trx).ok_or_else(|| missing_trx(trx))?;
        require_building(rec, trx)?;
        if rec.level == WsLevel::RbrBlob {
            return Err(err_kind(ErrorKind::Fatal, "cannot mix column payload into an RBR-blob trx"));
        }
        let charge: usize = cols.iter().map(|c| c.data.len() + 3).sum();
        rec.charge(charge, self.local_cache_size)?;
        let item = rec.items.last_mut().ok_or_else(|| {
            err_kind(ErrorKind::Fatal, format!("append_row_cols({trx}) with no preceding append_row_key"))
        })?;
        item.row = Some(RowPayload::Cols(cols));
        rec.level = WsLevel::Column;
        Ok(())
    }

    /// Appends row-based-replication bytes, switching the trx to
    /// [`WsLevel::RbrBlob`]. Mutually exclusive with row/column items.
    pub fn append_rbr(&self, trx: u64, bytes: &[u8]) -> Result<()> {
        let mut g = self.inner.lock();
        let rec = g.trxs.entry(trx).or_insert_with(TrxRecord::new);
        require_building(rec, trx)?;
        if !rec.items.is_empty() {
            return Err(err_kind(ErrorKind::Fatal, "cannot mix RBR bytes into a trx with row-key items"));
        }
        rec.charge(bytes.len(), self.local_cache_size)?;
        rec.rbr_buf.extend_from_slice(bytes);
        rec.level = WsLevel::RbrBlob;
        Ok(())
    }

    /// Records SQL that must precede slave apply of this connection's next
    /// WS (`USE db`, `SET VARIABLE=...`). Queued per-connection, not
    /// per-trx, and drained into the next [`build_write_set`](Self::build_write_set).
    pub fn set_connection_variable(&self, conn: u64, sql_setter: Vec<u8>, ts: i64, randseed: u32) {
        self.inner
            .lock()
            .conn_vars
            .entry(conn)
            .or_default()
            .push(QueryRecord { sql: sql_setter, timestamp: ts, randseed });
    }

    /// Captures the current built state, stamps `last_seen_trx =
    /// last_committed`, and returns the assembled WS. Holds a reference on
    /// `last_seen_trx` so the certification index cannot purge past it while
    /// the WS is in flight; callers must eventually call
    /// [`assign_seqnos`](Self::assign_seqnos) or
    /// [`mark_aborted`](Self::mark_aborted) to release it.
    pub fn build_write_set(&self, trx: u64, conn: u64, last_committed: i64) -> Result<WriteSet> {
        let mut g = self.inner.lock();
        let conn_queries = g.conn_vars.remove(&conn).unwrap_or_default();
        let rec = g.trxs.get_mut(&trx).ok_or_else(|| missing_trx(trx))?;
        require_building(rec, trx)?;

        rec.conn_queries = conn_queries;
        rec.last_seen_trx = Some(last_committed);
        *g.last_seen_refs.entry(last_committed).or_insert(0) += 1;
        rec.last_seen_ref_held = true;
        rec.state = TrxState::Replicating;

        let ws = TrxWs {
            local_trx_id: trx,
            last_seen_trx: last_committed,
            level: rec.level,
            flags: rec.flags,
            conn_queries: rec.conn_queries.clone(),
            trx_queries: rec.trx_queries.clone(),
            items: rec.items.clone(),
            rbr_buf: rec.rbr_buf.clone(),
        };
        ws.validate()?;
        trace!(trx, last_committed, "built write-set");
        Ok(WriteSet::Trx(ws))
    }

    /// Idempotent: repeating the same `(local, global)` pair for a trx
    /// already assigned is a no-op; assigning a different pair is a
    /// programming-error.
    pub fn assign_seqnos(&self, trx: u64, local: i64, global: i64) -> Result<()> {
        let mut g = self.inner.lock();
        let last_seen = {
            let rec = g.trxs.get(&trx).ok_or_else(|| missing_trx(trx))?;
            if rec.local_seqno == Some(local) && rec.global_seqno == Some(global) {
                return Ok(());
            }
            if rec.local_seqno.is_some() || rec.global_seqno.is_some() {
                return Err(err_kind(
                    ErrorKind::Fatal,
                    format!("assign_seqnos({trx}) called twice with different seqnos"),
                ));
            }
            rec.last_seen_trx
        };
        if let Some(seen) = last_seen {
            release_last_seen_ref(&mut g, trx, seen);
        }
        let rec = g.trxs.get_mut(&trx).expect("checked above");
        rec.local_seqno = Some(local);
        rec.global_seqno = Some(global);
        rec.state = TrxState::Replicated;
        Ok(())
    }

    /// Sets `seqno_global` to the aborted sentinel and releases the
    /// `last_seen_trx` reference.
    pub fn mark_aborted(&self, trx: u64) -> Result<()> {
        let mut g = self.inner.lock();
        let last_seen = g.trxs.get(&trx).ok_or_else(|| missing_trx(trx))?.last_seen_trx;
        if let Some(seen) = last_seen {
            release_last_seen_ref(&mut g, trx, seen);
        }
        let rec = g.trxs.get_mut(&trx).expect("checked above");
        rec.global_seqno = Some(SEQNO_ABORTED);
        rec.state = TrxState::Aborted;
        Ok(())
    }

    /// Frees the block chain. Releases any outstanding `last_seen_trx`
    /// reference as a safety net.
    pub fn delete_trx(&self, trx: u64) -> Result<()> {
        let mut g = self.inner.lock();
        let last_seen = g.trxs.get(&trx).ok_or_else(|| missing_trx(trx))?.last_seen_trx;
        if let Some(seen) = last_seen {
            release_last_seen_ref(&mut g, trx, seen);
        }
        g.trxs.remove(&trx);
        Ok(())
    }

    pub fn state(&self, trx: u64) -> Option<TrxState> {
        self.inner.lock().trxs.get(&trx).map(|r| r.state)
    }

    /// True if the trx carries no queries and no items yet (nothing to
    /// replicate). Checked by the coordinator before calling
    /// [`build_write_set`](Self::build_write_set), since an empty trx is a
    /// local no-op rather than a replication failure.
    pub fn is_empty(&self, trx: u64) -> Result<bool> {
        let g = self.inner.lock();
        let rec = g.trxs.get(&trx).ok_or_else(|| missing_trx(trx))?;
        Ok(rec.trx_queries.is_empty() && rec.items.is_empty() && rec.rbr_buf.is_empty())
    }

    /// The lowest `last_seen_trx` value still protecting an in-flight WS, or
    /// `None` if nothing is in flight. The coordinator must not purge the
    /// certification index past this value.
    pub fn min_referenced_last_seen(&self) -> Option<i64> {
        self.inner.lock().last_seen_refs.keys().next().copied()
    }
}

fn require_building(rec: &TrxRecord, trx: u64) -> Result<()> {
    if rec.state != TrxState::Building {
        return Err(err_kind(
            ErrorKind::Fatal,
            format!("trx {trx} is no longer building (state = {:?})", rec.state),
        ));
    }
    Ok(())
}

fn missing_trx(trx: u64) -> Error {
    err_kind(ErrorKind::Fatal, format!("no such local trx: {trx}"))
}

fn release_last_seen_ref(g: &mut Inner, trx: u64, last_seen: i64) {
    let held = g.trxs.get(&trx).map(|r| r.last_seen_ref_held).unwrap_or(false);
    if !held {
        return;
    }
    if let Some(count) = g.last_seen_refs.get_mut(&last_seen) {
        *count -= 1;
        if *count == 0 {
            g.last_seen_refs.remove(&last_seen);
        }
    }
    if let Some(rec) = g.trxs.get_mut(&trx) {
        rec.last_seen_ref_held = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use galera_wire::{KeyPart, KeyPartType, TableKey};
    use test_log::test;

    fn key(dbtable: &str, k: &[u8]) -> WsKeyRecord {
        WsKeyRecord::new(
            dbtable.to_string(),
            TableKey::new(vec![KeyPart::new(KeyPartType::Blob, k.to_vec()).unwrap()]).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn append_query_creates_trx_on_demand() {
        let store = LocalTrxStore::new(4096);
        store.append_query(1, b"INSERT INTO t VALUES (1)".to_vec(), 0, 0).unwrap();
        assert_eq!(store.state(1), Some(TrxState::Building));
    }

    #[test]
    fn build_write_set_stamps_last_seen_and_holds_ref() {
        let store = LocalTrxStore::new(4096);
        store.append_row_key(1, key("db.t", b"k1"), Action::Insert).unwrap();
        let ws = store.build_write_set(1, 1, 42).unwrap();
        match &ws {
            WriteSet::Trx(t) => assert_eq!(t.last_seen_trx, 42),
            _ => panic!("expected Trx"),
        }
        assert_eq!(store.min_referenced_last_seen(), Some(42));
        assert_eq!(store.state(1), Some(TrxState::Replicating));
    }

    #[test]
    fn assign_seqnos_releases_last_seen_ref() {
        let store = LocalTrxStore::new(4096);
        store.append_row_key(1, key("db.t", b"k1"), Action::Insert).unwrap();
        store.build_write_set(1, 1, 42).unwrap();
        store.assign_seqnos(1, 100, 200).unwrap();
        assert_eq!(store.min_referenced_last_seen(), None);
        assert_eq!(store.state(1), Some(TrxState::Replicated));
    }

    #[test]
    fn assign_seqnos_is_idempotent() {
        let store = LocalTrxStore::new(4096);
        store.append_row_key(1, key("db.t", b"k1"), Action::Insert).unwrap();
        store.build_write_set(1, 1, 0).unwrap();
        store.assign_seqnos(1, 5, 6).unwrap();
        store.assign_seqnos(1, 5, 6).unwrap();
        assert!(store.assign_seqnos(1, 5, 7).is_err());
    }

    #[test]
    fn mark_aborted_sets_sentinel_and_releases_ref() {
        let store = LocalTrxStore::new(4096);
        store.append_row_key(1, key("db.t", b"k1"), Action::Insert).unwrap();
        store.build_write_set(1, 1, 7).unwrap();
        store.mark_aborted(1).unwrap();
        assert_eq!(store.state(1), Some(TrxState::Aborted));
        assert_eq!(store.min_referenced_last_seen(), None);
    }

    #[test]
    fn min_referenced_last_seen_tracks_multiple_trxs() {
        let store = LocalTrxStore::new(4096);
        store.append_row_key(1, key("db.t", b"k1"), Action::Insert).unwrap();
        store.append_row_key(2, key("db.t", b"k2"), Action::Insert).unwrap();
        store.build_write_set(1, 1, 10).unwrap();
        store.build_write_set(2, 2, 20).unwrap();
        assert_eq!(store.min_referenced_last_seen(), Some(10));
        store.assign_seqnos(1, 1, 11).unwrap();
        assert_eq!(store.min_referenced_last_seen(), Some(20));
    }

    #[test]
    fn arena_spill_returns_capacity_error() {
        let store = LocalTrxStore::new(8);
        store.append_query(1, b"0123456789".to_vec(), 0, 0).unwrap_err();
    }

    #[test]
    fn append_row_without_key_fails() {
        let store = LocalTrxStore::new(4096);
        store.append_query(1, b"select 1".to_vec(), 0, 0).unwrap();
        assert!(store.append_row(1, b"payload".to_vec()).is_err());
    }

    #[test]
    fn mixing_rbr_and_row_items_rejected() {
        let store = LocalTrxStore::new(4096);
        store.append_row_key(1, key("db.t", b"k1"), Action::Insert).unwrap();
        assert!(store.append_rbr(1, b"binlog-bytes").is_err());

        store.append_rbr(2, b"binlog-bytes").unwrap();
        assert!(store.append_row_key(2, key("db.t", b"k1"), Action::Insert).is_err());
    }

    #[test]
    fn delete_trx_releases_ref_and_forgets_state() {
        let store = LocalTrxStore::new(4096);
        store.append_row_key(1, key("db.t", b"k1"), Action::Insert).unwrap();
        store.build_write_set(1, 1, 5).unwrap();
        store.delete_trx(1).unwrap();
        assert_eq!(store.state(1), None);
        assert_eq!(store.min_referenced_last_seen(), None);
    }

    #[test]
    fn connection_variable_is_drained_once() {
        let store = LocalTrxStore::new(4096);
        store.set_connection_variable(1, b"USE db1".to_vec(), 0, 0);
        store.append_row_key(10, key("db.t", b"k1"), Action::Insert).unwrap();
        let ws = store.build_write_set(10, 1, 0).unwrap();
        match &ws {
            WriteSet::Trx(t) => assert_eq!(t.conn_queries.len(), 1),
            _ => panic!("expected Trx"),
        }

        store.append_row_key(11, key("db.t", b"k2"), Action::Insert).unwrap();
        let ws2 = store.build_write_set(11, 1, 0).unwrap();
        match &ws2 {
            WriteSet::Trx(t) => assert!(t.conn_queries.is_empty()),
            _ => panic!("expected Trx"),
        }
    }
}
