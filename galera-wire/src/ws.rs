// The write-set (WS) data model and its wire codec (§3, §4.1, §6.1).
//
// `encode`/`decode` are inverses (P6: decode(encode(ws)) == ws, byte-equal).
// Decode failures are always reported as ErrorKind::MalformedWs: the caller
// (the coordinator's remote-apply path) advances the delivery queues via
// self-cancel rather than propagating the failure upward, so a malformed WS
// never stalls the total order.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use galera_base::{err_kind, ErrorKind, Result};

use crate::cursor::{Decoder, Encoder};
use crate::hash::mmh3_digest;

/// WS wire format version this codec reads and writes. An unknown version in
/// an incoming buffer is `malformed-ws`, same as any other decode failure.
pub const FORMAT_VERSION: u8 = 1;

const MAX_KEY_PART_LEN: usize = 1024;
const MAX_DBTABLE_LEN: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyPartType {
    Character = 0,
    Integer = 1,
    Float = 2,
    Blob = 3,
    Void = 4,
}

impl KeyPartType {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => KeyPartType::Character,
            1 => KeyPartType::Integer,
            2 => KeyPartType::Float,
            3 => KeyPartType::Blob,
            4 => KeyPartType::Void,
            _ => return Err(err_kind(ErrorKind::MalformedWs, "unknown key part type")),
        })
    }
}

/// One column value used in a composite key. `data.len() == length`,
/// `length <= 1024`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct KeyPart {
    pub ty: KeyPartType,
    pub data: Vec<u8>,
}

impl KeyPart {
    pub fn new(ty: KeyPartType, data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_KEY_PART_LEN {
            return Err(err_kind(ErrorKind::MalformedWs, "key part longer than 1024 bytes"));
        }
        Ok(KeyPart { ty, data })
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.u8(self.ty as u8);
        enc.bytes_with_u16_len(&self.data);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        let ty = KeyPartType::from_u8(dec.u8()?)?;
        let data = dec.bytes_with_u16_len()?;
        if data.len() > MAX_KEY_PART_LEN {
            return Err(err_kind(ErrorKind::MalformedWs, "key part longer than 1024 bytes"));
        }
        Ok(KeyPart { ty, data })
    }
}

/// An ordered, non-empty list of key parts forming one composite key.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TableKey(pub Vec<KeyPart>);

impl TableKey {
    pub fn new(parts: Vec<KeyPart>) -> Result<Self> {
        if parts.is_empty() {
            return Err(err_kind(ErrorKind::MalformedWs, "table key must have at least one part"));
        }
        Ok(TableKey(parts))
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.u16(self.0.len() as u16);
        for part in &self.0 {
            part.encode(enc);
        }
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        let count = dec.u16()? as usize;
        if count == 0 {
            return Err(err_kind(ErrorKind::MalformedWs, "table key must have at least one part"));
        }
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            parts.push(KeyPart::decode(dec)?);
        }
        Ok(TableKey(parts))
    }
}

/// `dbtable` (database.table identifier, <= 256 bytes) plus the composite
/// key. Equality for certification is the full byte image of this record.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct WsKeyRecord {
    pub dbtable: String,
    pub key: TableKey,
}

impl WsKeyRecord {
    pub fn new(dbtable: String, key: TableKey) -> Result<Self> {
        if dbtable.len() > MAX_DBTABLE_LEN {
            return Err(err_kind(ErrorKind::MalformedWs, "dbtable identifier longer than 256 bytes"));
        }
        Ok(WsKeyRecord { dbtable, key })
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.bytes_with_u16_len(self.dbtable.as_bytes());
        self.key.encode(enc);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        let dbtable_bytes = dec.bytes_with_u16_len()?;
        if dbtable_bytes.len() > MAX_DBTABLE_LEN {
            return Err(err_kind(ErrorKind::MalformedWs, "dbtable identifier longer than 256 bytes"));
        }
        let dbtable = String::from_utf8(dbtable_bytes)
            .map_err(|_| err_kind(ErrorKind::MalformedWs, "dbtable is not valid utf-8"))?;
        let key = TableKey::decode(dec)?;
        Ok(WsKeyRecord { dbtable, key })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Action {
    Insert = 0,
    Update = 1,
    Delete = 2,
}

impl Action {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Action::Insert,
            1 => Action::Update,
            2 => Action::Delete,
            _ => return Err(err_kind(ErrorKind::MalformedWs, "unknown item action code")),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ColRecord {
    pub col: u16,
    pub dtype: u8,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum RowPayload {
    Cols(Vec<ColRecord>),
    Row(Vec<u8>),
}

/// `action` + key record + optional row payload. Exactly one of the two
/// payload shapes is populated per item (or neither, key-only).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct WsItem {
    pub action: Action,
    pub key_rec: WsKeyRecord,
    pub row: Option<RowPayload>,
}

impl WsItem {
    fn encode(&self, enc: &mut Encoder) {
        enc.u8(self.action as u8);
        self.key_rec.encode(enc);
        match &self.row {
            None => enc.u8(0),
            Some(RowPayload::Cols(cols)) => {
                enc.u8(1);
                enc.u16(cols.len() as u16);
                for c in cols {
                    enc.u16(c.col);
                    enc.u8(c.dtype);
                    enc.bytes_with_u16_len(&c.data);
                }
            }
            Some(RowPayload::Row(bytes)) => {
                enc.u8(2);
                enc.bytes_with_u32_len(bytes);
            }
        }
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        let action = Action::from_u8(dec.u8()?)?;
        let key_rec = WsKeyRecord::decode(dec)?;
        let has_row = dec.u8()?;
        let row = match has_row {
            0 => None,
            1 => {
                let count = dec.u16()? as usize;
                let mut cols = Vec::with_capacity(count);
                for _ in 0..count {
                    let col = dec.u16()?;
                    let dtype = dec.u8()?;
                    let data = dec.bytes_with_u16_len()?;
                    cols.push(ColRecord { col, dtype, data });
                }
                Some(RowPayload::Cols(cols))
            }
            2 => Some(RowPayload::Row(dec.bytes_with_u32_len()?)),
            _ => return Err(err_kind(ErrorKind::MalformedWs, "unknown row payload tag")),
        };
        Ok(WsItem { action, key_rec, row })
    }
}

/// An SQL statement: bytes + timestamp + RNG seed to reproduce
/// non-deterministic functions during apply.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct QueryRecord {
    pub sql: Vec<u8>,
    pub timestamp: i64,
    pub randseed: u32,
}

impl QueryRecord {
    fn encode(&self, enc: &mut Encoder) {
        enc.bytes_with_u32_len(&self.sql);
        enc.i64(self.timestamp);
        enc.u32(self.randseed);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        let sql = dec.bytes_with_u32_len()?;
        let timestamp = dec.i64()?;
        let randseed = dec.u32()?;
        Ok(QueryRecord { sql, timestamp, randseed })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum WsLevel {
    Query = 0,
    Row = 1,
    Column = 2,
    RbrBlob = 3,
}

impl WsLevel {
    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => WsLevel::Query,
            1 => WsLevel::Row,
            2 => WsLevel::Column,
            3 => WsLevel::RbrBlob,
            _ => return Err(err_kind(ErrorKind::MalformedWs, "unknown WS level")),
        })
    }
}

bitflags! {
    /// Flags carried in the WS header alongside `level` (§3 ADD). Neither
    /// flag changes certification semantics directly; `PaUnsafe` is
    /// consulted by the job queue's conflict predicate (§4.5) before it
    /// ever calls the certification replay.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
    pub struct WsFlags: u32 {
        /// Contains a statement that cannot be safely applied concurrently
        /// with any other WS, regardless of key overlap.
        const PA_UNSAFE = 0b0000_0001;
        /// Marks a WS that must act as a barrier for commit-cut processing
        /// (e.g. carries schema DDL visible to later certification tests).
        const COMMIT_CUT_GUARD = 0b0000_0010;
    }
}

/// `local_trx_id`, `last_seen_trx` (certification lower bound), `level`,
/// connection-context queries, trx queries, items, optional RBR blob.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TrxWs {
    pub local_trx_id: u64,
    pub last_seen_trx: i64,
    pub level: WsLevel,
    pub flags: WsFlags,
    pub conn_queries: Vec<QueryRecord>,
    pub trx_queries: Vec<QueryRecord>,
    pub items: Vec<WsItem>,
    pub rbr_buf: Vec<u8>,
}

impl TrxWs {
    /// Validates the invariants from §3: if `level == RbrBlob` then
    /// `rbr_buf` is non-empty; otherwise at least one of queries/items is
    /// non-empty; `last_seen_trx >= 0`.
    pub fn validate(&self) -> Result<()> {
        if self.last_seen_trx < 0 {
            return Err(err_kind(ErrorKind::MalformedWs, "last_seen_trx must be >= 0"));
        }
        if self.level == WsLevel::RbrBlob {
            if self.rbr_buf.is_empty() {
                return Err(err_kind(ErrorKind::MalformedWs, "RBR-blob WS must carry a non-empty blob"));
            }
        } else if self.trx_queries.is_empty() && self.items.is_empty() {
            return Err(err_kind(
                ErrorKind::MalformedWs,
                "non-RBR WS must carry at least one query or item",
            ));
        }
        Ok(())
    }
}

/// Carries exactly one DDL-like statement applied under total order on
/// every node.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ConnWs {
    pub stmt: QueryRecord,
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum WriteSet {
    Trx(TrxWs),
    Conn(ConnWs),
}

impl WriteSet {
    pub fn validate(&self) -> Result<()> {
        match self {
            WriteSet::Trx(t) => t.validate(),
            WriteSet::Conn(_) => Ok(()),
        }
    }

    /// All WS items, empty for a connection WS.
    pub fn items(&self) -> &[WsItem] {
        match self {
            WriteSet::Trx(t) => &t.items,
            WriteSet::Conn(_) => &[],
        }
    }

    pub fn flags(&self) -> WsFlags {
        match self {
            WriteSet::Trx(t) => t.flags,
            WriteSet::Conn(_) => WsFlags::empty(),
        }
    }
}

const WS_TYPE_TRX: u8 = 1;
const WS_TYPE_CONN: u8 = 2;

/// Serialise a WS to bytes: length-prefixed, little-endian, tag-terminated
/// (§4.1, §6.1). Deterministic: the same WS always produces the same bytes.
pub fn encode(ws: &WriteSet) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.u8(FORMAT_VERSION);
    match ws {
        WriteSet::Trx(t) => {
            enc.u8(WS_TYPE_TRX);
            enc.u64(t.local_trx_id);
            enc.u64(t.last_seen_trx as u64);
            enc.u32(t.level as u32);
            enc.u32(t.flags.bits());
            enc.u16(t.trx_queries.len() as u16);
            for q in &t.trx_queries {
                q.encode(&mut enc);
            }
            enc.u16(t.conn_queries.len() as u16);
            for q in &t.conn_queries {
                q.encode(&mut enc);
            }
            enc.u32(t.items.len() as u32);
            for item in &t.items {
                item.encode(&mut enc);
            }
            enc.bytes_with_u32_len(&t.rbr_buf);
        }
        WriteSet::Conn(c) => {
            enc.u8(WS_TYPE_CONN);
            enc.u64(0);
            enc.u64(0);
            enc.u32(WsLevel::Query as u32);
            enc.u32(0);
            enc.u16(1);
            c.stmt.encode(&mut enc);
            enc.u16(0);
            enc.u32(0);
            enc.bytes_with_u32_len(&[]);
        }
    }
    enc.into_bytes()
}

/// Inverse of `encode`. Fails with `malformed-ws` on length overflow,
/// unknown action/level codes, oversized key parts, or a trailing-byte
/// mismatch.
pub fn decode(buf: &[u8]) -> Result<WriteSet> {
    let mut dec = Decoder::new(buf);
    let version = dec.u8()?;
    if version != FORMAT_VERSION {
        return Err(err_kind(ErrorKind::MalformedWs, "unsupported WS format version"));
    }
    let ty = dec.u8()?;
    let local_trx_id = dec.u64()?;
    let last_seen_trx = dec.u64()? as i64;
    let level = WsLevel::from_u32(dec.u32()?)?;
    let flags = WsFlags::from_bits(dec.u32()?)
        .ok_or_else(|| err_kind(ErrorKind::MalformedWs, "unknown WS flag bits"))?;

    let trx_query_count = dec.u16()? as usize;
    let mut trx_queries = Vec::with_capacity(trx_query_count);
    for _ in 0..trx_query_count {
        trx_queries.push(QueryRecord::decode(&mut dec)?);
    }

    let conn_query_count = dec.u16()? as usize;
    let mut conn_queries = Vec::with_capacity(conn_query_count);
    for _ in 0..conn_query_count {
        conn_queries.push(QueryRecord::decode(&mut dec)?);
    }

    let item_count = dec.u32()? as usize;
    let mut items = Vec::with_capacity(item_count);
    for _ in 0..item_count {
        items.push(WsItem::decode(&mut dec)?);
    }

    let rbr_buf = dec.bytes_with_u32_len()?;

    if !dec.finished() {
        return Err(err_kind(ErrorKind::MalformedWs, "trailing bytes after WS body"));
    }

    let ws = match ty {
        WS_TYPE_TRX => WriteSet::Trx(TrxWs {
            local_trx_id,
            last_seen_trx,
            level,
            flags,
            conn_queries,
            trx_queries,
            items,
            rbr_buf,
        }),
        WS_TYPE_CONN => {
            let stmt = trx_queries
                .into_iter()
                .next()
                .ok_or_else(|| err_kind(ErrorKind::MalformedWs, "connection WS missing its statement"))?;
            WriteSet::Conn(ConnWs { stmt })
        }
        _ => return Err(err_kind(ErrorKind::MalformedWs, "unknown WS type tag")),
    };
    ws.validate()?;
    Ok(ws)
}

fn encode_key_rec_no_outer_len(enc: &mut Encoder, key_rec: &WsKeyRecord) {
    enc.bytes_with_u16_len(key_rec.dbtable.as_bytes());
    enc.u16(key_rec.key.0.len() as u16);
    for part in &key_rec.key.0 {
        enc.u8(part.ty as u8);
        enc.bytes_with_u16_len(&part.data);
    }
}

/// Serialises *all* keys of the WS into one blob, prefixed by total length.
/// This blob is both the certification input and the payload cached in the
/// active-seqno list entry.
pub fn compute_key_composition(ws: &WriteSet) -> Vec<u8> {
    let mut body = Encoder::new();
    for item in ws.items() {
        let mut one = Encoder::new();
        encode_key_rec_no_outer_len(&mut one, &item.key_rec);
        body.u16(one.len() as u16);
        body.raw(&one.into_bytes());
    }
    let body_bytes = body.into_bytes();
    let mut out = Encoder::new();
    out.u32(body_bytes.len() as u32);
    out.raw(&body_bytes);
    out.into_bytes()
}

/// `dbtable` concatenated with the serialised table key. Used as the
/// row-hash key.
pub fn row_fingerprint(key_rec: &WsKeyRecord) -> Vec<u8> {
    let mut enc = Encoder::new();
    encode_key_rec_no_outer_len(&mut enc, key_rec);
    enc.into_bytes()
}

/// `dbtable` only. Used as the table-hash key.
pub fn table_fingerprint(key_rec: &WsKeyRecord) -> Vec<u8> {
    key_rec.dbtable.as_bytes().to_vec()
}

/// Digest of a fingerprint for use as a compact certification index key,
/// per §6.4 ("Used as MMH3 in the WS digest").
pub fn fingerprint_digest(fingerprint: &[u8]) -> u128 {
    mmh3_digest(fingerprint)
}

/// Inverse of `compute_key_composition`: recovers the per-item row
/// fingerprint byte strings from the blob cached in an active-seqno list
/// entry, so that purge can find a key's hash-table entry without holding
/// on to the original `WriteSet`.
pub fn parse_key_composition(blob: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut dec = Decoder::new(blob);
    let total_len = dec.u32()? as usize;
    if total_len != dec.remaining() {
        return Err(err_kind(ErrorKind::MalformedWs, "key composition length prefix mismatch"));
    }
    let mut out = Vec::new();
    while !dec.finished() {
        let item_len = dec.u16()? as usize;
        out.push(dec.raw(item_len)?.to_vec());
    }
    Ok(out)
}

/// Recovers the table fingerprint (the `dbtable` prefix) from a row
/// fingerprint produced by [`row_fingerprint`] or found via
/// [`parse_key_composition`].
pub fn table_fingerprint_from_row_fingerprint(row_fp: &[u8]) -> Result<Vec<u8>> {
    let mut dec = Decoder::new(row_fp);
    let dbtable_len = dec.u16()? as usize;
    Ok(dec.raw(dbtable_len)?.to_vec())
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    fn sample_key_rec(table: &str, val: &[u8]) -> WsKeyRecord {
        let part = KeyPart::new(KeyPartType::Character, val.to_vec()).unwrap();
        let key = TableKey::new(vec![part]).unwrap();
        WsKeyRecord::new(table.to_string(), key).unwrap()
    }

    fn sample_trx_ws() -> WriteSet {
        WriteSet::Trx(TrxWs {
            local_trx_id: 7,
            last_seen_trx: 3,
            level: WsLevel::Row,
            flags: WsFlags::empty(),
            conn_queries: vec![QueryRecord {
                sql: b"USE db1".to_vec(),
                timestamp: 1,
                randseed: 0,
            }],
            trx_queries: vec![],
            items: vec![WsItem {
                action: Action::Update,
                key_rec: sample_key_rec("db1.t", b"k1"),
                row: Some(RowPayload::Row(b"rowbytes".to_vec())),
            }],
            rbr_buf: vec![],
        })
    }

    #[test]
    fn codec_round_trips_trx_ws() {
        let ws = sample_trx_ws();
        let bytes = encode(&ws);
        let back = decode(&bytes).unwrap();
        assert_eq!(ws, back);
    }

    #[test]
    fn codec_is_deterministic() {
        let ws = sample_trx_ws();
        assert_eq!(encode(&ws), encode(&ws));
    }

    #[test]
    fn codec_round_trips_conn_ws() {
        let ws = WriteSet::Conn(ConnWs {
            stmt: QueryRecord {
                sql: b"ALTER TABLE t ADD COLUMN c INT".to_vec(),
                timestamp: 5,
                randseed: 1,
            },
        });
        let bytes = encode(&ws);
        let back = decode(&bytes).unwrap();
        assert_eq!(ws, back);
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let ws = sample_trx_ws();
        let mut bytes = encode(&ws);
        bytes.truncate(bytes.len() - 3);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_unknown_action_code() {
        let ws = WriteSet::Trx(TrxWs {
            local_trx_id: 1,
            last_seen_trx: 0,
            level: WsLevel::Row,
            flags: WsFlags::empty(),
            conn_queries: vec![],
            trx_queries: vec![],
            items: vec![WsItem {
                action: Action::Insert,
                key_rec: sample_key_rec("db1.t", b"k1"),
                row: None,
            }],
            rbr_buf: vec![],
        });
        let mut bytes = encode(&ws);
        // Header: version(1) + type(1) + local_trx_id(8) + last_seen(8) +
        // level(4) + flags(4) + trx_query_count(2) + conn_query_count(2) +
        // item_count(4) = 34 bytes, then the first item's action byte.
        let item_action_offset = 1 + 1 + 8 + 8 + 4 + 4 + 2 + 2 + 4;
        assert_eq!(bytes[item_action_offset], Action::Insert as u8);
        bytes[item_action_offset] = 0xEE;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_wrong_format_version() {
        let ws = sample_trx_ws();
        let mut bytes = encode(&ws);
        bytes[0] = FORMAT_VERSION + 1;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn key_part_over_1024_bytes_rejected() {
        let big = vec![0u8; 1025];
        assert!(KeyPart::new(KeyPartType::Blob, big).is_err());
    }

    #[test]
    fn key_composition_is_total_length_prefixed_and_order_preserving() {
        let mut ws = sample_trx_ws();
        if let WriteSet::Trx(t) = &mut ws {
            t.items.push(WsItem {
                action: Action::Insert,
                key_rec: sample_key_rec("db1.u", b"k2"),
                row: None,
            });
        }
        let blob = compute_key_composition(&ws);
        let total_len = u32::from_le_bytes(blob[0..4].try_into().unwrap()) as usize;
        assert_eq!(total_len, blob.len() - 4);
    }

    #[test]
    fn row_and_table_fingerprints_distinguish_tables() {
        let a = sample_key_rec("db1.t", b"k1");
        let b = sample_key_rec("db1.other", b"k1");
        assert_ne!(row_fingerprint(&a), row_fingerprint(&b));
        assert_ne!(table_fingerprint(&a), table_fingerprint(&b));
        assert_eq!(table_fingerprint(&a), b"db1.t".to_vec());
    }

    #[test]
    fn row_fingerprint_differs_by_key_value_same_table() {
        let a = sample_key_rec("db1.t", b"k1");
        let b = sample_key_rec("db1.t", b"k2");
        assert_eq!(table_fingerprint(&a), table_fingerprint(&b));
        assert_ne!(row_fingerprint(&a), row_fingerprint(&b));
    }
}
