//! Write-set data model, wire codec, GTID, configuration-change action, and
//! the interoperability hash functions (§3, §4.1, §6.1-§6.4).

mod cc;
mod cursor;
mod gtid;
pub mod hash;
mod ws;

pub use cc::{ConfChange, MemberRecord, NodeState, CONF_ID_NON_PRIMARY};
pub use gtid::{Gtid, SEQNO_UNDEFINED};
pub use ws::{
    compute_key_composition, decode, encode, fingerprint_digest, parse_key_composition,
    row_fingerprint, table_fingerprint, table_fingerprint_from_row_fingerprint, Action, ColRecord,
    ConnWs, KeyPart, KeyPartType, QueryRecord, RowPayload, TableKey, TrxWs, WriteSet, WsFlags,
    WsItem, WsKeyRecord, WsLevel, FORMAT_VERSION,
};
