// Configuration change (CC) action: delivered by GCS when membership
// changes (§3, §6.2). Decoding MUST reject a checksum mismatch.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use galera_base::{err_kind, ErrorKind, Result};

use crate::cursor::{Decoder, Encoder};
use crate::gtid::Gtid;
use crate::hash::fnv1a_64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeState {
    Undefined = 0,
    Joiner = 1,
    Donor = 2,
    Joined = 3,
    Synced = 4,
    Primary = 5,
}

impl NodeState {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => NodeState::Undefined,
            1 => NodeState::Joiner,
            2 => NodeState::Donor,
            3 => NodeState::Joined,
            4 => NodeState::Synced,
            5 => NodeState::Primary,
            _ => return Err(err_kind(ErrorKind::MalformedWs, "unknown node state")),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MemberRecord {
    pub uuid: Uuid,
    pub name: String,
    pub incoming_addr: String,
    pub lowest_cached_seqno: i64,
    pub state: NodeState,
}

impl MemberRecord {
    fn encode(&self, enc: &mut Encoder) {
        enc.raw(self.uuid.as_bytes());
        enc.bytes_with_u16_len(self.name.as_bytes());
        enc.bytes_with_u16_len(self.incoming_addr.as_bytes());
        enc.i64(self.lowest_cached_seqno);
        enc.u8(self.state as u8);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        let uuid_bytes = dec.raw(16)?;
        let uuid = Uuid::from_slice(uuid_bytes).map_err(galera_base::Error::from)?;
        let name = String::from_utf8(dec.bytes_with_u16_len()?)
            .map_err(|_| err_kind(ErrorKind::MalformedWs, "member name is not valid utf-8"))?;
        let incoming_addr = String::from_utf8(dec.bytes_with_u16_len()?)
            .map_err(|_| err_kind(ErrorKind::MalformedWs, "member address is not valid utf-8"))?;
        let lowest_cached_seqno = dec.i64()?;
        let state = NodeState::from_u8(dec.u8()?)?;
        Ok(MemberRecord { uuid, name, incoming_addr, lowest_cached_seqno, state })
    }
}

/// `conf_id == -1` means non-primary.
pub const CONF_ID_NON_PRIMARY: i64 = -1;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ConfChange {
    pub repl_proto_ver: u32,
    pub appl_proto_ver: u32,
    pub boundary: Gtid,
    pub conf_id: i64,
    pub vote_seqno: i64,
    pub vote_res: i64,
    pub members: Vec<MemberRecord>,
}

impl ConfChange {
    pub fn is_primary(&self) -> bool {
        self.conf_id != CONF_ID_NON_PRIMARY
    }

    fn encode_body(&self, enc: &mut Encoder) {
        enc.u32(self.repl_proto_ver);
        enc.u32(self.appl_proto_ver);
        enc.raw(&self.boundary.to_bytes());
        enc.i64(self.conf_id);
        enc.i64(self.vote_seqno);
        enc.i64(self.vote_res);
        enc.u16(self.members.len() as u16);
        for m in &self.members {
            m.encode(enc);
        }
    }

    /// Serialises with the trailing 8-byte FastHash checksum over the body.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_body(&mut enc);
        let body = enc.into_bytes();
        let checksum = fnv1a_64(&body);
        let mut out = body;
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Inverse of `encode`; rejects on checksum mismatch.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(err_kind(ErrorKind::MalformedWs, "CC action shorter than its checksum trailer"));
        }
        let (body, trailer) = buf.split_at(buf.len() - 8);
        let expected = u64::from_le_bytes(trailer.try_into().unwrap());
        let actual = fnv1a_64(body);
        if expected != actual {
            return Err(err_kind(ErrorKind::MalformedWs, "CC action checksum mismatch"));
        }

        let mut dec = Decoder::new(body);
        let repl_proto_ver = dec.u32()?;
        let appl_proto_ver = dec.u32()?;
        let boundary = Gtid::from_bytes(dec.raw(24)?)?;
        let conf_id = dec.i64()?;
        let vote_seqno = dec.i64()?;
        let vote_res = dec.i64()?;
        let member_count = dec.u16()? as usize;
        let mut members = Vec::with_capacity(member_count);
        for _ in 0..member_count {
            members.push(MemberRecord::decode(&mut dec)?);
        }
        if !dec.finished() {
            return Err(err_kind(ErrorKind::MalformedWs, "trailing bytes after CC action body"));
        }
        Ok(ConfChange {
            repl_proto_ver,
            appl_proto_ver,
            boundary,
            conf_id,
            vote_seqno,
            vote_res,
            members,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    fn sample() -> ConfChange {
        ConfChange {
            repl_proto_ver: 1,
            appl_proto_ver: 1,
            boundary: Gtid::new(Uuid::from_u128(1), 42),
            conf_id: 3,
            vote_seqno: -1,
            vote_res: 0,
            members: vec![MemberRecord {
                uuid: Uuid::from_u128(2),
                name: "node-a".into(),
                incoming_addr: "10.0.0.1:4567".into(),
                lowest_cached_seqno: 10,
                state: NodeState::Synced,
            }],
        }
    }

    #[test]
    fn round_trips() {
        let cc = sample();
        let bytes = cc.encode();
        let back = ConfChange::decode(&bytes).unwrap();
        assert_eq!(cc, back);
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let cc = sample();
        let mut bytes = cc.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(ConfChange::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_corrupted_body() {
        let cc = sample();
        let mut bytes = cc.encode();
        bytes[0] ^= 0xFF;
        assert!(ConfChange::decode(&bytes).is_err());
    }

    #[test]
    fn non_primary_sentinel() {
        let mut cc = sample();
        cc.conf_id = CONF_ID_NON_PRIMARY;
        assert!(!cc.is_primary());
        cc.conf_id = 0;
        assert!(cc.is_primary());
    }
}
