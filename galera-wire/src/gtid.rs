// GTID: (128-bit UUID, 64-bit sequence number) identifying a position in the
// replication stream. `SEQNO_UNDEFINED = -1`. Stream format `UUID:SEQNO`,
// binary format `UUID[16] || seqno_i64_le` (24 bytes total, §6.3).

use std::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use galera_base::{err, Result};

pub const SEQNO_UNDEFINED: i64 = -1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Gtid {
    pub uuid: Uuid,
    pub seqno: i64,
}

impl Gtid {
    pub fn new(uuid: Uuid, seqno: i64) -> Self {
        Gtid { uuid, seqno }
    }

    pub fn undefined(uuid: Uuid) -> Self {
        Gtid { uuid, seqno: SEQNO_UNDEFINED }
    }

    pub fn is_undefined(&self) -> bool {
        self.seqno == SEQNO_UNDEFINED
    }

    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..16].copy_from_slice(self.uuid.as_bytes());
        out[16..].copy_from_slice(&self.seqno.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != 24 {
            return Err(err("GTID binary form must be exactly 24 bytes"));
        }
        let uuid = Uuid::from_slice(&buf[..16]).map_err(|e| galera_base::Error::from(e))?;
        let seqno = i64::from_le_bytes(buf[16..24].try_into().unwrap());
        Ok(Gtid { uuid, seqno })
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uuid, self.seqno)
    }
}

impl std::str::FromStr for Gtid {
    type Err = galera_base::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (uuid_str, seqno_str) = s
            .rsplit_once(':')
            .ok_or_else(|| err("GTID string must be UUID:SEQNO"))?;
        let uuid = Uuid::parse_str(uuid_str).map_err(galera_base::Error::from)?;
        let seqno: i64 = seqno_str
            .parse()
            .map_err(|_| err("GTID seqno is not a valid integer"))?;
        Ok(Gtid { uuid, seqno })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn roundtrips_through_bytes() {
        let g = Gtid::new(Uuid::from_u128(0x1234_5678_9abc_def0_1122_3344_5566_7788), 42);
        let bytes = g.to_bytes();
        assert_eq!(bytes.len(), 24);
        let back = Gtid::from_bytes(&bytes).unwrap();
        assert_eq!(g, back);
    }

    #[test]
    fn roundtrips_through_display() {
        let g = Gtid::new(Uuid::from_u128(7), 99);
        let s = g.to_string();
        let back: Gtid = s.parse().unwrap();
        assert_eq!(g, back);
    }

    #[test]
    fn undefined_seqno_is_negative_one() {
        let g = Gtid::undefined(Uuid::nil());
        assert!(g.is_undefined());
        assert_eq!(g.seqno, -1);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Gtid::from_bytes(&[0u8; 23]).is_err());
    }
}
