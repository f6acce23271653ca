// A minimal little-endian byte cursor for the WS wire format (§6.1). Unlike
// submerge-coldb's Reader/Writer, which are file-backed and track nested
// "context" for annotated dumps, the WS format has no on-disk layer beneath
// it: a WS is a single length-prefixed, tag-terminated buffer assembled in
// memory before being handed to the GCS. So this is a plain growable buffer
// for encoding and a bounds-checked slice cursor for decoding; every read
// validates the remaining buffer length before consuming it, per Design
// Note on the wire format.

use galera_base::{err, err_kind, ErrorKind, Result};

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn bytes_with_u16_len(&mut self, data: &[u8]) {
        self.u16(data.len() as u16);
        self.buf.extend_from_slice(data);
    }

    pub fn bytes_with_u32_len(&mut self, data: &[u8]) {
        self.u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    pub fn raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(err_kind(
                ErrorKind::MalformedWs,
                "buffer underrun: not enough bytes remaining",
            ));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn bytes_with_u16_len(&mut self) -> Result<Vec<u8>> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn bytes_with_u32_len(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        if len > u32::MAX as usize / 2 {
            return Err(err("implausible length prefix"));
        }
        Ok(self.take(len)?.to_vec())
    }

    pub fn raw(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn finished(&self) -> bool {
        self.remaining() == 0
    }
}
