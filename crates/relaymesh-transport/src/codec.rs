//! Binary codec shared by every wire structure in relaymesh.
//!
//! Fixed-width integers are little-endian. Variable-size fields carry a
//! `u32` length prefix. Readers never panic: running out of input is a
//! [`TransportError::Codec`].
use bytes::{Buf, BufMut, BytesMut};

use crate::TransportError;

/// Append-only writer over a growable buffer.
///
/// ```rust
/// use relaymesh_transport::{ByteReader, ByteWriter};
///
/// let mut w = ByteWriter::new();
/// w.write_u16(7).write_str("inbound");
/// let bytes = w.into_vec();
///
/// let mut r = ByteReader::new(&bytes);
/// assert_eq!(r.read_u16().unwrap(), 7);
/// assert_eq!(r.read_string().unwrap(), "inbound");
/// ```
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: BytesMut,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.buf.put_u8(v as u8);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32_le(v);
        self
    }

    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.buf.put_f32_le(v);
        self
    }

    /// Length-prefixed bytes.
    pub fn write_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_u32_le(v.len() as u32);
        self.buf.put_slice(v);
        self
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_str(&mut self, v: &str) -> &mut Self {
        self.write_bytes(v.as_bytes())
    }

    /// Raw bytes, no prefix. Used for trailing blobs.
    pub fn write_raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Cursor over a borrowed byte slice.
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    data: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn need(&self, n: usize) -> Result<(), TransportError> {
        if self.data.len() < n {
            return Err(TransportError::codec(format!(
                "need {n} bytes, {} left",
                self.data.len()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, TransportError> {
        self.need(1)?;
        Ok(self.data.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, TransportError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, TransportError> {
        self.need(2)?;
        Ok(self.data.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, TransportError> {
        self.need(4)?;
        Ok(self.data.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, TransportError> {
        self.need(8)?;
        Ok(self.data.get_u64_le())
    }

    pub fn read_i32(&mut self) -> Result<i32, TransportError> {
        self.need(4)?;
        Ok(self.data.get_i32_le())
    }

    pub fn read_f32(&mut self) -> Result<f32, TransportError> {
        self.need(4)?;
        Ok(self.data.get_f32_le())
    }

    /// Exactly `n` bytes, no prefix.
    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8], TransportError> {
        self.need(n)?;
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    /// Length-prefixed bytes.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], TransportError> {
        let len = self.read_u32()? as usize;
        self.read_raw(len)
    }

    /// Length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, TransportError> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| TransportError::codec(format!("invalid utf-8: {e}")))
    }

    /// Everything not consumed yet.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_fields_are_little_endian() {
        let mut w = ByteWriter::new();
        w.write_u16(0x0102).write_u32(0x03040506);
        assert_eq!(w.into_vec(), vec![0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);
    }

    #[test]
    fn mixed_fields_read_back_in_order() {
        let mut w = ByteWriter::new();
        w.write_bool(true)
            .write_u64(u64::MAX - 1)
            .write_i32(-42)
            .write_f32(0.5)
            .write_bytes(b"abc")
            .write_raw(b"tail");
        let bytes = w.into_vec();

        let mut r = ByteReader::new(&bytes);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.read_i32().unwrap(), -42);
        assert_eq!(r.read_f32().unwrap(), 0.5);
        assert_eq!(r.read_bytes().unwrap(), b"abc");
        assert_eq!(r.rest(), b"tail");
        assert!(r.is_empty());
    }

    #[test]
    fn short_input_is_codec_error() {
        let mut r = ByteReader::new(&[1, 2]);
        let err = r.read_u32().unwrap_err();
        assert!(matches!(err, TransportError::Codec { .. }));
    }

    #[test]
    fn length_prefix_larger_than_input_is_rejected() {
        let mut w = ByteWriter::new();
        w.write_u32(100).write_raw(b"xy");
        let bytes = w.into_vec();
        assert!(ByteReader::new(&bytes).read_bytes().is_err());
    }

    #[test]
    fn invalid_utf8_string_is_rejected() {
        let mut w = ByteWriter::new();
        w.write_bytes(&[0xff, 0xfe]);
        let bytes = w.into_vec();
        assert!(ByteReader::new(&bytes).read_string().is_err());
    }
}
