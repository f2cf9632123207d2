//! Base-128 variable length encoding used by control messages.
//!
//! Integers are written as the unsigned LEB128 form of their 32-bit two's
//! complement value, so small non-negative numbers take one byte and negative
//! numbers take five. Strings and byte arrays are length-prefixed.

use super::ProtocolError;
use bytes::{BufMut, BytesMut};

const MAX_VARINT_BYTES: usize = 5;

/// Appends base-128 values to a byte buffer.
pub struct Base128Writer<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> Base128Writer<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf }
    }

    pub fn write_u32(&mut self, mut value: u32) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.put_u8(byte);
                return;
            }
            self.buf.put_u8(byte | 0x80);
        }
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_u32(value as u32);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u32(value as u32);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32_le(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }
}

/// Reads base-128 values from a byte slice, tracking the consumed position.
///
/// Running out of input yields [`ProtocolError::Truncated`], which stream
/// decoders interpret as "wait for more bytes".
pub struct Base128Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Base128Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let mut result: u32 = 0;
        for i in 0..MAX_VARINT_BYTES {
            let byte = self.read_byte()?;
            let bits = (byte & 0x7F) as u32;
            if i == MAX_VARINT_BYTES - 1 && bits > 0x0F {
                return Err(ProtocolError::MalformedVarint);
            }
            result |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(ProtocolError::MalformedVarint)
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u32()? != 0)
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Reads a collection length and returns it together with a capacity that
    /// is safe to preallocate: every element takes at least one byte, so a
    /// corrupt count can't trigger a huge allocation.
    pub fn read_len(&mut self) -> Result<(usize, usize), ProtocolError> {
        let len = self.read_u32()? as usize;
        Ok((len, len.min(self.remaining())))
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(ProtocolError::Truncated("varint"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated("byte array"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut Base128Writer)) -> BytesMut {
        let mut buf = BytesMut::new();
        f(&mut Base128Writer::new(&mut buf));
        buf
    }

    #[test]
    fn test_varint_sizes() {
        assert_eq!(&encode(|w| w.write_u32(0))[..], &[0x00]);
        assert_eq!(&encode(|w| w.write_u32(127))[..], &[0x7F]);
        assert_eq!(&encode(|w| w.write_u32(128))[..], &[0x80, 0x01]);
        assert_eq!(&encode(|w| w.write_u32(300))[..], &[0xAC, 0x02]);
        assert_eq!(encode(|w| w.write_i32(-1)).len(), 5);
    }

    #[test]
    fn test_negative_and_extreme_values() {
        let buf = encode(|w| {
            w.write_i32(-1);
            w.write_i32(i32::MIN);
            w.write_u32(u32::MAX);
        });
        let mut reader = Base128Reader::new(&buf);
        assert_eq!(reader.read_i32().unwrap(), -1);
        assert_eq!(reader.read_i32().unwrap(), i32::MIN);
        assert_eq!(reader.read_u32().unwrap(), u32::MAX);
        assert_eq!(reader.position(), buf.len());
    }

    #[test]
    fn test_truncated_input() {
        let mut reader = Base128Reader::new(&[0x80, 0x80]);
        assert!(matches!(reader.read_u32(), Err(ProtocolError::Truncated(_))));

        let buf = encode(|w| w.write_str("hello"));
        let mut reader = Base128Reader::new(&buf[..3]);
        assert!(matches!(reader.read_string(), Err(ProtocolError::Truncated(_))));
    }

    #[test]
    fn test_overlong_varint_rejected() {
        let mut reader = Base128Reader::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F]);
        assert!(matches!(reader.read_u32(), Err(ProtocolError::MalformedVarint)));
    }

    #[test]
    fn test_strings_are_utf8() {
        let buf = encode(|w| w.write_str("héllo ✓"));
        assert_eq!(buf[0] as usize, "héllo ✓".len());
        assert_eq!(Base128Reader::new(&buf).read_string().unwrap(), "héllo ✓");

        let mut reader = Base128Reader::new(&[0x02, 0xC3, 0x28]);
        assert!(matches!(reader.read_string(), Err(ProtocolError::InvalidUtf8)));
    }
}
