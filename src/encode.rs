//! Serialize data into the peer wire protocol.
use bytes::{BufMut, Bytes};

use crate::error::Result;

pub trait ToByte {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()>;
}

impl<'a, T: ToByte + 'a + ?Sized> ToByte for &'a T {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (*self).encode(buffer)
    }
}

impl ToByte for bool {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u8(*self as u8);
        Ok(())
    }
}

impl ToByte for u8 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u8(*self);
        Ok(())
    }
}

impl ToByte for u16 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u16(*self);
        Ok(())
    }
}

impl ToByte for u32 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u32(*self);
        Ok(())
    }
}

impl ToByte for u64 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u64(*self);
        Ok(())
    }
}

impl ToByte for i32 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(*self);
        Ok(())
    }
}

impl ToByte for str {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u16(self.len() as u16);
        buffer.put(self.as_bytes());
        Ok(())
    }
}

impl ToByte for String {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_str().encode(buffer)
    }
}

impl ToByte for Bytes {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(self.len() as i32);
        buffer.put(self.clone());
        Ok(())
    }
}

/// Encode optional bytes; `None` is rendered as length -1.
pub fn encode_nullable_bytes<W: BufMut>(buffer: &mut W, value: &Option<Bytes>) -> Result<()> {
    match value {
        Some(bytes) => bytes.encode(buffer),
        None => {
            buffer.put_i32(-1);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_bool() {
        let mut buf = Vec::new();
        true.encode(&mut buf).unwrap();
        false.encode(&mut buf).unwrap();
        assert_eq!(buf, vec![1, 0]);
    }

    #[test]
    fn test_encode_u64() {
        let mut buf = Vec::new();
        0x0102030405060708u64.encode(&mut buf).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_encode_str_length_prefixed() {
        let mut buf = Vec::new();
        "fw-a".encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0, 4, b'f', b'w', b'-', b'a']);
    }

    #[test]
    fn test_encode_bytes_length_prefixed() {
        let mut buf = Vec::new();
        Bytes::from_static(b"ab").encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 2, b'a', b'b']);
    }

    #[test]
    fn test_encode_nullable_bytes_none() {
        let mut buf = Vec::new();
        encode_nullable_bytes(&mut buf, &None).unwrap();
        assert_eq!(buf, vec![0xFF, 0xFF, 0xFF, 0xFF]);
    }

}
