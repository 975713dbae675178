//! Minimal big-endian reader and writer for fixed-layout packet
//! structures.
//!
//! The overlay wire format is small and fixed; this is deliberately a far
//! lighter tool than a general codec, but it keeps the same discipline:
//! parsing consumes from the front, every read is bounds-checked, and a
//! structure that should end exactly where the buffer does can say so.

use crate::err::ProtocolError;

/// A cursor over a byte slice, consuming from the front.
pub struct Reader<'a> {
    /// The bytes not yet consumed.
    remaining: &'a [u8],
}

impl<'a> Reader<'a> {
    /// Begin reading `slice`.
    pub fn from_slice(slice: &'a [u8]) -> Self {
        Reader { remaining: slice }
    }

    /// Return how many bytes are left.
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    /// Take `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining.len() < n {
            return Err(ProtocolError::ShortPacket);
        }
        let (head, tail) = self.remaining.split_at(n);
        self.remaining = tail;
        Ok(head)
    }

    /// Take the rest of the input.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = self.remaining;
        self.remaining = &[];
        rest
    }

    /// Take a single byte.
    pub fn take_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    /// Take a big-endian u16.
    pub fn take_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Take a big-endian u32.
    pub fn take_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Take a big-endian u64.
    pub fn take_u64(&mut self) -> Result<u64, ProtocolError> {
        let b = self.take(8)?;
        let mut arr = [0_u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Fail unless the input is fully consumed.
    pub fn should_be_exhausted(&self) -> Result<(), ProtocolError> {
        if self.remaining.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ExtraneousBytes)
        }
    }
}

/// An extension trait for appending big-endian integers to a byte buffer.
pub trait Writer {
    /// Append raw bytes.
    fn write_all(&mut self, bytes: &[u8]);
    /// Append one byte.
    fn write_u8(&mut self, x: u8) {
        self.write_all(&[x]);
    }
    /// Append a big-endian u16.
    fn write_u16(&mut self, x: u16) {
        self.write_all(&x.to_be_bytes());
    }
    /// Append a big-endian u32.
    fn write_u32(&mut self, x: u32) {
        self.write_all(&x.to_be_bytes());
    }
    /// Append a big-endian u64.
    fn write_u64(&mut self, x: u64) {
        self.write_all(&x.to_be_bytes());
    }
}

impl Writer for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use hex_literal::hex;

    #[test]
    fn read_ints() {
        let b = hex!("01 0203 04050607 08090a0b0c0d0e0f ff");
        let mut r = Reader::from_slice(&b);
        assert_eq!(r.take_u8().unwrap(), 0x01);
        assert_eq!(r.take_u16().unwrap(), 0x0203);
        assert_eq!(r.take_u32().unwrap(), 0x0405_0607);
        assert_eq!(r.take_u64().unwrap(), 0x0809_0a0b_0c0d_0e0f);
        assert_eq!(r.remaining(), 1);
        assert!(r.should_be_exhausted().is_err());
        assert_eq!(r.take_rest(), &[0xFF]);
        r.should_be_exhausted().unwrap();
    }

    #[test]
    fn short_reads_fail() {
        let mut r = Reader::from_slice(&[0x01]);
        assert_eq!(r.take_u32(), Err(ProtocolError::ShortPacket));
        // A failed read consumes nothing.
        assert_eq!(r.take_u8().unwrap(), 0x01);
    }

    #[test]
    fn write_ints() {
        let mut v = Vec::new();
        v.write_u8(0x01);
        v.write_u16(0x0203);
        v.write_u32(0x0405_0607);
        v.write_u64(0x0809_0a0b_0c0d_0e0f);
        assert_eq!(v, hex!("01 0203 04050607 08090a0b0c0d0e0f"));
    }
}
