#![forbid(unsafe_code)]
//! Fixed-width encoders, a checked read cursor, and bounded type tags shared
//! by every on-disk record.

pub mod le {
    //! Little-endian appenders for fixed-width integers.

    /// Appends a `u8`.
    pub fn put_u8(dst: &mut Vec<u8>, v: u8) {
        dst.push(v);
    }

    /// Appends a little-endian `u16`.
    pub fn put_u16(dst: &mut Vec<u8>, v: u16) {
        dst.extend_from_slice(&v.to_le_bytes());
    }

    /// Appends a little-endian `u32`.
    pub fn put_u32(dst: &mut Vec<u8>, v: u32) {
        dst.extend_from_slice(&v.to_le_bytes());
    }

    /// Appends a little-endian `u64`.
    pub fn put_u64(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_le_bytes());
    }

    /// Appends a little-endian `i64`.
    pub fn put_i64(dst: &mut Vec<u8>, v: i64) {
        dst.extend_from_slice(&v.to_le_bytes());
    }

    /// Appends a `u16` length prefix followed by `bytes`.
    ///
    /// Callers bound `bytes` to `u16::MAX` before encoding.
    pub fn put_short_bytes(dst: &mut Vec<u8>, bytes: &[u8]) {
        debug_assert!(bytes.len() <= u16::MAX as usize);
        put_u16(dst, bytes.len() as u16);
        dst.extend_from_slice(bytes);
    }

    /// Appends a `u32` length prefix followed by `bytes`.
    pub fn put_long_bytes(dst: &mut Vec<u8>, bytes: &[u8]) {
        debug_assert!(bytes.len() <= u32::MAX as usize);
        put_u32(dst, bytes.len() as u32);
        dst.extend_from_slice(bytes);
    }
}

pub mod buf {
    //! A slice-backed cursor for parsing records without panicking.

    use core::fmt;

    use crate::types::{CairnError, Result};

    /// A cursor over a byte slice with offset tracking.
    pub struct Cursor<'a> {
        buf: &'a [u8],
        off: usize,
        what: &'static str,
    }

    impl<'a> Cursor<'a> {
        /// Creates a cursor; `what` names the structure in error messages.
        pub fn new(buf: &'a [u8], what: &'static str) -> Self {
            Self { buf, off: 0, what }
        }

        /// Takes the next `n` bytes, failing if the buffer is shorter.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .filter(|end| *end <= self.buf.len())
                .ok_or_else(|| {
                    CairnError::Format(format!(
                        "{} truncated: need {} bytes at offset {}, have {}",
                        self.what,
                        n,
                        self.off,
                        self.remaining()
                    ))
                })?;
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads `N` bytes into an array.
        pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
            let mut out = [0u8; N];
            out.copy_from_slice(self.take(N)?);
            Ok(out)
        }

        /// Reads a `u8`.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a little-endian `u16`.
        pub fn u16(&mut self) -> Result<u16> {
            Ok(u16::from_le_bytes(self.array()?))
        }

        /// Reads a little-endian `u32`.
        pub fn u32(&mut self) -> Result<u32> {
            Ok(u32::from_le_bytes(self.array()?))
        }

        /// Reads a little-endian `u64`.
        pub fn u64(&mut self) -> Result<u64> {
            Ok(u64::from_le_bytes(self.array()?))
        }

        /// Reads a little-endian `i64`.
        pub fn i64(&mut self) -> Result<i64> {
            Ok(i64::from_le_bytes(self.array()?))
        }

        /// Reads a `u16`-prefixed byte string.
        pub fn short_bytes(&mut self) -> Result<&'a [u8]> {
            let len = self.u16()? as usize;
            self.take(len)
        }

        /// Reads a `u32`-prefixed byte string.
        pub fn long_bytes(&mut self) -> Result<&'a [u8]> {
            let len = self.u32()? as usize;
            self.take(len)
        }

        /// Reads a `u16`-prefixed UTF-8 string.
        pub fn short_str(&mut self) -> Result<&'a str> {
            let what = self.what;
            let bytes = self.short_bytes()?;
            core::str::from_utf8(bytes)
                .map_err(|_| CairnError::Format(format!("{what} contains invalid UTF-8")))
        }

        /// Bytes left to read.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Fails unless every byte has been consumed.
        pub fn finish(self) -> Result<()> {
            if self.remaining() != 0 {
                return Err(CairnError::Format(format!(
                    "{} has {} trailing bytes",
                    self.what,
                    self.remaining()
                )));
            }
            Ok(())
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("what", &self.what)
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}

pub mod tag {
    //! Bounded-width type tags for nodes and links.

    use crate::types::{CairnError, Result};

    /// Width of an encoded type tag.
    pub const TYPE_TAG_LEN: usize = 32;

    /// Truncates `ty` to at most [`TYPE_TAG_LEN`] bytes on a char boundary.
    pub fn normalize(ty: &str) -> &str {
        if ty.len() <= TYPE_TAG_LEN {
            return ty;
        }
        let mut end = TYPE_TAG_LEN;
        while !ty.is_char_boundary(end) {
            end -= 1;
        }
        &ty[..end]
    }

    /// Encodes `ty` as a zero-padded fixed-width tag.
    pub fn encode(ty: &str) -> Result<[u8; TYPE_TAG_LEN]> {
        let ty = normalize(ty);
        if ty.is_empty() || ty.contains('\0') {
            return Err(CairnError::Invalid(format!(
                "type tag must be non-empty and NUL-free: {ty:?}"
            )));
        }
        let mut out = [0u8; TYPE_TAG_LEN];
        out[..ty.len()].copy_from_slice(ty.as_bytes());
        Ok(out)
    }

    /// Decodes a zero-padded tag.
    pub fn decode(raw: &[u8; TYPE_TAG_LEN]) -> Result<String> {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(TYPE_TAG_LEN);
        if raw[end..].iter().any(|&b| b != 0) {
            return Err(CairnError::Format("type tag has bytes after padding".into()));
        }
        String::from_utf8(raw[..end].to_vec())
            .map_err(|_| CairnError::Format("type tag is not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::{buf::Cursor, le, tag};

    #[test]
    fn fixed_width_roundtrip() {
        let mut out = Vec::new();
        le::put_u8(&mut out, 7);
        le::put_u16(&mut out, 0xBEEF);
        le::put_u32(&mut out, 123_456_789);
        le::put_u64(&mut out, u64::MAX - 1);
        le::put_i64(&mut out, -42);
        le::put_short_bytes(&mut out, b"abc");
        le::put_long_bytes(&mut out, b"");

        let mut cur = Cursor::new(&out, "test");
        assert_eq!(cur.u8().unwrap(), 7);
        assert_eq!(cur.u16().unwrap(), 0xBEEF);
        assert_eq!(cur.u32().unwrap(), 123_456_789);
        assert_eq!(cur.u64().unwrap(), u64::MAX - 1);
        assert_eq!(cur.i64().unwrap(), -42);
        assert_eq!(cur.short_str().unwrap(), "abc");
        assert_eq!(cur.long_bytes().unwrap(), b"");
        cur.finish().unwrap();
    }

    #[test]
    fn truncated_reads_fail_without_panicking() {
        let mut cur = Cursor::new(&[1, 2, 3], "short");
        assert!(cur.u32().is_err());
        let mut cur = Cursor::new(&[5, 0, b'a'], "short");
        assert!(cur.short_bytes().is_err());
    }

    #[test]
    fn trailing_bytes_are_reported() {
        let mut cur = Cursor::new(&[1, 2], "trail");
        cur.u8().unwrap();
        assert!(cur.finish().is_err());
    }

    #[test]
    fn type_tags_truncate_on_char_boundary() {
        let long = "é".repeat(20);
        let normalized = tag::normalize(&long);
        assert!(normalized.len() <= tag::TYPE_TAG_LEN);
        assert_eq!(normalized.len() % 2, 0);

        let raw = tag::encode("note").unwrap();
        assert_eq!(tag::decode(&raw).unwrap(), "note");
        assert!(tag::encode("").is_err());
    }
}
