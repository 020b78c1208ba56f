//! Cursor-based reader and accumulating builder for packet payloads
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Error produced while decoding a packet payload
#[derive(Error, Debug)]
pub enum CodecError {
    /// The packet was shorter than expected
    #[error("end of packet")]
    EndOfPacket,
    /// A length-encoded integer started with a prefix byte that is never valid
    #[error("invalid length-encoded prefix {0:#04x}")]
    InvalidLenenc(u8),
    /// A length-encoded integer was NULL (0xFB) where a length was required
    #[error("unexpected NULL length")]
    NullLength,
    /// A string in a packet was not utf-8 as expected
    #[error("utf-8 error at {valid_up_to}")]
    Utf8 {
        /// The string is valid utf-8 until this many bytes
        valid_up_to: u32,
        /// The length of the error
        error_len: Option<u8>,
    },
    /// A byte with a single legal value held something else
    #[error("expected {expected:#04x} for {loc}, got {got:#04x}")]
    UnexpectedByte {
        /// What was being read
        loc: &'static str,
        /// The only legal value
        expected: u8,
        /// The value found
        got: u8,
    },
    /// A result row held a column type this crate cannot decode
    #[error("unsupported column type {0:#04x}")]
    UnsupportedType(u8),
}

const _: () = {
    assert!(size_of::<CodecError>() <= 24);
};

impl From<bytes::TryGetError> for CodecError {
    fn from(_value: bytes::TryGetError) -> Self {
        CodecError::EndOfPacket
    }
}

impl From<std::str::Utf8Error> for CodecError {
    fn from(value: std::str::Utf8Error) -> Self {
        CodecError::Utf8 {
            valid_up_to: value.valid_up_to().try_into().unwrap_or(u32::MAX),
            error_len: value.error_len().map(|v| v.try_into().unwrap_or(0xFF)),
        }
    }
}

/// Result returned by [PacketReader]
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// An assembled payload with its leading type byte peeled off
pub(crate) struct Packet {
    /// The first payload byte: 0x00 OK, 0xFE EOF, 0xFF ERR, 0x0A greeting, or a data tag
    pub(crate) kind: u8,
    /// The full payload, type byte included
    pub(crate) payload: Bytes,
}

impl Packet {
    /// A reader positioned just after the type byte
    pub(crate) fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(&self.payload[1..])
    }
}

/// Reads MySQL primitive types out of a payload, advancing a cursor
#[derive(Clone, Copy)]
pub struct PacketReader<'a>(&'a [u8]);

impl<'a> PacketReader<'a> {
    /// Construct a reader over the given payload
    pub(crate) fn new(payload: &'a [u8]) -> Self {
        Self(payload)
    }

    /// Number of bytes left to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.0.len()
    }

    /// True once the payload is exhausted
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look at the next byte without consuming it
    #[inline]
    pub fn peek(&self) -> Option<u8> {
        self.0.first().copied()
    }

    /// Read a u8
    #[inline]
    pub fn get_u8(&mut self) -> CodecResult<u8> {
        Ok(self.0.try_get_u8()?)
    }

    /// Read a i8
    #[inline]
    pub fn get_i8(&mut self) -> CodecResult<i8> {
        Ok(self.0.try_get_i8()?)
    }

    /// Read a little-endian u16
    #[inline]
    pub fn get_u16(&mut self) -> CodecResult<u16> {
        Ok(self.0.try_get_u16_le()?)
    }

    /// Read a little-endian i16
    #[inline]
    pub fn get_i16(&mut self) -> CodecResult<i16> {
        Ok(self.0.try_get_i16_le()?)
    }

    /// Read a little-endian 24-bit unsigned integer, zero-extended
    #[inline]
    pub fn get_u24(&mut self) -> CodecResult<u32> {
        let a: u32 = self.get_u8()?.into();
        let b: u32 = self.get_u8()?.into();
        let c: u32 = self.get_u8()?.into();
        Ok(a | (b << 8) | (c << 16))
    }

    /// Read a little-endian u32
    #[inline]
    pub fn get_u32(&mut self) -> CodecResult<u32> {
        Ok(self.0.try_get_u32_le()?)
    }

    /// Read a little-endian i32
    #[inline]
    pub fn get_i32(&mut self) -> CodecResult<i32> {
        Ok(self.0.try_get_i32_le()?)
    }

    /// Read a little-endian u64
    #[inline]
    pub fn get_u64(&mut self) -> CodecResult<u64> {
        Ok(self.0.try_get_u64_le()?)
    }

    /// Read a little-endian i64
    #[inline]
    pub fn get_i64(&mut self) -> CodecResult<i64> {
        Ok(self.0.try_get_i64_le()?)
    }

    /// Read a little-endian f32
    #[inline]
    pub fn get_f32(&mut self) -> CodecResult<f32> {
        Ok(self.0.try_get_f32_le()?)
    }

    /// Read a little-endian f64
    #[inline]
    pub fn get_f64(&mut self) -> CodecResult<f64> {
        Ok(self.0.try_get_f64_le()?)
    }

    /// Read a length-encoded integer.
    ///
    /// In this, the header, context a 0xFB prefix (NULL) is an error.
    ///
    /// See <https://mariadb.com/docs/server/reference/clientserver-protocol/protocol-data-types#length-encoded-integers>
    #[inline]
    pub fn get_lenenc(&mut self) -> CodecResult<u64> {
        match self.get_u8()? {
            0xFB => Err(CodecError::NullLength),
            0xFC => Ok(self.get_u16()?.into()),
            0xFD => Ok(self.get_u24()?.into()),
            0xFE => self.get_u64(),
            0xFF => Err(CodecError::InvalidLenenc(0xFF)),
            v => Ok(v.into()),
        }
    }

    /// Read a length-encoded integer in row context, where 0xFB means NULL
    #[inline]
    pub fn get_lenenc_nullable(&mut self) -> CodecResult<Option<u64>> {
        if self.peek() == Some(0xFB) {
            self.get_u8()?;
            return Ok(None);
        }
        Ok(Some(self.get_lenenc()?))
    }

    /// Read a length-encoded blob
    #[inline]
    pub fn get_lenenc_blob(&mut self) -> CodecResult<&'a [u8]> {
        let len = self.get_lenenc()?;
        self.get_bytes(len as usize)
    }

    /// Read a length-encoded utf-8 string
    #[inline]
    pub fn get_lenenc_str(&mut self) -> CodecResult<&'a str> {
        let v = self.get_lenenc_blob()?;
        Ok(str::from_utf8(v)?)
    }

    /// Skip past a length-encoded string or blob
    #[inline]
    pub fn skip_lenenc_str(&mut self) -> CodecResult<()> {
        let len = self.get_lenenc()?;
        self.get_bytes(len as usize)?;
        Ok(())
    }

    /// Read a NUL-terminated string, up to but excluding the terminator,
    /// which is consumed
    #[inline]
    pub fn get_null_str(&mut self) -> CodecResult<&'a str> {
        match std::ffi::CStr::from_bytes_until_nul(self.0) {
            Ok(v) => {
                let v = v.to_str()?;
                self.0.advance(v.len() + 1);
                Ok(v)
            }
            Err(_) => Err(CodecError::EndOfPacket),
        }
    }

    /// Skip past a NUL-terminated string
    #[inline]
    pub fn skip_null_str(&mut self) -> CodecResult<()> {
        match std::ffi::CStr::from_bytes_until_nul(self.0) {
            Ok(v) => {
                self.0.advance(v.count_bytes() + 1);
                Ok(())
            }
            Err(_) => Err(CodecError::EndOfPacket),
        }
    }

    /// Read the rest of the payload as a utf-8 string
    #[inline]
    pub fn get_eof_str(&mut self) -> CodecResult<&'a str> {
        let v = str::from_utf8(self.0)?;
        self.0.advance(v.len());
        Ok(v)
    }

    /// Read exactly `len` bytes
    #[inline]
    pub fn get_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        match self.0.get(..len) {
            Some(v) => {
                self.0.advance(len);
                Ok(v)
            }
            None => Err(CodecError::EndOfPacket),
        }
    }

    /// Consume one byte that may only hold `expected`
    #[inline]
    pub fn expect_u8(&mut self, loc: &'static str, expected: u8) -> CodecResult<()> {
        let got = self.get_u8()?;
        if got != expected {
            return Err(CodecError::UnexpectedByte { loc, expected, got });
        }
        Ok(())
    }
}

/// Accumulates MySQL primitive types into a payload buffer.
///
/// Kept separate from [PacketReader]: one appends, the other advances a
/// cursor, and a structure doing both invites bugs.
pub struct PacketBuilder(BytesMut);

impl PacketBuilder {
    /// Start an empty payload
    pub(crate) fn new() -> Self {
        PacketBuilder(BytesMut::with_capacity(128))
    }

    /// The accumulated payload
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Append a u8
    #[inline]
    pub fn put_u8(&mut self, v: u8) {
        self.0.put_u8(v);
    }

    /// Append a little-endian u16
    #[inline]
    pub fn put_u16(&mut self, v: u16) {
        self.0.put_u16_le(v);
    }

    /// Append a little-endian 24-bit unsigned integer
    #[inline]
    pub fn put_u24(&mut self, v: u32) {
        self.0.put_u8((v & 0xFF) as u8);
        self.0.put_u8(((v >> 8) & 0xFF) as u8);
        self.0.put_u8(((v >> 16) & 0xFF) as u8);
    }

    /// Append a little-endian u32
    #[inline]
    pub fn put_u32(&mut self, v: u32) {
        self.0.put_u32_le(v);
    }

    /// Append a little-endian u64
    #[inline]
    pub fn put_u64(&mut self, v: u64) {
        self.0.put_u64_le(v);
    }

    /// Append a little-endian i16
    #[inline]
    pub fn put_i16(&mut self, v: i16) {
        self.0.put_i16_le(v);
    }

    /// Append a little-endian i64
    #[inline]
    pub fn put_i64(&mut self, v: i64) {
        self.0.put_i64_le(v);
    }

    /// Append a little-endian f64
    #[inline]
    pub fn put_f64(&mut self, v: f64) {
        self.0.put_f64_le(v);
    }

    /// Append a length-encoded integer using the minimal prefix class
    ///
    /// See <https://mariadb.com/docs/server/reference/clientserver-protocol/protocol-data-types#length-encoded-integers>
    #[inline]
    pub fn put_lenenc(&mut self, v: u64) {
        if v < 0xFB {
            self.put_u8(v as u8);
        } else if v <= 0xFFFF {
            self.put_u8(0xFC);
            self.put_u16(v as u16);
        } else if v <= 0xFF_FFFF {
            self.put_u8(0xFD);
            self.put_u24(v as u32);
        } else {
            self.put_u8(0xFE);
            self.put_u64(v);
        }
    }

    /// Append a length-encoded string or blob
    #[inline]
    pub fn put_lenenc_bytes(&mut self, v: &[u8]) {
        self.put_lenenc(v.len() as u64);
        self.0.put_slice(v);
    }

    /// Append a NUL-terminated string
    #[inline]
    pub fn put_str_null(&mut self, s: &str) {
        self.0.put_slice(s.as_bytes());
        self.0.put_u8(0);
    }

    /// Append raw bytes
    #[inline]
    pub fn put_slice(&mut self, src: &[u8]) {
        self.0.put_slice(src);
    }
}

/// Byte width of a result-row NULL bitmap covering `columns` columns.
///
/// Binary result rows shift the bitmap by two bits, hence the +9.
#[inline]
pub(crate) fn null_bitmap_width(columns: usize) -> usize {
    (columns + 9) >> 3
}

/// Is column `index` marked NULL in a result-row bitmap?
#[inline]
pub(crate) fn null_bitmap_is_set(bitmap: &[u8], index: usize) -> bool {
    bitmap[(index + 2) >> 3] & (1 << ((index + 2) & 7)) != 0
}

/// Mark column `index` NULL in a result-row bitmap
#[inline]
pub(crate) fn null_bitmap_set(bitmap: &mut [u8], index: usize) {
    bitmap[(index + 2) >> 3] |= 1 << ((index + 2) & 7);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lenenc_bytes(v: u64) -> Vec<u8> {
        let mut b = PacketBuilder::new();
        b.put_lenenc(v);
        b.bytes().to_vec()
    }

    #[test]
    fn lenenc_uses_minimal_prefix_class() {
        assert_eq!(lenenc_bytes(0), vec![0]);
        assert_eq!(lenenc_bytes(0xFA), vec![0xFA]);
        assert_eq!(lenenc_bytes(0xFB), vec![0xFC, 0xFB, 0x00]);
        assert_eq!(lenenc_bytes(0xFFFF), vec![0xFC, 0xFF, 0xFF]);
        assert_eq!(lenenc_bytes(0x1_0000), vec![0xFD, 0x00, 0x00, 0x01]);
        assert_eq!(lenenc_bytes(0xFF_FFFF), vec![0xFD, 0xFF, 0xFF, 0xFF]);
        assert_eq!(
            lenenc_bytes(0x100_0000),
            vec![0xFE, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn lenenc_round_trips() {
        for v in [
            0u64,
            1,
            0xFA,
            0xFB,
            0xFC,
            0xFFFF,
            0x1_0000,
            0xFF_FFFF,
            0x100_0000,
            u32::MAX as u64,
            u64::MAX,
        ] {
            let encoded = lenenc_bytes(v);
            let mut r = PacketReader::new(&encoded);
            assert_eq!(r.get_lenenc().unwrap(), v);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn lenenc_null_prefix_is_context_dependent() {
        let mut r = PacketReader::new(&[0xFB]);
        assert!(matches!(r.get_lenenc(), Err(CodecError::NullLength)));

        let mut r = PacketReader::new(&[0xFB, 0x07]);
        assert_eq!(r.get_lenenc_nullable().unwrap(), None);
        assert_eq!(r.get_lenenc_nullable().unwrap(), Some(7));
    }

    #[test]
    fn lenenc_rejects_invalid_prefix() {
        let mut r = PacketReader::new(&[0xFF]);
        assert!(matches!(r.get_lenenc(), Err(CodecError::InvalidLenenc(0xFF))));
    }

    #[test]
    fn null_str_excludes_and_consumes_terminator() {
        let mut r = PacketReader::new(b"hello\0rest");
        assert_eq!(r.get_null_str().unwrap(), "hello");
        assert_eq!(r.get_eof_str().unwrap(), "rest");

        let mut r = PacketReader::new(b"no terminator");
        assert!(matches!(r.get_null_str(), Err(CodecError::EndOfPacket)));
    }

    #[test]
    fn empty_lenenc_string_is_empty() {
        let mut r = PacketReader::new(&[0x00]);
        assert_eq!(r.get_lenenc_str().unwrap(), "");
    }

    #[test]
    fn expect_u8_reports_mismatch() {
        let mut r = PacketReader::new(&[0x01]);
        let err = r.expect_u8("filler", 0).unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnexpectedByte { expected: 0, got: 1, .. }
        ));
    }

    #[test]
    fn primitives_round_trip() {
        let mut b = PacketBuilder::new();
        b.put_u8(0x12);
        b.put_u16(0x3456);
        b.put_u24(0x78_9ABC);
        b.put_u32(0xDEAD_BEEF);
        b.put_u64(0x0102_0304_0506_0708);
        b.put_i16(-2);
        b.put_i64(-3);
        b.put_f64(1.5);
        let bytes = b.bytes().to_vec();
        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 0x12);
        assert_eq!(r.get_u16().unwrap(), 0x3456);
        assert_eq!(r.get_u24().unwrap(), 0x78_9ABC);
        assert_eq!(r.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.get_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(r.get_i16().unwrap(), -2);
        assert_eq!(r.get_i64().unwrap(), -3);
        assert_eq!(r.get_f64().unwrap(), 1.5);
        assert!(r.is_empty());
    }

    #[test]
    fn row_null_bitmap_round_trips() {
        for width in 1..=20usize {
            let nulls: Vec<usize> = (0..width).filter(|i| i % 3 == 0).collect();
            let mut bitmap = vec![0u8; null_bitmap_width(width)];
            for &i in &nulls {
                null_bitmap_set(&mut bitmap, i);
            }
            for i in 0..width {
                assert_eq!(null_bitmap_is_set(&bitmap, i), nulls.contains(&i));
            }
        }
    }

    #[test]
    fn row_null_bitmap_width_matches_protocol() {
        assert_eq!(null_bitmap_width(1), 1);
        assert_eq!(null_bitmap_width(6), 1);
        assert_eq!(null_bitmap_width(7), 2);
        assert_eq!(null_bitmap_width(14), 2);
        assert_eq!(null_bitmap_width(15), 3);
    }
}
