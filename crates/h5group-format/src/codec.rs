//! Bounds-checked cursors for encoding and decoding fixed-layout structures.
//!
//! Every on-disk structure in this crate is read through a [`Reader`] and
//! written through a [`Writer`]. Both carry the file's [`Sizes`], so offsets
//! and lengths are always encoded at the width recorded in the superblock.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::FormatError;

/// Per-file widths of addresses ("offsets") and sizes ("lengths").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sizes {
    /// Size of offsets in bytes (2, 4, or 8).
    pub offset: u8,
    /// Size of lengths in bytes (2, 4, or 8).
    pub length: u8,
}

impl Sizes {
    /// Validate and build a `Sizes`.
    pub fn new(offset: u8, length: u8) -> Result<Sizes, FormatError> {
        if !matches!(offset, 2 | 4 | 8) {
            return Err(FormatError::InvalidOffsetSize(offset));
        }
        if !matches!(length, 2 | 4 | 8) {
            return Err(FormatError::InvalidLengthSize(length));
        }
        Ok(Sizes { offset, length })
    }

    /// Offset width in bytes.
    #[inline]
    pub fn os(&self) -> usize {
        self.offset as usize
    }

    /// Length width in bytes.
    #[inline]
    pub fn ls(&self) -> usize {
        self.length as usize
    }

    /// Largest address representable in `offset` bytes.
    ///
    /// The all-ones pattern is reserved for the undefined address.
    pub fn max_address(&self) -> u64 {
        match self.offset {
            8 => u64::MAX - 1,
            n => (1u64 << (n as u32 * 8)) - 2,
        }
    }

    /// Largest value representable in `length` bytes.
    pub fn max_length(&self) -> u64 {
        match self.length {
            8 => u64::MAX,
            n => (1u64 << (n as u32 * 8)) - 1,
        }
    }
}

impl Default for Sizes {
    fn default() -> Self {
        Sizes {
            offset: 8,
            length: 8,
        }
    }
}

fn read_uint(slice: &[u8], width: u8) -> u64 {
    match width {
        1 => slice[0] as u64,
        2 => LittleEndian::read_u16(slice) as u64,
        4 => LittleEndian::read_u32(slice) as u64,
        _ => LittleEndian::read_u64(slice),
    }
}

/// Cursor over an immutable byte buffer.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    sizes: Sizes,
}

impl<'a> Reader<'a> {
    /// Start reading `data` at position 0.
    pub fn new(data: &'a [u8], sizes: Sizes) -> Self {
        Reader {
            data,
            pos: 0,
            sizes,
        }
    }

    /// Widths this reader decodes with.
    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        let end = self.pos.checked_add(n).ok_or(FormatError::UnexpectedEof {
            expected: usize::MAX,
            available: self.data.len(),
        })?;
        if end > self.data.len() {
            return Err(FormatError::UnexpectedEof {
                expected: end,
                available: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), FormatError> {
        self.take(n).map(|_| ())
    }

    /// Read `n` raw bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        self.take(n)
    }

    /// Read a 4-byte signature and compare it.
    pub fn expect_signature(
        &mut self,
        sig: &[u8; 4],
        err: FormatError,
    ) -> Result<(), FormatError> {
        if self.take(4)? != sig {
            return Err(err);
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, FormatError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn u32(&mut self) -> Result<u32, FormatError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    /// Read an address; all-ones decodes as `None`.
    pub fn address(&mut self) -> Result<Option<u64>, FormatError> {
        let width = self.sizes.offset;
        let slice = self.take(width as usize)?;
        if slice.iter().all(|&b| b == 0xFF) {
            return Ok(None);
        }
        Ok(Some(read_uint(slice, width)))
    }

    /// Read an address that must be defined.
    pub fn defined_address(&mut self, what: &str) -> Result<u64, FormatError> {
        self.address()?
            .ok_or_else(|| FormatError::CorruptIndex(format!("undefined {what} address")))
    }

    /// Read a length-width value.
    pub fn length(&mut self) -> Result<u64, FormatError> {
        let width = self.sizes.length;
        Ok(read_uint(self.take(width as usize)?, width))
    }
}

/// Cursor appending to an owned buffer.
#[derive(Debug, Clone)]
pub struct Writer {
    buf: Vec<u8>,
    sizes: Sizes,
}

impl Writer {
    pub fn with_capacity(sizes: Sizes, capacity: usize) -> Self {
        Writer {
            buf: Vec::with_capacity(capacity),
            sizes,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    fn uint(&mut self, v: u64, width: u8) {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, v);
        self.buf.extend_from_slice(&b[..width as usize]);
    }

    /// Write an address; `None` encodes as all-ones.
    pub fn address(&mut self, addr: Option<u64>) {
        match addr {
            Some(a) => self.uint(a, self.sizes.offset),
            None => {
                let n = self.sizes.os();
                self.buf.resize(self.buf.len() + n, 0xFF);
            }
        }
    }

    /// Write a length-width value.
    pub fn length(&mut self, v: u64) {
        self.uint(v, self.sizes.length);
    }

    /// Append `n` zero bytes.
    pub fn zeros(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    /// Zero-fill up to `len` total bytes.
    pub fn pad_to(&mut self, len: usize) {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Round `n` up to a multiple of 8.
#[inline]
pub fn align8(n: u64) -> u64 {
    (n + 7) & !7
}
