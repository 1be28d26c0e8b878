//! Byte-addressed storage underneath heaps, B-tree pages and object headers.
//!
//! The engine never touches a file descriptor. It allocates, reads and
//! writes address ranges through [`Storage`]; [`MemStorage`] keeps the whole
//! file image in memory and is what the file layer flushes to disk.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use log::trace;

use crate::error::FormatError;

/// Address-space allocator and block I/O.
pub trait Storage {
    /// Allocate `size` bytes and return their address.
    fn alloc(&mut self, size: u64) -> Result<u64, FormatError>;

    /// Release a block. Freed space may be handed out again by `alloc`.
    fn free(&mut self, addr: u64, size: u64);

    /// Resize a block, moving it when it cannot grow in place.
    ///
    /// The contents up to `min(old_size, new_size)` are preserved.
    fn realloc(&mut self, addr: u64, old_size: u64, new_size: u64) -> Result<u64, FormatError>;

    /// Borrow `len` bytes at `addr`.
    fn read(&self, addr: u64, len: usize) -> Result<&[u8], FormatError>;

    /// Overwrite bytes at `addr`. The range must have been allocated.
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), FormatError>;

    /// First address past the end of the image.
    fn eof(&self) -> u64;
}

/// In-memory file image with first-fit reuse of freed blocks.
#[derive(Debug, Clone)]
pub struct MemStorage {
    image: Vec<u8>,
    free_blocks: Vec<(u64, u64)>,
    limit: u64,
}

impl MemStorage {
    /// Empty image whose addresses may not exceed `limit`.
    pub fn new(limit: u64) -> Self {
        MemStorage {
            image: Vec::new(),
            free_blocks: Vec::new(),
            limit,
        }
    }

    /// Wrap an existing file image.
    pub fn from_bytes(image: Vec<u8>, limit: u64) -> Self {
        MemStorage {
            image,
            free_blocks: Vec::new(),
            limit,
        }
    }

    /// The full image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.image
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.image
    }

    /// Total bytes currently on the free list.
    pub fn free_bytes(&self) -> u64 {
        self.free_blocks.iter().map(|&(_, s)| s).sum()
    }

    fn check_range(&self, addr: u64, len: u64) -> Result<(usize, usize), FormatError> {
        let end = addr.checked_add(len).unwrap_or(u64::MAX);
        if end > self.image.len() as u64 {
            return Err(FormatError::UnexpectedEof {
                expected: end.min(usize::MAX as u64) as usize,
                available: self.image.len(),
            });
        }
        Ok((addr as usize, end as usize))
    }

    fn grow(&mut self, size: u64) -> Result<u64, FormatError> {
        let addr = self.image.len() as u64;
        let end = addr.checked_add(size).unwrap_or(u64::MAX);
        if end > self.limit {
            return Err(FormatError::OutOfSpace {
                requested: size,
                limit: self.limit,
            });
        }
        self.image.resize(end as usize, 0);
        Ok(addr)
    }
}

impl Storage for MemStorage {
    fn alloc(&mut self, size: u64) -> Result<u64, FormatError> {
        if let Some(i) = self.free_blocks.iter().position(|&(_, s)| s >= size) {
            let (addr, s) = self.free_blocks[i];
            if s == size {
                self.free_blocks.remove(i);
            } else {
                self.free_blocks[i] = (addr + size, s - size);
            }
            let (start, end) = self.check_range(addr, size)?;
            self.image[start..end].fill(0);
            trace!("alloc {size} bytes at {addr:#x} (reused)");
            return Ok(addr);
        }
        let addr = self.grow(size)?;
        trace!("alloc {size} bytes at {addr:#x}");
        Ok(addr)
    }

    fn free(&mut self, addr: u64, size: u64) {
        if size == 0 {
            return;
        }
        // A block at the end of the image shrinks it instead.
        if addr + size == self.image.len() as u64 {
            self.image.truncate(addr as usize);
            // Trailing free blocks may now touch the end as well.
            while let Some(i) = self
                .free_blocks
                .iter()
                .position(|&(a, s)| a + s == self.image.len() as u64)
            {
                let (a, _) = self.free_blocks.remove(i);
                self.image.truncate(a as usize);
            }
            return;
        }
        let mut addr = addr;
        let mut size = size;
        if let Some(i) = self.free_blocks.iter().position(|&(a, s)| a + s == addr) {
            let (a, s) = self.free_blocks.remove(i);
            addr = a;
            size += s;
        }
        if let Some(i) = self.free_blocks.iter().position(|&(a, _)| a == addr + size) {
            let (_, s) = self.free_blocks.remove(i);
            size += s;
        }
        self.free_blocks.push((addr, size));
    }

    fn realloc(&mut self, addr: u64, old_size: u64, new_size: u64) -> Result<u64, FormatError> {
        if new_size <= old_size {
            self.free(addr + new_size, old_size - new_size);
            return Ok(addr);
        }
        // The last block of the image can grow in place.
        if addr + old_size == self.image.len() as u64 {
            self.grow(new_size - old_size)?;
            return Ok(addr);
        }
        let (start, end) = self.check_range(addr, old_size)?;
        let contents = self.image[start..end].to_vec();
        let new_addr = self.alloc(new_size)?;
        self.write(new_addr, &contents)?;
        self.free(addr, old_size);
        Ok(new_addr)
    }

    fn read(&self, addr: u64, len: usize) -> Result<&[u8], FormatError> {
        let (start, end) = self.check_range(addr, len as u64)?;
        Ok(&self.image[start..end])
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), FormatError> {
        let (start, end) = self.check_range(addr, data.len() as u64)?;
        self.image[start..end].copy_from_slice(data);
        Ok(())
    }

    fn eof(&self) -> u64 {
        self.image.len() as u64
    }
}
