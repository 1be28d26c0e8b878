//! HDF5 Local Heap: per-group storage for link names and soft-link values.
//!
//! The heap is a header plus one contiguous data segment. Free space inside
//! the segment is threaded into a singly linked list whose records live in
//! the free spans themselves: `next offset (L)` followed by `size (L)`. All
//! allocations are multiples of 8 bytes.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use log::{debug, warn};

use crate::codec::{align8, Reader, Sizes, Writer};
use crate::error::FormatError;
use crate::storage::Storage;

/// "HEAP" signature.
pub const HEAP_SIGNATURE: [u8; 4] = *b"HEAP";

/// Free-list terminator. Offset 1 can never start an 8-aligned span.
pub const FREE_NULL: u64 = 1;

/// One span on the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpan {
    pub offset: u64,
    pub size: u64,
}

/// A local heap loaded into memory.
///
/// Mutations touch only the in-memory image; [`LocalHeap::flush`] writes the
/// header, data segment and free list back to storage.
#[derive(Debug, Clone)]
pub struct LocalHeap {
    addr: u64,
    data_addr: u64,
    data: Vec<u8>,
    free: Vec<FreeSpan>,
    sizes: Sizes,
    dirty: bool,
}

/// Encoded size of the heap header.
pub fn header_size(sizes: Sizes) -> usize {
    // signature(4) + version(1) + reserved(3) + data size + free head + data address
    8 + 2 * sizes.ls() + sizes.os()
}

impl LocalHeap {
    /// Smallest span the free list can describe.
    fn sizeof_free(&self) -> u64 {
        2 * self.sizes.length as u64
    }

    /// Allocate a new heap with room for at least `size_hint` bytes and put
    /// the empty string at offset 0.
    pub fn create(
        store: &mut dyn Storage,
        sizes: Sizes,
        size_hint: u64,
    ) -> Result<LocalHeap, FormatError> {
        // Room for the empty string plus one trackable free span.
        let min = align8(2 * sizes.length as u64 + 8);
        let size = align8(size_hint.max(min));
        let hdr = header_size(sizes) as u64;
        let addr = store.alloc(hdr + size)?;
        let mut heap = LocalHeap {
            addr,
            data_addr: addr + hdr,
            data: vec![0u8; size as usize],
            free: vec![FreeSpan { offset: 0, size }],
            sizes,
            dirty: true,
        };
        let empty = heap.insert(store, b"\0")?;
        debug_assert_eq!(empty, 0);
        heap.flush(store)?;
        debug!("created local heap at {addr:#x} ({size} bytes)");
        Ok(heap)
    }

    /// Read the heap whose header is at `addr`.
    pub fn load(store: &dyn Storage, sizes: Sizes, addr: u64) -> Result<LocalHeap, FormatError> {
        let raw = store.read(addr, header_size(sizes))?;
        let mut r = Reader::new(raw, sizes);
        r.expect_signature(&HEAP_SIGNATURE, FormatError::InvalidLocalHeapSignature)?;
        let version = r.u8()?;
        if version != 0 {
            return Err(FormatError::InvalidLocalHeapVersion(version));
        }
        r.skip(3)?;
        let data_size = r.length()?;
        let free_head = r.length()?;
        let data_addr = r.defined_address("heap data segment")?;

        let data = store.read(data_addr, data_size as usize)?.to_vec();
        let ls = sizes.ls();
        let max_spans = data.len() / (2 * ls) + 1;
        let mut free = Vec::new();
        let mut next = free_head;
        while next != FREE_NULL {
            if free.len() >= max_spans {
                return Err(FormatError::CorruptIndex("local heap free list cycles".into()));
            }
            let off = next as usize;
            if off.checked_add(2 * ls).map_or(true, |end| end > data.len()) {
                return Err(FormatError::CorruptIndex(format!(
                    "free list entry at {off} outside heap of {} bytes",
                    data.len()
                )));
            }
            let mut fr = Reader::new(&data[off..off + 2 * ls], sizes);
            next = fr.length()?;
            let size = fr.length()?;
            if next != FREE_NULL && next % 8 != 0 || (off as u64).saturating_add(size) > data_size {
                return Err(FormatError::CorruptIndex(format!(
                    "bad free span at {off} (size {size})"
                )));
            }
            free.push(FreeSpan {
                offset: off as u64,
                size,
            });
        }

        Ok(LocalHeap {
            addr,
            data_addr,
            data,
            free,
            sizes,
            dirty: false,
        })
    }

    /// Write the header and data segment if anything changed.
    pub fn flush(&mut self, store: &mut dyn Storage) -> Result<(), FormatError> {
        if !self.dirty {
            return Ok(());
        }
        // Thread the free list through the spans.
        for (i, span) in self.free.iter().enumerate() {
            let next = self.free.get(i + 1).map_or(FREE_NULL, |s| s.offset);
            let mut w = Writer::with_capacity(self.sizes, 2 * self.sizes.ls());
            w.length(next);
            w.length(span.size);
            let rec = w.finish();
            let off = span.offset as usize;
            self.data[off..off + rec.len()].copy_from_slice(&rec);
        }
        store.write(self.data_addr, &self.data)?;

        let mut w = Writer::with_capacity(self.sizes, header_size(self.sizes));
        w.bytes(&HEAP_SIGNATURE);
        w.u8(0);
        w.zeros(3);
        w.length(self.data.len() as u64);
        w.length(self.free.first().map_or(FREE_NULL, |s| s.offset));
        w.address(Some(self.data_addr));
        store.write(self.addr, &w.finish())?;
        self.dirty = false;
        Ok(())
    }

    /// Copy `bytes` into the heap and return their offset.
    ///
    /// Callers storing strings include the terminating NUL.
    pub fn insert(&mut self, store: &mut dyn Storage, bytes: &[u8]) -> Result<u64, FormatError> {
        let need = align8(bytes.len().max(1) as u64);
        let sizeof_free = self.sizeof_free();

        let mut found = None;
        let mut last: Option<usize> = None;
        for i in 0..self.free.len() {
            let span = self.free[i];
            if span.size > need && span.size - need >= sizeof_free {
                self.free[i].offset += need;
                self.free[i].size -= need;
                found = Some(span.offset);
                break;
            } else if span.size == need {
                self.free.remove(i);
                found = Some(span.offset);
                break;
            } else if last.map_or(true, |l| self.free[l].offset < span.offset) {
                last = Some(i);
            }
        }

        let offset = match found {
            Some(off) => off,
            None => self.grow(store, need, last)?,
        };

        let start = offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.data[start + bytes.len()..start + need as usize].fill(0);
        self.dirty = true;
        Ok(offset)
    }

    /// Insert a string with its NUL terminator.
    pub fn insert_str(&mut self, store: &mut dyn Storage, s: &str) -> Result<u64, FormatError> {
        let mut buf = Vec::with_capacity(s.len() + 1);
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
        self.insert(store, &buf)
    }

    /// Enlarge the data segment so `need` bytes fit, returning their offset.
    fn grow(
        &mut self,
        store: &mut dyn Storage,
        need: u64,
        last: Option<usize>,
    ) -> Result<u64, FormatError> {
        let old = self.data.len() as u64;
        let tail = last.filter(|&l| {
            let s = self.free[l];
            s.offset + s.size == old
        });
        let need_more = match tail {
            Some(l) => need.saturating_sub(self.free[l].size),
            None => need,
        }
        .max(old);
        let new_size = old + need_more;
        if new_size > self.sizes.max_length() {
            return Err(FormatError::OutOfSpace {
                requested: new_size,
                limit: self.sizes.max_length(),
            });
        }

        // Nothing changes in memory unless the storage could grow.
        let new_addr = store.realloc(self.data_addr, old, new_size)?;

        let sizeof_free = self.sizeof_free();
        let offset = match tail {
            Some(l) => {
                let off = self.free[l].offset;
                self.free[l].offset += need;
                self.free[l].size = self.free[l].size + need_more - need;
                if self.free[l].size < sizeof_free {
                    self.free.remove(l);
                }
                off
            }
            None => {
                let rest = need_more - need;
                if rest >= sizeof_free {
                    self.free.push(FreeSpan {
                        offset: old + need,
                        size: rest,
                    });
                }
                old
            }
        };

        if new_addr != self.data_addr {
            debug!(
                "local heap {:#x}: data segment moved {:#x} -> {new_addr:#x}",
                self.addr, self.data_addr
            );
        }
        debug!("local heap {:#x}: grew {old} -> {new_size} bytes", self.addr);
        self.data_addr = new_addr;
        self.data.resize(new_size as usize, 0);
        self.dirty = true;
        Ok(offset)
    }

    /// Borrow the heap bytes starting at `offset`.
    pub fn peek(&self, offset: u64) -> Result<&[u8], FormatError> {
        let off = offset as usize;
        if offset >= self.data.len() as u64 {
            return Err(FormatError::CorruptIndex(format!(
                "heap offset {offset} beyond {} bytes",
                self.data.len()
            )));
        }
        Ok(&self.data[off..])
    }

    /// Borrow the NUL-terminated byte string at `offset`, without the NUL.
    pub fn peek_name(&self, offset: u64) -> Result<&[u8], FormatError> {
        let tail = self.peek(offset)?;
        match tail.iter().position(|&b| b == 0) {
            Some(end) => Ok(&tail[..end]),
            None => Err(FormatError::CorruptIndex(format!(
                "unterminated heap string at {offset}"
            ))),
        }
    }

    /// Borrow the NUL-terminated UTF-8 string at `offset`.
    pub fn peek_str(&self, offset: u64) -> Result<&str, FormatError> {
        let bytes = self.peek_name(offset)?;
        core::str::from_utf8(bytes)
            .map_err(|_| FormatError::CorruptIndex(format!("heap string at {offset} is not UTF-8")))
    }

    /// Return `size` bytes at `offset` to the free list.
    pub fn remove(&mut self, offset: u64, size: u64) -> Result<(), FormatError> {
        let size = align8(size.max(1));
        if offset % 8 != 0 || offset + size > self.data.len() as u64 {
            return Err(FormatError::CorruptIndex(format!(
                "cannot free {size} bytes at heap offset {offset}"
            )));
        }
        self.dirty = true;
        self.data[offset as usize..(offset + size) as usize].fill(0);

        for i in 0..self.free.len() {
            let span = self.free[i];
            if offset + size == span.offset {
                self.free[i].offset = offset;
                self.free[i].size += size;
                let merged = self.free[i];
                if let Some(j) = self
                    .free
                    .iter()
                    .position(|s| s.offset + s.size == merged.offset)
                {
                    self.free[j].size += merged.size;
                    self.free.remove(i);
                }
                return Ok(());
            }
            if span.offset + span.size == offset {
                self.free[i].size += size;
                let merged = self.free[i];
                if let Some(j) = self
                    .free
                    .iter()
                    .position(|s| merged.offset + merged.size == s.offset)
                {
                    self.free[i].size += self.free[j].size;
                    self.free.remove(j);
                }
                return Ok(());
            }
        }

        if size < self.sizeof_free() {
            warn!(
                "local heap {:#x}: {size} bytes at {offset} too small to track, lost",
                self.addr
            );
            return Ok(());
        }
        self.free.insert(0, FreeSpan { offset, size });
        Ok(())
    }

    /// Header address.
    pub fn address(&self) -> u64 {
        self.addr
    }

    /// Current data segment address.
    pub fn data_address(&self) -> u64 {
        self.data_addr
    }

    /// Data segment size in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Free spans in list order.
    pub fn free_spans(&self) -> &[FreeSpan] {
        &self.free
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn new_heap(sizes: Sizes, hint: u64) -> (MemStorage, LocalHeap) {
        let mut store = MemStorage::new(u64::MAX);
        let heap = LocalHeap::create(&mut store, sizes, hint).unwrap();
        (store, heap)
    }

    #[test]
    fn offset_zero_is_empty_string() {
        let (_store, heap) = new_heap(Sizes::default(), 64);
        assert_eq!(heap.peek_str(0).unwrap(), "");
        assert_eq!(heap.free_spans(), &[FreeSpan { offset: 8, size: 56 }]);
    }

    #[test]
    fn insert_then_peek() {
        let (mut store, mut heap) = new_heap(Sizes::default(), 64);
        let a = heap.insert_str(&mut store, "alpha").unwrap();
        let b = heap.insert_str(&mut store, "beta").unwrap();
        assert_eq!((a, b), (8, 16));
        assert_eq!(heap.peek_str(a).unwrap(), "alpha");
        assert_eq!(heap.peek_str(b).unwrap(), "beta");
    }

    #[test]
    fn exact_fit_consumes_the_span() {
        let (mut store, mut heap) = new_heap(Sizes::default(), 32);
        // 32 bytes: "" at 0, free span [8, 32)
        let off = heap.insert(&mut store, &[7u8; 24]).unwrap();
        assert_eq!(off, 8);
        assert!(heap.free_spans().is_empty());
        assert_eq!(heap.size(), 32);
    }

    #[test]
    fn grow_doubles_and_extends_tail_span() {
        let (mut store, mut heap) = new_heap(Sizes::default(), 32);
        // Remainder of 8 would be too small to track, so the tail span is
        // extended instead of split.
        let off = heap.insert(&mut store, &[1u8; 16]).unwrap();
        assert_eq!(off, 8);
        assert_eq!(heap.size(), 64);
        assert_eq!(heap.free_spans(), &[FreeSpan { offset: 24, size: 40 }]);
    }

    #[test]
    fn grow_appends_when_no_tail_span() {
        let (mut store, mut heap) = new_heap(Sizes::default(), 24);
        let a = heap.insert(&mut store, &[1u8; 16]).unwrap();
        assert_eq!(a, 8);
        assert!(heap.free_spans().is_empty());
        let b = heap.insert_str(&mut store, "grown").unwrap();
        assert_eq!(b, 24);
        assert_eq!(heap.size(), 48);
        assert_eq!(heap.free_spans(), &[FreeSpan { offset: 32, size: 16 }]);
        assert_eq!(heap.peek(a).unwrap()[0], 1);
        assert_eq!(heap.peek_str(b).unwrap(), "grown");
    }

    #[test]
    fn growth_relocates_data_segment() {
        let sizes = Sizes::default();
        let mut store = MemStorage::new(u64::MAX);
        let mut heap = LocalHeap::create(&mut store, sizes, 16).unwrap();
        let before = heap.data_address();
        // Something after the heap pins it in place.
        store.alloc(64).unwrap();
        let off = heap.insert_str(&mut store, "a-much-longer-name").unwrap();
        assert_ne!(heap.data_address(), before);
        heap.flush(&mut store).unwrap();

        let reloaded = LocalHeap::load(&store, sizes, heap.address()).unwrap();
        assert_eq!(reloaded.data_address(), heap.data_address());
        assert_eq!(reloaded.peek_str(off).unwrap(), "a-much-longer-name");
        assert_eq!(reloaded.peek_str(0).unwrap(), "");
    }

    #[test]
    fn failed_growth_leaves_heap_unchanged() {
        let sizes = Sizes::default();
        let mut store = MemStorage::new(header_size(sizes) as u64 + 24);
        let mut heap = LocalHeap::create(&mut store, sizes, 24).unwrap();
        let a = heap.insert(&mut store, &[7u8; 16]).unwrap();
        assert!(heap.free_spans().is_empty());

        let err = heap.insert(&mut store, b"overflow").unwrap_err();
        assert!(matches!(err, FormatError::OutOfSpace { .. }));
        assert!(heap.free_spans().is_empty());
        assert_eq!(heap.size(), 24);

        heap.flush(&mut store).unwrap();
        let reloaded = LocalHeap::load(&store, sizes, heap.address()).unwrap();
        assert_eq!(reloaded.peek(a).unwrap(), &[7u8; 16]);
        assert!(reloaded.free_spans().is_empty());
    }

    #[test]
    fn remove_coalesces_both_neighbours() {
        let (mut store, mut heap) = new_heap(Sizes::default(), 128);
        let a = heap.insert(&mut store, &[1u8; 16]).unwrap();
        let b = heap.insert(&mut store, &[2u8; 16]).unwrap();
        let c = heap.insert(&mut store, &[3u8; 16]).unwrap();
        assert_eq!((a, b, c), (8, 24, 40));
        heap.remove(a, 16).unwrap();
        heap.remove(c, 16).unwrap();
        // c merged with the trailing span
        assert_eq!(
            heap.free_spans(),
            &[FreeSpan { offset: 8, size: 16 }, FreeSpan { offset: 40, size: 88 }]
        );
        heap.remove(b, 16).unwrap();
        assert_eq!(heap.free_spans(), &[FreeSpan { offset: 8, size: 120 }]);
    }

    #[test]
    fn small_isolated_span_is_dropped() {
        let (mut store, mut heap) = new_heap(Sizes::default(), 64);
        let a = heap.insert(&mut store, &[1u8; 8]).unwrap();
        let _b = heap.insert(&mut store, &[2u8; 8]).unwrap();
        heap.remove(a, 8).unwrap();
        assert!(heap.free_spans().iter().all(|s| s.offset != a));
    }

    #[test]
    fn flush_load_round_trip_keeps_free_list() {
        let sizes = Sizes::new(4, 4).unwrap();
        let (mut store, mut heap) = new_heap(sizes, 96);
        let a = heap.insert_str(&mut store, "one").unwrap();
        let b = heap.insert_str(&mut store, "two").unwrap();
        let _c = heap.insert_str(&mut store, "three").unwrap();
        heap.remove(b, 4).unwrap();
        heap.flush(&mut store).unwrap();
        assert!(!heap.is_dirty());

        let loaded = LocalHeap::load(&store, sizes, heap.address()).unwrap();
        assert_eq!(loaded.free_spans(), heap.free_spans());
        assert_eq!(loaded.peek_str(a).unwrap(), "one");
        assert_eq!(loaded.size(), heap.size());
    }

    #[test]
    fn invalid_signature() {
        let (mut store, heap) = new_heap(Sizes::default(), 32);
        store.write(heap.address(), b"XEAP").unwrap();
        let err = LocalHeap::load(&store, Sizes::default(), heap.address()).unwrap_err();
        assert_eq!(err, FormatError::InvalidLocalHeapSignature);
    }

    #[test]
    fn invalid_version() {
        let (mut store, heap) = new_heap(Sizes::default(), 32);
        store.write(heap.address() + 4, &[1]).unwrap();
        let err = LocalHeap::load(&store, Sizes::default(), heap.address()).unwrap_err();
        assert_eq!(err, FormatError::InvalidLocalHeapVersion(1));
    }

    #[test]
    fn peek_past_end_is_corrupt() {
        let (_store, heap) = new_heap(Sizes::default(), 32);
        let err = heap.peek_str(4096).unwrap_err();
        assert!(matches!(err, FormatError::CorruptIndex(_)));
    }
}
