//! Symbol table entries: one named object's location inside a group.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::codec::{Reader, Sizes, Writer};
use crate::error::FormatError;

/// Cache type tag: nothing cached.
pub const CACHE_NOTHING: u32 = 0;
/// Cache type tag: the entry names a group.
pub const CACHE_SYMBOL_TABLE: u32 = 1;
/// Cache type tag: the entry is a soft link.
pub const CACHE_SYMBOLIC_LINK: u32 = 2;

/// Bytes of the scratch pad following the cache type.
pub const SCRATCH_SIZE: usize = 16;

/// Extra metadata carried inline by an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryCache {
    #[default]
    Nothing,
    /// The target is a group whose symbol table lives here.
    SymbolTable { btree: u64, heap: u64 },
    /// Heap offset (in the holding group's heap) of the link value.
    SymbolicLink { value_offset: u32 },
}

impl EntryCache {
    pub fn type_code(&self) -> u32 {
        match self {
            EntryCache::Nothing => CACHE_NOTHING,
            EntryCache::SymbolTable { .. } => CACHE_SYMBOL_TABLE,
            EntryCache::SymbolicLink { .. } => CACHE_SYMBOLIC_LINK,
        }
    }
}

/// A symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolEntry {
    /// Offset of the link name in the holding group's heap.
    pub name_offset: u64,
    /// Object header address; `None` for soft links.
    pub header: Option<u64>,
    pub cache: EntryCache,
}

impl SymbolEntry {
    /// Entry for an object header with nothing cached.
    pub fn object(header: u64) -> Self {
        SymbolEntry {
            name_offset: 0,
            header: Some(header),
            cache: EntryCache::Nothing,
        }
    }

    /// Entry for a group.
    pub fn group(header: u64, btree: u64, heap: u64) -> Self {
        SymbolEntry {
            name_offset: 0,
            header: Some(header),
            cache: EntryCache::SymbolTable { btree, heap },
        }
    }

    /// Entry for a soft link whose value sits at `value_offset`.
    pub fn soft_link(value_offset: u32) -> Self {
        SymbolEntry {
            name_offset: 0,
            header: None,
            cache: EntryCache::SymbolicLink { value_offset },
        }
    }

    pub fn is_soft_link(&self) -> bool {
        matches!(self.cache, EntryCache::SymbolicLink { .. })
    }

    /// Cached `(btree, heap)` pair when the entry names a group.
    pub fn symbol_table(&self) -> Option<(u64, u64)> {
        match self.cache {
            EntryCache::SymbolTable { btree, heap } => Some((btree, heap)),
            _ => None,
        }
    }

    /// Same object (header address and cache), ignoring the name.
    pub fn same_object(&self, other: &SymbolEntry) -> bool {
        self.header == other.header && self.cache == other.cache
    }

    /// Encoded size: `L + A + 24`.
    pub fn encoded_size(sizes: Sizes) -> usize {
        sizes.ls() + sizes.os() + 8 + SCRATCH_SIZE
    }

    pub fn encode(&self, w: &mut Writer) {
        w.length(self.name_offset);
        w.address(self.header);
        w.u32(self.cache.type_code());
        w.u32(0);
        let start = w.len();
        match self.cache {
            EntryCache::Nothing => {}
            EntryCache::SymbolTable { btree, heap } => {
                w.address(Some(btree));
                w.address(Some(heap));
            }
            EntryCache::SymbolicLink { value_offset } => w.u32(value_offset),
        }
        w.pad_to(start + SCRATCH_SIZE);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<SymbolEntry, FormatError> {
        let name_offset = r.length()?;
        let header = r.address()?;
        let cache_type = r.u32()?;
        r.skip(4)?;
        let scratch = r.bytes(SCRATCH_SIZE)?;
        let mut s = Reader::new(scratch, r.sizes());
        let cache = match cache_type {
            CACHE_NOTHING => EntryCache::Nothing,
            CACHE_SYMBOL_TABLE => EntryCache::SymbolTable {
                btree: s.defined_address("cached B-tree")?,
                heap: s.defined_address("cached heap")?,
            },
            CACHE_SYMBOLIC_LINK => EntryCache::SymbolicLink {
                value_offset: s.u32()?,
            },
            other => return Err(FormatError::InvalidCacheType(other)),
        };
        Ok(SymbolEntry {
            name_offset,
            header,
            cache,
        })
    }

    /// Encode into a standalone buffer.
    pub fn to_bytes(&self, sizes: Sizes) -> Vec<u8> {
        let mut w = Writer::with_capacity(sizes, Self::encoded_size(sizes));
        self.encode(&mut w);
        w.finish()
    }
}
