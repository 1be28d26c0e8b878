//! Symbol table nodes (SNOD) and the B-tree class that indexes them.
//!
//! A group's B-tree has SNODs as its leaf-level children. Keys are offsets of
//! names in the group's local heap: child `i` holds names `n` with
//! `name(key[i]) < n <= name(key[i + 1])`. The leftmost key is the empty
//! string at heap offset 0.

#[cfg(not(feature = "std"))]
use alloc::{string::String, vec::Vec};

use core::cmp::Ordering;

use log::{debug, trace};

use crate::btree::{Bracket, BTreeClass, InsertOp, InsertOutcome, RemoveOutcome};
use crate::codec::{Reader, Sizes, Writer};
use crate::entry::SymbolEntry;
use crate::error::FormatError;
use crate::local_heap::LocalHeap;
use crate::storage::Storage;

/// "SNOD" signature.
pub const SNOD_SIGNATURE: [u8; 4] = *b"SNOD";

/// Symbol table node version.
pub const SNOD_VERSION: u8 = 1;

/// B-tree node type for group indexes.
pub const GROUP_NODE_TYPE: u8 = 0;

/// A decoded symbol table node: entries sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SymbolNode {
    pub entries: Vec<SymbolEntry>,
}

impl SymbolNode {
    /// Encoded size of a node holding up to `2 * leaf_k` entries.
    pub fn size(sizes: Sizes, leaf_k: usize) -> usize {
        8 + 2 * leaf_k * SymbolEntry::encoded_size(sizes)
    }

    pub fn encode(&self, sizes: Sizes, leaf_k: usize) -> Vec<u8> {
        let size = Self::size(sizes, leaf_k);
        let mut w = Writer::with_capacity(sizes, size);
        w.bytes(&SNOD_SIGNATURE);
        w.u8(SNOD_VERSION);
        w.u8(0);
        w.u16(self.entries.len() as u16);
        for e in &self.entries {
            e.encode(&mut w);
        }
        w.pad_to(size);
        w.finish()
    }

    pub fn decode(raw: &[u8], sizes: Sizes, leaf_k: usize) -> Result<SymbolNode, FormatError> {
        let mut r = Reader::new(raw, sizes);
        r.expect_signature(&SNOD_SIGNATURE, FormatError::InvalidSymbolTableNodeSignature)?;
        let version = r.u8()?;
        if version != SNOD_VERSION {
            return Err(FormatError::InvalidSymbolTableNodeVersion(version));
        }
        r.skip(1)?;
        let n = r.u16()? as usize;
        if n > 2 * leaf_k {
            return Err(FormatError::CorruptIndex(format!(
                "symbol table node holds {n} entries, capacity {}",
                2 * leaf_k
            )));
        }
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            entries.push(SymbolEntry::decode(&mut r)?);
        }
        Ok(SymbolNode { entries })
    }

    pub fn load(
        store: &dyn Storage,
        sizes: Sizes,
        leaf_k: usize,
        addr: u64,
    ) -> Result<SymbolNode, FormatError> {
        let raw = store.read(addr, Self::size(sizes, leaf_k))?;
        Self::decode(raw, sizes, leaf_k)
    }

    pub fn save(
        &self,
        store: &mut dyn Storage,
        sizes: Sizes,
        leaf_k: usize,
        addr: u64,
    ) -> Result<(), FormatError> {
        store.write(addr, &self.encode(sizes, leaf_k))
    }
}

/// Caller data for one group index operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameProbe {
    pub name: String,
    /// Entry to insert, or the entry found / removed.
    pub entry: SymbolEntry,
}

impl NameProbe {
    pub fn new(name: &str) -> Self {
        NameProbe {
            name: name.into(),
            entry: SymbolEntry::default(),
        }
    }

    pub fn with_entry(name: &str, entry: SymbolEntry) -> Self {
        NameProbe {
            name: name.into(),
            entry,
        }
    }
}

/// One iterated group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub name: String,
    pub entry: SymbolEntry,
}

/// The group B-tree class, bound to one group's local heap.
pub struct GroupNodeClass<'h> {
    heap: &'h mut LocalHeap,
    sizes: Sizes,
    leaf_k: usize,
}

impl<'h> GroupNodeClass<'h> {
    pub fn new(heap: &'h mut LocalHeap, sizes: Sizes, leaf_k: usize) -> Self {
        GroupNodeClass {
            heap,
            sizes,
            leaf_k,
        }
    }

    fn name_at(&self, offset: u64) -> Result<&[u8], FormatError> {
        self.heap.peek_name(offset)
    }

    fn load(&self, store: &dyn Storage, addr: u64) -> Result<SymbolNode, FormatError> {
        SymbolNode::load(store, self.sizes, self.leaf_k, addr)
    }

    fn save(
        &self,
        store: &mut dyn Storage,
        addr: u64,
        node: &SymbolNode,
    ) -> Result<(), FormatError> {
        node.save(store, self.sizes, self.leaf_k, addr)
    }

    /// `Ok(i)` when the name is at `i`, `Err(i)` for its insertion point.
    fn search(&self, node: &SymbolNode, name: &[u8]) -> Result<Result<usize, usize>, FormatError> {
        let (mut lt, mut rt) = (0usize, node.entries.len());
        while lt < rt {
            let idx = (lt + rt) / 2;
            match name.cmp(self.name_at(node.entries[idx].name_offset)?) {
                Ordering::Less => rt = idx,
                Ordering::Greater => lt = idx + 1,
                Ordering::Equal => return Ok(Ok(idx)),
            }
        }
        Ok(Err(lt))
    }
}

impl BTreeClass for GroupNodeClass<'_> {
    type Key = u64;
    type Udata = NameProbe;
    type Item = GroupMember;

    const NODE_TYPE: u8 = GROUP_NODE_TYPE;
    const FOLLOW_MIN: bool = true;
    const FOLLOW_MAX: bool = true;

    fn sizes(&self) -> Sizes {
        self.sizes
    }

    fn key_size(&self) -> usize {
        self.sizes.ls()
    }

    fn encode_key(&self, w: &mut Writer, key: &u64) {
        w.length(*key);
    }

    fn decode_key(&self, r: &mut Reader<'_>) -> Result<u64, FormatError> {
        r.length()
    }

    fn empty_key(&self) -> u64 {
        0
    }

    fn cmp_keys(&self, a: &u64, b: &u64) -> Result<Ordering, FormatError> {
        Ok(self.name_at(*a)?.cmp(self.name_at(*b)?))
    }

    fn cmp3(&self, left: &u64, udata: &NameProbe, right: &u64) -> Result<Ordering, FormatError> {
        let name = udata.name.as_bytes();
        if name <= self.name_at(*left)? {
            Ok(Ordering::Less)
        } else if name > self.name_at(*right)? {
            Ok(Ordering::Greater)
        } else {
            Ok(Ordering::Equal)
        }
    }

    fn found(
        &mut self,
        store: &dyn Storage,
        child: u64,
        _left: &u64,
        udata: &mut NameProbe,
    ) -> Result<bool, FormatError> {
        let node = self.load(store, child)?;
        match self.search(&node, udata.name.as_bytes())? {
            Ok(i) => {
                udata.entry = node.entries[i];
                trace!("found {:?} in symbol node {child:#x}", udata.name);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn new_node(
        &mut self,
        store: &mut dyn Storage,
        op: InsertOp,
        bracket: &mut Bracket<u64>,
        _udata: &mut NameProbe,
    ) -> Result<u64, FormatError> {
        let addr = store.alloc(SymbolNode::size(self.sizes, self.leaf_k) as u64)?;
        self.save(store, addr, &SymbolNode::default())?;
        if op == InsertOp::First {
            bracket.left = 0;
            bracket.right = 0;
        }
        Ok(addr)
    }

    fn insert(
        &mut self,
        store: &mut dyn Storage,
        child: u64,
        bracket: &mut Bracket<u64>,
        md: &mut u64,
        udata: &mut NameProbe,
    ) -> Result<InsertOutcome, FormatError> {
        let mut node = self.load(store, child)?;
        let idx = match self.search(&node, udata.name.as_bytes())? {
            Ok(_) => return Err(FormatError::AlreadyExists(udata.name.clone())),
            Err(i) => i,
        };

        let offset = self.heap.insert_str(store, &udata.name)?;
        let mut entry = udata.entry;
        entry.name_offset = offset;
        udata.entry = entry;

        let n = node.entries.len();
        if idx == n {
            bracket.right = offset;
            bracket.right_changed = true;
        }

        if n < 2 * self.leaf_k {
            node.entries.insert(idx, entry);
            self.save(store, child, &node)?;
            return Ok(InsertOutcome::Noop);
        }

        // Full: move the upper half to a new right sibling.
        let mut right = SymbolNode {
            entries: node.entries.split_off(self.leaf_k),
        };
        if idx <= self.leaf_k {
            node.entries.insert(idx, entry);
        } else {
            right.entries.insert(idx - self.leaf_k, entry);
        }
        let right_addr = store.alloc(SymbolNode::size(self.sizes, self.leaf_k) as u64)?;
        self.save(store, child, &node)?;
        self.save(store, right_addr, &right)?;
        if let Some(last) = node.entries.last() {
            *md = last.name_offset;
        }
        debug!(
            "symbol node {child:#x} split {} + {} -> {right_addr:#x}",
            node.entries.len(),
            right.entries.len()
        );
        Ok(InsertOutcome::Right(right_addr))
    }

    fn remove(
        &mut self,
        store: &mut dyn Storage,
        child: u64,
        bracket: &mut Bracket<u64>,
        udata: &mut NameProbe,
    ) -> Result<RemoveOutcome, FormatError> {
        let mut node = self.load(store, child)?;
        let idx = match self.search(&node, udata.name.as_bytes())? {
            Ok(i) => i,
            Err(_) => return Err(FormatError::NotFound(udata.name.clone())),
        };
        udata.entry = node.entries.remove(idx);

        if node.entries.is_empty() {
            store.free(child, SymbolNode::size(self.sizes, self.leaf_k) as u64);
            trace!("symbol node {child:#x} emptied");
            return Ok(RemoveOutcome::Remove);
        }
        if idx == node.entries.len() {
            if let Some(last) = node.entries.last() {
                bracket.right = last.name_offset;
                bracket.right_changed = true;
            }
        }
        self.save(store, child, &node)?;
        Ok(RemoveOutcome::Noop)
    }

    fn items(&mut self, store: &dyn Storage, child: u64) -> Result<Vec<GroupMember>, FormatError> {
        let node = self.load(store, child)?;
        node.entries
            .iter()
            .map(|e| {
                Ok(GroupMember {
                    name: self.heap.peek_str(e.name_offset)?.into(),
                    entry: *e,
                })
            })
            .collect()
    }
}
