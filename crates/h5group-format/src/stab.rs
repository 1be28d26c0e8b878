//! Symbol tables: a group's name -> entry mapping over a heap + B-tree pair.

#[cfg(not(feature = "std"))]
use alloc::{string::String, vec::Vec};

use log::{debug, trace};

use crate::btree::{BTree, BTreeParams};
use crate::codec::Sizes;
use crate::entry::{EntryCache, SymbolEntry};
use crate::error::FormatError;
use crate::group_node::{GroupMember, GroupNodeClass, NameProbe};
use crate::local_heap::LocalHeap;
use crate::object_header::{ObjectHeader, SymbolTableMessage};
use crate::storage::Storage;

/// Per-file shape of symbol tables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabConfig {
    pub sizes: Sizes,
    /// Symbol table nodes hold up to `2 * leaf_k` entries.
    pub leaf_k: usize,
    pub btree: BTreeParams,
}

/// Create an empty group: local heap, B-tree and an object header carrying
/// the symbol-table message. The header starts with a link count of 0.
pub fn create(
    store: &mut dyn Storage,
    cfg: &StabConfig,
    size_hint: u64,
) -> Result<SymbolEntry, FormatError> {
    let mut heap = LocalHeap::create(store, cfg.sizes, size_hint)?;
    let tree = {
        let cls = GroupNodeClass::new(&mut heap, cfg.sizes, cfg.leaf_k);
        BTree::create(&cls, store, cfg.btree)?
    };
    let msg = SymbolTableMessage {
        btree_address: tree.address(),
        local_heap_address: heap.address(),
    };
    let header = ObjectHeader::new(vec![msg.to_message(cfg.sizes)]).create(store, cfg.sizes)?;
    debug!(
        "created group: header {header:#x}, B-tree {:#x}, heap {:#x}",
        tree.address(),
        heap.address()
    );
    Ok(SymbolEntry::group(header, tree.address(), heap.address()))
}

/// The group's B-tree and heap, from the entry cache or its object header.
pub fn table(
    store: &dyn Storage,
    cfg: &StabConfig,
    group: &SymbolEntry,
) -> Result<SymbolTableMessage, FormatError> {
    if let EntryCache::SymbolTable { btree, heap } = group.cache {
        return Ok(SymbolTableMessage {
            btree_address: btree,
            local_heap_address: heap,
        });
    }
    let Some(addr) = group.header else {
        return Err(FormatError::BadMessage("soft link is not a group".into()));
    };
    ObjectHeader::load(store, cfg.sizes, addr)?
        .symbol_table(cfg.sizes)?
        .ok_or_else(|| FormatError::BadMessage(format!("object {addr:#x} is not a group")))
}

fn open(
    store: &dyn Storage,
    cfg: &StabConfig,
    group: &SymbolEntry,
) -> Result<(BTree, LocalHeap), FormatError> {
    let msg = table(store, cfg, group)?;
    let heap = LocalHeap::load(store, cfg.sizes, msg.local_heap_address)?;
    Ok((BTree::open(msg.btree_address, cfg.btree), heap))
}

fn name_not_found(name: &str) -> impl FnOnce(FormatError) -> FormatError + '_ {
    move |e| {
        if e.is_not_found() {
            FormatError::NotFound(name.into())
        } else {
            e
        }
    }
}

/// Look `name` up in `group`.
pub fn find(
    store: &dyn Storage,
    cfg: &StabConfig,
    group: &SymbolEntry,
    name: &str,
) -> Result<SymbolEntry, FormatError> {
    let (tree, mut heap) = open(store, cfg, group)?;
    let mut cls = GroupNodeClass::new(&mut heap, cfg.sizes, cfg.leaf_k);
    let mut probe = NameProbe::new(name);
    tree.find(&mut cls, store, &mut probe)
        .map_err(name_not_found(name))?;
    trace!("stab find {name:?} -> {:?}", probe.entry.header);
    Ok(probe.entry)
}

/// Add `name -> entry` to `group`. Returns the stored entry, whose
/// `name_offset` points at the new heap copy of the name.
pub fn insert(
    store: &mut dyn Storage,
    cfg: &StabConfig,
    group: &SymbolEntry,
    name: &str,
    entry: SymbolEntry,
) -> Result<SymbolEntry, FormatError> {
    let (tree, mut heap) = open(store, cfg, group)?;
    let mut probe = NameProbe::with_entry(name, entry);
    let inserted = {
        let mut cls = GroupNodeClass::new(&mut heap, cfg.sizes, cfg.leaf_k);
        tree.insert(&mut cls, store, &mut probe)
    };
    // Flushed on failure too: a heap that grew has already left its old block.
    let flushed = heap.flush(store);
    inserted?;
    flushed?;
    trace!("stab insert {name:?} at heap offset {}", probe.entry.name_offset);
    Ok(probe.entry)
}

/// Remove `name` from `group`, returning the removed entry.
///
/// The name's heap span stays allocated.
pub fn remove(
    store: &mut dyn Storage,
    cfg: &StabConfig,
    group: &SymbolEntry,
    name: &str,
) -> Result<SymbolEntry, FormatError> {
    let (tree, mut heap) = open(store, cfg, group)?;
    let mut cls = GroupNodeClass::new(&mut heap, cfg.sizes, cfg.leaf_k);
    let mut probe = NameProbe::new(name);
    tree.remove(&mut cls, store, &mut probe)
        .map_err(name_not_found(name))?;
    trace!("stab remove {name:?}");
    Ok(probe.entry)
}

/// Visit members in name order; see [`BTree::iterate`].
pub fn iterate<F>(
    store: &dyn Storage,
    cfg: &StabConfig,
    group: &SymbolEntry,
    skip: usize,
    f: F,
) -> Result<i32, FormatError>
where
    F: FnMut(&GroupMember) -> i32,
{
    let (tree, mut heap) = open(store, cfg, group)?;
    let mut cls = GroupNodeClass::new(&mut heap, cfg.sizes, cfg.leaf_k);
    tree.iterate(&mut cls, store, skip, f)
}

/// All members in name order.
pub fn members(
    store: &dyn Storage,
    cfg: &StabConfig,
    group: &SymbolEntry,
) -> Result<Vec<GroupMember>, FormatError> {
    let mut out = Vec::new();
    iterate(store, cfg, group, 0, |m| {
        out.push(m.clone());
        0
    })?;
    Ok(out)
}

/// Store a soft-link value in `group`'s heap, returning its offset.
pub fn insert_value(
    store: &mut dyn Storage,
    cfg: &StabConfig,
    group: &SymbolEntry,
    value: &str,
) -> Result<u32, FormatError> {
    let (_, mut heap) = open(store, cfg, group)?;
    let offset = heap.insert_str(store, value)?;
    heap.flush(store)?;
    u32::try_from(offset).map_err(|_| FormatError::OutOfSpace {
        requested: offset,
        limit: u64::from(u32::MAX),
    })
}

/// Read the value of a soft link held by `group`.
pub fn link_value(
    store: &dyn Storage,
    cfg: &StabConfig,
    group: &SymbolEntry,
    link: &SymbolEntry,
) -> Result<String, FormatError> {
    let EntryCache::SymbolicLink { value_offset } = link.cache else {
        return Err(FormatError::BadMessage("entry is not a soft link".into()));
    };
    let (_, heap) = open(store, cfg, group)?;
    Ok(heap.peek_str(u64::from(value_offset))?.into())
}

/// Validate a group's index structure.
pub fn validate(
    store: &dyn Storage,
    cfg: &StabConfig,
    group: &SymbolEntry,
) -> Result<crate::btree::BTreeReport<u64>, FormatError> {
    let (tree, mut heap) = open(store, cfg, group)?;
    let cls = GroupNodeClass::new(&mut heap, cfg.sizes, cfg.leaf_k);
    tree.validate(&cls, store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_header::adjust_link_count;
    use crate::property_list::SplitRatios;
    use crate::storage::MemStorage;

    fn cfg() -> StabConfig {
        StabConfig {
            sizes: Sizes::default(),
            leaf_k: 2,
            btree: BTreeParams::new(2, SplitRatios::default()),
        }
    }

    #[test]
    fn find_after_insert_and_remove() {
        let cfg = cfg();
        let mut store = MemStorage::new(u64::MAX);
        let group = create(&mut store, &cfg, 64).unwrap();

        let stored = insert(&mut store, &cfg, &group, "data", SymbolEntry::object(0x900)).unwrap();
        assert_ne!(stored.name_offset, 0);
        let found = find(&store, &cfg, &group, "data").unwrap();
        assert_eq!(found, stored);

        let removed = remove(&mut store, &cfg, &group, "data").unwrap();
        assert_eq!(removed, stored);
        let err = find(&store, &cfg, &group, "data").unwrap_err();
        assert_eq!(err, FormatError::NotFound("data".into()));
    }

    #[test]
    fn remove_keeps_the_name_in_the_heap() {
        let cfg = cfg();
        let mut store = MemStorage::new(u64::MAX);
        let group = create(&mut store, &cfg, 64).unwrap();
        let stored = insert(&mut store, &cfg, &group, "kept", SymbolEntry::object(0x900)).unwrap();

        let heap_addr = table(&store, &cfg, &group).unwrap().local_heap_address;
        let before = LocalHeap::load(&store, cfg.sizes, heap_addr).unwrap();
        remove(&mut store, &cfg, &group, "kept").unwrap();
        let after = LocalHeap::load(&store, cfg.sizes, heap_addr).unwrap();

        // Lazy reclamation: the span is not returned to the free list.
        assert_eq!(after.free_spans(), before.free_spans());
        assert_eq!(after.peek_str(stored.name_offset).unwrap(), "kept");
    }

    #[test]
    fn members_are_sorted() {
        let cfg = cfg();
        let mut store = MemStorage::new(u64::MAX);
        let group = create(&mut store, &cfg, 64).unwrap();
        let names = ["pear", "apple", "fig", "kiwi", "banana", "cherry", "lime"];
        for (i, n) in names.iter().enumerate() {
            insert(&mut store, &cfg, &group, n, SymbolEntry::object(0x100 * i as u64)).unwrap();
        }
        let got: Vec<String> = members(&store, &cfg, &group)
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        let mut want: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        want.sort();
        assert_eq!(got, want);
        validate(&store, &cfg, &group).unwrap();

        let mut skipped = Vec::new();
        iterate(&store, &cfg, &group, 5, |m| {
            skipped.push(m.name.clone());
            0
        })
        .unwrap();
        assert_eq!(skipped, vec!["lime", "pear"]);
    }

    #[test]
    fn duplicate_insert() {
        let cfg = cfg();
        let mut store = MemStorage::new(u64::MAX);
        let group = create(&mut store, &cfg, 64).unwrap();
        insert(&mut store, &cfg, &group, "a", SymbolEntry::object(1)).unwrap();
        let err = insert(&mut store, &cfg, &group, "a", SymbolEntry::object(2)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);
    }

    #[test]
    fn non_group_entry_is_bad_message() {
        let cfg = cfg();
        let mut store = MemStorage::new(u64::MAX);
        let header = ObjectHeader::new(vec![]).create(&mut store, cfg.sizes).unwrap();
        let entry = SymbolEntry::object(header);
        let err = find(&store, &cfg, &entry, "x").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadMessage);
        let err = find(&store, &cfg, &SymbolEntry::soft_link(8), "x").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadMessage);
    }

    #[test]
    fn uncached_group_entry_reads_header() {
        let cfg = cfg();
        let mut store = MemStorage::new(u64::MAX);
        let group = create(&mut store, &cfg, 64).unwrap();
        insert(&mut store, &cfg, &group, "x", SymbolEntry::object(7)).unwrap();
        let bare = SymbolEntry::object(group.header.unwrap());
        assert_eq!(find(&store, &cfg, &bare, "x").unwrap().header, Some(7));
        adjust_link_count(&mut store, cfg.sizes, group.header.unwrap(), 1).unwrap();
        assert_eq!(find(&store, &cfg, &bare, "x").unwrap().header, Some(7));
    }

    #[test]
    fn soft_link_value_round_trip() {
        let cfg = cfg();
        let mut store = MemStorage::new(u64::MAX);
        let group = create(&mut store, &cfg, 64).unwrap();
        let off = insert_value(&mut store, &cfg, &group, "/a/b/c").unwrap();
        let link = insert(&mut store, &cfg, &group, "ln", SymbolEntry::soft_link(off)).unwrap();
        assert_eq!(link_value(&store, &cfg, &group, &link).unwrap(), "/a/b/c");
        let err = link_value(&store, &cfg, &group, &SymbolEntry::object(1)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadMessage);
    }

    #[test]
    fn many_members_force_heap_growth() {
        let cfg = cfg();
        let mut store = MemStorage::new(u64::MAX);
        let group = create(&mut store, &cfg, 32).unwrap();
        for i in 0..200u64 {
            insert(&mut store, &cfg, &group, &format!("member-{i:04}"), SymbolEntry::object(i)).unwrap();
        }
        for i in (0..200u64).step_by(17) {
            let e = find(&store, &cfg, &group, &format!("member-{i:04}")).unwrap();
            assert_eq!(e.header, Some(i));
        }
        assert_eq!(members(&store, &cfg, &group).unwrap().len(), 200);
        validate(&store, &cfg, &group).unwrap();
    }
}
