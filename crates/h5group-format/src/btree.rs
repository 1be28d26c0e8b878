//! HDF5 B-tree (version 1): a disk-resident B-link tree shared by all index
//! classes.
//!
//! The engine owns node layout, descent, splitting, merging and sibling
//! links. Everything that depends on what the tree indexes (key encoding,
//! key comparison, the content of the leaf-level children) is supplied by a
//! [`BTreeClass`] implementation.
//!
//! Child `i` of a node is bracketed by `keys[i]` and `keys[i + 1]`. A parent's
//! keys are authoritative: when descending, the child's outer keys are
//! replaced by the parent's bracketing keys before the child is used.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};

use core::cmp::Ordering;
use core::fmt;

use log::{debug, trace};

use crate::codec::{Reader, Sizes, Writer};
use crate::error::FormatError;
use crate::property_list::SplitRatios;
use crate::storage::Storage;

/// "TREE" signature.
pub const BTREE_SIGNATURE: [u8; 4] = *b"TREE";

/// Bytes before the key/child array: signature + type + level + entries used.
const NODE_PREFIX: usize = 8;

/// Why a class is asked to create a new leaf-level child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOp {
    /// The tree is empty.
    First,
    /// The new child goes left of every existing child.
    Left,
    /// The new child goes right of every existing child.
    Right,
}

/// Result of inserting into a leaf-level child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Nothing to do in the parent.
    Noop,
    /// The child moved to a new address.
    Change(u64),
    /// A new child was created immediately left of this one; `md` bounds it
    /// on the right.
    Left(u64),
    /// A new child was created immediately right of this one; `md` bounds it
    /// on the left.
    Right(u64),
}

/// Result of removing from a leaf-level child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Noop,
    /// The child moved to a new address.
    Change(u64),
    /// The child is empty and has been released by the class.
    Remove,
}

/// The two keys around one child, with flags the class sets when it
/// changes them.
#[derive(Debug, Clone)]
pub struct Bracket<K> {
    pub left: K,
    pub left_changed: bool,
    pub right: K,
    pub right_changed: bool,
}

impl<K> Bracket<K> {
    pub fn new(left: K, right: K) -> Self {
        Bracket {
            left,
            left_changed: false,
            right,
            right_changed: false,
        }
    }
}

/// One kind of B-tree index: how keys look and what leaf children hold.
pub trait BTreeClass {
    type Key: Clone + fmt::Debug;
    /// Per-operation caller data (the name being looked up, the entry being
    /// inserted, ...).
    type Udata;
    /// What iteration yields for each item stored under a leaf-level child.
    type Item;

    /// Node type byte written into every page of this class.
    const NODE_TYPE: u8;
    /// Targets below the leftmost key go into the leftmost child rather
    /// than a new one.
    const FOLLOW_MIN: bool;
    /// Targets above the rightmost key go into the rightmost child rather
    /// than a new one.
    const FOLLOW_MAX: bool;

    fn sizes(&self) -> Sizes;
    fn key_size(&self) -> usize;
    fn encode_key(&self, w: &mut Writer, key: &Self::Key);
    fn decode_key(&self, r: &mut Reader<'_>) -> Result<Self::Key, FormatError>;
    /// Key stored in a brand new, empty root.
    fn empty_key(&self) -> Self::Key;

    /// Order of two keys.
    fn cmp_keys(&self, a: &Self::Key, b: &Self::Key) -> Result<Ordering, FormatError>;

    /// `Less` if the target sorts before the child bracketed by `left` and
    /// `right`, `Greater` if after, `Equal` if the child covers it.
    fn cmp3(
        &self,
        left: &Self::Key,
        udata: &Self::Udata,
        right: &Self::Key,
    ) -> Result<Ordering, FormatError>;

    /// Look the target up in a leaf-level child, filling `udata` on success.
    fn found(
        &mut self,
        store: &dyn Storage,
        child: u64,
        left: &Self::Key,
        udata: &mut Self::Udata,
    ) -> Result<bool, FormatError>;

    /// Create a leaf-level child holding the target and set its bracket.
    fn new_node(
        &mut self,
        store: &mut dyn Storage,
        op: InsertOp,
        bracket: &mut Bracket<Self::Key>,
        udata: &mut Self::Udata,
    ) -> Result<u64, FormatError>;

    /// Insert the target into an existing leaf-level child.
    ///
    /// For `Left`/`Right` outcomes `md` receives the key between the old
    /// child and the new one.
    fn insert(
        &mut self,
        store: &mut dyn Storage,
        child: u64,
        bracket: &mut Bracket<Self::Key>,
        md: &mut Self::Key,
        udata: &mut Self::Udata,
    ) -> Result<InsertOutcome, FormatError>;

    /// Remove the target from a leaf-level child.
    fn remove(
        &mut self,
        store: &mut dyn Storage,
        child: u64,
        bracket: &mut Bracket<Self::Key>,
        udata: &mut Self::Udata,
    ) -> Result<RemoveOutcome, FormatError>;

    /// Items held by a leaf-level child, in order.
    fn items(&mut self, store: &dyn Storage, child: u64) -> Result<Vec<Self::Item>, FormatError>;
}

/// Tree shape parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BTreeParams {
    /// Rank: nodes hold up to `2k` children.
    pub k: usize,
    pub split_ratios: SplitRatios,
}

impl BTreeParams {
    pub fn new(k: usize, split_ratios: SplitRatios) -> Self {
        BTreeParams { k, split_ratios }
    }

    /// Maximum children per node.
    pub fn capacity(&self) -> usize {
        2 * self.k
    }

    /// A non-root node with fewer children than this is rebalanced.
    pub fn merge_threshold(&self) -> usize {
        let t = (self.capacity() as f64 * self.split_ratios.min_fill()) as usize;
        t.max(1)
    }
}

/// A decoded B-tree page.
#[derive(Debug, Clone, PartialEq)]
pub struct BTreeNode<K> {
    /// 0 = leaf, >0 = internal.
    pub level: u8,
    pub left: Option<u64>,
    pub right: Option<u64>,
    /// `children.len() + 1` keys.
    pub keys: Vec<K>,
    pub children: Vec<u64>,
}

impl<K: Clone> BTreeNode<K> {
    /// Encode into a full fixed-size page.
    pub fn encode<C: BTreeClass<Key = K>>(&self, cls: &C, k: usize) -> Vec<u8> {
        let size = node_size(cls, k);
        let cap = 2 * k;
        let sizes = cls.sizes();
        let mut w = Writer::with_capacity(sizes, size);
        w.bytes(&BTREE_SIGNATURE);
        w.u8(C::NODE_TYPE);
        w.u8(self.level);
        w.u16(self.children.len() as u16);
        w.address(self.left);
        w.address(self.right);
        for i in 0..cap {
            match self.keys.get(i) {
                Some(key) => cls.encode_key(&mut w, key),
                None => w.zeros(cls.key_size()),
            }
            match self.children.get(i) {
                Some(&child) => w.address(Some(child)),
                None => w.zeros(sizes.os()),
            }
        }
        match self.keys.get(cap) {
            Some(key) => cls.encode_key(&mut w, key),
            None => w.zeros(cls.key_size()),
        }
        w.pad_to(size);
        w.finish()
    }

    /// Decode a page.
    pub fn decode<C: BTreeClass<Key = K>>(
        cls: &C,
        raw: &[u8],
        k: usize,
    ) -> Result<BTreeNode<K>, FormatError> {
        let mut r = Reader::new(raw, cls.sizes());
        r.expect_signature(&BTREE_SIGNATURE, FormatError::InvalidBTreeSignature)?;
        let node_type = r.u8()?;
        if node_type != C::NODE_TYPE {
            return Err(FormatError::InvalidBTreeNodeType(node_type));
        }
        let level = r.u8()?;
        let used = r.u16()? as usize;
        if used > 2 * k {
            return Err(FormatError::CorruptIndex(format!(
                "B-tree node uses {used} of {} child slots",
                2 * k
            )));
        }
        let left = r.address()?;
        let right = r.address()?;

        let mut keys = Vec::with_capacity(used + 1);
        let mut children = Vec::with_capacity(used);
        for _ in 0..used {
            keys.push(cls.decode_key(&mut r)?);
            children.push(r.defined_address("B-tree child")?);
        }
        keys.push(cls.decode_key(&mut r)?);

        Ok(BTreeNode {
            level,
            left,
            right,
            keys,
            children,
        })
    }

    fn set_bracket(&mut self, left: &K, right: &K) {
        self.keys[0] = left.clone();
        if let Some(last) = self.keys.last_mut() {
            *last = right.clone();
        }
    }
}

/// Size of one page for `cls` at rank `k`.
pub fn node_size<C: BTreeClass>(cls: &C, k: usize) -> usize {
    let os = cls.sizes().os();
    NODE_PREFIX + 2 * os + (2 * k + 1) * cls.key_size() + 2 * k * os
}

/// Shape of a tree as seen by [`BTree::validate`].
#[derive(Debug, Clone)]
pub struct BTreeReport<K> {
    /// Keys of the leaf level, left to right, shared boundaries once.
    pub keys: Vec<K>,
    /// Child counts of every node, one vector per level, root first.
    pub levels: Vec<Vec<usize>>,
}

impl<K> BTreeReport<K> {
    /// Number of levels.
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    /// Total number of pages.
    pub fn nodes(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }
}

/// Pages allocated ahead of an insert; whatever is left is freed afterwards.
struct PageReserve {
    size: u64,
    pages: Vec<u64>,
}

impl PageReserve {
    fn new(store: &mut dyn Storage, size: u64, count: usize) -> Result<Self, FormatError> {
        let mut reserve = PageReserve {
            size,
            pages: Vec::with_capacity(count),
        };
        for _ in 0..count {
            match store.alloc(size) {
                Ok(addr) => reserve.pages.push(addr),
                Err(e) => {
                    reserve.release(store);
                    return Err(e);
                }
            }
        }
        Ok(reserve)
    }

    fn take(&mut self, store: &mut dyn Storage) -> Result<u64, FormatError> {
        match self.pages.pop() {
            Some(addr) => Ok(addr),
            None => store.alloc(self.size),
        }
    }

    fn release(self, store: &mut dyn Storage) {
        for addr in self.pages.into_iter().rev() {
            store.free(addr, self.size);
        }
    }
}

/// Handle to a B-tree rooted at a fixed address.
///
/// The root page never moves: root splits and collapses rewrite it in place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BTree {
    addr: u64,
    params: BTreeParams,
}

impl BTree {
    /// Write an empty level-0 root and return a handle to it.
    pub fn create<C: BTreeClass>(
        cls: &C,
        store: &mut dyn Storage,
        params: BTreeParams,
    ) -> Result<BTree, FormatError> {
        let size = node_size(cls, params.k) as u64;
        let addr = store.alloc(size)?;
        let tree = BTree { addr, params };
        let root = BTreeNode {
            level: 0,
            left: None,
            right: None,
            keys: vec![cls.empty_key()],
            children: Vec::new(),
        };
        tree.save(cls, store, addr, &root)?;
        debug!("created B-tree (type {}) at {addr:#x}", C::NODE_TYPE);
        Ok(tree)
    }

    /// Handle to an existing tree.
    pub fn open(addr: u64, params: BTreeParams) -> BTree {
        BTree { addr, params }
    }

    pub fn address(&self) -> u64 {
        self.addr
    }

    pub fn params(&self) -> &BTreeParams {
        &self.params
    }

    /// Read the page at `addr`.
    pub fn load<C: BTreeClass>(
        &self,
        cls: &C,
        store: &dyn Storage,
        addr: u64,
    ) -> Result<BTreeNode<C::Key>, FormatError> {
        let raw = store.read(addr, node_size(cls, self.params.k))?;
        BTreeNode::decode(cls, raw, self.params.k)
    }

    fn load_at_level<C: BTreeClass>(
        &self,
        cls: &C,
        store: &dyn Storage,
        addr: u64,
        level: Option<u8>,
    ) -> Result<BTreeNode<C::Key>, FormatError> {
        let node = self.load(cls, store, addr)?;
        if let Some(expected) = level {
            if node.level != expected {
                return Err(FormatError::CorruptIndex(format!(
                    "B-tree node {addr:#x} at level {} where {expected} was expected",
                    node.level
                )));
            }
        }
        Ok(node)
    }

    fn save<C: BTreeClass>(
        &self,
        cls: &C,
        store: &mut dyn Storage,
        addr: u64,
        node: &BTreeNode<C::Key>,
    ) -> Result<(), FormatError> {
        store.write(addr, &node.encode(cls, self.params.k))
    }

    fn search<C: BTreeClass>(
        cls: &C,
        node: &BTreeNode<C::Key>,
        udata: &C::Udata,
    ) -> Result<(usize, Ordering), FormatError> {
        let (mut lt, mut rt) = (0usize, node.children.len());
        let mut idx = 0;
        let mut cmp = Ordering::Equal;
        while lt < rt {
            idx = (lt + rt) / 2;
            cmp = cls.cmp3(&node.keys[idx], udata, &node.keys[idx + 1])?;
            match cmp {
                Ordering::Less => rt = idx,
                Ordering::Greater => lt = idx + 1,
                Ordering::Equal => break,
            }
        }
        Ok((idx, cmp))
    }

    /// Find the target described by `udata`; the class fills in the result.
    pub fn find<C: BTreeClass>(
        &self,
        cls: &mut C,
        store: &dyn Storage,
        udata: &mut C::Udata,
    ) -> Result<(), FormatError> {
        let mut addr = self.addr;
        let mut level = None;
        let mut bracket: Option<(C::Key, C::Key)> = None;
        loop {
            let mut node = self.load_at_level(cls, store, addr, level)?;
            if let Some((lt, rt)) = bracket.take() {
                node.set_bracket(&lt, &rt);
            }
            if node.children.is_empty() {
                return Err(FormatError::NotFound("B-tree is empty".into()));
            }
            let (idx, cmp) = Self::search(cls, &node, udata)?;
            if cmp != Ordering::Equal {
                return Err(FormatError::NotFound("key outside every child".into()));
            }
            if node.level > 0 {
                trace!("B-tree find: {addr:#x} level {} -> child {idx}", node.level);
                bracket = Some((node.keys[idx].clone(), node.keys[idx + 1].clone()));
                level = Some(node.level - 1);
                addr = node.children[idx];
                continue;
            }
            return if cls.found(store, node.children[idx], &node.keys[idx], udata)? {
                Ok(())
            } else {
                Err(FormatError::NotFound("key not in leaf child".into()))
            };
        }
    }

    /// Insert the target described by `udata`.
    pub fn insert<C: BTreeClass>(
        &self,
        cls: &mut C,
        store: &mut dyn Storage,
        udata: &mut C::Udata,
    ) -> Result<(), FormatError> {
        // One twin per level plus the moved root are allocated before any
        // page is rewritten, so running out of space leaves the tree intact.
        let root_level = self.load(cls, store, self.addr)?.level;
        let size = node_size(cls, self.params.k) as u64;
        let mut spare = PageReserve::new(store, size, usize::from(root_level) + 2)?;
        let result = self.insert_root(cls, store, &mut spare, udata);
        spare.release(store);
        result
    }

    fn insert_root<C: BTreeClass>(
        &self,
        cls: &mut C,
        store: &mut dyn Storage,
        spare: &mut PageReserve,
        udata: &mut C::Udata,
    ) -> Result<(), FormatError> {
        let split = self.insert_helper(cls, store, spare, self.addr, None, None, udata)?;
        let Some((md, twin_addr)) = split else {
            return Ok(());
        };

        // The root split: move its left half to a new page and write a new
        // root one level up at the old address.
        let old_root = self.load(cls, store, self.addr)?;
        let moved = spare.take(store)?;
        let mut twin = self.load(cls, store, twin_addr)?;
        twin.left = Some(moved);
        self.save(cls, store, twin_addr, &twin)?;
        self.save(cls, store, moved, &old_root)?;

        let right_key = twin.keys[twin.keys.len() - 1].clone();
        let new_root = BTreeNode {
            level: old_root.level + 1,
            left: None,
            right: None,
            keys: vec![old_root.keys[0].clone(), md, right_key],
            children: vec![moved, twin_addr],
        };
        self.save(cls, store, self.addr, &new_root)?;
        debug!(
            "B-tree {:#x}: root split, height now {}",
            self.addr,
            new_root.level as usize + 1
        );
        Ok(())
    }

    /// Returns the middle key and address of a new right sibling when this
    /// node split.
    fn insert_helper<C: BTreeClass>(
        &self,
        cls: &mut C,
        store: &mut dyn Storage,
        spare: &mut PageReserve,
        addr: u64,
        level: Option<u8>,
        outer: Option<&mut Bracket<C::Key>>,
        udata: &mut C::Udata,
    ) -> Result<Option<(C::Key, u64)>, FormatError> {
        let mut node = self.load_at_level(cls, store, addr, level)?;
        if let Some(b) = outer.as_deref() {
            node.set_bracket(&b.left, &b.right);
        }
        let mut dirty = false;
        let mut lt_changed = false;
        let mut rt_changed = false;
        let mut md = cls.empty_key();
        let mut outcome = InsertOutcome::Noop;

        let n = node.children.len();
        let mut idx = 0;
        // `Some(i)`: hand the target to child `i`.
        let mut descend: Option<usize> = None;

        if n == 0 {
            if node.level != 0 {
                return Err(FormatError::CorruptIndex(format!(
                    "internal B-tree node {addr:#x} has no children"
                )));
            }
            let mut br = Bracket::new(node.keys[0].clone(), node.keys[0].clone());
            let child = cls.new_node(store, InsertOp::First, &mut br, udata)?;
            node.keys = vec![br.left, br.right];
            node.children = vec![child];
            dirty = true;
            lt_changed = true;
            rt_changed = true;
            if C::FOLLOW_MIN || C::FOLLOW_MAX {
                descend = Some(0);
            }
        } else {
            let (i, cmp) = Self::search(cls, &node, udata)?;
            idx = i;
            match cmp {
                Ordering::Less if idx == 0 => {
                    if node.level > 0 || C::FOLLOW_MIN {
                        descend = Some(0);
                    } else {
                        let mut br = Bracket::new(node.keys[0].clone(), node.keys[0].clone());
                        let child = cls.new_node(store, InsertOp::Left, &mut br, udata)?;
                        node.keys[0] = br.left;
                        md = br.right;
                        outcome = InsertOutcome::Left(child);
                        dirty = true;
                        lt_changed = true;
                    }
                }
                Ordering::Greater if idx + 1 == n => {
                    if node.level > 0 || C::FOLLOW_MAX {
                        descend = Some(idx);
                    } else {
                        let mut br = Bracket::new(node.keys[n].clone(), node.keys[n].clone());
                        let child = cls.new_node(store, InsertOp::Right, &mut br, udata)?;
                        md = br.left;
                        node.keys[n] = br.right;
                        outcome = InsertOutcome::Right(child);
                        dirty = true;
                        rt_changed = true;
                    }
                }
                Ordering::Equal => descend = Some(idx),
                _ => {
                    return Err(FormatError::CorruptIndex(format!(
                        "B-tree node {addr:#x}: no child brackets the key"
                    )));
                }
            }
        }

        if let Some(i) = descend {
            idx = i;
            let mut br = Bracket::new(node.keys[i].clone(), node.keys[i + 1].clone());
            if node.level > 0 {
                let child_level = Some(node.level - 1);
                let split = self.insert_helper(
                    cls,
                    store,
                    spare,
                    node.children[i],
                    child_level,
                    Some(&mut br),
                    udata,
                )?;
                if let Some((m, twin)) = split {
                    md = m;
                    outcome = InsertOutcome::Right(twin);
                }
            } else {
                outcome = cls.insert(store, node.children[i], &mut br, &mut md, udata)?;
            }
            if br.left_changed {
                node.keys[i] = br.left;
                dirty = true;
                lt_changed |= i == 0;
            }
            if br.right_changed {
                node.keys[i + 1] = br.right;
                dirty = true;
                rt_changed |= i + 1 == node.children.len();
            }
        }

        match outcome {
            InsertOutcome::Noop => {}
            InsertOutcome::Change(new_addr) => {
                node.children[idx] = new_addr;
                dirty = true;
            }
            InsertOutcome::Left(child) => {
                node.keys.insert(idx + 1, md);
                node.children.insert(idx, child);
                dirty = true;
            }
            InsertOutcome::Right(child) => {
                node.keys.insert(idx + 1, md);
                node.children.insert(idx + 1, child);
                dirty = true;
            }
        }

        if let Some(b) = outer {
            if lt_changed {
                b.left = node.keys[0].clone();
                b.left_changed = true;
            }
            if rt_changed {
                b.right = node.keys[node.keys.len() - 1].clone();
                b.right_changed = true;
            }
        }

        let split = if node.children.len() > self.params.capacity() {
            Some(self.split(cls, store, spare, addr, &mut node)?)
        } else {
            None
        };
        if dirty || split.is_some() {
            self.save(cls, store, addr, &node)?;
        }
        Ok(split)
    }

    /// Split an over-full node, keeping the left part at `addr`.
    fn split<C: BTreeClass>(
        &self,
        cls: &C,
        store: &mut dyn Storage,
        spare: &mut PageReserve,
        addr: u64,
        node: &mut BTreeNode<C::Key>,
    ) -> Result<(C::Key, u64), FormatError> {
        let total = node.children.len();
        let ratios = &self.params.split_ratios;
        let ratio = if node.right.is_none() {
            ratios.right()
        } else if node.left.is_none() {
            ratios.left()
        } else {
            ratios.middle()
        };
        let nleft = ((total as f64 * ratio) as usize).clamp(1, total - 1);

        let twin_children = node.children.split_off(nleft);
        let twin_keys = node.keys[nleft..].to_vec();
        node.keys.truncate(nleft + 1);

        let twin_addr = spare.take(store)?;
        let twin = BTreeNode {
            level: node.level,
            left: Some(addr),
            right: node.right,
            keys: twin_keys,
            children: twin_children,
        };
        if let Some(r) = node.right {
            let mut right = self.load(cls, store, r)?;
            right.left = Some(twin_addr);
            self.save(cls, store, r, &right)?;
        }
        node.right = Some(twin_addr);
        self.save(cls, store, twin_addr, &twin)?;
        debug!(
            "B-tree node {addr:#x} (level {}) split {} + {} -> {twin_addr:#x}",
            node.level,
            nleft,
            twin.children.len()
        );
        Ok((twin.keys[0].clone(), twin_addr))
    }

    /// Remove the target described by `udata`.
    pub fn remove<C: BTreeClass>(
        &self,
        cls: &mut C,
        store: &mut dyn Storage,
        udata: &mut C::Udata,
    ) -> Result<(), FormatError> {
        self.remove_helper(cls, store, self.addr, None, None, udata)?;

        // Collapse a root that is left with a single child.
        loop {
            let mut root = self.load(cls, store, self.addr)?;
            if root.level == 0 {
                break;
            }
            match root.children.len() {
                0 => {
                    root.level = 0;
                    root.keys.truncate(1);
                    self.save(cls, store, self.addr, &root)?;
                    break;
                }
                1 => {
                    let only = root.children[0];
                    let mut child = self.load(cls, store, only)?;
                    child.set_bracket(&root.keys[0], &root.keys[1]);
                    child.left = None;
                    child.right = None;
                    self.save(cls, store, self.addr, &child)?;
                    store.free(only, node_size(cls, self.params.k) as u64);
                    debug!(
                        "B-tree {:#x}: root collapsed to level {}",
                        self.addr, child.level
                    );
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Returns the node's remaining child count.
    fn remove_helper<C: BTreeClass>(
        &self,
        cls: &mut C,
        store: &mut dyn Storage,
        addr: u64,
        level: Option<u8>,
        outer: Option<&mut Bracket<C::Key>>,
        udata: &mut C::Udata,
    ) -> Result<usize, FormatError> {
        let mut node = self.load_at_level(cls, store, addr, level)?;
        if let Some(b) = outer.as_deref() {
            node.set_bracket(&b.left, &b.right);
        }
        if node.children.is_empty() {
            return Err(FormatError::NotFound("B-tree is empty".into()));
        }
        let (idx, cmp) = Self::search(cls, &node, udata)?;
        if cmp != Ordering::Equal {
            return Err(FormatError::NotFound("key outside every child".into()));
        }

        let n = node.children.len();
        let mut br = Bracket::new(node.keys[idx].clone(), node.keys[idx + 1].clone());
        let mut drop_child = false;
        let mut underfull = false;
        if node.level > 0 {
            let left = self.remove_helper(
                cls,
                store,
                node.children[idx],
                Some(node.level - 1),
                Some(&mut br),
                udata,
            )?;
            if left == 0 {
                self.unlink_page(cls, store, node.children[idx])?;
                drop_child = true;
            } else {
                underfull = left < self.params.merge_threshold();
            }
        } else {
            match cls.remove(store, node.children[idx], &mut br, udata)? {
                RemoveOutcome::Noop => {}
                RemoveOutcome::Change(new_addr) => node.children[idx] = new_addr,
                RemoveOutcome::Remove => drop_child = true,
            }
        }

        let mut lt_changed = false;
        let mut rt_changed = false;
        if br.left_changed {
            node.keys[idx] = br.left;
            lt_changed = idx == 0;
        }
        if br.right_changed {
            node.keys[idx + 1] = br.right;
            rt_changed = idx + 1 == n;
        }

        if drop_child {
            node.children.remove(idx);
            // The neighbour absorbs the range; the node's outer keys stay.
            if idx > 0 {
                node.keys.remove(idx);
            } else {
                node.keys.remove(1);
            }
        } else if underfull && node.children.len() > 1 {
            self.rebalance(cls, store, &mut node, idx)?;
        }

        if let Some(b) = outer {
            if lt_changed {
                b.left = node.keys[0].clone();
                b.left_changed = true;
            }
            if rt_changed {
                b.right = node.keys[node.keys.len() - 1].clone();
                b.right_changed = true;
            }
        }

        self.save(cls, store, addr, &node)?;
        Ok(node.children.len())
    }

    /// Release an empty page and splice it out of its sibling chain.
    fn unlink_page<C: BTreeClass>(
        &self,
        cls: &C,
        store: &mut dyn Storage,
        addr: u64,
    ) -> Result<(), FormatError> {
        let page = self.load(cls, store, addr)?;
        if let Some(l) = page.left {
            let mut left = self.load(cls, store, l)?;
            left.right = page.right;
            self.save(cls, store, l, &left)?;
        }
        if let Some(r) = page.right {
            let mut right = self.load(cls, store, r)?;
            right.left = page.left;
            self.save(cls, store, r, &right)?;
        }
        store.free(addr, node_size(cls, self.params.k) as u64);
        trace!("B-tree page {addr:#x} released");
        Ok(())
    }

    /// Fix an under-full child `idx` of `node` by merging it with a
    /// neighbour or borrowing one child from it.
    fn rebalance<C: BTreeClass>(
        &self,
        cls: &C,
        store: &mut dyn Storage,
        node: &mut BTreeNode<C::Key>,
        idx: usize,
    ) -> Result<(), FormatError> {
        let j = if idx + 1 < node.children.len() { idx } else { idx - 1 };
        let (a_addr, b_addr) = (node.children[j], node.children[j + 1]);
        let child_level = Some(node.level - 1);
        let mut a = self.load_at_level(cls, store, a_addr, child_level)?;
        let mut b = self.load_at_level(cls, store, b_addr, child_level)?;
        a.set_bracket(&node.keys[j], &node.keys[j + 1]);
        b.set_bracket(&node.keys[j + 1], &node.keys[j + 2]);

        if a.children.len() + b.children.len() <= self.params.capacity() {
            a.keys.pop();
            a.keys.append(&mut b.keys);
            a.children.append(&mut b.children);
            a.right = b.right;
            if let Some(r) = b.right {
                let mut right = self.load(cls, store, r)?;
                right.left = Some(a_addr);
                self.save(cls, store, r, &right)?;
            }
            self.save(cls, store, a_addr, &a)?;
            store.free(b_addr, node_size(cls, self.params.k) as u64);
            node.children.remove(j + 1);
            node.keys.remove(j + 1);
            debug!("B-tree pages {b_addr:#x} merged into {a_addr:#x}");
        } else if a.children.len() < b.children.len() {
            let moved = b.children.remove(0);
            b.keys.remove(0);
            a.children.push(moved);
            a.keys.push(b.keys[0].clone());
            node.keys[j + 1] = b.keys[0].clone();
            self.save(cls, store, a_addr, &a)?;
            self.save(cls, store, b_addr, &b)?;
            trace!("B-tree rotated one child {b_addr:#x} -> {a_addr:#x}");
        } else {
            let Some(moved) = a.children.pop() else {
                return Err(FormatError::CorruptIndex("rebalance of empty page".into()));
            };
            a.keys.pop();
            let sep = a.keys[a.keys.len() - 1].clone();
            b.children.insert(0, moved);
            b.keys.insert(0, sep.clone());
            node.keys[j + 1] = sep;
            self.save(cls, store, a_addr, &a)?;
            self.save(cls, store, b_addr, &b)?;
            trace!("B-tree rotated one child {a_addr:#x} -> {b_addr:#x}");
        }
        Ok(())
    }

    /// Visit every item left to right along the leaf level.
    ///
    /// The first `skip` items are passed over. A non-zero return from `f`
    /// stops the walk and becomes the result; otherwise the result is 0.
    pub fn iterate<C, F>(
        &self,
        cls: &mut C,
        store: &dyn Storage,
        skip: usize,
        mut f: F,
    ) -> Result<i32, FormatError>
    where
        C: BTreeClass,
        F: FnMut(&C::Item) -> i32,
    {
        let mut addr = self.addr;
        let mut node = self.load(cls, store, addr)?;
        while node.level > 0 {
            let Some(&first) = node.children.first() else {
                return Err(FormatError::CorruptIndex(format!(
                    "internal B-tree node {addr:#x} has no children"
                )));
            };
            let expected = node.level - 1;
            addr = first;
            node = self.load_at_level(cls, store, addr, Some(expected))?;
        }

        let max_pages = store.eof() / node_size(cls, self.params.k) as u64 + 1;
        let mut pages = 0u64;
        let mut seen = 0usize;
        loop {
            pages += 1;
            if pages > max_pages {
                return Err(FormatError::CorruptIndex("B-tree sibling chain cycles".into()));
            }
            for &child in &node.children {
                for item in cls.items(store, child)? {
                    if seen < skip {
                        seen += 1;
                        continue;
                    }
                    seen += 1;
                    let ret = f(&item);
                    if ret != 0 {
                        return Ok(ret);
                    }
                }
            }
            match node.right {
                Some(next) => {
                    node = self.load_at_level(cls, store, next, Some(0))?;
                    if node.left != Some(addr) {
                        return Err(FormatError::CorruptIndex(format!(
                            "B-tree page {next:#x} does not link back to {addr:#x}"
                        )));
                    }
                    addr = next;
                }
                None => return Ok(0),
            }
        }
    }

    /// Check structure and ordering of the whole tree.
    pub fn validate<C: BTreeClass>(
        &self,
        cls: &C,
        store: &dyn Storage,
    ) -> Result<BTreeReport<C::Key>, FormatError> {
        let mut levels: Vec<Vec<(u64, BTreeNode<C::Key>)>> = Vec::new();
        let root = self.load(cls, store, self.addr)?;
        if root.left.is_some() || root.right.is_some() {
            return Err(FormatError::CorruptIndex("B-tree root has siblings".into()));
        }
        let mut current = vec![(self.addr, root)];
        loop {
            let level = current[0].1.level;
            let mut next = Vec::new();
            for (addr, node) in &current {
                if node.keys.len() != node.children.len() + 1 {
                    return Err(FormatError::CorruptIndex(format!(
                        "B-tree node {addr:#x}: key count mismatch"
                    )));
                }
                for w in node.keys.windows(2) {
                    if cls.cmp_keys(&w[0], &w[1])? != Ordering::Less {
                        return Err(FormatError::CorruptIndex(format!(
                            "B-tree node {addr:#x}: keys out of order ({:?} !< {:?})",
                            w[0], w[1]
                        )));
                    }
                }
                if level > 0 {
                    for (i, &child) in node.children.iter().enumerate() {
                        let mut c = self.load_at_level(cls, store, child, Some(level - 1))?;
                        c.set_bracket(&node.keys[i], &node.keys[i + 1]);
                        next.push((child, c));
                    }
                }
            }
            for (i, (addr, node)) in current.iter().enumerate() {
                let want_left = if i == 0 { None } else { Some(current[i - 1].0) };
                let want_right = current.get(i + 1).map(|(a, _)| *a);
                if node.left != want_left || node.right != want_right {
                    return Err(FormatError::CorruptIndex(format!(
                        "B-tree node {addr:#x}: sibling links do not match level order"
                    )));
                }
            }
            levels.push(current);
            if level == 0 {
                break;
            }
            current = next;
        }

        let leaves = &levels[levels.len() - 1];
        let mut keys = Vec::new();
        for (i, (_, node)) in leaves.iter().enumerate() {
            let from = if i == 0 { 0 } else { 1 };
            keys.extend(node.keys[from..].iter().cloned());
        }
        if leaves.len() == 1 && leaves[0].1.children.is_empty() {
            keys.clear();
        }
        let levels = levels
            .iter()
            .map(|lvl| lvl.iter().map(|(_, n)| n.children.len()).collect())
            .collect();
        Ok(BTreeReport { keys, levels })
    }
}
