//! The group graph: open files, path resolution, soft links and mounts.
//!
//! Paths are `/`-separated. Absolute paths start at the root group of the
//! top-level file of the mount hierarchy; relative paths start at the
//! caller's [`Location`]. Soft links are resolved relative to the group
//! holding them, and each lookup may follow at most
//! [`FileAccessProps::max_symlinks`] of them.

#[cfg(not(feature = "std"))]
use alloc::{string::String, vec::Vec};

use core::ops::BitOr;

use log::{debug, trace};

use crate::btree::{BTreeParams, BTreeReport};
use crate::codec::Sizes;
use crate::entry::SymbolEntry;
use crate::error::FormatError;
use crate::group_node::GroupMember;
use crate::object_header::{adjust_link_count, HeaderMessage, ObjectHeader};
use crate::property_list::{FileAccessProps, FileCreateProps, DEFAULT_HEAP_SIZE_HINT};
use crate::registry::{ObjectKind, TypeRegistry};
use crate::stab::{self, StabConfig};
use crate::storage::{MemStorage, Storage};
use crate::superblock::{find_signature, Superblock};

/// Handle of a file open in a [`Hierarchy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);

impl FileId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An entry together with the file it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub file: FileId,
    pub entry: SymbolEntry,
}

impl Location {
    /// Same object, regardless of the name it was reached through.
    pub fn same_object(&self, other: &Location) -> bool {
        self.file == other.file && self.entry.same_object(&other.entry)
    }
}

/// How the final path component is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Target(u8);

impl Target {
    /// Follow soft links and mounts everywhere.
    pub const FOLLOW: Target = Target(0);
    /// Return a final soft link itself.
    pub const NO_FOLLOW_LINK: Target = Target(1);
    /// Return a final mount point itself rather than the mounted root.
    pub const NO_FOLLOW_MOUNT: Target = Target(2);

    pub fn contains(self, other: Target) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Target {
    type Output = Target;
    fn bitor(self, rhs: Target) -> Target {
        Target(self.0 | rhs.0)
    }
}

/// Result of walking a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    /// Last group searched.
    pub group: Location,
    /// The object, or `None` when a component was missing.
    pub object: Option<Location>,
    /// Unresolved suffix, starting at the missing component.
    pub rest: String,
    /// Last component looked up.
    pub name: String,
    /// Symbol table lookups performed, soft links included.
    pub lookups: usize,
}

/// What `get_objinfo` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub file: FileId,
    /// Object header address; `None` for soft links.
    pub header: Option<u64>,
    /// Hard-link count (0 for soft links).
    pub nlink: u32,
    pub kind: ObjectKind,
    /// Soft-link value length including the terminator; 0 otherwise.
    pub link_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MountPoint {
    parent: FileId,
    /// Object header of the group the child is mounted on.
    header: u64,
    child: FileId,
}

/// One HDF5 file image with its group metadata.
#[derive(Debug)]
pub struct H5File {
    store: MemStorage,
    cfg: StabConfig,
    superblock: Superblock,
    fapl: FileAccessProps,
    /// Initial heap size for groups created without an explicit hint.
    heap_size_hint: u64,
    mounted_on: Option<Location>,
}

fn storage_limit(sizes: Sizes, fapl: &FileAccessProps) -> u64 {
    fapl.max_file_size
        .unwrap_or(u64::MAX)
        .min(sizes.max_address())
}

impl H5File {
    /// New file with an empty root group.
    pub fn create(fcpl: &FileCreateProps, fapl: &FileAccessProps) -> Result<H5File, FormatError> {
        fcpl.validate()?;
        fapl.validate()?;
        let sizes = fcpl.sizes_checked()?;
        let mut store = MemStorage::new(storage_limit(sizes, fapl));
        store.alloc(Superblock::encoded_size(sizes) as u64)?;

        let cfg = StabConfig {
            sizes,
            leaf_k: fcpl.sym_leaf_k as usize,
            btree: BTreeParams::new(fcpl.btree_k as usize, fapl.split_ratios),
        };
        let root = stab::create(&mut store, &cfg, fcpl.heap_size_hint)?;
        if let Some(h) = root.header {
            adjust_link_count(&mut store, sizes, h, 1)?;
        }
        let superblock = Superblock {
            sizes,
            sym_leaf_k: fcpl.sym_leaf_k,
            btree_k: fcpl.btree_k,
            consistency_flags: 0,
            base_address: 0,
            eof_address: 0,
            root,
        };
        let mut file = H5File {
            store,
            cfg,
            superblock,
            fapl: fapl.clone(),
            heap_size_hint: fcpl.heap_size_hint,
            mounted_on: None,
        };
        file.flush()?;
        debug!(
            "created file: offsets {}, lengths {}, leaf K {}, B-tree K {}",
            sizes.offset, sizes.length, fcpl.sym_leaf_k, fcpl.btree_k
        );
        Ok(file)
    }

    /// Open a file image.
    pub fn open(mut image: Vec<u8>, fapl: &FileAccessProps) -> Result<H5File, FormatError> {
        fapl.validate()?;
        let base = find_signature(&image)?;
        if base > 0 {
            image.drain(..base);
        }
        let superblock = Superblock::decode(&image)?;
        if superblock.eof_address > image.len() as u64 {
            return Err(FormatError::UnexpectedEof {
                expected: superblock.eof_address as usize,
                available: image.len(),
            });
        }
        image.truncate(superblock.eof_address as usize);
        let sizes = superblock.sizes;
        let cfg = StabConfig {
            sizes,
            leaf_k: superblock.sym_leaf_k as usize,
            btree: BTreeParams::new(superblock.btree_k as usize, fapl.split_ratios),
        };
        let store = MemStorage::from_bytes(image, storage_limit(sizes, fapl));
        stab::table(&store, &cfg, &superblock.root)?;
        debug!("opened file: {} bytes, superblock at {base}", store.eof());
        Ok(H5File {
            store,
            cfg,
            superblock,
            fapl: fapl.clone(),
            heap_size_hint: DEFAULT_HEAP_SIZE_HINT,
            mounted_on: None,
        })
    }

    /// Rewrite the superblock with the current end of file.
    pub fn flush(&mut self) -> Result<(), FormatError> {
        self.superblock.eof_address = self.store.eof();
        let raw = self.superblock.encode();
        self.store.write(0, &raw)
    }

    pub fn root(&self) -> SymbolEntry {
        self.superblock.root
    }

    pub fn sizes(&self) -> Sizes {
        self.cfg.sizes
    }

    pub fn config(&self) -> &StabConfig {
        &self.cfg
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn image(&self) -> &[u8] {
        self.store.as_bytes()
    }

    /// Flush and hand back the file image.
    pub fn into_image(mut self) -> Result<Vec<u8>, FormatError> {
        self.flush()?;
        Ok(self.store.into_bytes())
    }
}

fn next_component(path: &str) -> (&str, &str) {
    let p = path.trim_start_matches('/');
    match p.find('/') {
        Some(i) => (&p[..i], &p[i..]),
        None => (p, ""),
    }
}

fn check_component(comp: &str) -> Result<(), FormatError> {
    if comp.as_bytes().contains(&0) {
        return Err(FormatError::InvalidName(format!("{comp:?} contains NUL")));
    }
    Ok(())
}

/// Open files, their mount table and the object type registry.
#[derive(Debug, Default)]
pub struct Hierarchy {
    files: Vec<Option<H5File>>,
    mounts: Vec<MountPoint>,
    registry: TypeRegistry,
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `registry` to classify objects.
    pub fn with_registry(registry: TypeRegistry) -> Self {
        Hierarchy {
            registry,
            ..Self::default()
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TypeRegistry {
        &mut self.registry
    }

    // ---- files ---------------------------------------------------------

    /// Take ownership of an open file.
    pub fn add_file(&mut self, file: H5File) -> FileId {
        let idx = match self.files.iter().position(Option::is_none) {
            Some(i) => {
                self.files[i] = Some(file);
                i
            }
            None => {
                self.files.push(Some(file));
                self.files.len() - 1
            }
        };
        FileId(idx as u32)
    }

    pub fn create_file(
        &mut self,
        fcpl: &FileCreateProps,
        fapl: &FileAccessProps,
    ) -> Result<FileId, FormatError> {
        Ok(self.add_file(H5File::create(fcpl, fapl)?))
    }

    pub fn open_file(&mut self, image: Vec<u8>, fapl: &FileAccessProps) -> Result<FileId, FormatError> {
        Ok(self.add_file(H5File::open(image, fapl)?))
    }

    /// Detach a file from the hierarchy, unmounting it and anything mounted
    /// on it.
    pub fn remove_file(&mut self, id: FileId) -> Result<H5File, FormatError> {
        self.file(id)?;
        let (gone, kept): (Vec<MountPoint>, Vec<MountPoint>) = self
            .mounts
            .iter()
            .copied()
            .partition(|m| m.parent == id || m.child == id);
        self.mounts = kept;
        for m in gone {
            if let Some(Some(child)) = self.files.get_mut(m.child.index()) {
                child.mounted_on = None;
            }
        }
        let mut file = self.files[id.index()]
            .take()
            .ok_or_else(|| FormatError::NotFound(format!("file {id:?}")))?;
        file.mounted_on = None;
        Ok(file)
    }

    pub fn file(&self, id: FileId) -> Result<&H5File, FormatError> {
        self.files
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| FormatError::NotFound(format!("file {id:?}")))
    }

    pub fn file_mut(&mut self, id: FileId) -> Result<&mut H5File, FormatError> {
        self.files
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| FormatError::NotFound(format!("file {id:?}")))
    }

    /// Location of a file's own root group.
    pub fn root(&self, id: FileId) -> Result<Location, FormatError> {
        Ok(Location {
            file: id,
            entry: self.file(id)?.root(),
        })
    }

    pub fn flush(&mut self, id: FileId) -> Result<(), FormatError> {
        self.file_mut(id)?.flush()
    }

    /// Root of the top-level file above `id` in the mount hierarchy.
    fn top_root(&self, id: FileId) -> Result<Location, FormatError> {
        let mut id = id;
        let mut hops = 0;
        while let Some(parent) = self.file(id)?.mounted_on {
            id = parent.file;
            hops += 1;
            if hops > self.files.len() {
                return Err(FormatError::CorruptIndex("mount hierarchy cycles".into()));
            }
        }
        self.root(id)
    }

    // ---- resolution ----------------------------------------------------

    /// Walk `path` from `loc`.
    ///
    /// A missing component is not an error: the result has `object: None`
    /// and `rest` starting at that component. A dangling soft link is.
    pub fn namei(&self, loc: &Location, path: &str, target: Target) -> Result<Lookup, FormatError> {
        let mut budget = self.file(loc.file)?.fapl.max_symlinks;
        let mut lookups = 0;
        self.walk(*loc, path, target, &mut budget, &mut lookups)
    }

    fn walk(
        &self,
        start: Location,
        path: &str,
        target: Target,
        budget: &mut u32,
        lookups: &mut usize,
    ) -> Result<Lookup, FormatError> {
        let mut grp = if path.starts_with('/') {
            self.top_root(start.file)?
        } else {
            start
        };
        let mut obj = grp;
        let mut name = String::new();
        let mut rest = path;

        loop {
            let (comp, tail) = next_component(rest);
            if comp.is_empty() {
                break;
            }
            if comp == "." {
                rest = tail;
                continue;
            }
            check_component(comp)?;

            grp = obj;
            let file = self.file(grp.file)?;
            *lookups += 1;
            let entry = match stab::find(&file.store, &file.cfg, &grp.entry, comp) {
                Ok(e) => e,
                Err(e) if e.is_not_found() => {
                    trace!("namei {path:?}: {comp:?} missing");
                    return Ok(Lookup {
                        group: grp,
                        object: None,
                        rest: rest.trim_start_matches('/').into(),
                        name: comp.into(),
                        lookups: *lookups,
                    });
                }
                Err(e) => return Err(e),
            };
            trace!("namei {path:?}: {comp:?} -> {:?}", entry.header);
            obj = Location {
                file: grp.file,
                entry,
            };
            name = comp.into();

            let last = next_component(tail).0.is_empty();
            if entry.is_soft_link() && !(last && target.contains(Target::NO_FOLLOW_LINK)) {
                obj = self.follow_soft_link(grp, obj, budget, lookups)?;
            }
            if !(last && target.contains(Target::NO_FOLLOW_MOUNT)) {
                obj = self.cross_mounts(obj)?;
            }
            rest = tail;
        }

        Ok(Lookup {
            group: grp,
            object: Some(obj),
            rest: String::new(),
            name,
            lookups: *lookups,
        })
    }

    fn follow_soft_link(
        &self,
        holder: Location,
        link: Location,
        budget: &mut u32,
        lookups: &mut usize,
    ) -> Result<Location, FormatError> {
        let file = self.file(holder.file)?;
        let value = stab::link_value(&file.store, &file.cfg, &holder.entry, &link.entry)?;
        if *budget == 0 {
            return Err(FormatError::TooManySymlinks(value));
        }
        *budget -= 1;
        trace!("following soft link -> {value:?} ({budget} left)");
        let lk = self.walk(holder, &value, Target::FOLLOW, budget, lookups)?;
        lk.object
            .ok_or_else(|| FormatError::NotFound(format!("{value} (dangling soft link)")))
    }

    fn mount_at(&self, loc: &Location) -> Option<&MountPoint> {
        let header = loc.entry.header?;
        self.mounts
            .iter()
            .find(|m| m.parent == loc.file && m.header == header)
    }

    /// Replace a mount point by the root of the file mounted on it.
    fn cross_mounts(&self, loc: Location) -> Result<Location, FormatError> {
        let mut loc = loc;
        let mut hops = 0;
        while let Some(m) = self.mount_at(&loc) {
            loc = self.root(m.child)?;
            hops += 1;
            if hops > self.mounts.len() {
                return Err(FormatError::CorruptIndex("mount table cycles".into()));
            }
        }
        Ok(loc)
    }

    /// Resolve `path` to an object, following everything.
    pub fn resolve(&self, loc: &Location, path: &str) -> Result<Location, FormatError> {
        self.resolve_with(loc, path, Target::FOLLOW)
    }

    fn resolve_with(&self, loc: &Location, path: &str, target: Target) -> Result<Location, FormatError> {
        let lk = self.namei(loc, path, target)?;
        lk.object
            .ok_or_else(|| FormatError::NotFound(lk.rest))
    }

    /// The group a new object named by `path` goes into, and its name.
    fn creation_point(&self, loc: &Location, path: &str) -> Result<(Location, String), FormatError> {
        if next_component(path).0.is_empty() {
            return Err(FormatError::InvalidName(format!("{path:?} names no object")));
        }
        let lk = self.namei(loc, path, Target::NO_FOLLOW_LINK | Target::NO_FOLLOW_MOUNT)?;
        if lk.object.is_some() {
            return Err(FormatError::AlreadyExists(path.into()));
        }
        let (comp, tail) = next_component(&lk.rest);
        let mut tail = tail;
        // Trailing "." components still name the new object.
        loop {
            let (next, after) = next_component(tail);
            if next == "." {
                tail = after;
            } else if next.is_empty() {
                break;
            } else {
                return Err(FormatError::NotFound(comp.into()));
            }
        }
        Ok((lk.group, comp.into()))
    }

    // ---- groups and links ------------------------------------------------

    /// Create a group. A `size_hint` of 0 uses the heap size the file was
    /// created with.
    pub fn create_group(
        &mut self,
        loc: &Location,
        path: &str,
        size_hint: u64,
    ) -> Result<Location, FormatError> {
        let (grp, name) = self.creation_point(loc, path)?;
        let file = self.file_mut(grp.file)?;
        let hint = if size_hint == 0 {
            file.heap_size_hint
        } else {
            size_hint
        };
        let cfg = file.cfg;
        let group = stab::create(&mut file.store, &cfg, hint)?;
        let stored = stab::insert(&mut file.store, &cfg, &grp.entry, &name, group)?;
        if let Some(h) = stored.header {
            adjust_link_count(&mut file.store, cfg.sizes, h, 1)?;
        }
        debug!("created group {path:?}");
        Ok(Location {
            file: grp.file,
            entry: stored,
        })
    }

    /// Resolve `path` and check that it is a group.
    pub fn open_group(&self, loc: &Location, path: &str) -> Result<Location, FormatError> {
        let obj = self.resolve(loc, path)?;
        let file = self.file(obj.file)?;
        stab::table(&file.store, &file.cfg, &obj.entry)?;
        Ok(obj)
    }

    /// Create a non-group object from `messages` and link it at `path`.
    pub fn insert_object(
        &mut self,
        loc: &Location,
        path: &str,
        messages: Vec<HeaderMessage>,
    ) -> Result<Location, FormatError> {
        let (grp, name) = self.creation_point(loc, path)?;
        let file = self.file_mut(grp.file)?;
        let cfg = file.cfg;
        let header = ObjectHeader::new(messages).create(&mut file.store, cfg.sizes)?;
        let stored = stab::insert(&mut file.store, &cfg, &grp.entry, &name, SymbolEntry::object(header))?;
        adjust_link_count(&mut file.store, cfg.sizes, header, 1)?;
        Ok(Location {
            file: grp.file,
            entry: stored,
        })
    }

    /// Add a hard link `new` to the object named by `cur`.
    pub fn link_hard(
        &mut self,
        cur_loc: &Location,
        cur: &str,
        new_loc: &Location,
        new: &str,
    ) -> Result<Location, FormatError> {
        let target = self.resolve(cur_loc, cur)?;
        let (grp, name) = self.creation_point(new_loc, new)?;
        if target.file != grp.file {
            return Err(FormatError::InterfileLink);
        }
        let Some(header) = target.entry.header else {
            return Err(FormatError::BadMessage(format!("{cur:?} has no object header")));
        };
        let file = self.file_mut(grp.file)?;
        let cfg = file.cfg;
        let stored = stab::insert(&mut file.store, &cfg, &grp.entry, &name, target.entry)?;
        adjust_link_count(&mut file.store, cfg.sizes, header, 1)?;
        trace!("hard link {new:?} -> {header:#x}");
        Ok(Location {
            file: grp.file,
            entry: stored,
        })
    }

    /// Add a soft link `new` whose value is `target`.
    pub fn link_soft(&mut self, target: &str, new_loc: &Location, new: &str) -> Result<Location, FormatError> {
        if target.is_empty() {
            return Err(FormatError::InvalidName("empty soft link value".into()));
        }
        check_component(target)?;
        let (grp, name) = self.creation_point(new_loc, new)?;
        let file = self.file_mut(grp.file)?;
        let cfg = file.cfg;
        let offset = stab::insert_value(&mut file.store, &cfg, &grp.entry, target)?;
        let stored = stab::insert(
            &mut file.store,
            &cfg,
            &grp.entry,
            &name,
            SymbolEntry::soft_link(offset),
        )?;
        trace!("soft link {new:?} -> {target:?}");
        Ok(Location {
            file: grp.file,
            entry: stored,
        })
    }

    /// Remove the final component of `path` from its group. The target is
    /// not followed; a hard link's object loses one link count.
    pub fn unlink(&mut self, loc: &Location, path: &str) -> Result<(), FormatError> {
        let lk = self.namei(loc, path, Target::NO_FOLLOW_LINK | Target::NO_FOLLOW_MOUNT)?;
        let Some(obj) = lk.object else {
            return Err(FormatError::NotFound(lk.rest));
        };
        if lk.name.is_empty() {
            return Err(FormatError::InvalidName(format!("cannot unlink {path:?}")));
        }
        let file = self.file_mut(lk.group.file)?;
        let cfg = file.cfg;
        stab::remove(&mut file.store, &cfg, &lk.group.entry, &lk.name)?;
        if let (false, Some(h)) = (obj.entry.is_soft_link(), obj.entry.header) {
            adjust_link_count(&mut file.store, cfg.sizes, h, -1)?;
        }
        debug!("unlinked {path:?}");
        Ok(())
    }

    /// Rename: link under `dst`, then unlink `src`. A soft link moves by
    /// value.
    pub fn move_link(
        &mut self,
        src_loc: &Location,
        src: &str,
        dst_loc: &Location,
        dst: &str,
    ) -> Result<Location, FormatError> {
        let info = self.get_objinfo(src_loc, src, false)?;
        let moved = if info.kind == ObjectKind::SoftLink {
            let value = self.get_linkval(src_loc, src)?;
            self.link_soft(&value, dst_loc, dst)?
        } else {
            let lk = self.namei(src_loc, src, Target::NO_FOLLOW_MOUNT)?;
            let target = lk.object.ok_or_else(|| FormatError::NotFound(lk.rest.clone()))?;
            let (grp, name) = self.creation_point(dst_loc, dst)?;
            if target.file != grp.file {
                return Err(FormatError::InterfileLink);
            }
            let file = self.file_mut(grp.file)?;
            let cfg = file.cfg;
            let stored = stab::insert(&mut file.store, &cfg, &grp.entry, &name, target.entry)?;
            if let Some(h) = stored.header {
                adjust_link_count(&mut file.store, cfg.sizes, h, 1)?;
            }
            Location {
                file: grp.file,
                entry: stored,
            }
        };
        self.unlink(src_loc, src)?;
        debug!("moved {src:?} -> {dst:?}");
        Ok(moved)
    }

    // ---- queries -------------------------------------------------------

    /// Describe the object at `path`; with `follow_link` false a final soft
    /// link is described itself.
    pub fn get_objinfo(
        &self,
        loc: &Location,
        path: &str,
        follow_link: bool,
    ) -> Result<ObjectInfo, FormatError> {
        let target = if follow_link {
            Target::FOLLOW
        } else {
            Target::NO_FOLLOW_LINK
        };
        let lk = self.namei(loc, path, target)?;
        let Some(obj) = lk.object else {
            return Err(FormatError::NotFound(lk.rest));
        };
        let file = self.file(obj.file)?;
        if obj.entry.is_soft_link() {
            let holder = self.file(lk.group.file)?;
            let value = stab::link_value(&holder.store, &holder.cfg, &lk.group.entry, &obj.entry)?;
            return Ok(ObjectInfo {
                file: obj.file,
                header: None,
                nlink: 0,
                kind: ObjectKind::SoftLink,
                link_len: value.len() + 1,
            });
        }
        let Some(addr) = obj.entry.header else {
            return Err(FormatError::CorruptIndex(format!("{path:?} has no object header")));
        };
        let header = ObjectHeader::load(&file.store, file.cfg.sizes, addr)?;
        Ok(ObjectInfo {
            file: obj.file,
            header: Some(addr),
            nlink: header.link_count,
            kind: self.registry.classify(&header),
            link_len: 0,
        })
    }

    /// Value of the soft link at `path`.
    pub fn get_linkval(&self, loc: &Location, path: &str) -> Result<String, FormatError> {
        let lk = self.namei(loc, path, Target::NO_FOLLOW_LINK)?;
        let Some(obj) = lk.object else {
            return Err(FormatError::NotFound(lk.rest));
        };
        if !obj.entry.is_soft_link() {
            return Err(FormatError::BadMessage(format!("{path:?} is not a soft link")));
        }
        let file = self.file(lk.group.file)?;
        stab::link_value(&file.store, &file.cfg, &lk.group.entry, &obj.entry)
    }

    /// Kind of the object at `path`, following links.
    pub fn get_type(&self, loc: &Location, path: &str) -> Result<ObjectKind, FormatError> {
        Ok(self.get_objinfo(loc, path, true)?.kind)
    }

    /// Visit the members of the group at `path` in name order.
    pub fn iterate<F>(&self, loc: &Location, path: &str, skip: usize, f: F) -> Result<i32, FormatError>
    where
        F: FnMut(&GroupMember) -> i32,
    {
        let grp = self.open_group(loc, path)?;
        let file = self.file(grp.file)?;
        stab::iterate(&file.store, &file.cfg, &grp.entry, skip, f)
    }

    /// Member names of the group at `path`.
    pub fn list(&self, loc: &Location, path: &str) -> Result<Vec<String>, FormatError> {
        let mut names = Vec::new();
        self.iterate(loc, path, 0, |m| {
            names.push(m.name.clone());
            0
        })?;
        Ok(names)
    }

    /// Structural check of the group index at `path`.
    pub fn validate_group(&self, loc: &Location, path: &str) -> Result<BTreeReport<u64>, FormatError> {
        let grp = self.open_group(loc, path)?;
        let file = self.file(grp.file)?;
        stab::validate(&file.store, &file.cfg, &grp.entry)
    }

    // ---- mounts --------------------------------------------------------

    /// The group at `path` if a file could be mounted on it: an existing
    /// group with an object header that is not already a mount point.
    pub fn mount_point(&self, loc: &Location, path: &str) -> Result<Location, FormatError> {
        let point = self.resolve_with(loc, path, Target::NO_FOLLOW_MOUNT)?;
        {
            let file = self.file(point.file)?;
            stab::table(&file.store, &file.cfg, &point.entry)?;
        }
        if self.mount_at(&point).is_some() {
            return Err(FormatError::AlreadyExists(format!("{path:?} is already a mount point")));
        }
        if point.entry.header.is_none() {
            return Err(FormatError::BadMessage(format!("{path:?} has no object header")));
        }
        Ok(point)
    }

    /// Mount `child`'s root group on the group at `path`.
    pub fn mount(&mut self, loc: &Location, path: &str, child: FileId) -> Result<(), FormatError> {
        let point = self.mount_point(loc, path)?;
        if self.file(child)?.mounted_on.is_some() {
            return Err(FormatError::AlreadyExists(format!("file {child:?} is already mounted")));
        }
        let mut f = point.file;
        loop {
            if f == child {
                return Err(FormatError::InvalidConfig("mount would create a cycle".into()));
            }
            match self.file(f)?.mounted_on {
                Some(parent) => f = parent.file,
                None => break,
            }
        }
        let Some(header) = point.entry.header else {
            return Err(FormatError::BadMessage(format!("{path:?} has no object header")));
        };
        self.mounts.push(MountPoint {
            parent: point.file,
            header,
            child,
        });
        self.file_mut(child)?.mounted_on = Some(point);
        debug!("mounted {child:?} on {path:?}");
        Ok(())
    }

    /// Remove the mount at `path`, returning the detached file's id.
    pub fn unmount(&mut self, loc: &Location, path: &str) -> Result<FileId, FormatError> {
        let point = self.resolve_with(loc, path, Target::NO_FOLLOW_MOUNT)?;
        let Some(idx) = self
            .mounts
            .iter()
            .position(|m| m.parent == point.file && Some(m.header) == point.entry.header)
        else {
            return Err(FormatError::NotFound(format!("{path:?} is not a mount point")));
        };
        let m = self.mounts.remove(idx);
        self.file_mut(m.child)?.mounted_on = None;
        debug!("unmounted {:?} from {path:?}", m.child);
        Ok(m.child)
    }

    /// Mount point the file is attached to, if any.
    pub fn mounted_on(&self, id: FileId) -> Result<Option<Location>, FormatError> {
        Ok(self.file(id)?.mounted_on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::object_header::MessageType;

    fn setup() -> (Hierarchy, Location) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut h = Hierarchy::new();
        let fcpl = FileCreateProps::new().sym_leaf_k(2).btree_k(2).heap_size_hint(64);
        let id = h.create_file(&fcpl, &FileAccessProps::new()).unwrap();
        let root = h.root(id).unwrap();
        (h, root)
    }

    fn dataset() -> Vec<HeaderMessage> {
        vec![
            HeaderMessage::new(MessageType::Dataspace, vec![0; 8]),
            HeaderMessage::new(MessageType::DataLayout, vec![0; 8]),
        ]
    }

    #[test]
    fn slash_and_dot() {
        let (mut h, root) = setup();
        let a = h.create_group(&root, "a", 0).unwrap();
        h.create_group(&root, "a/b", 0).unwrap();
        let b = h.resolve(&root, "/a/b").unwrap();

        let lk = h.namei(&b, "/", Target::FOLLOW).unwrap();
        assert!(lk.object.unwrap().same_object(&root));
        assert_eq!(lk.lookups, 0);

        let lk = h.namei(&b, ".", Target::FOLLOW).unwrap();
        assert!(lk.object.unwrap().same_object(&b));

        assert!(h.resolve(&root, "a/./b/.").unwrap().same_object(&b));
        assert!(h.resolve(&root, "//a//").unwrap().same_object(&a));
    }

    #[test]
    fn default_heap_size_comes_from_creation_props() {
        let (mut h, root) = setup();
        let plain = h.create_group(&root, "plain", 0).unwrap();
        let sized = h.create_group(&root, "sized", 512).unwrap();
        let file = h.file(root.file).unwrap();
        let heap_size = |loc: &Location| {
            let (_, heap) = loc.entry.symbol_table().unwrap();
            crate::local_heap::LocalHeap::load(&file.store, file.sizes(), heap)
                .unwrap()
                .size()
        };
        assert_eq!(heap_size(&plain), 64);
        assert_eq!(heap_size(&sized), 512);
    }

    #[test]
    fn nested_lookup_count() {
        let (mut h, root) = setup();
        let mut path = String::new();
        for i in 0..5 {
            path.push_str(&format!("/g{i}"));
            h.create_group(&root, &path, 0).unwrap();
        }
        let lk = h.namei(&root, &path, Target::FOLLOW).unwrap();
        assert!(lk.object.is_some());
        assert_eq!(lk.lookups, 5);
        assert_eq!(lk.name, "g4");
    }

    #[test]
    fn missing_component_reports_rest() {
        let (mut h, root) = setup();
        let a = h.create_group(&root, "a", 0).unwrap();
        let lk = h.namei(&root, "/a/x/y", Target::FOLLOW).unwrap();
        assert_eq!(lk.object, None);
        assert!(lk.group.same_object(&a));
        assert_eq!(lk.rest, "x/y");
        assert_eq!(lk.name, "x");

        let err = h.create_group(&root, "/a/x/y", 0).unwrap_err();
        assert_eq!(err, FormatError::NotFound("x".into()));
        let err = h.create_group(&root, "/a", 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        let err = h.create_group(&root, "/", 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidName);
    }

    #[test]
    fn soft_links_resolve_relative_to_their_group() {
        let (mut h, root) = setup();
        h.create_group(&root, "a", 0).unwrap();
        let target = h.create_group(&root, "a/target", 0).unwrap();
        h.link_soft("target", &root, "a/rel").unwrap();
        h.link_soft("/a/target", &root, "abs").unwrap();

        assert!(h.resolve(&root, "a/rel").unwrap().same_object(&target));
        assert!(h.resolve(&root, "abs").unwrap().same_object(&target));
        assert_eq!(h.get_linkval(&root, "a/rel").unwrap(), "target");

        let info = h.get_objinfo(&root, "abs", false).unwrap();
        assert_eq!(info.kind, ObjectKind::SoftLink);
        assert_eq!(info.link_len, "/a/target".len() + 1);
        assert_eq!(h.get_type(&root, "abs").unwrap(), ObjectKind::Group);

        // A link to a missing object is dangling, not a missing component.
        h.link_soft("/nowhere", &root, "dangling").unwrap();
        let err = h.resolve(&root, "dangling").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let lk = h.namei(&root, "dangling", Target::NO_FOLLOW_LINK).unwrap();
        assert!(lk.object.unwrap().entry.is_soft_link());
    }

    #[test]
    fn symlink_cycle_guard() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut h = Hierarchy::new();
        let fapl = FileAccessProps::new().max_symlinks(4);
        let id = h.create_file(&FileCreateProps::new(), &fapl).unwrap();
        let root = h.root(id).unwrap();
        h.create_group(&root, "end", 0).unwrap();

        // l0 -> l1 -> ... -> l3 -> end: four hops is within the limit.
        for i in 0..4 {
            let next = if i == 3 { "end".to_string() } else { format!("l{}", i + 1) };
            h.link_soft(&next, &root, &format!("l{i}")).unwrap();
        }
        h.resolve(&root, "l0").unwrap();

        h.link_soft("l0", &root, "l_extra").unwrap();
        let err = h.resolve(&root, "l_extra").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TooManySymlinks);

        h.link_soft("loop_b", &root, "loop_a").unwrap();
        h.link_soft("loop_a", &root, "loop_b").unwrap();
        let err = h.resolve(&root, "loop_a/x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TooManySymlinks);
    }

    #[test]
    fn hard_links_count_references() {
        let (mut h, root) = setup();
        let d = h.insert_object(&root, "data", dataset()).unwrap();
        assert_eq!(h.get_objinfo(&root, "data", true).unwrap().nlink, 1);
        h.create_group(&root, "g", 0).unwrap();
        let alias = h.link_hard(&root, "data", &root, "g/alias").unwrap();
        assert!(alias.same_object(&d));
        assert_eq!(h.get_objinfo(&root, "data", true).unwrap().nlink, 2);
        assert_eq!(h.get_type(&root, "g/alias").unwrap(), ObjectKind::Dataset);

        h.unlink(&root, "data").unwrap();
        let info = h.get_objinfo(&root, "g/alias", true).unwrap();
        assert_eq!(info.nlink, 1);
        assert!(h.resolve(&root, "data").unwrap_err().is_not_found());
    }

    #[test]
    fn unlink_does_not_follow() {
        let (mut h, root) = setup();
        h.create_group(&root, "real", 0).unwrap();
        h.link_soft("/real", &root, "ln").unwrap();
        h.unlink(&root, "ln").unwrap();
        assert!(h.resolve(&root, "real").is_ok());
        assert_eq!(h.get_objinfo(&root, "real", true).unwrap().nlink, 1);

        let err = h.unlink(&root, "/").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidName);
        let err = h.unlink(&root, "nothing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn move_group_and_soft_link() {
        let (mut h, root) = setup();
        h.create_group(&root, "foo", 0).unwrap();
        h.insert_object(&root, "foo/bar", dataset()).unwrap();
        h.link_soft("foo/bar", &root, "ln").unwrap();

        h.move_link(&root, "/foo", &root, "/baz").unwrap();
        assert!(h.resolve(&root, "/foo").unwrap_err().is_not_found());
        assert!(h.resolve(&root, "/baz/bar").is_ok());
        assert_eq!(h.get_objinfo(&root, "/baz", true).unwrap().nlink, 1);

        // The value is copied, not re-resolved: it still names foo/bar.
        h.move_link(&root, "ln", &root, "baz/ln").unwrap();
        assert_eq!(h.get_linkval(&root, "baz/ln").unwrap(), "foo/bar");
        assert!(h.resolve(&root, "baz/ln").unwrap_err().is_not_found());
        assert_eq!(h.list(&root, "/").unwrap(), vec!["baz"]);
    }

    #[test]
    fn mounts_redirect_resolution() {
        let (mut h, root) = setup();
        let mnt = h.create_group(&root, "mnt", 0).unwrap();
        let child = h.create_file(&FileCreateProps::new(), &FileAccessProps::new()).unwrap();
        let child_root = h.root(child).unwrap();
        h.create_group(&child_root, "inner", 0).unwrap();

        h.mount(&root, "/mnt", child).unwrap();
        let inner = h.resolve(&root, "/mnt/inner").unwrap();
        assert_eq!(inner.file, child);
        assert!(h.resolve(&root, "/mnt").unwrap().same_object(&child_root));
        let lk = h.namei(&root, "/mnt", Target::NO_FOLLOW_MOUNT).unwrap();
        assert!(lk.object.unwrap().same_object(&mnt));

        // "/" from inside the child is the top-level root.
        assert!(h.resolve(&inner, "/").unwrap().same_object(&root));

        let err = h.link_hard(&root, "/mnt/inner", &root, "/alias").unwrap_err();
        assert_eq!(err, FormatError::InterfileLink);
        let err = h.mount(&root, "/mnt", child).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        assert_eq!(h.unmount(&root, "/mnt").unwrap(), child);
        assert!(h.resolve(&root, "/mnt/inner").unwrap_err().is_not_found());
        assert_eq!(h.mounted_on(child).unwrap(), None);
    }

    #[test]
    fn mount_cycle_rejected() {
        let (mut h, root) = setup();
        h.create_group(&root, "mnt", 0).unwrap();
        let child = h.create_file(&FileCreateProps::new(), &FileAccessProps::new()).unwrap();
        let child_root = h.root(child).unwrap();
        h.create_group(&child_root, "back", 0).unwrap();
        h.mount(&root, "/mnt", child).unwrap();
        let err = h.mount(&child_root, "back", root.file).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn iterate_members_in_order() {
        let (mut h, root) = setup();
        for n in ["zeta", "alpha", "mid"] {
            h.create_group(&root, n, 0).unwrap();
        }
        h.link_soft("alpha", &root, "beta").unwrap();
        assert_eq!(h.list(&root, ".").unwrap(), vec!["alpha", "beta", "mid", "zeta"]);

        let mut first = None;
        let ret = h
            .iterate(&root, "/", 1, |m| {
                first = Some(m.name.clone());
                7
            })
            .unwrap();
        assert_eq!(ret, 7);
        assert_eq!(first.as_deref(), Some("beta"));

        let err = h.list(&root, "beta/x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn image_reopens() {
        let (mut h, root) = setup();
        h.create_group(&root, "persist", 0).unwrap();
        h.link_soft("/persist", &root, "p").unwrap();
        let file = h.remove_file(root.file).unwrap();
        let image = file.into_image().unwrap();

        let mut h2 = Hierarchy::new();
        let id = h2.open_file(image, &FileAccessProps::new()).unwrap();
        let root2 = h2.root(id).unwrap();
        assert_eq!(h2.list(&root2, "/").unwrap(), vec!["p", "persist"]);
        assert_eq!(h2.get_type(&root2, "p").unwrap(), ObjectKind::Group);
        assert_eq!(h2.file(id).unwrap().superblock().sym_leaf_k, 2);
    }
}
