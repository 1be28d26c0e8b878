//! HDF5 group storage engine.
//!
//! Local heaps, the generic v1 B-link tree, symbol-table nodes and the
//! group graph built on them: path resolution, hard and soft links, and
//! mounts. Everything works on a [`storage::Storage`] address space; the
//! crate supports `no_std` environments with the `alloc` crate.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
#[macro_use]
extern crate alloc;

pub mod btree;
pub mod codec;
pub mod entry;
pub mod error;
pub mod group_node;
pub mod hierarchy;
pub mod local_heap;
pub mod object_header;
pub mod property_list;
pub mod registry;
pub mod stab;
pub mod storage;
pub mod superblock;

pub use btree::{BTree, BTreeClass, BTreeParams, BTreeReport};
pub use codec::Sizes;
pub use entry::{EntryCache, SymbolEntry};
pub use error::{ErrorKind, FormatError};
pub use group_node::GroupMember;
pub use hierarchy::{FileId, H5File, Hierarchy, Location, Lookup, ObjectInfo, Target};
pub use local_heap::LocalHeap;
pub use object_header::{HeaderMessage, MessageType, ObjectHeader};
pub use property_list::{FileAccessProps, FileCreateProps, SplitRatios};
pub use registry::{ObjectKind, TypeRegistry};
pub use storage::{MemStorage, Storage};
pub use superblock::Superblock;
