//! Object type classification.
//!
//! A [`TypeRegistry`] is an ordered list of predicates over object headers.
//! The first predicate that matches decides the object's kind.

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, vec::Vec};

use crate::object_header::{MessageType, ObjectHeader};

/// Kind of object a header describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Group,
    Dataset,
    NamedDatatype,
    /// A soft link (never matched by a predicate; links have no header).
    SoftLink,
    /// Registered by a caller.
    Custom(u16),
    Unknown,
}

type Predicate = Box<dyn Fn(&ObjectHeader) -> bool + Send + Sync>;

/// Ordered `(predicate, kind)` list.
pub struct TypeRegistry {
    entries: Vec<(Predicate, ObjectKind)>,
}

impl core::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(_, k)| k))
            .finish()
    }
}

impl TypeRegistry {
    /// A registry that classifies nothing.
    pub fn empty() -> Self {
        TypeRegistry {
            entries: Vec::new(),
        }
    }

    /// Append a predicate; earlier registrations take precedence.
    pub fn register<F>(&mut self, kind: ObjectKind, predicate: F)
    where
        F: Fn(&ObjectHeader) -> bool + Send + Sync + 'static,
    {
        self.entries.push((Box::new(predicate), kind));
    }

    /// Put a predicate ahead of all existing ones.
    pub fn register_first<F>(&mut self, kind: ObjectKind, predicate: F)
    where
        F: Fn(&ObjectHeader) -> bool + Send + Sync + 'static,
    {
        self.entries.insert(0, (Box::new(predicate), kind));
    }

    pub fn classify(&self, header: &ObjectHeader) -> ObjectKind {
        self.entries
            .iter()
            .find(|(p, _)| p(header))
            .map_or(ObjectKind::Unknown, |(_, k)| *k)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TypeRegistry {
    /// Groups, then datasets, then named datatypes.
    fn default() -> Self {
        let mut reg = TypeRegistry::empty();
        reg.register(ObjectKind::Group, |h| h.has_message(MessageType::SymbolTable));
        reg.register(ObjectKind::Dataset, |h| h.has_message(MessageType::DataLayout));
        reg.register(ObjectKind::NamedDatatype, |h| {
            h.has_message(MessageType::Datatype) && !h.has_message(MessageType::DataLayout)
        });
        reg
    }
}
