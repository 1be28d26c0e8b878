//! File-level API over the HDF5 group storage engine.
//!
//! ```no_run
//! use h5group::File;
//!
//! let file = File::create("groups.h5").unwrap();
//! let root = file.root().unwrap();
//! root.create_group("runs").unwrap();
//! root.create_group("runs/2024").unwrap();
//! root.link_soft("/runs/2024", "latest").unwrap();
//! assert_eq!(root.members().unwrap(), vec!["latest", "runs"]);
//! file.flush().unwrap();
//! ```

pub mod error;
pub mod file;

pub use error::{Error, MountError};
pub use file::{File, Group};

pub use h5group_format::{
    ErrorKind, FileAccessProps, FileCreateProps, HeaderMessage, MessageType, ObjectInfo, ObjectKind,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Vec<HeaderMessage> {
        vec![HeaderMessage::new(MessageType::DataLayout, vec![0; 16])]
    }

    #[test]
    fn in_memory_groups() {
        let file = File::in_memory().unwrap();
        let root = file.root().unwrap();
        let g = root.create_group("a").unwrap();
        g.create_group("b").unwrap();
        assert!(root.exists("a/b").unwrap());
        assert!(!root.exists("a/c").unwrap());
        assert_eq!(file.group("/a").unwrap().members().unwrap(), vec!["b"]);
        assert_eq!(file.path().unwrap(), None);
    }

    #[test]
    fn bytes_round_trip() {
        let file = File::in_memory().unwrap();
        let root = file.root().unwrap();
        root.create_group("g").unwrap();
        root.insert_object("g/d", dataset()).unwrap();
        root.link_soft("g/d", "ln").unwrap();

        let reopened = File::from_bytes(file.to_bytes().unwrap()).unwrap();
        let root = reopened.root().unwrap();
        assert_eq!(root.kind("ln").unwrap(), ObjectKind::Dataset);
        assert_eq!(root.link_info("ln").unwrap().kind, ObjectKind::SoftLink);
        assert_eq!(root.link_value("ln").unwrap(), "g/d");
    }

    #[test]
    fn rename_and_unlink() {
        let file = File::in_memory().unwrap();
        let root = file.root().unwrap();
        root.create_group("foo").unwrap();
        root.create_group("foo/bar").unwrap();
        root.unlink("foo/bar").unwrap();
        root.rename("foo", "baz").unwrap();
        assert_eq!(root.members().unwrap(), vec!["baz"]);
        assert!(root.group("baz").unwrap().members().unwrap().is_empty());
        let err = root.group("foo").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn mount_requires_sole_handle() {
        let parent = File::in_memory().unwrap();
        let root = parent.root().unwrap();
        root.create_group("mnt").unwrap();

        let child = File::in_memory().unwrap();
        child.root().unwrap().create_group("inner").unwrap();
        let extra = child.clone();
        let err = root.mount("mnt", child).unwrap_err();
        assert!(matches!(err.error(), Error::Shared));

        let child = err.into_inner();
        drop(extra);
        root.mount("mnt", child).unwrap();
        assert!(root.exists("mnt/inner").unwrap());
    }

    #[test]
    fn failed_mount_hands_the_child_back() {
        let parent = File::in_memory().unwrap();
        let root = parent.root().unwrap();
        root.create_group("mnt").unwrap();
        root.insert_object("data", dataset()).unwrap();

        let child = File::in_memory().unwrap();
        child.root().unwrap().create_group("unsaved").unwrap();

        let err = root.mount("nope", child).unwrap_err();
        assert!(err.error().is_not_found());
        let child = err.into_inner();
        assert_eq!(child.root().unwrap().members().unwrap(), vec!["unsaved"]);

        let (err, child) = root.mount("data", child).unwrap_err().into_parts();
        assert_eq!(err.kind(), Some(ErrorKind::BadMessage));
        assert_eq!(child.root().unwrap().members().unwrap(), vec!["unsaved"]);

        root.mount("mnt", child).unwrap();
        let other = File::in_memory().unwrap();
        let (err, other) = root.mount("mnt", other).unwrap_err().into_parts();
        assert_eq!(err.kind(), Some(ErrorKind::AlreadyExists));
        assert!(other.root().unwrap().members().unwrap().is_empty());
        assert!(root.exists("mnt/unsaved").unwrap());
    }
}
