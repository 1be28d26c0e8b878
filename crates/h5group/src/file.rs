//! File and group handles.
//!
//! A [`File`] keeps its whole image in memory; [`File::flush`] writes it
//! back to the path it was opened from. Files mounted into another file
//! share that file's session, so paths may cross into them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use h5group_format::btree::BTreeReport;
use h5group_format::error::FormatError;
use h5group_format::group_node::GroupMember;
use h5group_format::hierarchy::{FileId, H5File, Hierarchy, Location, ObjectInfo};
use h5group_format::object_header::HeaderMessage;
use h5group_format::property_list::{FileAccessProps, FileCreateProps};
use h5group_format::registry::ObjectKind;
use log::debug;

use crate::error::{Error, MountError};

#[derive(Debug, Default)]
struct Session {
    hier: Hierarchy,
    paths: HashMap<FileId, PathBuf>,
}

impl Session {
    fn single(file: H5File, path: Option<PathBuf>) -> (Session, FileId) {
        let mut s = Session::default();
        let id = s.hier.add_file(file);
        if let Some(p) = path {
            s.paths.insert(id, p);
        }
        (s, id)
    }

    fn flush_one(&mut self, id: FileId) -> Result<(), Error> {
        self.hier.flush(id)?;
        if let Some(path) = self.paths.get(&id) {
            std::fs::write(path, self.hier.file(id)?.image())?;
            debug!("flushed {}", path.display());
        }
        Ok(())
    }
}

/// An open HDF5 file.
///
/// Cloning yields another handle to the same file.
#[derive(Debug, Clone)]
pub struct File {
    session: Arc<Mutex<Session>>,
    id: FileId,
}

impl File {
    fn wrap(file: H5File, path: Option<PathBuf>) -> File {
        let (session, id) = Session::single(file, path);
        File::from_session(session, id)
    }

    fn from_session(session: Session, id: FileId) -> File {
        File {
            session: Arc::new(Mutex::new(session)),
            id,
        }
    }

    /// Put `file` back into the session it was taken from.
    fn restore(mut session: Session, file: H5File, path: Option<PathBuf>) -> File {
        let id = session.hier.add_file(file);
        if let Some(p) = path {
            session.paths.insert(id, p);
        }
        File::from_session(session, id)
    }

    /// Create (or truncate) a file on disk with default properties.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<File, Error> {
        Self::create_with(path, &FileCreateProps::default(), &FileAccessProps::default())
    }

    pub fn create_with<P: AsRef<Path>>(
        path: P,
        fcpl: &FileCreateProps,
        fapl: &FileAccessProps,
    ) -> Result<File, Error> {
        let path = path.as_ref().to_path_buf();
        let file = H5File::create(fcpl, fapl)?;
        std::fs::write(&path, file.image())?;
        debug!("created {}", path.display());
        Ok(Self::wrap(file, Some(path)))
    }

    /// Open an existing file, reading it into memory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<File, Error> {
        Self::open_with(path, &FileAccessProps::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, fapl: &FileAccessProps) -> Result<File, Error> {
        let path = path.as_ref().to_path_buf();
        let image = std::fs::read(&path)?;
        let file = H5File::open(image, fapl)?;
        debug!("opened {}", path.display());
        Ok(Self::wrap(file, Some(path)))
    }

    /// A file with no backing path.
    pub fn in_memory() -> Result<File, Error> {
        Self::in_memory_with(&FileCreateProps::default(), &FileAccessProps::default())
    }

    pub fn in_memory_with(fcpl: &FileCreateProps, fapl: &FileAccessProps) -> Result<File, Error> {
        Ok(Self::wrap(H5File::create(fcpl, fapl)?, None))
    }

    /// Open an in-memory file image.
    pub fn from_bytes(image: Vec<u8>) -> Result<File, Error> {
        Self::from_bytes_with(image, &FileAccessProps::default())
    }

    pub fn from_bytes_with(image: Vec<u8>, fapl: &FileAccessProps) -> Result<File, Error> {
        Ok(Self::wrap(H5File::open(image, fapl)?, None))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Session>, Error> {
        self.session.lock().map_err(|_| Error::Poisoned)
    }

    fn with<R>(&self, f: impl FnOnce(&mut Hierarchy) -> Result<R, FormatError>) -> Result<R, Error> {
        let mut s = self.lock()?;
        Ok(f(&mut s.hier)?)
    }

    /// Path the file was opened from, if any.
    pub fn path(&self) -> Result<Option<PathBuf>, Error> {
        Ok(self.lock()?.paths.get(&self.id).cloned())
    }

    /// Flushed copy of the file image.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut s = self.lock()?;
        s.hier.flush(self.id)?;
        Ok(s.hier.file(self.id)?.image().to_vec())
    }

    /// Write this file and every file mounted in its session to disk.
    pub fn flush(&self) -> Result<(), Error> {
        let mut s = self.lock()?;
        let mut ids: Vec<FileId> = s.paths.keys().copied().collect();
        if !ids.contains(&self.id) {
            ids.push(self.id);
        }
        ids.sort();
        for id in ids {
            s.flush_one(id)?;
        }
        Ok(())
    }

    /// The root group of this file.
    pub fn root(&self) -> Result<Group<'_>, Error> {
        let loc = self.with(|h| h.root(self.id))?;
        Ok(Group { file: self, loc })
    }

    /// Open a group by path from the root.
    pub fn group(&self, path: &str) -> Result<Group<'_>, Error> {
        self.root()?.group(path)
    }
}

/// A group reached through a [`File`].
///
/// Relative paths given to its methods start at this group; absolute
/// paths start at the root of the top-level file.
#[derive(Debug, Clone, Copy)]
pub struct Group<'f> {
    file: &'f File,
    loc: Location,
}

impl<'f> Group<'f> {
    pub fn location(&self) -> Location {
        self.loc
    }

    fn derive(&self, loc: Location) -> Group<'f> {
        Group {
            file: self.file,
            loc,
        }
    }

    /// Create a group with the file's default heap size.
    pub fn create_group(&self, path: &str) -> Result<Group<'f>, Error> {
        self.create_group_sized(path, 0)
    }

    /// Create a group whose heap starts with `size_hint` bytes.
    pub fn create_group_sized(&self, path: &str, size_hint: u64) -> Result<Group<'f>, Error> {
        let loc = self.file.with(|h| h.create_group(&self.loc, path, size_hint))?;
        Ok(self.derive(loc))
    }

    pub fn group(&self, path: &str) -> Result<Group<'f>, Error> {
        let loc = self.file.with(|h| h.open_group(&self.loc, path))?;
        Ok(self.derive(loc))
    }

    /// Create a non-group object from header messages.
    pub fn insert_object(&self, path: &str, messages: Vec<HeaderMessage>) -> Result<ObjectInfo, Error> {
        self.file.with(|h| {
            h.insert_object(&self.loc, path, messages)?;
            h.get_objinfo(&self.loc, path, false)
        })
    }

    /// Hard link `new` to the object at `target`.
    pub fn link(&self, target: &str, new: &str) -> Result<(), Error> {
        self.file.with(|h| h.link_hard(&self.loc, target, &self.loc, new).map(|_| ()))
    }

    /// Soft link `new` with value `value`.
    pub fn link_soft(&self, value: &str, new: &str) -> Result<(), Error> {
        self.file.with(|h| h.link_soft(value, &self.loc, new).map(|_| ()))
    }

    pub fn unlink(&self, path: &str) -> Result<(), Error> {
        self.file.with(|h| h.unlink(&self.loc, path))
    }

    pub fn rename(&self, src: &str, dst: &str) -> Result<(), Error> {
        self.file
            .with(|h| h.move_link(&self.loc, src, &self.loc, dst).map(|_| ()))
    }

    /// Describe the object at `path`, following soft links.
    pub fn info(&self, path: &str) -> Result<ObjectInfo, Error> {
        self.file.with(|h| h.get_objinfo(&self.loc, path, true))
    }

    /// Describe `path` itself, even when it is a soft link.
    pub fn link_info(&self, path: &str) -> Result<ObjectInfo, Error> {
        self.file.with(|h| h.get_objinfo(&self.loc, path, false))
    }

    pub fn link_value(&self, path: &str) -> Result<String, Error> {
        self.file.with(|h| h.get_linkval(&self.loc, path))
    }

    pub fn kind(&self, path: &str) -> Result<ObjectKind, Error> {
        self.file.with(|h| h.get_type(&self.loc, path))
    }

    /// Whether `path` resolves to an object.
    pub fn exists(&self, path: &str) -> Result<bool, Error> {
        match self.file.with(|h| h.resolve(&self.loc, path)) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Member names in order.
    pub fn members(&self) -> Result<Vec<String>, Error> {
        self.file.with(|h| h.list(&self.loc, "."))
    }

    /// Visit members from index `skip`; a nonzero return from `f` stops
    /// the walk and is returned.
    pub fn iterate<F>(&self, skip: usize, f: F) -> Result<i32, Error>
    where
        F: FnMut(&GroupMember) -> i32,
    {
        self.file.with(|h| h.iterate(&self.loc, ".", skip, f))
    }

    /// Check this group's index structure.
    pub fn validate(&self) -> Result<BTreeReport<u64>, Error> {
        self.file.with(|h| h.validate_group(&self.loc, "."))
    }

    /// Mount `child` on the group at `path`.
    ///
    /// `child` must be its only handle. Files mounted on `child` itself
    /// are detached first. On failure `child` comes back inside the error.
    pub fn mount(&self, path: &str, child: File) -> Result<(), MountError> {
        let mut s = match self.file.lock() {
            Ok(s) => s,
            Err(e) => return Err(MountError::new(e, child)),
        };
        if let Err(e) = s.hier.mount_point(&self.loc, path) {
            return Err(MountError::new(e.into(), child));
        }

        let child_id = child.id;
        let session = match Arc::try_unwrap(child.session) {
            Ok(session) => session,
            Err(session) => {
                return Err(MountError::new(Error::Shared, File { session, id: child_id }));
            }
        };
        let mut session = match session.into_inner() {
            Ok(session) => session,
            Err(poisoned) => {
                let child = File::from_session(poisoned.into_inner(), child_id);
                return Err(MountError::new(Error::Poisoned, child));
            }
        };
        let h5 = match session.hier.remove_file(child_id) {
            Ok(h5) => h5,
            Err(e) => return Err(MountError::new(e.into(), File::from_session(session, child_id))),
        };
        let child_path = session.paths.remove(&child_id);

        let id = s.hier.add_file(h5);
        if let Some(p) = child_path {
            s.paths.insert(id, p);
        }
        if let Err(e) = s.hier.mount(&self.loc, path, id) {
            let child_path = s.paths.remove(&id);
            let child = match s.hier.remove_file(id) {
                Ok(h5) => File::restore(session, h5, child_path),
                Err(_) => File::from_session(session, child_id),
            };
            return Err(MountError::new(e.into(), child));
        }
        Ok(())
    }

    /// Detach the file mounted at `path` into its own handle.
    pub fn unmount(&self, path: &str) -> Result<File, Error> {
        let mut s = self.file.lock()?;
        let id = s.hier.unmount(&self.loc, path)?;
        let h5 = s.hier.remove_file(id)?;
        let child_path = s.paths.remove(&id);
        Ok(File::wrap(h5, child_path))
    }
}
