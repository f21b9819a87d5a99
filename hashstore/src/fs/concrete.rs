//! Real-filesystem-backed [`FileSystem`]: an arbitrary set of named
//! files under one root directory, opened on demand and kept by handle.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use tracing::{instrument, trace};

use super::{FileSystem, FsError, Handle};

pub struct ConcreteFileSystem {
    root: PathBuf,
    next_handle: AtomicUsize,
    open: RwLock<HashMap<Handle, (String, File)>>,
    by_name: RwLock<HashMap<String, Handle>>,
}

impl ConcreteFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FsError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| FsError::io(root.display().to_string(), e))?;
        Ok(ConcreteFileSystem {
            root,
            next_handle: AtomicUsize::new(1),
            open: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn with_file<F, R>(&self, handle: Handle, f: F) -> Result<R, FsError>
    where
        F: FnOnce(&File, &str) -> io::Result<R>,
    {
        let open = self.open.read().unwrap();
        let (name, file) = open
            .get(&handle)
            .ok_or_else(|| FsError::NotOpen { name: format!("{handle:?}") })?;
        f(file, name).map_err(|e| FsError::io(name.clone(), e))
    }
}

use std::io;

impl FileSystem for ConcreteFileSystem {
    #[instrument(skip(self))]
    fn open(&self, name: &str) -> Result<Handle, FsError> {
        if let Some(handle) = self.by_name.read().unwrap().get(name).copied() {
            return Ok(handle);
        }

        let path = self.path_for(name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| FsError::io(path.display().to_string(), e))?;

        let handle = Handle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        trace!(name, ?handle, "opened file");
        self.open.write().unwrap().insert(handle, (name.to_string(), file));
        self.by_name.write().unwrap().insert(name.to_string(), handle);
        Ok(handle)
    }

    fn remove(&self, name: &str) -> Result<(), FsError> {
        if let Some(handle) = self.by_name.write().unwrap().remove(name) {
            self.open.write().unwrap().remove(&handle);
        }
        let path = self.path_for(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::io(path.display().to_string(), e)),
        }
    }

    fn exists(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }

    fn list(&self) -> Result<Vec<String>, FsError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| FsError::io(self.root.display().to_string(), e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FsError::io(self.root.display().to_string(), e))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    #[instrument(skip(self, buf))]
    fn read_exact_at(&self, handle: Handle, buf: &mut [u8], offset: u64) -> Result<(), FsError> {
        self.with_file(handle, |file, name| {
            trace!(name, read_size = buf.len(), offset, "read_exact_at");
            file.read_exact_at(buf, offset)
        })
    }

    #[instrument(skip(self, buf))]
    fn write_at(&self, handle: Handle, buf: &[u8], offset: u64) -> Result<usize, FsError> {
        self.with_file(handle, |file, name| {
            trace!(name, write_size = buf.len(), offset, "write_at");
            file.write_at(buf, offset)
        })
    }

    fn file_size(&self, handle: Handle) -> Result<u64, FsError> {
        self.with_file(handle, |file, _| Ok(file.metadata()?.len()))
    }

    fn truncate(&self, handle: Handle, size: u64) -> Result<(), FsError> {
        self.with_file(handle, |file, _| file.set_len(size))
    }

    fn flush(&self, handle: Handle) -> Result<(), FsError> {
        self.with_file(handle, |file, _| file.sync_data())
    }
}
