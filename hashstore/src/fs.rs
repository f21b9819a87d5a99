//! Filesystem abstraction the store is built on: a store with many
//! named, independently sized files, where each subset owns a `.data`,
//! an `.index`, and a `.cache` file. Implementations need not be
//! threadsafe; callers serialize access through [`crate::sync`].

use std::io;
use std::path::PathBuf;

pub mod concrete;

/// A handle to an open file, opaque to callers. Implementations are
/// free to choose any internal representation (raw fd, map key, ...).
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Handle(usize);

impl Handle {
    pub fn from_raw(raw: usize) -> Self {
        Handle(raw)
    }

    pub fn raw(self) -> usize {
        self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("file not open: {name}")]
    NotOpen { name: String },
}

impl FsError {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        FsError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Basic file operations the store needs, keyed by logical file name
/// (e.g. `"0012.data"`).
pub trait FileSystem: Send + Sync {
    /// Opens `name` for read/write, creating it if absent.
    fn open(&self, name: &str) -> Result<Handle, FsError>;

    /// Removes the named file if it exists. No error if it doesn't.
    fn remove(&self, name: &str) -> Result<(), FsError>;

    /// `true` if a file named `name` currently exists.
    fn exists(&self, name: &str) -> bool;

    /// Lists file names directly under the root, for subset discovery
    /// on load.
    fn list(&self) -> Result<Vec<String>, FsError>;

    fn read_exact_at(&self, handle: Handle, buf: &mut [u8], offset: u64) -> Result<(), FsError>;
    fn write_at(&self, handle: Handle, buf: &[u8], offset: u64) -> Result<usize, FsError>;
    fn file_size(&self, handle: Handle) -> Result<u64, FsError>;
    fn truncate(&self, handle: Handle, size: u64) -> Result<(), FsError>;
    fn flush(&self, handle: Handle) -> Result<(), FsError>;

    /// Writes the whole buffer, looping on short writes.
    fn write_all_at(&self, handle: Handle, buf: &[u8], mut offset: u64) -> Result<(), FsError> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write_at(handle, &buf[written..], offset)?;
            written += n;
            offset += n as u64;
        }
        Ok(())
    }
}

/// Where a concrete filesystem implementation roots its files.
pub fn subset_file_name(subset_id: u16, extension: &str) -> String {
    format!("{subset_id:04x}.{extension}")
}

pub fn root_relative(root: &std::path::Path, name: &str) -> PathBuf {
    root.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subset_file_name_is_zero_padded_hex() {
        assert_eq!(subset_file_name(0, "data"), "0000.data");
        assert_eq!(subset_file_name(255, "index"), "00ff.index");
        assert_eq!(subset_file_name(4095, "cache"), "0fff.cache");
    }
}
