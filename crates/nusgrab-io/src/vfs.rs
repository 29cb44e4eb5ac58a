//! Storage capability consumed by the write queue.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Blocking storage operations, abstracted so the worker never talks to
/// `std::fs` directly and tests can run against memory.
pub trait Vfs: Send + Sync {
    /// Create (truncating) a file. `prealloc` is a size hint in bytes;
    /// implementations may ignore it.
    fn create(&self, path: &Path, prealloc: u64) -> io::Result<Box<dyn Write + Send>>;

    /// Open an existing file for appending, creating it when absent.
    fn append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Size of the file, or `None` when it does not exist.
    fn size(&self, path: &Path) -> io::Result<Option<u64>>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// Production implementation over `std::fs`.
#[derive(Debug, Default)]
pub struct StdVfs;

impl Vfs for StdVfs {
    fn create(&self, path: &Path, prealloc: u64) -> io::Result<Box<dyn Write + Send>> {
        let file = File::create(path)?;
        if prealloc > 0 {
            preallocate(&file, prealloc);
        }
        Ok(Box::new(file))
    }

    fn append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(file))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn size(&self, path: &Path) -> io::Result<Option<u64>> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }
}

// The hint keeps large content files contiguous; failure to honor it is
// not an error. KEEP_SIZE is required: resume offsets and completion
// checks are derived from the visible length, which must keep tracking
// the bytes actually written.
#[cfg(target_os = "linux")]
fn preallocate(file: &File, len: u64) {
    use nix::fcntl::{FallocateFlags, fallocate};

    let _ = fallocate(file, FallocateFlags::FALLOC_FL_KEEP_SIZE, 0, len as i64);
}

#[cfg(not(target_os = "linux"))]
fn preallocate(_file: &File, _len: u64) {}

/// In-memory implementation for tests.
#[derive(Debug, Clone, Default)]
pub struct MemVfs {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl MemVfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock().get(path).cloned()
    }

    pub fn insert(&self, path: &Path, bytes: Vec<u8>) {
        self.lock().insert(path.to_path_buf(), bytes);
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Vec<u8>>> {
        match self.files.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct MemWriter {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
    path: PathBuf,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut files = match self.files.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        files.entry(self.path.clone()).or_default().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Vfs for MemVfs {
    fn create(&self, path: &Path, _prealloc: u64) -> io::Result<Box<dyn Write + Send>> {
        self.lock().insert(path.to_path_buf(), Vec::new());
        Ok(Box::new(MemWriter {
            files: Arc::clone(&self.files),
            path: path.to_path_buf(),
        }))
    }

    fn append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        self.lock().entry(path.to_path_buf()).or_default();
        Ok(Box::new(MemWriter {
            files: Arc::clone(&self.files),
            path: path.to_path_buf(),
        }))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match self.lock().remove(path) {
            Some(_) => Ok(()),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn size(&self, path: &Path) -> io::Result<Option<u64>> {
        Ok(self.lock().get(path).map(|bytes| bytes.len() as u64))
    }

    fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}
