//! Storage seam for PEM material.
//!
//! The certificate store only ever needs three operations from its backing
//! storage: read a file, write a file, and check whether a file exists.
//! [`OsFs`] is the real filesystem; [`MemFs`] keeps everything in memory so
//! several services can share one process without touching disk.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

/// Permission class of a file written by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Certificates: world-readable.
    Public,
    /// Private keys: owner read/write only.
    Private,
}

impl FileMode {
    /// Unix permission bits for this class.
    #[must_use]
    pub const fn unix_bits(self) -> u32 {
        match self {
            Self::Public => 0o644,
            Self::Private => 0o600,
        }
    }
}

/// Minimal filesystem interface used by [`super::CertStore`].
pub trait CertFs: Send + Sync {
    /// Read the whole file at `path`.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Create or truncate `path` with `contents`, creating parent directories.
    fn write(&self, path: &Path, contents: &[u8], mode: FileMode) -> io::Result<()>;

    /// Whether `path` exists.
    fn exists(&self, path: &Path) -> bool;
}

// ─────────────────────────────────────────────────────────────────────────────
// OS filesystem
// ─────────────────────────────────────────────────────────────────────────────

/// [`CertFs`] backed by `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl CertFs for OsFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8], mode: FileMode) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_with_mode(path, contents, mode)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[cfg(unix)]
fn write_with_mode(path: &Path, contents: &[u8], mode: FileMode) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode.unix_bits())
        .open(path)?;
    // `mode` only applies on creation; an overwritten key keeps stale bits otherwise.
    file.set_permissions(fs::Permissions::from_mode(mode.unix_bits()))?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_with_mode(path: &Path, contents: &[u8], _mode: FileMode) -> io::Result<()> {
    fs::write(path, contents)
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory filesystem
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory [`CertFs`].
#[derive(Debug, Default)]
pub struct MemFs {
    files: RwLock<HashMap<PathBuf, (Vec<u8>, FileMode)>>,
}

impl MemFs {
    /// Create an empty in-memory filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Permission class a file was written with.
    pub fn mode(&self, path: &Path) -> Option<FileMode> {
        self.files.read().get(path).map(|(_, mode)| *mode)
    }
}

impl CertFs for MemFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files
            .read()
            .get(path)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn write(&self, path: &Path, contents: &[u8], mode: FileMode) -> io::Result<()> {
        self.files
            .write()
            .insert(path.to_path_buf(), (contents.to_vec(), mode));
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }
}
