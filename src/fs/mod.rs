//! Virtual filesystem seen by route scripts, the module loader and the route scanner
//!
//! Every path handed to a [`VirtualFs`] is a `/`-rooted POSIX path that does not
//! depend on the host layout. The same site therefore runs unchanged from a host
//! directory ([`OsFs`]), an in-memory store ([`MemoryFs`]) or a read-only bundle
//! compiled into the binary ([`EmbeddedFs`]).
//!
//! Implementations must tolerate concurrent reads from several engine threads.

mod embedded;
mod memory;
mod os;
pub mod vpath;

pub use embedded::EmbeddedFs;
pub use memory::MemoryFs;
pub use os::OsFs;

use std::fmt::Debug;
use std::io;
use std::time::SystemTime;
use thiserror::Error;

/// Errors raised by filesystem backings
#[derive(Error, Debug)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("filesystem is read-only: {0}")]
    ReadOnly(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    /// Node-style error code exposed to scripts as `err.code`
    pub fn code(&self) -> &'static str {
        match self {
            FsError::NotFound(_) => "ENOENT",
            FsError::ReadOnly(_) => "EROFS",
            FsError::NotADirectory(_) => "ENOTDIR",
            FsError::Io { .. } => "EIO",
        }
    }

    pub(crate) fn from_io(path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            io::ErrorKind::ReadOnlyFilesystem => FsError::ReadOnly(path.to_string()),
            io::ErrorKind::NotADirectory => FsError::NotADirectory(path.to_string()),
            _ => FsError::Io {
                path: path.to_string(),
                source: err,
            },
        }
    }
}

/// Result type for filesystem operations
pub type FsResult<T> = Result<T, FsError>;

/// Metadata returned by [`VirtualFs::stat`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub modified: SystemTime,
    pub is_dir: bool,
    pub len: u64,
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Storage collaborator consumed by the loader, the dispatcher and the `fs` capability.
///
/// Mutating operations on a read-only backing fail with [`FsError::ReadOnly`].
pub trait VirtualFs: Send + Sync + Debug {
    fn read_file(&self, path: &str) -> FsResult<Vec<u8>>;

    fn stat(&self, path: &str) -> FsResult<FileStat>;

    /// Directory listing sorted by name
    fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>>;

    fn is_read_only(&self) -> bool;

    fn write_file(&self, path: &str, contents: &[u8]) -> FsResult<()>;

    fn create_dir_all(&self, path: &str) -> FsResult<()>;

    fn remove(&self, path: &str) -> FsResult<()>;

    /// Short backing name used in pool keys and log lines
    fn kind(&self) -> &'static str;

    fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    fn is_file(&self, path: &str) -> bool {
        self.stat(path).map(|stat| !stat.is_dir).unwrap_or(false)
    }

    fn read_to_string(&self, path: &str) -> FsResult<String> {
        let bytes = self.read_file(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Returned by a [`walk`] visitor to steer the traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    SkipDir,
}

/// Depth-first walk below `root`, visiting entries in name order.
///
/// The visitor receives the full virtual path of each entry. Returning
/// [`WalkControl::SkipDir`] for a directory skips its contents.
pub fn walk<F>(fs: &dyn VirtualFs, root: &str, visit: &mut F) -> FsResult<()>
where
    F: FnMut(&str, &DirEntry) -> WalkControl,
{
    let root = vpath::clean(root);
    for entry in fs.read_dir(&root)? {
        let path = vpath::join(&root, &entry.name);
        let control = visit(&path, &entry);
        if entry.is_dir && control == WalkControl::Continue {
            walk(fs, &path, visit)?;
        }
    }
    Ok(())
}
