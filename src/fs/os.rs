use super::{DirEntry, FileStat, FsError, FsResult, VirtualFs, vpath};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Writable filesystem rooted at a host directory
#[derive(Debug, Clone)]
pub struct OsFs {
    root: PathBuf,
}

impl OsFs {
    /// Create a filesystem rooted at `root`, which must be an existing directory
    pub fn new(root: impl AsRef<Path>) -> FsResult<Self> {
        let display = root.as_ref().to_string_lossy().into_owned();
        let root = root
            .as_ref()
            .canonicalize()
            .map_err(|e| FsError::from_io(&display, e))?;
        if !root.is_dir() {
            return Err(FsError::NotADirectory(display));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(vpath::relative(path))
    }
}

impl VirtualFs for OsFs {
    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        std::fs::read(self.host_path(path)).map_err(|e| FsError::from_io(path, e))
    }

    fn stat(&self, path: &str) -> FsResult<FileStat> {
        let meta = std::fs::metadata(self.host_path(path)).map_err(|e| FsError::from_io(path, e))?;
        Ok(FileStat {
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            is_dir: meta.is_dir(),
            len: meta.len(),
        })
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let reader =
            std::fs::read_dir(self.host_path(path)).map_err(|e| FsError::from_io(path, e))?;

        let mut entries = Vec::new();
        for entry in reader {
            let entry = entry.map_err(|e| FsError::from_io(path, e))?;
            let is_dir = entry
                .file_type()
                .map(|t| t.is_dir())
                .map_err(|e| FsError::from_io(path, e))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> FsResult<()> {
        std::fs::write(self.host_path(path), contents).map_err(|e| FsError::from_io(path, e))
    }

    fn create_dir_all(&self, path: &str) -> FsResult<()> {
        std::fs::create_dir_all(self.host_path(path)).map_err(|e| FsError::from_io(path, e))
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        let host = self.host_path(path);
        let result = if host.is_dir() {
            std::fs::remove_dir_all(&host)
        } else {
            std::fs::remove_file(&host)
        };
        result.map_err(|e| FsError::from_io(path, e))
    }

    fn kind(&self) -> &'static str {
        "os"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs::new(dir.path()).unwrap();

        fs.create_dir_all("/routes/api").unwrap();
        fs.write_file("/routes/api/users.js", b"exports.get = 1;").unwrap();

        assert_eq!(fs.read_to_string("/routes/api/users.js").unwrap(), "exports.get = 1;");
        assert!(fs.stat("/routes/api").unwrap().is_dir);
        assert_eq!(
            fs.read_dir("/routes").unwrap(),
            vec![DirEntry { name: "api".into(), is_dir: true }]
        );

        fs.remove("/routes/api/users.js").unwrap();
        assert!(matches!(fs.stat("/routes/api/users.js"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_os_fs_cannot_escape_root() {
        let outer = tempfile::tempdir().unwrap();
        std::fs::write(outer.path().join("secret.txt"), "top").unwrap();
        std::fs::create_dir(outer.path().join("site")).unwrap();

        let fs = OsFs::new(outer.path().join("site")).unwrap();
        assert!(fs.read_file("/../secret.txt").is_err());
    }
}
