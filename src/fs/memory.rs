use super::{DirEntry, FileStat, FsError, FsResult, VirtualFs, vpath};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

/// Writable in-memory filesystem.
///
/// Every mutation stamps the touched entry with a modification time strictly
/// later than any earlier stamp, so cache invalidation never depends on the
/// host clock resolution.
#[derive(Debug, Default)]
pub struct MemoryFs {
    inner: RwLock<MemoryTree>,
}

#[derive(Debug)]
struct MemoryTree {
    files: BTreeMap<String, MemoryFile>,
    dirs: BTreeMap<String, SystemTime>,
    clock: SystemTime,
}

#[derive(Debug)]
struct MemoryFile {
    data: Vec<u8>,
    modified: SystemTime,
}

impl Default for MemoryTree {
    fn default() -> Self {
        let mut dirs = BTreeMap::new();
        dirs.insert("/".to_string(), SystemTime::UNIX_EPOCH);
        Self {
            files: BTreeMap::new(),
            dirs,
            clock: SystemTime::UNIX_EPOCH,
        }
    }
}

impl MemoryTree {
    fn tick(&mut self) -> SystemTime {
        let now = SystemTime::now();
        self.clock = if now > self.clock {
            now
        } else {
            self.clock + Duration::from_micros(1)
        };
        self.clock
    }

    fn ensure_parents(&mut self, path: &str, stamp: SystemTime) {
        let mut dir = vpath::dirname(path);
        while !self.dirs.contains_key(&dir) {
            self.dirs.insert(dir.clone(), stamp);
            dir = vpath::dirname(&dir);
        }
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filesystem from `(path, contents)` pairs
    pub fn with_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: AsRef<[u8]>,
    {
        let fs = Self::new();
        {
            let mut tree = fs.inner.write();
            for (path, contents) in files {
                let path = vpath::clean(path.as_ref());
                let stamp = tree.tick();
                tree.ensure_parents(&path, stamp);
                tree.files.insert(
                    path,
                    MemoryFile {
                        data: contents.as_ref().to_vec(),
                        modified: stamp,
                    },
                );
            }
        }
        fs
    }

    /// Advance the modification time of an existing file without changing it
    pub fn touch(&self, path: &str) -> FsResult<()> {
        let path = vpath::clean(path);
        let mut tree = self.inner.write();
        let stamp = tree.tick();
        match tree.files.get_mut(&path) {
            Some(file) => {
                file.modified = stamp;
                Ok(())
            }
            None => Err(FsError::NotFound(path)),
        }
    }
}

impl VirtualFs for MemoryFs {
    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let path = vpath::clean(path);
        self.inner
            .read()
            .files
            .get(&path)
            .map(|file| file.data.clone())
            .ok_or(FsError::NotFound(path))
    }

    fn stat(&self, path: &str) -> FsResult<FileStat> {
        let path = vpath::clean(path);
        let tree = self.inner.read();
        if let Some(file) = tree.files.get(&path) {
            return Ok(FileStat {
                modified: file.modified,
                is_dir: false,
                len: file.data.len() as u64,
            });
        }
        match tree.dirs.get(&path) {
            Some(modified) => Ok(FileStat {
                modified: *modified,
                is_dir: true,
                len: 0,
            }),
            None => Err(FsError::NotFound(path)),
        }
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let path = vpath::clean(path);
        let tree = self.inner.read();
        if !tree.dirs.contains_key(&path) {
            return if tree.files.contains_key(&path) {
                Err(FsError::NotADirectory(path))
            } else {
                Err(FsError::NotFound(path))
            };
        }

        let mut entries: Vec<DirEntry> = tree
            .dirs
            .keys()
            .filter(|dir| dir.as_str() != "/" && vpath::dirname(dir) == path)
            .map(|dir| DirEntry {
                name: vpath::basename(dir).to_string(),
                is_dir: true,
            })
            .chain(
                tree.files
                    .keys()
                    .filter(|file| vpath::dirname(file) == path)
                    .map(|file| DirEntry {
                        name: vpath::basename(file).to_string(),
                        is_dir: false,
                    }),
            )
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> FsResult<()> {
        let path = vpath::clean(path);
        let mut tree = self.inner.write();
        if tree.dirs.contains_key(&path) {
            return Err(FsError::Io {
                path,
                source: std::io::Error::new(std::io::ErrorKind::IsADirectory, "is a directory"),
            });
        }
        let stamp = tree.tick();
        tree.ensure_parents(&path, stamp);
        tree.files.insert(
            path,
            MemoryFile {
                data: contents.to_vec(),
                modified: stamp,
            },
        );
        Ok(())
    }

    fn create_dir_all(&self, path: &str) -> FsResult<()> {
        let path = vpath::clean(path);
        let mut tree = self.inner.write();
        if tree.files.contains_key(&path) {
            return Err(FsError::NotADirectory(path));
        }
        if !tree.dirs.contains_key(&path) {
            let stamp = tree.tick();
            tree.ensure_parents(&path, stamp);
            tree.dirs.insert(path, stamp);
        }
        Ok(())
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        let path = vpath::clean(path);
        let mut tree = self.inner.write();
        if tree.files.remove(&path).is_some() {
            return Ok(());
        }
        if path != "/" && tree.dirs.remove(&path).is_some() {
            let prefix = format!("{path}/");
            tree.files.retain(|file, _| !file.starts_with(&prefix));
            tree.dirs.retain(|dir, _| !dir.starts_with(&prefix));
            return Ok(());
        }
        Err(FsError::NotFound(path))
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_bump_modified_time() {
        let fs = MemoryFs::new();
        fs.write_file("/a.js", b"1").unwrap();
        let first = fs.stat("/a.js").unwrap().modified;
        fs.write_file("/a.js", b"2").unwrap();
        let second = fs.stat("/a.js").unwrap().modified;
        fs.touch("/a.js").unwrap();
        let third = fs.stat("/a.js").unwrap().modified;

        assert!(second > first);
        assert!(third > second);
        assert_eq!(fs.read_file("/a.js").unwrap(), b"2");
    }

    #[test]
    fn test_directories_are_implicit() {
        let fs = MemoryFs::with_files([("/routes/blog/index.js", "x"), ("/routes/a.js", "y")]);
        assert!(fs.stat("/routes/blog").unwrap().is_dir);
        let names: Vec<_> = fs
            .read_dir("/routes")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.js", "blog"]);
    }

    #[test]
    fn test_remove_directory_recursively() {
        let fs = MemoryFs::with_files([("/tmp/a/b.txt", "x")]);
        fs.remove("/tmp").unwrap();
        assert!(!fs.exists("/tmp/a/b.txt"));
        assert!(!fs.exists("/tmp/a"));
    }
}
