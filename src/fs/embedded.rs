use super::{DirEntry, FileStat, FsError, FsResult, VirtualFs, vpath};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

/// Read-only filesystem over a bundle of files compiled into the binary.
///
/// All entries share one modification time taken when the bundle is built.
#[derive(Debug, Clone)]
pub struct EmbeddedFs {
    files: BTreeMap<String, Cow<'static, [u8]>>,
    dirs: BTreeSet<String>,
    built: SystemTime,
}

impl EmbeddedFs {
    pub fn new<I, P, C>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: Into<Cow<'static, [u8]>>,
    {
        let mut files = BTreeMap::new();
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());

        for (path, contents) in entries {
            let path = vpath::clean(path.as_ref());
            let mut dir = vpath::dirname(&path);
            while dirs.insert(dir.clone()) {
                dir = vpath::dirname(&dir);
            }
            files.insert(path, contents.into());
        }

        Self {
            files,
            dirs,
            built: SystemTime::now(),
        }
    }

    /// Bundle from a static table, typically generated with `include_bytes!`
    pub fn from_static(entries: &'static [(&'static str, &'static [u8])]) -> Self {
        Self::new(entries.iter().map(|(path, data)| (*path, Cow::Borrowed(*data))))
    }
}

impl VirtualFs for EmbeddedFs {
    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let path = vpath::clean(path);
        self.files
            .get(&path)
            .map(|data| data.to_vec())
            .ok_or(FsError::NotFound(path))
    }

    fn stat(&self, path: &str) -> FsResult<FileStat> {
        let path = vpath::clean(path);
        if let Some(data) = self.files.get(&path) {
            return Ok(FileStat {
                modified: self.built,
                is_dir: false,
                len: data.len() as u64,
            });
        }
        if self.dirs.contains(&path) {
            return Ok(FileStat {
                modified: self.built,
                is_dir: true,
                len: 0,
            });
        }
        Err(FsError::NotFound(path))
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let path = vpath::clean(path);
        if !self.dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }
        let mut entries: Vec<DirEntry> = self
            .dirs
            .iter()
            .filter(|dir| dir.as_str() != "/" && vpath::dirname(dir) == path)
            .map(|dir| DirEntry {
                name: vpath::basename(dir).to_string(),
                is_dir: true,
            })
            .chain(
                self.files
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
        true
    }

    fn write_file(&self, path: &str, _contents: &[u8]) -> FsResult<()> {
        Err(FsError::ReadOnly(vpath::clean(path)))
    }

    fn create_dir_all(&self, path: &str) -> FsResult<()> {
        Err(FsError::ReadOnly(vpath::clean(path)))
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        Err(FsError::ReadOnly(vpath::clean(path)))
    }

    fn kind(&self) -> &'static str {
        "embedded"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static BUNDLE: &[(&str, &[u8])] = &[
        ("/routes/index.js", b"exports.get = function () {};"),
        ("/routes/index.html", b"<h1>{{ .Title }}</h1>"),
    ];

    #[test]
    fn test_reads_static_bundle() {
        let fs = EmbeddedFs::from_static(BUNDLE);
        assert!(fs.is_read_only());
        assert!(fs.stat("/routes").unwrap().is_dir);
        assert_eq!(fs.read_dir("/routes").unwrap().len(), 2);
        assert_eq!(fs.read_to_string("/routes/index.html").unwrap(), "<h1>{{ .Title }}</h1>");
    }

    #[test]
    fn test_mutations_are_rejected() {
        let fs = EmbeddedFs::from_static(BUNDLE);
        let err = fs.write_file("/routes/new.txt", b"x").unwrap_err();
        assert!(matches!(err, FsError::ReadOnly(_)));
        assert_eq!(err.code(), "EROFS");
        assert!(err.to_string().contains("read-only"));
        assert!(matches!(fs.remove("/routes/index.js"), Err(FsError::ReadOnly(_))));
        assert!(matches!(fs.create_dir_all("/x"), Err(FsError::ReadOnly(_))));
    }
}
