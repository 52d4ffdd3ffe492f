use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// File metadata as reported by a source.
#[derive(Clone, Copy, Debug)]
pub struct SourceStat {
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub regular: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryKind {
    File,
    Dir,
    /// Symlink, device, socket, or anything else that is not indexed.
    Other,
}

/// One directory entry yielded by a walk.
#[derive(Debug)]
pub struct SourceEntry {
    /// Base name of the entry within its directory.
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// A read-only view of a file tree consumed by the scanner. Names are
/// unrooted slash-separated paths relative to the source root; "." names the
/// root directory itself.
pub trait FileSource: Sync {
    /// Opens the named file, returning a reader and the stat taken at open.
    fn open(&self, name: &str) -> io::Result<(Box<dyn Read + Send + '_>, SourceStat)>;

    /// Stats the named file (used for post-read verification).
    fn stat(&self, name: &str) -> io::Result<SourceStat>;

    /// Lists a directory in lexicographic order.
    fn read_dir(&self, dir: &str) -> io::Result<Vec<SourceEntry>>;

    /// The source root as a plain string, if it has one.
    fn root(&self) -> &str {
        ""
    }
}

/// Local-filesystem source rooted at a directory.
pub struct LocalSource {
    root: PathBuf,
    root_str: String,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> LocalSource {
        let root = root.into();
        let root_str = root.to_string_lossy().into_owned();
        LocalSource { root, root_str }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        if name == "." {
            self.root.clone()
        } else {
            self.root.join(name)
        }
    }
}

fn stat_of(md: &fs::Metadata) -> io::Result<SourceStat> {
    Ok(SourceStat {
        size: md.len(),
        mtime: md.modified()?.into(),
        regular: md.is_file(),
    })
}

impl FileSource for LocalSource {
    fn open(&self, name: &str) -> io::Result<(Box<dyn Read + Send + '_>, SourceStat)> {
        let f = fs::File::open(self.resolve(name))?;
        let stat = stat_of(&f.metadata()?)?;
        Ok((Box::new(f), stat))
    }

    fn stat(&self, name: &str) -> io::Result<SourceStat> {
        stat_of(&fs::metadata(self.resolve(name))?)
    }

    fn read_dir(&self, dir: &str) -> io::Result<Vec<SourceEntry>> {
        let mut entries = Vec::new();
        for e in fs::read_dir(self.resolve(dir))? {
            let e = e?;
            let ft = e.file_type()?;
            let md = e.metadata()?;
            let kind = if ft.is_file() {
                EntryKind::File
            } else if ft.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::Other
            };
            entries.push(SourceEntry {
                name: e.file_name().to_string_lossy().into_owned(),
                kind,
                size: md.len(),
                mtime: md.modified()?.into(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn root(&self) -> &str {
        &self.root_str
    }
}

/// In-memory source for tests, keyed by slash-separated file path.
#[cfg(test)]
pub(crate) mod mem {
    use std::collections::BTreeMap;

    use super::*;

    pub(crate) struct MemFile {
        pub data: Vec<u8>,
        pub mtime: DateTime<Utc>,
    }

    impl MemFile {
        pub(crate) fn new(data: &[u8], mtime: DateTime<Utc>) -> MemFile {
            MemFile {
                data: data.to_vec(),
                mtime,
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct MemSource {
        pub files: BTreeMap<String, MemFile>,
        /// Names reported as neither regular files nor directories.
        pub others: Vec<String>,
        pub root: String,
    }

    impl MemSource {
        pub(crate) fn insert(&mut self, name: &str, data: &[u8], mtime: DateTime<Utc>) {
            self.files.insert(name.to_string(), MemFile::new(data, mtime));
        }

        fn is_dir(&self, name: &str) -> bool {
            if name == "." {
                return true;
            }
            let prefix = format!("{name}/");
            self.files.keys().any(|k| k.starts_with(&prefix))
        }
    }

    impl FileSource for MemSource {
        fn open(&self, name: &str) -> io::Result<(Box<dyn Read + Send + '_>, SourceStat)> {
            let stat = self.stat(name)?;
            if !stat.regular {
                return Err(io::Error::new(io::ErrorKind::Other, "not a regular file"));
            }
            let data = self.files[name].data.clone();
            Ok((Box::new(io::Cursor::new(data)), stat))
        }

        fn stat(&self, name: &str) -> io::Result<SourceStat> {
            if let Some(f) = self.files.get(name) {
                return Ok(SourceStat {
                    size: f.data.len() as u64,
                    mtime: f.mtime,
                    regular: true,
                });
            }
            if self.is_dir(name) {
                return Ok(SourceStat {
                    size: 0,
                    mtime: DateTime::UNIX_EPOCH,
                    regular: false,
                });
            }
            Err(io::Error::new(io::ErrorKind::NotFound, name.to_string()))
        }

        fn read_dir(&self, dir: &str) -> io::Result<Vec<SourceEntry>> {
            if !self.is_dir(dir) {
                return Err(io::Error::new(io::ErrorKind::NotFound, dir.to_string()));
            }
            let prefix = if dir == "." {
                String::new()
            } else {
                format!("{dir}/")
            };
            let mut children: BTreeMap<String, SourceEntry> = BTreeMap::new();
            for path in &self.others {
                if let Some(rest) = path.strip_prefix(&prefix) {
                    if !rest.is_empty() && !rest.contains('/') {
                        children.insert(
                            rest.to_string(),
                            SourceEntry {
                                name: rest.to_string(),
                                kind: EntryKind::Other,
                                size: 0,
                                mtime: DateTime::UNIX_EPOCH,
                            },
                        );
                    }
                }
            }
            for (path, f) in &self.files {
                let Some(rest) = path.strip_prefix(&prefix) else {
                    continue;
                };
                if rest.is_empty() {
                    continue;
                }
                match rest.find('/') {
                    None => {
                        children.insert(
                            rest.to_string(),
                            SourceEntry {
                                name: rest.to_string(),
                                kind: EntryKind::File,
                                size: f.data.len() as u64,
                                mtime: f.mtime,
                            },
                        );
                    }
                    Some(i) => {
                        let name = &rest[..i];
                        children.entry(name.to_string()).or_insert(SourceEntry {
                            name: name.to_string(),
                            kind: EntryKind::Dir,
                            size: 0,
                            mtime: DateTime::UNIX_EPOCH,
                        });
                    }
                }
            }
            Ok(children.into_values().collect())
        }

        fn root(&self) -> &str {
            &self.root
        }
    }
}
