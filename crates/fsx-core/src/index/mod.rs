pub(crate) mod codec;

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::Path as StdPath;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;

use crate::error::Error;
use crate::flag::{AtomicFlag, Flag};
use crate::hasher::Digest;
use crate::path::Path;
use crate::scanner::source::SourceStat;
use crate::tree::Tree;

/// A regular file in the indexed tree. Records are shared: the same `File`
/// appears in an `Index` group, in its parent `Dir`'s file list, and in the
/// `Tree` digest map. Only the flag is mutable.
pub struct File {
    path: Path,
    digest: Digest,
    size: u64,
    mtime: DateTime<Utc>,
    flag: AtomicFlag,
}

impl File {
    pub(crate) fn new(
        path: Path,
        digest: Digest,
        size: u64,
        mtime: DateTime<Utc>,
        flag: Flag,
    ) -> File {
        File {
            path,
            digest,
            size,
            mtime,
            flag: AtomicFlag::new(flag),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mod_time(&self) -> DateTime<Utc> {
        self.mtime
    }

    pub fn flag(&self) -> Flag {
        self.flag.get()
    }

    pub(crate) fn set_flag(&self, f: Flag) {
        self.flag.set(f);
    }

    /// Returns the parent directory of the file.
    pub fn dir(&self) -> Path {
        self.path.parent()
    }

    pub fn base(&self) -> &str {
        self.path.base()
    }

    /// Returns whether the file still has the same size and modification
    /// time as the given stat.
    pub(crate) fn is_same(&self, stat: &SourceStat) -> bool {
        stat.regular && stat.size == self.size && stat.mtime == self.mtime
    }

    /// Returns whether the file can be ignored for the purposes of
    /// deduplication.
    pub(crate) fn can_ignore(&self) -> bool {
        if self.size == 0 {
            return true;
        }
        let name = self.base();
        name.eq_ignore_ascii_case("Thumbs.db") || name.eq_ignore_ascii_case("desktop.ini")
    }

    /// Returns whether this is a safe copy located outside directory d.
    pub(crate) fn is_safe_outside_of(&self, d: &Path) -> bool {
        self.flag.get().is_safe() && !d.contains(&self.path)
    }

    /// Returns whether this is a safe copy located inside directory d.
    pub(crate) fn is_safe_in(&self, d: &Path) -> bool {
        self.flag.get().is_safe() && d.contains(&self.path)
    }

    /// Returns whether the file exists inside directory d.
    pub(crate) fn exists_in(&self, d: &Path) -> bool {
        !self.flag.get().is_gone() && d.contains(&self.path)
    }

    /// Sort order: path, gone bit, modification time, keep bits, size.
    pub(crate) fn cmp_order(&self, other: &File) -> Ordering {
        self.path
            .cmp_path(&other.path)
            .then_with(|| {
                let (a, b) = (self.flag.get(), other.flag.get());
                (a & Flag::GONE).bits().cmp(&(b & Flag::GONE).bits())
            })
            .then_with(|| self.mtime.cmp(&other.mtime))
            .then_with(|| {
                let (a, b) = (self.flag.get(), other.flag.get());
                a.mark().bits().cmp(&b.mark().bits())
            })
            .then_with(|| self.size.cmp(&other.size))
    }
}

impl PartialEq for File {
    fn eq(&self, other: &File) -> bool {
        self.path == other.path
            && self.digest == other.digest
            && self.size == other.size
            && self.mtime == other.mtime
            && self.flag.get() == other.flag.get()
    }
}

impl Eq for File {}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("path", &self.path)
            .field("digest", &self.digest)
            .field("size", &self.size)
            .field("mtime", &self.mtime)
            .field("flag", &self.flag.get())
            .finish()
    }
}

/// An ordered list of shared file records.
pub type Files = Vec<Arc<File>>;

/// Sorts files by path and other attributes.
pub(crate) fn sort_files(files: &mut [Arc<File>]) {
    files.par_sort_by(|a, b| a.cmp_order(b));
}

/// The root of an indexed file tree: an opaque root string and an ordered
/// list of file groups, each sharing one digest and size.
#[derive(PartialEq)]
pub struct Index {
    root: String,
    groups: Vec<Files>,
}

impl Index {
    /// Creates a new index from a list of files. The files are sorted and
    /// grouped by digest.
    pub fn new(root: impl Into<String>, mut all: Files) -> Index {
        let root = root.into();
        if all.is_empty() {
            return Index {
                root,
                groups: Vec::new(),
            };
        }
        sort_files(&mut all);
        Index {
            root,
            groups: group_by_digest(all),
        }
    }

    pub(crate) fn from_groups(root: String, groups: Vec<Files>) -> Index {
        Index { root, groups }
    }

    /// Returns the index root directory.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn groups(&self) -> &[Files] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Returns all files, sorted.
    pub fn files(&self) -> Files {
        let mut all: Files = self.groups.iter().flatten().cloned().collect();
        sort_files(&mut all);
        all
    }

    /// Converts the index to a directory tree. File records are shared with
    /// the tree.
    pub fn to_tree(&self) -> Tree {
        Tree::build(self)
    }

    /// Loads index contents from the named file.
    pub fn load(name: impl AsRef<StdPath>) -> Result<Index, Error> {
        let f = fs::File::open(name.as_ref())?;
        Index::read(f)
    }

    /// Saves index contents to the named file. An existing file is first
    /// renamed with a ".bak" extension.
    pub fn save(&self, name: impl AsRef<StdPath>) -> Result<(), Error> {
        self.save_inner(name.as_ref(), true)
    }

    /// Saves index contents to the named file, overwriting any existing file
    /// without a backup.
    pub fn overwrite(&self, name: impl AsRef<StdPath>) -> Result<(), Error> {
        self.save_inner(name.as_ref(), false)
    }

    fn save_inner(&self, name: &StdPath, backup: bool) -> Result<(), Error> {
        let dir = match name.parent() {
            Some(p) if p.as_os_str().is_empty() => StdPath::new("."),
            Some(p) => p,
            None => StdPath::new("."),
        };
        let base = name
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{base}."))
            .tempfile_in(dir)?;
        self.write(tmp.as_file_mut())?;
        tmp.as_file_mut().flush()?;
        if backup {
            match fs::symlink_metadata(name) {
                Ok(md) if !md.is_file() => {
                    return Err(Error::IrregularBackup(name.display().to_string()));
                }
                Ok(_) => {
                    let mut bak = name.as_os_str().to_owned();
                    bak.push(".bak");
                    fs::rename(name, &bak)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tmp.persist(name).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Reads zstd-compressed index contents from src.
    pub fn read(src: impl Read) -> Result<Index, Error> {
        let dec = zstd::stream::Decoder::new(src)?;
        codec::read_text(dec)
    }

    /// Writes zstd-compressed index contents to dst.
    pub fn write(&self, dst: impl Write) -> Result<(), Error> {
        let mut enc = zstd::stream::Encoder::new(dst, 0)?;
        codec::write_text(self, &mut enc)?;
        enc.finish()?;
        Ok(())
    }

    /// Reads uncompressed index contents from src.
    pub fn read_text(src: impl Read) -> Result<Index, Error> {
        codec::read_text(src)
    }

    /// Writes uncompressed index contents to dst.
    pub fn write_text(&self, dst: impl Write) -> Result<(), Error> {
        codec::write_text(self, dst)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("root", &self.root)
            .field("groups", &self.groups)
            .finish()
    }
}

/// Combines files with identical digests into groups. Group order equals the
/// first appearance of each digest in the input; the relative file order
/// within each group is preserved. Two files sharing a digest but not a size
/// are a fatal integrity failure.
pub(crate) fn group_by_digest(all: Files) -> Vec<Files> {
    let mut idx: ahash::AHashMap<Digest, usize> = ahash::AHashMap::with_capacity(all.len());
    let mut groups: Vec<Files> = Vec::new();
    for f in all {
        match idx.entry(f.digest()) {
            std::collections::hash_map::Entry::Occupied(e) => {
                let g = &mut groups[*e.get()];
                if g[0].size() != f.size() {
                    panic!(
                        "fsx: digest collision: {:?} != {:?}",
                        g[0].path(),
                        f.path()
                    );
                }
                g.push(f);
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(groups.len());
                groups.push(vec![f]);
            }
        }
    }
    groups
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn group_order_and_membership() {
        let (d1, d2) = (digest(1), digest(2));
        let t0 = t("2009-11-10T23:00:00Z");
        let a = file("X/a", d1, 1, t0, Flag::NONE);
        let b = file("X/b", d2, 2, t0, Flag::NONE);
        let c = file("c", d1, 1, t0, Flag::NONE);

        let x = Index::new("", vec![c.clone(), a.clone(), b.clone()]);
        assert_eq!(2, x.groups().len());
        // Sorted order is X/a, X/b, c, so d1 appears first
        assert_eq!(vec![a.clone(), c.clone()], x.groups()[0]);
        assert_eq!(vec![b.clone()], x.groups()[1]);

        let all = x.files();
        assert_eq!(vec![a, b, c], all);
    }

    #[test]
    fn empty_index() {
        let x = Index::new("root", Vec::new());
        assert!(x.is_empty());
        assert_eq!("root", x.root());
    }

    #[test]
    #[should_panic(expected = "digest collision")]
    fn size_mismatch_panics() {
        let d1 = digest(1);
        let t0 = t("2009-11-10T23:00:00Z");
        let a = file("a", d1, 1, t0, Flag::NONE);
        let b = file("b", d1, 2, t0, Flag::NONE);
        Index::new("", vec![a, b]);
    }

    #[test]
    fn sort_key() {
        let d1 = digest(1);
        let (t0, t1) = (t("2009-11-10T23:00:00Z"), t("2009-11-11T23:00:01Z"));
        let gone = file("p", d1, 1, t0, Flag::KEEP | Flag::GONE);
        let live = file("p", d1, 1, t1, Flag::NONE);
        let mut fs = vec![gone.clone(), live.clone()];
        sort_files(&mut fs);
        // Live file sorts before the gone one regardless of time
        assert_eq!(vec![live, gone], fs);
    }
}
