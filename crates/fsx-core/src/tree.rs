use std::sync::Arc;

use ahash::AHashMap;

use crate::error::Error;
use crate::flag::Flag;
use crate::hasher::Digest;
use crate::index::{File, Files, Index};
use crate::path::{Path, UniqueDirs};

/// A directory in the tree. Child directories and the atom link are keys
/// into the owning tree's directory map, so the graph has no owning cycles.
pub struct Dir {
    path: Path,
    dirs: Vec<Path>,
    files: Files,
    atom: Option<Path>,
    total_dirs: usize,
    total_files: usize,
    unique_files: usize,
}

impl Dir {
    fn new(path: Path) -> Dir {
        Dir {
            path,
            dirs: Vec::new(),
            files: Files::new(),
            atom: None,
            total_dirs: 0,
            total_files: 0,
            unique_files: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Child directories, ordered by base name.
    pub fn sub_dirs(&self) -> &[Path] {
        &self.dirs
    }

    /// Files in this directory, ordered by base name.
    pub fn files(&self) -> &Files {
        &self.files
    }

    /// The atomic container this directory belongs to, if any.
    pub fn atom(&self) -> Option<&Path> {
        self.atom.as_ref()
    }

    /// Total number of direct and indirect subdirectories.
    pub fn total_dirs(&self) -> usize {
        self.total_dirs
    }

    /// Total number of direct and indirect files.
    pub fn total_files(&self) -> usize {
        self.total_files
    }

    /// Number of distinct digests reachable via non-gone files.
    pub fn unique_files(&self) -> usize {
        self.unique_files
    }

    /// Returns a quality score in [0,1] for alt as an alternate location of
    /// this directory's files, with alt containing safe copies of `safe` out
    /// of `rem` remaining unique files.
    ///
    /// A perfect match is an exact subset of this directory's unique files
    /// with no extra files, a flat layout, and a nearby location. Ancestors
    /// of this directory are halved because they make visual confirmation of
    /// preservation impossible.
    pub(crate) fn alt_score(&self, alt: &Dir, safe: usize, rem: usize) -> f64 {
        assert!(
            0 < safe && safe <= alt.unique_files && safe <= rem && rem <= self.unique_files,
            "fsx: invalid file counts"
        );
        let s = safe as f64;
        let matches = (s / rem as f64) * (s / alt.unique_files as f64);
        let files = s / alt.total_files as f64;
        let dirs = 1.0 / (1.0 + alt.total_dirs as f64);
        let dist = 1.0 / self.path.dist(&self.path.common_root(&alt.path)) as f64;
        const A: f64 = 1.0 / 8.0;
        let mut score = (5.0 * A) * matches + A * files + A * dirs + A * dist;
        if alt.path.contains(&self.path) {
            score /= 2.0;
        }
        assert!((0.0..=1.0).contains(&score), "fsx: invalid score: {score}");
        score
    }
}

/// Directory names whose contents are treated as an inseparable container.
fn is_atomic(base: &str) -> bool {
    matches!(base, ".git" | ".svn")
}

/// A directory tree projection of an index. File records are shared with the
/// source index.
pub struct Tree {
    root: String,
    dirs: AHashMap<Path, Dir>,
    idx: AHashMap<Digest, Files>,
}

impl Tree {
    /// Builds the tree projection of x.
    pub(crate) fn build(x: &Index) -> Tree {
        let mut t = Tree {
            root: x.root().to_string(),
            dirs: AHashMap::with_capacity(x.groups().len() / 8 + 1),
            idx: AHashMap::with_capacity(x.groups().len()),
        };
        t.dirs.insert(Path::root(), Dir::new(Path::root()));

        // Add each file to the tree, creating all required dir entries and
        // updating unique file counts.
        let mut unique = UniqueDirs::default();
        for g in x.groups() {
            if g.is_empty() {
                continue;
            }
            if t.idx.insert(g[0].digest(), g.clone()).is_some() {
                panic!("fsx: digest collision: {}", g[0].digest());
            }
            for f in g {
                if !f.flag().is_gone() {
                    t.add_file(f);
                    unique.add(f.dir());
                }
            }
            unique.for_each(|p| t.dirs.get_mut(p).unwrap().unique_files += 1);
        }

        // Sort directories and files by base name; duplicates are a fatal
        // integrity failure.
        for d in t.dirs.values_mut() {
            d.dirs.sort_by(|a, b| a.base().cmp(b.base()));
            for w in d.dirs.windows(2) {
                if w[0].base() == w[1].base() {
                    panic!("fsx: duplicate directory name: {}", w[1]);
                }
            }
            d.files.sort_by(|a, b| a.base().cmp(b.base()));
            for w in d.files.windows(2) {
                if w[0].base() == w[1].base() {
                    panic!("fsx: duplicate file name: {}", w[1].path());
                }
            }
        }

        // Find atomic directories; the outermost atomic ancestor wins.
        let mut atoms: Vec<Path> = t
            .dirs
            .keys()
            .filter(|p| is_atomic(p.base()))
            .cloned()
            .collect();
        atoms.sort_by(|a, b| a.cmp_path(b));
        for a in atoms {
            if t.dirs[&a].atom.is_some() {
                continue;
            }
            let mut stack = vec![a.clone()];
            while let Some(p) = stack.pop() {
                let d = t.dirs.get_mut(&p).unwrap();
                d.atom = Some(a.clone());
                stack.extend(d.dirs.iter().rev().cloned());
            }
        }

        // Update directory and file counts
        t.update_counts(&Path::root());
        t
    }

    fn add_file(&mut self, f: &Arc<File>) {
        let mut name = f.dir();
        if let Some(d) = self.dirs.get_mut(&name) {
            d.files.push(f.clone());
            return;
        }
        let mut d = Dir::new(name.clone());
        d.files.push(f.clone());
        while !name.is_root() {
            let parent = name.parent();
            let child = name.clone();
            self.dirs.insert(name, d);
            match self.dirs.get_mut(&parent) {
                Some(p) => {
                    p.dirs.push(child);
                    return;
                }
                None => {
                    d = Dir::new(parent.clone());
                    d.dirs.push(child);
                    name = parent;
                }
            }
        }
        unreachable!("fsx: corrupt directory tree");
    }

    fn update_counts(&mut self, p: &Path) -> (usize, usize) {
        let children = self.dirs[p].dirs.clone();
        let mut total_dirs = children.len();
        let mut total_files = self.dirs[p].files.len();
        for c in &children {
            let (td, tf) = self.update_counts(c);
            total_dirs += td;
            total_files += tf;
        }
        let d = self.dirs.get_mut(p).unwrap();
        d.total_dirs = total_dirs;
        d.total_files = total_files;
        if total_files < d.unique_files {
            panic!("fsx: invalid total or unique file count: {p}");
        }
        (total_dirs, total_files)
    }

    /// Converts the tree back to an index. Gone files are preserved so that
    /// their marks survive.
    pub fn to_index(&self) -> Index {
        let all: Files = self.idx.values().flatten().cloned().collect();
        Index::new(self.root.clone(), all)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Returns the named directory, if it exists.
    pub fn dir(&self, name: &str) -> Option<&Dir> {
        self.dirs.get(&Path::dir(name).ok()?)
    }

    pub(crate) fn dir_at(&self, p: &Path) -> Option<&Dir> {
        self.dirs.get(p)
    }

    pub(crate) fn group(&self, d: Digest) -> Option<&Files> {
        self.idx.get(&d)
    }

    pub(crate) fn digest_map(&self) -> &AHashMap<Digest, Files> {
        &self.idx
    }

    /// Returns the named file, if it exists.
    pub fn file(&self, name: &str) -> Option<&Arc<File>> {
        self.file_at(&Path::strict_file(name).ok()?)
    }

    pub(crate) fn file_at(&self, p: &Path) -> Option<&Arc<File>> {
        if p.is_dir() {
            return None;
        }
        let d = self.dirs.get(&p.parent())?;
        let base = p.base();
        let i = d
            .files
            .binary_search_by(|f| f.base().cmp(base))
            .ok()?;
        Some(&d.files[i])
    }

    /// Visits start and every directory below it in depth-first order.
    pub(crate) fn subtree<'a>(&'a self, start: &'a Dir) -> Subtree<'a> {
        Subtree {
            tree: self,
            stack: vec![start],
        }
    }

    /// Sets the duplicate flag for a single file or all files under a
    /// directory. Files that are already marked are unaffected.
    pub fn mark_dup(&self, name: &str) -> Result<(), Error> {
        self.mark(name, Flag::DUP)
    }

    /// Sets the junk flag for a single file or all files under a directory.
    /// Files that are already marked are unaffected.
    pub fn mark_junk(&self, name: &str) -> Result<(), Error> {
        self.mark(name, Flag::JUNK)
    }

    /// Sets the keep flag for a single file or all files under a directory.
    /// Files that are already marked are unaffected.
    pub fn mark_keep(&self, name: &str) -> Result<(), Error> {
        self.mark(name, Flag::KEEP)
    }

    fn mark(&self, name: &str, flag: Flag) -> Result<(), Error> {
        fn set(f: &Arc<File>, flag: Flag) {
            if f.flag().mark() == Flag::NONE {
                f.set_flag(f.flag() | flag);
            }
        }
        if flag == Flag::NONE || flag.clear(Flag::KEEP) != Flag::NONE {
            panic!("fsx: invalid mark: {flag:?}");
        }
        let (dir, file) = Path::either(name);
        if let Some(d) = dir.and_then(|p| self.dirs.get(&p)) {
            for d in self.subtree(d) {
                for f in &d.files {
                    set(f, flag);
                }
            }
            return Ok(());
        }
        if let Some(f) = file.and_then(|p| self.file_at(&p)) {
            set(f, flag);
            return Ok(());
        }
        Err(Error::NotFound(name.to_string()))
    }
}

pub(crate) struct Subtree<'a> {
    tree: &'a Tree,
    stack: Vec<&'a Dir>,
}

impl<'a> Iterator for Subtree<'a> {
    type Item = &'a Dir;

    fn next(&mut self) -> Option<&'a Dir> {
        let d = self.stack.pop()?;
        for c in d.dirs.iter().rev() {
            self.stack.push(&self.tree.dirs[c]);
        }
        Some(d)
    }
}
