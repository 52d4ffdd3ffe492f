use std::cmp::Ordering;
use std::fmt;

use crate::error::Error;

const EMPTY_PATH: &str = "fsx: empty path";

/// An unrooted, clean, slash-separated path. Except for the special "." root,
/// a directory path always ends with a '/'. A file path never does.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Path {
    p: String,
}

impl Path {
    /// The special "." root directory.
    pub fn root() -> Path {
        Path { p: ".".to_string() }
    }

    /// Creates a directory path, appending the '/' suffix if absent.
    pub fn dir(p: &str) -> Result<Path, Error> {
        let mut c = clean_path(p).ok_or_else(|| Error::InvalidPath(p.to_string()))?;
        if c != "." && !c.ends_with('/') {
            c.push('/');
        }
        Ok(Path { p: c })
    }

    /// Creates a file path. The input must already be in canonical form.
    pub fn strict_file(p: &str) -> Result<Path, Error> {
        match clean_path(p) {
            Some(c) if c == p && Path::is_file_str(&c) => Ok(Path { p: c }),
            _ => Err(Error::InvalidPath(p.to_string())),
        }
    }

    /// Returns the directory and/or file interpretations of p, depending on
    /// which one is possible.
    pub fn either(p: &str) -> (Option<Path>, Option<Path>) {
        match clean_path(p) {
            None => (None, None),
            Some(c) if c == "." || c.ends_with('/') => (Some(Path { p: c }), None),
            Some(c) => {
                let dir = Path { p: format!("{c}/") };
                (Some(dir), Some(Path { p: c }))
            }
        }
    }

    /// Wraps a string that is already known to be a clean path.
    pub(crate) fn new_unchecked(p: impl Into<String>) -> Path {
        Path { p: p.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.p
    }

    pub fn is_root(&self) -> bool {
        self.p == "."
    }

    pub fn is_dir(&self) -> bool {
        !self.p.is_empty() && (self.p == "." || self.p.ends_with('/'))
    }

    pub fn is_file(&self) -> bool {
        Path::is_file_str(&self.p)
    }

    fn is_file_str(p: &str) -> bool {
        !p.is_empty() && p != "." && !p.ends_with('/')
    }

    /// Returns whether other is under the directory tree self. It returns
    /// true if the paths are equal (same directory) or if self is ".".
    pub fn contains(&self, other: &Path) -> bool {
        self.p == "."
            || (!self.p.is_empty()
                && self.p.len() <= other.p.len()
                && other.p.starts_with(self.p.as_str())
                && self.p.ends_with('/'))
    }

    /// Returns the parent directory.
    pub fn parent(&self) -> Path {
        if self.p.is_empty() {
            panic!("{EMPTY_PATH}");
        }
        let trimmed = &self.p[..self.p.len() - 1];
        match trimmed.rfind('/') {
            Some(0) => panic!("fsx: rooted path: {}", self.p),
            Some(i) => Path::new_unchecked(&self.p[..i + 1]),
            None => Path::root(),
        }
    }

    /// Returns the last element of the path.
    pub fn base(&self) -> &str {
        if self.p.is_empty() {
            panic!("{EMPTY_PATH}");
        }
        if self.p == "." {
            return ".";
        }
        let s = self.p.strip_suffix('/').unwrap_or(&self.p);
        match s.rfind('/') {
            Some(i) => &s[i + 1..],
            None => s,
        }
    }

    /// Returns the path that is a parent of both self and other.
    pub fn common_root(&self, other: &Path) -> Path {
        if self.p.is_empty() || other.p.is_empty() {
            panic!("{EMPTY_PATH}");
        }
        let (mut a, mut b) = (self.p.as_str(), other.p.as_str());
        loop {
            let i = a.find('/');
            if i.is_none() || i != b.find('/') || a[..i.unwrap()] != b[..i.unwrap()] {
                let s = &self.p[..self.p.len() - a.len()];
                if s.is_empty() {
                    return Path::root();
                }
                return Path::new_unchecked(s);
            }
            let i = i.unwrap();
            a = &a[i + 1..];
            b = &b[i + 1..];
        }
    }

    /// Returns the distance between two paths in terms of directories
    /// traversed to go from one to the other.
    pub fn dist(&self, other: &Path) -> usize {
        let r = self.common_root(other);
        let (mut a, mut b) = (self.p.as_str(), other.p.as_str());
        if !r.is_root() {
            a = &a[r.p.len()..];
            b = &b[r.p.len()..];
        }
        count_byte(a, b'/') + count_byte(b, b'/')
    }

    /// Compares two paths. Directories are considered less than files. Panics
    /// if either path is empty or if the same name refers to both a file and
    /// a directory.
    pub fn cmp_path(&self, other: &Path) -> Ordering {
        cmp_paths(&self.p, &other.p)
    }

    pub(crate) fn steps(&self) -> Steps {
        Steps {
            p: self.p.clone(),
            n: 0,
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.p)
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.p)
    }
}

fn less_if(cond: bool) -> Ordering {
    if cond {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

fn count_byte(s: &str, b: u8) -> usize {
    s.bytes().filter(|&c| c == b).count()
}

/// Total order over clean paths. The tie-break cascade on the first differing
/// byte: a '/' side is smaller; a directory-bearing side is smaller; numeric
/// byte order otherwise. A directory prefix sorts before any longer path.
pub(crate) fn cmp_paths(a: &str, b: &str) -> Ordering {
    if a == "." || b == "." {
        if a == b {
            return Ordering::Equal;
        }
        if a.is_empty() || b.is_empty() {
            panic!("{EMPTY_PATH}");
        }
        return less_if(a == "."); // Root is less than all other paths
    }
    let (ab, bb) = (a.as_bytes(), b.as_bytes());
    // Find the first byte mismatch
    for i in 0..ab.len().min(bb.len()) {
        if ab[i] != bb[i] {
            // Directory is less than a file
            let a_dir = ab[i..].contains(&b'/');
            let b_dir = bb[i..].contains(&b'/');
            if a_dir != b_dir {
                return less_if(a_dir);
            }
            // Path separator is less than any other byte
            if ab[i] != b'/' && bb[i] != b'/' {
                return ab[i].cmp(&bb[i]);
            }
            return less_if(ab[i] == b'/');
        }
    }
    // One of the paths is a prefix of the other. If needed, swap the paths so
    // that a is a prefix of b to simplify the remaining logic.
    let (a, b, invert) = if ab.len() >= bb.len() {
        if ab.len() == bb.len() {
            return Ordering::Equal; // Same path
        }
        (bb, ab, true)
    } else {
        (ab, bb, false)
    };
    // a is a prefix of b and the next byte in b cannot be a '/' since the
    // same name cannot be both a file and a directory. Directories must end
    // with a '/' to keep ["b/", "b/c", "a"] ordering consistent.
    let b_sep = b[a.len()..].iter().position(|&c| c == b'/');
    if b_sep == Some(0) {
        panic!(
            "fsx: directory without separator suffix: {}",
            String::from_utf8_lossy(a)
        );
    }
    if a.is_empty() {
        panic!("{EMPTY_PATH}");
    }
    // If a ends with '/', then it's a parent of b. If b does not have any
    // more separators, then a and b are regular files in the same directory
    // and a is shorter. Otherwise, a is a file and b is a directory.
    less_if((a[a.len() - 1] == b'/' || b_sep.is_none()) != invert)
}

/// Returns a clean, slash-separated representation of p, or None if p is
/// invalid (empty, rooted, a volume/UNC name, or escaping via "..").
/// The trailing separator, if present, is preserved.
pub(crate) fn clean_path(p: &str) -> Option<String> {
    if p.is_empty() {
        return None;
    }
    let p = if p.contains('\\') {
        p.replace('\\', "/")
    } else {
        p.to_string()
    };
    let b = p.as_bytes();
    if b[0] == b'/' || (b.len() >= 2 && b[1] == b':' && b[0].is_ascii_alphabetic()) {
        return None;
    }
    let mut out: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if out.pop().is_none() {
                    return None;
                }
            }
            _ => out.push(seg),
        }
    }
    let mut c = out.join("/");
    if c.is_empty() {
        return Some(".".to_string());
    }
    let cb = c.as_bytes();
    if cb.len() >= 2 && (cb[1] == b':' || &cb[..2] == b"..") {
        return None;
    }
    if p.ends_with('/') {
        c.push('/');
    }
    Some(c)
}

/// Iterates over every step in a path, yielding each ancestor directory and
/// finally the path itself. The "." root is never yielded.
pub(crate) struct Steps {
    p: String,
    n: usize,
}

impl Steps {
    pub(crate) fn next(&mut self) -> Option<Path> {
        if self.n >= self.p.len() || self.p == "." {
            return None;
        }
        match self.p.as_bytes()[self.n..].iter().position(|&c| c == b'/') {
            Some(0) => panic!("fsx: rooted or non-clean path: {}", self.p),
            Some(i) => self.n += i + 1,
            None => self.n = self.p.len(),
        }
        Some(Path::new_unchecked(&self.p[..self.n]))
    }

    /// Fast-forwards so that next returns the step after p, provided p is an
    /// ancestor of the final path that hasn't been yielded yet.
    pub(crate) fn skip(&mut self, p: &Path) {
        if self.n < p.p.len()
            && p.p.len() <= self.p.len()
            && self.p[..p.p.len()] == p.p
            && p.p.ends_with('/')
        {
            self.n = p.p.len();
        }
    }
}

/// Visits all unique directories in a bag of directory paths, in pre-order,
/// rooted at ".".
#[derive(Default)]
pub(crate) struct UniqueDirs(Vec<Steps>);

impl UniqueDirs {
    pub(crate) fn add(&mut self, p: Path) {
        if !p.is_dir() {
            panic!("fsx: not a directory path: {p}");
        }
        self.0.push(p.steps());
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Calls f for each unique directory in the set, leaving the set empty.
    /// For a set containing "A/B/", "A/C/", and "D/", f is called for ".",
    /// "A/", "A/B/", "A/C/", and "D/".
    pub(crate) fn for_each(&mut self, mut f: impl FnMut(&Path)) {
        if !self.0.is_empty() {
            f(&Path::root());
        }
        while !self.0.is_empty() {
            match self.0[0].next() {
                Some(p) => {
                    f(&p);
                    for s in &mut self.0[1..] {
                        s.skip(&p);
                    }
                }
                None => {
                    self.0.remove(0);
                }
            }
        }
    }
}
