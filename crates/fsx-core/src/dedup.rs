use std::sync::Arc;
use std::thread;

use ahash::{AHashMap, AHashSet};
use crossbeam_channel::{bounded, select};

use crate::hasher::Digest;
use crate::index::{sort_files, File, Files};
use crate::path::{Path, UniqueDirs};
use crate::tree::{Dir, Tree};

/// A directory that can be deleted without losing data that is not preserved
/// elsewhere.
#[derive(Debug, PartialEq)]
pub struct Dup {
    path: Path,
    alts: Vec<Path>,
    lost: Files,
    ignored: Files,
    safe: AHashMap<Digest, Path>,
}

impl Dup {
    /// The directory that can be deleted.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Alternate directories that collectively contain copies of all safe
    /// unique files.
    pub fn alts(&self) -> &[Path] {
        &self.alts
    }

    /// Unique files that would be lost if the directory is deleted.
    pub fn lost(&self) -> &Files {
        &self.lost
    }

    /// Empty and other ignored files that may be lost if the directory is
    /// deleted.
    pub fn ignored(&self) -> &Files {
        &self.ignored
    }

    /// The chosen alternate directory for each rescued digest.
    pub fn safe(&self) -> &AHashMap<Digest, Path> {
        &self.safe
    }

    /// Returns a map from each file in the directory to a safe copy outside
    /// it. If alt is given, only files with copies under alt are returned;
    /// None is returned when alt does not name a directory in the tree.
    pub fn file_map(&self, tree: &Tree, alt: Option<&str>) -> Option<Vec<(Arc<File>, Arc<File>)>> {
        let alt = match alt {
            Some(name) => Some(tree.dir(name)?.path().clone()),
            None => None,
        };
        let mut m = Vec::new();
        for (digest, chosen) in &self.safe {
            if let Some(alt) = &alt {
                if chosen != alt {
                    continue;
                }
            }
            let group = tree.group(*digest).expect("fsx: missing digest group");
            let safe = group
                .iter()
                .find(|f| f.is_safe_in(chosen))
                .unwrap_or_else(|| panic!("fsx: no safe file for {digest} in {chosen}"));
            for f in group {
                if f.exists_in(&self.path) {
                    m.push((f.clone(), safe.clone()));
                }
            }
        }
        m.sort_by(|a, b| a.0.path().cmp_path(b.0.path()));
        Some(m)
    }
}

/// Per-worker deduplication state, reused across directories to minimize
/// allocations.
#[derive(Default)]
pub(crate) struct Dedup {
    root: Option<Path>,
    ignored: Files,
    safe: AHashSet<Digest>,
    lost: AHashSet<Digest>,
    unique_dirs: UniqueDirs,
    safe_count: AHashMap<Path, usize>,
}

impl Dedup {
    /// Returns whether directory p can be deduplicated: every unique file
    /// under p, except those that can be ignored, must have a safe copy
    /// outside p, with at most max_lost exceptions, and far more rescued
    /// unique files than lost ones.
    pub(crate) fn is_dup(&mut self, tree: &Tree, p: &Path, max_lost: usize) -> bool {
        self.root = None;
        let root = match tree.dir_at(p) {
            Some(d) => d,
            None => return false,
        };
        if let Some(atom) = root.atom() {
            if atom != p {
                // Inside an atomic container and not its root
                return false;
            }
        }
        self.safe.clear();
        self.lost.clear();
        self.ignored.clear();

        // Categorize files as ignored, safe, or lost
        for d in tree.subtree(root) {
            'files: for f in d.files() {
                let flag = f.flag();
                if flag.persist() != crate::flag::Flag::NONE {
                    // The tree should not contain gone files, but just in case
                    if flag.is_gone() {
                        continue;
                    }
                    if flag.keep() {
                        return false;
                    }
                }
                if f.can_ignore() {
                    self.ignored.push(f.clone());
                    continue;
                }
                if let Some(g) = tree.group(f.digest()) {
                    if g.len() > 1 && g.iter().any(|c| c.is_safe_outside_of(p)) {
                        self.safe.insert(f.digest());
                        continue 'files;
                    }
                }
                self.lost.insert(f.digest());
                if self.lost.len() > max_lost {
                    return false;
                }
            }
        }

        // Require far more unique files to be rescued than lost
        if self.safe.len() > self.lost.len() * self.lost.len() {
            self.root = Some(p.clone());
        }
        self.root.is_some()
    }

    /// Returns the deduplication strategy for the directory passed to the
    /// last successful is_dup call: the smallest set of alternate directories
    /// collectively covering all safe unique files.
    pub(crate) fn dedup(&mut self, tree: &Tree) -> Dup {
        let root = self.root.take().expect("fsx: dedup without is_dup");
        let root_dir = tree.dir_at(&root).unwrap();

        // Record ignored and lost files
        let mut u = Dup {
            path: root.clone(),
            alts: Vec::new(),
            lost: Files::new(),
            ignored: std::mem::take(&mut self.ignored),
            safe: AHashMap::with_capacity(self.safe.len()),
        };
        sort_files(&mut u.ignored);
        if !self.lost.is_empty() {
            for g in &self.lost {
                for f in tree.group(*g).into_iter().flatten() {
                    if f.exists_in(&root) {
                        u.lost.push(f.clone());
                    }
                }
            }
            sort_files(&mut u.lost);
        }

        // Select alternate directories until all safe files are accounted for
        while !self.safe.is_empty() {
            // Count, per directory, the remaining safe digests with at least
            // one safe copy in its subtree. Atomic containers stand in for
            // their descendants.
            self.safe_count.clear();
            for g in &self.safe {
                for f in tree.group(*g).into_iter().flatten() {
                    if f.is_safe_outside_of(&root) {
                        let d = tree.dir_at(&f.dir()).expect("fsx: missing parent dir");
                        let p = d.atom().unwrap_or(d.path());
                        self.unique_dirs.add(p.clone());
                    }
                }
                if self.unique_dirs.is_empty() {
                    panic!("fsx: no alternates for a safe file");
                }
                let count = &mut self.safe_count;
                self.unique_dirs
                    .for_each(|p| *count.entry(p.clone()).or_insert(0) += 1);
            }

            // Find the next best alternate; ties break by path order
            let mut best: Option<(f64, &Path)> = None;
            for (p, &n) in &self.safe_count {
                let d = tree.dir_at(p).unwrap();
                let s = root_dir.alt_score(d, n, self.safe.len());
                best = match best {
                    Some((bs, bp))
                        if s < bs
                            || (s == bs && bp.cmp_path(p) != std::cmp::Ordering::Greater) =>
                    {
                        Some((bs, bp))
                    }
                    _ => Some((s, p)),
                };
            }
            let best = best.expect("fsx: no alternates for a safe file").1.clone();

            // Remove all safe digests covered by the chosen alternate
            let covered: Vec<Digest> = self
                .safe
                .iter()
                .filter(|g| {
                    tree.group(**g)
                        .into_iter()
                        .flatten()
                        .any(|f| f.is_safe_in(&best))
                })
                .copied()
                .collect();
            for g in covered {
                self.safe.remove(&g);
                u.safe.insert(g, best.clone());
            }
            u.alts.push(best);
        }
        u.alts.sort_by(|a, b| a.cmp_path(b));
        u
    }
}

impl Tree {
    /// Returns directories under dir that contain duplicate data, sorted by
    /// path. If max_dups is given, at most that many directories are
    /// returned. max_lost is the number of unique files that may be lost for
    /// a directory to still be considered a duplicate.
    pub fn dups(&self, dir: &str, max_dups: Option<usize>, max_lost: usize) -> Vec<Dup> {
        let root = match self.dir(dir) {
            Some(d) if !d.sub_dirs().is_empty() => d,
            _ => return Vec::new(),
        };
        let workers = thread::available_parallelism().map_or(1, |n| n.get());
        let mut queue: Vec<&Dir> = Vec::with_capacity(root.sub_dirs().len());
        for p in root.sub_dirs().iter().rev() {
            queue.push(self.dir_at(p).unwrap());
        }

        // Directories are sent to workers over work. Duplicates come back
        // over dup; subdirectories of non-duplicates come back over todo.
        let (work_tx, work_rx) = bounded::<&Dir>(workers);
        let (dup_tx, dup_rx) = bounded::<Dup>(1);
        let (todo_tx, todo_rx) = bounded::<&[Path]>(1);

        let mut dups: Vec<Dup> = Vec::new();
        thread::scope(|s| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let dup_tx = dup_tx.clone();
                let todo_tx = todo_tx.clone();
                s.spawn(move || {
                    let mut dd = Dedup::default();
                    for d in work_rx {
                        if dd.is_dup(self, d.path(), max_lost) {
                            let _ = dup_tx.send(dd.dedup(self));
                        } else {
                            let _ = todo_tx.send(d.sub_dirs());
                        }
                    }
                });
            }
            drop(dup_tx);
            drop(todo_tx);

            // Process the queue in approximate depth-first order without
            // blocking on sends. Once the limit is reached, pending work is
            // dropped and only in-flight directories drain.
            let mut pending = queue.len();
            let mut limited = false;
            while pending > 0 {
                while let Some(&d) = queue.last() {
                    if work_tx.try_send(d).is_err() {
                        break;
                    }
                    queue.pop();
                }
                select! {
                    recv(dup_rx) -> msg => {
                        if let Ok(u) = msg {
                            dups.push(u);
                            if Some(dups.len()) == max_dups && !limited {
                                limited = true;
                                pending -= queue.len();
                                queue.clear();
                            }
                        }
                        pending -= 1;
                    }
                    recv(todo_rx) -> msg => {
                        if let Ok(ds) = msg {
                            if !limited {
                                pending += ds.len();
                                for p in ds.iter().rev() {
                                    queue.push(self.dir_at(p).unwrap());
                                }
                            }
                        }
                        pending -= 1;
                    }
                }
            }
            drop(work_tx);
        });

        dups.sort_by(|a, b| a.path.cmp_path(&b.path));
        if let Some(max) = max_dups {
            dups.truncate(max);
        }
        dups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag::Flag;
    use crate::index::testutil::*;
    use crate::index::Index;

    fn sized(path: &str, d: u8) -> Arc<File> {
        file(path, digest(d), 1, t("2009-11-10T23:00:00Z"), Flag::NONE)
    }

    fn tree(files: Vec<Files>) -> Tree {
        Index::from_groups(String::new(), files).to_tree()
    }

    fn p(s: &str) -> Path {
        Path::new_unchecked(s)
    }

    #[test]
    fn is_dup_margins() {
        let tr = tree(vec![
            vec![sized("A/B/a0", 1), sized("X/Y/a1", 1)],
            vec![sized("A/B/b0", 2), sized("X/Y/b1", 2)],
            vec![sized("A/B/C/c0", 3), sized("X/Z/c1", 3)],
            vec![sized("A/B/C/D/d0", 4), sized("X/Z/d1", 4)],
            vec![sized("X/Y/e0", 5)],
            vec![sized("X/Z/f0", 6)],
        ]);
        let mut dd = Dedup::default();
        assert!(dd.is_dup(&tr, &p("A/"), 0));
        assert!(dd.is_dup(&tr, &p("A/B/"), 0));
        assert!(dd.is_dup(&tr, &p("A/B/C/"), 0));
        assert!(dd.is_dup(&tr, &p("A/B/C/D/"), 0));
        // X would lose both e0 and f0, one more than allowed
        assert!(!dd.is_dup(&tr, &p("X/"), 1));
        assert!(!dd.is_dup(&tr, &p("X/Y/"), 0));
        assert!(dd.is_dup(&tr, &p("X/Z/"), 1));
        assert!(!dd.is_dup(&tr, &p("missing/"), 1));
    }

    #[test]
    fn dups_with_alternates() {
        let t0 = t("2009-11-10T23:00:00Z");
        let a0 = file("A/a0", digest(1), 1, t0, Flag::NONE);
        let a1 = file("B/a1", digest(1), 1, t0, Flag::NONE);
        let b0 = file("A/b0", digest(2), 1, t0, Flag::NONE);
        let b1 = file("B/b1", digest(2), 1, t0, Flag::NONE);
        let c0 = file("A/c0", digest(3), 1, t0, Flag::NONE);
        let c1 = file("B/c1", digest(3), 1, t0, Flag::GONE);

        let x = Index::from_groups(
            String::new(),
            vec![
                vec![a0.clone(), a1.clone()],
                vec![b0.clone(), b1.clone()],
                vec![c0.clone(), c1],
            ],
        );
        let tr = x.to_tree();

        let dups = tr.dups(".", None, 1);
        assert_eq!(2, dups.len());
        assert_eq!(&p("A/"), dups[0].path());
        assert_eq!(&[p("B/")], dups[0].alts());
        assert_eq!(&vec![c0.clone()], dups[0].lost());
        assert_eq!(&p("B/"), dups[1].path());
        assert_eq!(&[p("A/")], dups[1].alts());
        assert!(dups[1].lost().is_empty());

        // A keep mark inside A excludes it from the results
        a0.set_flag(Flag::KEEP);
        let dups = tr.dups(".", None, 1);
        assert_eq!(1, dups.len());
        assert_eq!(&p("B/"), dups[0].path());

        // A keep mark on the B copy still permits reporting B with alt A
        a0.set_flag(Flag::NONE);
        c0.set_flag(Flag::KEEP | Flag::GONE);
        a1.set_flag(Flag::KEEP);
        let dups = tr.dups(".", None, 1);
        assert_eq!(1, dups.len());
        assert_eq!(&p("A/"), dups[0].path());
        assert!(dups[0].lost().is_empty());
    }

    #[test]
    fn atomic_containers_are_rejected_inside() {
        let tr = tree(vec![
            vec![sized("C/.git/X/x1", 1), sized("D/x2", 1)],
            vec![sized("C/.git/X/.git/Z/y1", 2), sized("D/y2", 2)],
        ]);
        let mut dd = Dedup::default();
        // Inside the atomic container and not its root
        assert!(!dd.is_dup(&tr, &p("C/.git/X/"), 0));
        assert!(!dd.is_dup(&tr, &p("C/.git/X/.git/"), 0));
        // The container root itself can be a duplicate
        assert!(dd.is_dup(&tr, &p("C/.git/"), 0));
    }

    #[test]
    fn dups_skips_subtrees_of_atomic_containers() {
        let tr = tree(vec![
            vec![sized("C/.git/X/x1", 1), sized("D/x2", 1)],
            vec![sized("C/.git/X/.git/Z/y1", 2), sized("D/y2", 2)],
        ]);
        // Every candidate under C/.git/X is inside the atomic container
        assert!(tr.dups("C/.git/X", None, 0).is_empty());
        // From the top, the container root itself is reported
        let dups = tr.dups("C", None, 0);
        assert_eq!(1, dups.len());
        assert_eq!(&p("C/.git/"), dups[0].path());
        assert_eq!(&[p("D/")], dups[0].alts());
    }

    #[test]
    fn alt_score_favors_exact_nearby_copies() {
        let tr = tree(vec![
            vec![sized("A/a", 1), sized("B/a", 1)],
            vec![sized("A/b", 2), sized("B/b", 2)],
            vec![sized("C/x", 3)],
        ]);
        let a = tr.dir("A").unwrap();
        let b = tr.dir("B").unwrap();
        let root = tr.dir(".").unwrap();

        // An exact sibling copy scores a perfect 1
        assert_eq!(1.0, a.alt_score(b, 2, 2));
        // The root contains everything, including A itself, and is halved
        let s = a.alt_score(root, 2, 2);
        assert!(s < 0.5, "{s}");
        // Partial coverage scores below a full match
        assert!(a.alt_score(b, 1, 2) < 1.0);
    }

    #[test]
    fn zero_size_and_convention_files_are_ignored() {
        let t0 = t("2009-11-10T23:00:00Z");
        let zero = file("A/empty", digest(9), 0, t0, Flag::NONE);
        let thumbs = file("A/Thumbs.db", digest(8), 7, t0, Flag::NONE);
        let tr = tree(vec![
            vec![sized("A/a0", 1), sized("B/a1", 1)],
            vec![zero.clone()],
            vec![thumbs.clone()],
        ]);
        let mut dd = Dedup::default();
        assert!(dd.is_dup(&tr, &p("A/"), 0));
        let u = dd.dedup(&tr);
        assert_eq!(&p("A/"), u.path());
        assert_eq!(&[p("B/")], u.alts());
        assert_eq!(2, u.ignored().len());
        assert!(u.lost().is_empty());
    }

    #[test]
    fn alternates_prefer_specific_matches() {
        // B is an exact copy of A; R has the same content plus extras, so B
        // must win.
        let tr = tree(vec![
            vec![sized("A/a", 1), sized("B/a", 1), sized("R/deep/a", 1)],
            vec![sized("A/b", 2), sized("B/b", 2), sized("R/deep/b", 2)],
            vec![sized("R/deep/extra", 3), sized("R/extra2", 3)],
        ]);
        let mut dd = Dedup::default();
        assert!(dd.is_dup(&tr, &p("A/"), 0));
        let u = dd.dedup(&tr);
        assert_eq!(&[p("B/")], u.alts());
        assert_eq!(2, u.safe().len());
        assert!(u.safe().values().all(|alt| alt == &p("B/")));
    }

    #[test]
    fn alternates_substitute_atomic_containers() {
        let tr = tree(vec![
            vec![sized("A/a", 1), sized("R/.git/sub/a", 1)],
            vec![sized("A/b", 2), sized("R/.git/b", 2)],
        ]);
        let mut dd = Dedup::default();
        assert!(dd.is_dup(&tr, &p("A/"), 0));
        let u = dd.dedup(&tr);
        assert_eq!(&[p("R/.git/")], u.alts());
    }

    #[test]
    fn file_map() {
        let t0 = t("2009-11-10T23:00:00Z");
        let a0 = file("A/a0", digest(1), 1, t0, Flag::NONE);
        let a1 = file("B/a0", digest(1), 1, t0, Flag::NONE);
        let tr = tree(vec![vec![a0.clone(), a1.clone()]]);
        let mut dd = Dedup::default();
        assert!(dd.is_dup(&tr, &p("A/"), 0));
        let u = dd.dedup(&tr);
        let m = u.file_map(&tr, None).unwrap();
        assert_eq!(vec![(a0.clone(), a1.clone())], m);
        let m = u.file_map(&tr, Some("B")).unwrap();
        assert_eq!(vec![(a0, a1)], m);
        assert!(u.file_map(&tr, Some("missing")).is_none());
    }

    #[test]
    fn max_dups_limits_results() {
        let tr = tree(vec![
            vec![sized("A/a", 1), sized("B/a", 1)],
            vec![sized("C/c", 2), sized("D/c", 2)],
        ]);
        let dups = tr.dups(".", Some(1), 0);
        assert_eq!(1, dups.len());
        let all = tr.dups(".", None, 0);
        assert_eq!(4, all.len());
    }
}
