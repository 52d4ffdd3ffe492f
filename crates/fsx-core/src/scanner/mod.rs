pub mod source;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender};
use tracing::debug;

use crate::error::Error;
use crate::flag::Flag;
use crate::hasher::Hasher;
use crate::index::{File, Files, Index};
use crate::path::Path;
use crate::progress::Progress;
use crate::tree::Tree;
use source::{EntryKind, FileSource};

/// Callbacks and cancellation for a scan. Per-file errors do not stop the
/// scan; they are delivered to err_fn on the calling thread.
#[derive(Default)]
pub struct ScanOptions<'a> {
    pub err_fn: Option<&'a mut dyn FnMut(Error)>,
    pub progress_fn: Option<&'a mut dyn FnMut(&Progress)>,
    pub cancel: Option<&'a AtomicBool>,
}

/// Creates an index of the source. Regular files are hashed by a pool of
/// worker threads; the output is sorted and therefore identical across runs
/// regardless of parallelism.
pub fn scan(source: &dyn FileSource, opts: ScanOptions) -> Result<Index, Error> {
    rescan_impl(None, source, opts)
}

impl Tree {
    /// Updates the index of the source, skipping the hashing of any files
    /// with unchanged size and modification time and carrying their marks
    /// forward. Files that disappeared are marked gone and retained only if
    /// they carry a persistent mark. The tree is consumed: its file flags
    /// are rewritten during the scan.
    pub fn rescan(self, source: &dyn FileSource, opts: ScanOptions) -> Result<Index, Error> {
        rescan_impl(Some(&self), source, opts)
    }
}

fn rescan_impl(
    tree: Option<&Tree>,
    source: &dyn FileSource,
    mut opts: ScanOptions,
) -> Result<Index, Error> {
    // Clear non-persistent flags from a previous scan
    if let Some(t) = tree {
        for g in t.digest_map().values() {
            for f in g {
                f.set_flag(f.flag().persist());
            }
        }
    }

    let workers = thread::available_parallelism().map_or(1, |n| n.get());
    let (file_tx, file_rx) = bounded::<Arc<File>>(1);
    let (err_tx, err_rx) = bounded::<Error>(1);
    let (hash_tx, hash_rx) = bounded::<String>(1);

    let sample_bytes = AtomicU64::new(0);
    let cancel = opts.cancel;
    let cancelled = || cancel.is_some_and(|c| c.load(Ordering::Relaxed));
    let monitor = |n: usize| -> Result<(), Error> {
        sample_bytes.fetch_add(n as u64, Ordering::Relaxed);
        if cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    };

    let mut prog = opts
        .progress_fn
        .as_ref()
        .map(|_| Progress::new(Instant::now()));
    let ticker = if prog.is_some() {
        tick(Duration::from_secs(1))
    } else {
        never()
    };

    let mut all: Files = Vec::with_capacity(64);
    thread::scope(|s| {
        {
            let w = Walker {
                source,
                tree,
                file_tx: file_tx.clone(),
                err_tx: err_tx.clone(),
                hash_tx,
                cancelled: &cancelled,
            };
            s.spawn(move || w.walk("."));
        }
        for _ in 0..workers {
            let hash_rx = hash_rx.clone();
            let file_tx = file_tx.clone();
            let err_tx = err_tx.clone();
            let monitor = &monitor;
            s.spawn(move || hash_worker(source, hash_rx, file_tx, err_tx, monitor));
        }
        drop(file_tx);
        drop(err_tx);
        drop(hash_rx);

        // Collect files, errors, and progress ticks on the calling thread
        let mut err_rx = err_rx;
        loop {
            select! {
                recv(file_rx) -> msg => match msg {
                    Ok(f) => {
                        all.push(f);
                        if let Some(p) = &mut prog {
                            p.sample_files += 1;
                        }
                    }
                    Err(_) => break,
                },
                recv(err_rx) -> msg => match msg {
                    Ok(e) => {
                        if let Some(f) = &mut opts.err_fn {
                            f(e);
                        }
                    }
                    Err(_) => err_rx = never(),
                },
                recv(ticker) -> _ => {
                    if let (Some(p), Some(f)) = (&mut prog, &mut opts.progress_fn) {
                        p.update(Instant::now(), &sample_bytes);
                        f(p);
                    }
                }
            }
        }
        while let Ok(e) = err_rx.try_recv() {
            if let Some(f) = &mut opts.err_fn {
                f(e);
            }
        }
    });

    if let (Some(p), Some(f)) = (&mut prog, &mut opts.progress_fn) {
        p.finish(Instant::now(), &sample_bytes);
        f(p);
    }
    if cancelled() {
        return Err(Error::Cancelled);
    }

    // The accumulator now describes the current source contents. Files
    // marked same are shared with the tree; all of its other files have been
    // removed or modified, so they are marked gone and retained only if a
    // persistent mark must survive.
    if let Some(t) = tree {
        for g in t.digest_map().values() {
            for f in g {
                let flag = f.flag();
                if flag.is_same() {
                    continue; // Already in the accumulator
                }
                f.set_flag(flag | Flag::GONE);
                if flag.mark() != Flag::NONE {
                    all.push(f.clone());
                }
            }
        }
    }
    debug!(files = all.len(), root = source.root(), "scan complete");
    Ok(Index::new(source.root(), all))
}

struct Walker<'a> {
    source: &'a dyn FileSource,
    tree: Option<&'a Tree>,
    file_tx: Sender<Arc<File>>,
    err_tx: Sender<Error>,
    hash_tx: Sender<String>,
    cancelled: &'a (dyn Fn() -> bool + Sync),
}

impl Walker<'_> {
    /// Depth-first traversal in lexicographic order. Returns false once the
    /// cancellation signal is observed.
    fn walk(&self, dir: &str) -> bool {
        if (self.cancelled)() {
            return false;
        }
        let entries = match self.source.read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.err(Error::Walk {
                    name: dir.to_string(),
                    source: e,
                });
                return true;
            }
        };
        for e in entries {
            if (self.cancelled)() {
                return false;
            }
            let name = if dir == "." {
                e.name.clone()
            } else {
                format!("{dir}/{}", e.name)
            };
            if e.name.is_empty() || name.starts_with('\t') || name.contains('\n') {
                self.err(Error::InvalidPath(name));
                if e.kind == EntryKind::Dir {
                    continue; // Do not descend
                }
                return true; // Skip the rest of the enclosing directory
            }
            match e.kind {
                EntryKind::File => {
                    if let Some(t) = self.tree {
                        let p = Path::new_unchecked(name.as_str());
                        if let Some(f) = t.file_at(&p) {
                            if f.size() == e.size && f.mod_time() == e.mtime {
                                // Unchanged: reuse the record without hashing
                                f.set_flag(f.flag().clear(Flag::GONE) | Flag::SAME);
                                let _ = self.file_tx.send(f.clone());
                                continue;
                            }
                        }
                    }
                    if self.hash_tx.send(name).is_err() {
                        return false;
                    }
                }
                EntryKind::Dir => {
                    if !self.walk(&name) {
                        return false;
                    }
                }
                EntryKind::Other => self.err(Error::IrregularEntry(name)),
            }
        }
        true
    }

    fn err(&self, e: Error) {
        let _ = self.err_tx.send(e);
    }
}

fn hash_worker(
    source: &dyn FileSource,
    hash_rx: Receiver<String>,
    file_tx: Sender<Arc<File>>,
    err_tx: Sender<Error>,
    monitor: &(dyn Fn(usize) -> Result<(), Error> + Sync),
) {
    let mut h = Hasher::new(Some(monitor));
    for name in hash_rx {
        match h.read(source, &name, true) {
            Ok(f) => {
                let _ = file_tx.send(Arc::new(f));
            }
            Err(Error::Cancelled) => {}
            Err(e) => {
                let _ = err_tx.send(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::source::mem::MemSource;
    use super::*;
    use crate::index::testutil::t;
    use chrono::{DateTime, Utc};

    fn d(data: &[u8]) -> crate::hasher::Digest {
        crate::hasher::Digest::from_bytes(*blake3::hash(data).as_bytes())
    }

    fn times() -> (DateTime<Utc>, DateTime<Utc>) {
        (t("2009-11-10T23:00:00Z"), t("2009-11-09T23:00:00Z"))
    }

    fn flags_by_path(x: &Index) -> Vec<(String, String, Flag)> {
        x.groups()
            .iter()
            .flatten()
            .map(|f| {
                (
                    f.path().as_str().to_string(),
                    f.digest().to_hex(),
                    f.flag(),
                )
            })
            .collect()
    }

    #[test]
    fn scan_groups_by_digest() {
        let (t1, t2) = times();
        let mut src = MemSource::default();
        src.insert("X/a", b"\x00", t1);
        src.insert("X/b", b"\x00\x01", t2);
        src.insert("Y/c", b"\x00", t2);
        src.insert("d", b"\x00\x01\x02", t1);

        let x = scan(&src, ScanOptions::default()).unwrap();
        let have = flags_by_path(&x);
        let want = vec![
            ("X/a".to_string(), d(b"\x00").to_hex(), Flag::NONE),
            ("Y/c".to_string(), d(b"\x00").to_hex(), Flag::NONE),
            ("X/b".to_string(), d(b"\x00\x01").to_hex(), Flag::NONE),
            ("d".to_string(), d(b"\x00\x01\x02").to_hex(), Flag::NONE),
        ];
        assert_eq!(want, have);
        assert_eq!(3, x.groups().len());
    }

    #[test]
    fn rescan_preserves_marks() {
        let (t1, t2) = times();
        let mut src = MemSource::default();
        src.insert("X/a", b"\x00", t1);
        src.insert("X/b", b"\x00\x01", t2);
        src.insert("Y/c", b"\x00", t2);
        src.insert("d", b"\x00\x01\x02", t1);

        let x = scan(&src, ScanOptions::default()).unwrap();

        // Remove, modify, and create files
        src.files.remove("X/a");
        src.files.remove("Y/c");
        src.insert("X/b", b"\x00\x01\x02", t2);
        src.insert("e", b"\x00", t2);

        let tr = x.to_tree();
        tr.file("X/a").unwrap().set_flag(Flag::JUNK);
        tr.file("X/b").unwrap().set_flag(Flag::KEEP);
        tr.file("d").unwrap().set_flag(Flag::DUP);
        let x = tr.rescan(&src, ScanOptions::default()).unwrap();

        let want = vec![
            ("X/a".to_string(), d(b"\x00").to_hex(), Flag::JUNK | Flag::GONE),
            ("e".to_string(), d(b"\x00").to_hex(), Flag::NONE),
            ("X/b".to_string(), d(b"\x00\x01\x02").to_hex(), Flag::NONE),
            ("d".to_string(), d(b"\x00\x01\x02").to_hex(), Flag::DUP | Flag::SAME),
            ("X/b".to_string(), d(b"\x00\x01").to_hex(), Flag::KEEP | Flag::GONE),
        ];
        assert_eq!(want, flags_by_path(&x));
        assert_eq!(3, x.groups().len());

        // Restore the original X/b and touch d
        src.insert("X/b", b"\x00\x01", t2);
        let touched = t("2009-11-09T23:00:00Z");
        src.insert("d", b"\x00\x01\x02", touched);

        let tr = x.to_tree();
        let e = tr.file("e").unwrap();
        e.set_flag(e.flag() | Flag::DUP | Flag::GONE);
        let x = tr.rescan(&src, ScanOptions::default()).unwrap();

        let want = vec![
            ("X/a".to_string(), d(b"\x00").to_hex(), Flag::JUNK | Flag::GONE),
            ("e".to_string(), d(b"\x00").to_hex(), Flag::DUP | Flag::SAME),
            ("X/b".to_string(), d(b"\x00\x01").to_hex(), Flag::NONE),
            ("X/b".to_string(), d(b"\x00\x01").to_hex(), Flag::KEEP | Flag::GONE),
            ("d".to_string(), d(b"\x00\x01\x02").to_hex(), Flag::NONE),
            ("d".to_string(), d(b"\x00\x01\x02").to_hex(), Flag::DUP | Flag::GONE),
        ];
        assert_eq!(want, flags_by_path(&x));
    }

    #[test]
    fn rescan_unchanged_is_identity() {
        let (t1, t2) = times();
        let mut src = MemSource::default();
        src.insert("X/a", b"\x00", t1);
        src.insert("X/b", b"\x00\x01", t2);

        let x = scan(&src, ScanOptions::default()).unwrap();
        let want = x.to_tree().to_index();
        let have = x.to_tree().rescan(&src, ScanOptions::default()).unwrap();

        // Identical modulo the runtime same bit
        for g in have.groups() {
            for f in g {
                assert!(f.flag().is_same(), "{:?}", f.path());
                f.set_flag(f.flag().clear(Flag::SAME));
            }
        }
        assert_eq!(want, have);
    }

    #[test]
    fn scan_reports_per_file_errors() {
        let (t1, _) = times();
        let mut src = MemSource::default();
        src.insert("ok", b"\x00", t1);
        src.insert("bad\nname/f", b"\x00", t1);

        let mut errs = Vec::new();
        let mut err_fn = |e: Error| errs.push(e.to_string());
        let x = scan(
            &src,
            ScanOptions {
                err_fn: Some(&mut err_fn),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(1, x.groups().len());
        assert_eq!(1, errs.len(), "{errs:?}");
        assert!(errs[0].contains("unsupported file path"), "{errs:?}");
    }

    #[test]
    fn irregular_entries_are_reported_and_skipped() {
        let (t1, _) = times();
        let mut src = MemSource::default();
        src.insert("a", b"\x00", t1);
        src.insert("z", b"\x01", t1);
        src.others.push("link".to_string());

        let mut errs = Vec::new();
        let mut err_fn = |e: Error| errs.push(e.to_string());
        let x = scan(
            &src,
            ScanOptions {
                err_fn: Some(&mut err_fn),
                ..Default::default()
            },
        )
        .unwrap();
        // Both regular files survive; the irregular entry is an error only
        assert_eq!(2, x.groups().len());
        assert_eq!(1, errs.len(), "{errs:?}");
        assert!(errs[0].contains("not a regular file or directory"));
    }

    #[test]
    fn cancelled_scan_returns_no_index() {
        let (t1, _) = times();
        let mut src = MemSource::default();
        for i in 0..64 {
            src.insert(&format!("f{i:02}"), &[i], t1);
        }
        let cancel = AtomicBool::new(true);
        let got = scan(
            &src,
            ScanOptions {
                cancel: Some(&cancel),
                ..Default::default()
            },
        );
        assert!(matches!(got, Err(Error::Cancelled)));
    }

    #[test]
    fn empty_files_get_distinct_digests() {
        let (t1, _) = times();
        let mut src = MemSource::default();
        src.insert("u", b"", t1);
        src.insert("v", b"", t1);

        let x = scan(&src, ScanOptions::default()).unwrap();
        assert_eq!(2, x.groups().len());
        let have = flags_by_path(&x);
        assert_eq!(d(b"u").to_hex(), have[0].1);
        assert_eq!(d(b"v").to_hex(), have[1].1);
    }

    #[test]
    fn scan_is_deterministic() {
        let (t1, t2) = times();
        let mut src = MemSource::default();
        for i in 0..32u8 {
            src.insert(&format!("a/f{i:02}"), &[i % 7], t1);
            src.insert(&format!("b/g{i:02}"), &[i % 5, 1], t2);
        }
        let x1 = scan(&src, ScanOptions::default()).unwrap();
        let x2 = scan(&src, ScanOptions::default()).unwrap();
        assert_eq!(x1, x2);
    }

    #[test]
    fn progress_reports_final() {
        let (t1, _) = times();
        let mut src = MemSource::default();
        src.insert("a", b"\x00\x01\x02", t1);

        let mut reports = 0u32;
        let mut last_final = false;
        let mut prog_fn = |p: &Progress| {
            reports += 1;
            last_final = p.is_final();
        };
        scan(
            &src,
            ScanOptions {
                progress_fn: Some(&mut prog_fn),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(reports >= 1);
        assert!(last_final);
    }
}
