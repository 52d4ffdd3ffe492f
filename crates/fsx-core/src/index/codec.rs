use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use unicode_width::UnicodeWidthStr;

use crate::error::Error;
use crate::flag::Flag;
use crate::hasher::Digest;
use crate::index::{File, Files, Index};
use crate::path::Path;

pub(crate) const SIGNATURE: &str = "fsx index v1";

/// Power-of-2 tab character alignment.
const TAB_WIDTH: usize = 8;
const DIGEST_HEX: usize = 2 * Digest::LEN;
const MIN_ALIGN: usize =
    2 * TAB_WIDTH + DIGEST_HEX + TAB_WIDTH + (11 & !(TAB_WIDTH - 1)) + TAB_WIDTH;

/// Writes the line-oriented index representation to dst. One line per file,
/// followed by one digest/size trailer line per group. Files that are gone
/// and unmarked are forgotten.
pub(crate) fn write_text(x: &Index, dst: impl Write) -> Result<(), Error> {
    let mut w = BufWriter::new(dst);
    w.write_all(SIGNATURE.as_bytes())?;
    w.write_all(b"\n")?;
    w.write_all(x.root().as_bytes())?;
    w.write_all(b"\n")?;

    let mut widths: Vec<usize> = Vec::with_capacity(16);
    for g in x.groups() {
        // Calculate path widths for mtime column alignment
        let mut any = false;
        let mut align = MIN_ALIGN;
        widths.clear();
        for f in g {
            if f.flag().should_write() {
                any = true;
                let n = TAB_WIDTH
                    + (display_width(f.path().as_str()) & !(TAB_WIDTH - 1))
                    + 2 * TAB_WIDTH;
                align = align.max(n);
                widths.push(n);
            } else {
                widths.push(0);
            }
            if f.digest() != g[0].digest() || f.size() != g[0].size() {
                panic!("fsx: group digest/size mismatch: {:?}", f.path());
            }
            if f.mod_time().timestamp_nanos_opt().is_none() {
                panic!("fsx: file time out of range: {:?}", f.path());
            }
        }
        if !any {
            continue;
        }

        // Flags, paths, and modification times
        let mut prev: Option<DateTime<Utc>> = None;
        for (i, f) in g.iter().enumerate() {
            if !f.flag().should_write() {
                continue;
            }
            w.write_all(f.flag().as_str().as_bytes())?;
            w.write_all(b"\t")?;
            w.write_all(f.path().as_str().as_bytes())?;
            if prev != Some(f.mod_time()) {
                w.write_all(b"\t//\t")?;
                for _ in 0..(align - widths[i]) / TAB_WIDTH {
                    w.write_all(b"\t")?;
                }
                let mtime = f.mod_time().to_rfc3339_opts(SecondsFormat::AutoSi, true);
                w.write_all(mtime.as_bytes())?;
            } else if has_trailing_space(f.path().as_str()) {
                // Protect trailing whitespace from downstream trimmers
                w.write_all(b"\t//")?;
            }
            w.write_all(b"\n")?;
            prev = Some(f.mod_time());
        }

        // Digest and size
        w.write_all(b"\t\t")?;
        w.write_all(g[0].digest().to_hex().as_bytes())?;
        writeln!(w, "\t{}", g[0].size())?;
    }
    w.flush()?;
    Ok(())
}

/// Reads the line-oriented index representation from src.
pub(crate) fn read_text(src: impl Read) -> Result<Index, Error> {
    let mut r = BufReader::new(src);
    let mut line_no: u64 = 0;

    // Header
    let sig = read_line(&mut r, &mut line_no)?
        .ok_or_else(|| format_err(1, "missing signature"))?;
    if sig != SIGNATURE.as_bytes() {
        return Err(format_err(1, "invalid signature"));
    }
    let root = read_line(&mut r, &mut line_no)?
        .ok_or_else(|| format_err(2, "missing root"))?;
    if root.contains(&b'\t') {
        return Err(format_err(2, "invalid root"));
    }
    let root = String::from_utf8(root).map_err(|_| format_err(2, "invalid root"))?;

    let mut pending: Vec<(Flag, Path, DateTime<Utc>)> = Vec::new();
    let mut groups: Vec<Files> = Vec::new();
    while let Some(line) = read_line(&mut r, &mut line_no)? {
        let n = line_no;
        if let Some(rest) = line.strip_prefix(b"\t\t".as_slice()) {
            // Trailer: digest and size for the pending group
            if pending.is_empty() {
                return Err(format_err(n, "missing file group"));
            }
            let i = rest
                .iter()
                .position(|&c| c == b'\t')
                .ok_or_else(|| format_err(n, "invalid digest"))?;
            let digest =
                Digest::from_hex(&rest[..i]).ok_or_else(|| format_err(n, "invalid digest"))?;
            let size = std::str::from_utf8(&rest[i + 1..])
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|&v| v <= i64::MAX as u64)
                .ok_or_else(|| format_err(n, "invalid size"))?;
            let g: Files = pending
                .drain(..)
                .map(|(flag, path, mtime)| Arc::new(File::new(path, digest, size, mtime, flag)))
                .collect();
            groups.push(g);
            continue;
        }

        // File line: flag, path, and optional modification time
        let i = line
            .iter()
            .position(|&c| c == b'\t')
            .ok_or_else(|| format_err(n, "invalid entry"))?;
        let flag = std::str::from_utf8(&line[..i])
            .ok()
            .and_then(Flag::parse)
            .ok_or_else(|| format_err(n, "invalid flag"))?;
        let rest = &line[i + 1..];
        let (path_bytes, tail) = match rest.windows(3).position(|w| w == b"\t//") {
            Some(j) => (&rest[..j], Some(&rest[j + 3..])),
            None => (rest, None),
        };
        let mtime = match tail {
            Some(t) if !t.is_empty() => {
                let t = std::str::from_utf8(t)
                    .map_err(|_| format_err(n, "invalid modification time"))?;
                DateTime::parse_from_rfc3339(t.trim_start_matches('\t'))
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|_| format_err(n, "invalid modification time"))?
            }
            _ => match pending.last() {
                Some((_, _, mtime)) => *mtime,
                None => return Err(format_err(n, "missing modification time")),
            },
        };
        let path = std::str::from_utf8(path_bytes)
            .map_err(|_| format_err(n, "invalid path"))
            .and_then(|p| Path::strict_file(p).map_err(|_| format_err(n, "invalid path")))?;
        pending.push((flag, path, mtime));
    }
    if !pending.is_empty() {
        return Err(format_err(line_no, "incomplete final group"));
    }
    Ok(Index::from_groups(root, groups))
}

fn format_err(line: u64, reason: &str) -> Error {
    Error::Format {
        line,
        reason: reason.to_string(),
    }
}

/// Reads one LF-terminated line, stripping the terminator. Returns None at
/// end of input.
fn read_line(r: &mut impl BufRead, line_no: &mut u64) -> Result<Option<Vec<u8>>, Error> {
    let mut buf = Vec::new();
    let n = r.read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    *line_no += 1;
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    Ok(Some(buf))
}

fn has_trailing_space(p: &str) -> bool {
    p.ends_with([' ', '\t', '\n', '\u{B}', '\u{C}', '\r'])
}

/// Returns the rendered monospace width of s, with tab runs advancing to the
/// next multiple of the tab width.
fn display_width(s: &str) -> usize {
    let mut n = 0;
    let mut rest = s;
    loop {
        match rest.find('\t') {
            None => return n + rest.width(),
            Some(i) => {
                let b = rest.as_bytes();
                let mut j = i + 1;
                while j < b.len() && b[j] == b'\t' {
                    j += 1;
                }
                n = ((n + rest[..i].width()) & !(TAB_WIDTH - 1)) + (j - i) * TAB_WIDTH;
                rest = &rest[j..];
            }
        }
    }
}
