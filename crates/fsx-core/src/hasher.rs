use std::fmt;
use std::io::Read;

use crate::error::Error;
use crate::flag::Flag;
use crate::index::File;
use crate::path::Path;
use crate::scanner::source::FileSource;

/// The output of the content hash function (BLAKE3-256).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const LEN: usize = 32;

    pub const fn from_bytes(b: [u8; 32]) -> Digest {
        Digest(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encodes the digest as 64 lowercase hex characters.
    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut s = String::with_capacity(2 * Digest::LEN);
        for b in self.0 {
            s.push(HEX[(b >> 4) as usize] as char);
            s.push(HEX[(b & 0xf) as usize] as char);
        }
        s
    }

    /// Decodes 64 hex characters. Uppercase digits are accepted.
    pub fn from_hex(s: &[u8]) -> Option<Digest> {
        if s.len() != 2 * Digest::LEN {
            return None;
        }
        let mut d = [0u8; Digest::LEN];
        for (i, b) in d.iter_mut().enumerate() {
            *b = (nibble(s[2 * i])? << 4) | nibble(s[2 * i + 1])?;
        }
        Some(Digest(d))
    }
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// Monitor callback invoked with the number of bytes absorbed after every
/// hash update. Returning an error aborts the read (cooperative cancellation).
pub type Monitor<'a> = &'a (dyn Fn(usize) -> Result<(), Error> + Sync);

const BUF_LEN: usize = 1 << 20;

/// A file hasher owning one BLAKE3 state and a fixed 1 MiB read buffer.
pub struct Hasher<'m> {
    state: blake3::Hasher,
    monitor: Option<Monitor<'m>>,
    buf: Box<[u8]>,
}

impl<'m> Hasher<'m> {
    pub fn new(monitor: Option<Monitor<'m>>) -> Hasher<'m> {
        Hasher {
            state: blake3::Hasher::new(),
            monitor,
            buf: vec![0u8; BUF_LEN].into_boxed_slice(),
        }
    }

    /// Computes the digest of the named file in source. If the file is empty
    /// and name_fallback is true, the digest is computed over the name bytes
    /// instead, so that empty files collide only with themselves. The file
    /// size and modification time are re-checked after reading; any change
    /// fails the read.
    pub fn read(
        &mut self,
        source: &dyn FileSource,
        name: &str,
        name_fallback: bool,
    ) -> Result<File, Error> {
        let path = Path::strict_file(name)?;
        let (mut r, stat) = source.open(name).map_err(|e| Error::FileIo {
            name: name.to_string(),
            source: e,
        })?;

        self.state.reset();
        let mut total: u64 = 0;
        loop {
            let n = r.read(&mut self.buf).map_err(|e| Error::FileIo {
                name: name.to_string(),
                source: e,
            })?;
            if n == 0 {
                break;
            }
            total += n as u64;
            self.state.update(&self.buf[..n]);
            if let Some(m) = self.monitor {
                m(n)?;
            }
        }
        drop(r);
        if total != stat.size {
            return Err(Error::Modified(name.to_string()));
        }
        if total == 0 && name_fallback {
            // Zero-length files get a unique digest based on their full name
            self.state.update(name.as_bytes());
            if let Some(m) = self.monitor {
                m(name.len())?;
            }
        }

        // Verify that file size and modification time have not changed
        let stat2 = source.stat(name).map_err(|e| Error::FileIo {
            name: name.to_string(),
            source: e,
        })?;
        if stat2.size != stat.size || stat2.mtime != stat.mtime {
            return Err(Error::Modified(name.to_string()));
        }

        let digest = Digest(*self.state.finalize().as_bytes());
        Ok(File::new(path, digest, stat.size, stat.mtime, Flag::NONE))
    }
}
