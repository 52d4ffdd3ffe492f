use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU8, Ordering};

/// File flags: one of three mutually exclusive persistent marks, a persistent
/// "gone" bit, and a runtime-only "same" bit.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Flag(u8);

impl Flag {
    /// Zero value.
    pub const NONE: Flag = Flag(0);
    /// File may be removed.
    pub const DUP: Flag = Flag(1);
    /// File and all of its copies may be removed.
    pub const JUNK: Flag = Flag(2);
    /// File must be preserved (value and mask).
    pub const KEEP: Flag = Flag(3);
    /// File no longer exists.
    pub const GONE: Flag = Flag(1 << 2);
    /// File exists and hasn't changed (runtime only).
    pub(crate) const SAME: Flag = Flag(1 << 4);
    /// Persistent flags.
    pub(crate) const PERSIST: Flag = Flag(0x0f);

    /// Returns whether this file is a duplicate that may be removed.
    pub fn is_dup(self) -> bool {
        self.0 & Flag::KEEP.0 == Flag::DUP.0
    }

    /// Returns whether the file and all of its copies may be removed.
    pub fn is_junk(self) -> bool {
        self.0 & Flag::KEEP.0 == Flag::JUNK.0
    }

    /// Returns whether the file must be preserved.
    pub fn keep(self) -> bool {
        self.0 & Flag::KEEP.0 == Flag::KEEP.0
    }

    /// Returns whether the file no longer exists.
    pub fn is_gone(self) -> bool {
        self.0 & Flag::GONE.0 != 0
    }

    /// Returns whether this scan found the file unchanged.
    pub fn is_same(self) -> bool {
        self.0 & Flag::SAME.0 != 0
    }

    /// Returns whether the file may be removed.
    pub fn may_remove(self) -> bool {
        self.is_dup() || self.is_junk()
    }

    /// Returns whether the file exists and is not marked for removal.
    pub fn is_safe(self) -> bool {
        let p = self.0 & Flag::PERSIST.0;
        p == 0 || p == Flag::KEEP.0
    }

    /// Returns the persistent mark bits, without the gone bit.
    pub(crate) fn mark(self) -> Flag {
        Flag(self.0 & Flag::KEEP.0)
    }

    /// Returns only the persistent flags.
    pub(crate) fn persist(self) -> Flag {
        Flag(self.0 & Flag::PERSIST.0)
    }

    /// Returns whether the file should be written to the index.
    pub(crate) fn should_write(self) -> bool {
        !self.is_gone() || self.mark() != Flag::NONE
    }

    pub(crate) fn clear(self, mask: Flag) -> Flag {
        Flag(self.0 & !mask.0)
    }

    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    /// Returns the persisted string form: the mark letter, if any, followed
    /// by 'X' when the file is gone.
    pub fn as_str(self) -> &'static str {
        const GONE: u8 = Flag::GONE.0;
        match self.0 & Flag::PERSIST.0 {
            0 => "",
            1 => "D",
            2 => "J",
            3 => "K",
            d if d == Flag::DUP.0 | GONE => "DX",
            j if j == Flag::JUNK.0 | GONE => "JX",
            k if k == Flag::KEEP.0 | GONE => "KX",
            _ => "", // Gone without a mark is never written
        }
    }

    /// Decodes the persisted string form. "X" alone is not a valid flag: a
    /// gone file without a mark is simply omitted from the index.
    pub fn parse(b: &str) -> Option<Flag> {
        let b = b.as_bytes();
        match b {
            [] => Some(Flag::NONE),
            [m] => Flag::parse_mark(*m),
            [m, b'X'] => Flag::parse_mark(*m).map(|f| f | Flag::GONE),
            _ => None,
        }
    }

    fn parse_mark(m: u8) -> Option<Flag> {
        match m {
            b'D' => Some(Flag::DUP),
            b'J' => Some(Flag::JUNK),
            b'K' => Some(Flag::KEEP),
            _ => None,
        }
    }
}

impl BitOr for Flag {
    type Output = Flag;
    fn bitor(self, rhs: Flag) -> Flag {
        Flag(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flag {
    fn bitor_assign(&mut self, rhs: Flag) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flag {
    type Output = Flag;
    fn bitand(self, rhs: Flag) -> Flag {
        Flag(self.0 & rhs.0)
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flag({:#04x} {:?})", self.0, self.as_str())
    }
}

/// Interior-mutable flag storage. Rescan and mark operations update flags on
/// file records that are shared between an Index and a Tree.
pub(crate) struct AtomicFlag(AtomicU8);

impl AtomicFlag {
    pub(crate) fn new(f: Flag) -> AtomicFlag {
        AtomicFlag(AtomicU8::new(f.0))
    }

    pub(crate) fn get(&self) -> Flag {
        Flag(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn set(&self, f: Flag) {
        self.0.store(f.0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_form() {
        assert_eq!("", Flag::NONE.as_str());
        assert_eq!("D", Flag::DUP.as_str());
        assert_eq!("J", Flag::JUNK.as_str());
        assert_eq!("K", Flag::KEEP.as_str());
        assert_eq!("DX", (Flag::DUP | Flag::GONE).as_str());
        assert_eq!("JX", (Flag::JUNK | Flag::GONE).as_str());
        assert_eq!("KX", (Flag::KEEP | Flag::GONE).as_str());
        assert_eq!("", Flag::GONE.as_str());
        assert_eq!("D", (Flag::DUP | Flag::SAME).as_str());
    }

    #[test]
    fn parse() {
        assert_eq!(Some(Flag::NONE), Flag::parse(""));
        assert_eq!(Some(Flag::DUP), Flag::parse("D"));
        assert_eq!(Some(Flag::JUNK), Flag::parse("J"));
        assert_eq!(Some(Flag::KEEP), Flag::parse("K"));
        assert_eq!(Some(Flag::DUP | Flag::GONE), Flag::parse("DX"));
        assert_eq!(Some(Flag::JUNK | Flag::GONE), Flag::parse("JX"));
        assert_eq!(Some(Flag::KEEP | Flag::GONE), Flag::parse("KX"));
        for bad in ["X", "DD", "XD", "KXX", "k", " ", "D "] {
            assert_eq!(None, Flag::parse(bad), "{bad:?}");
        }
    }

    #[test]
    fn predicates() {
        assert!(Flag::NONE.is_safe());
        assert!(Flag::KEEP.is_safe());
        assert!(!Flag::DUP.is_safe());
        assert!(!Flag::JUNK.is_safe());
        assert!(!(Flag::KEEP | Flag::GONE).is_safe());
        assert!(!Flag::GONE.is_safe());

        assert!(Flag::DUP.may_remove());
        assert!(Flag::JUNK.may_remove());
        assert!(!Flag::KEEP.may_remove());
        assert!(!Flag::NONE.may_remove());

        assert!(Flag::NONE.should_write());
        assert!((Flag::KEEP | Flag::GONE).should_write());
        assert!(!Flag::GONE.should_write());
    }
}
