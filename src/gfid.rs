//! 128-bit persistent object identifiers.
//!
//! A gfid identifies a filesystem object independently of any path. It is
//! assigned by the storage layer when an object is first observed and never
//! changes afterwards.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// 128-bit object identifier.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Gfid(pub [u8; 16]);

impl Gfid {
    /// The all-zero gfid, used as "not yet assigned".
    pub const NULL: Gfid = Gfid([0; 16]);

    /// The well-known root gfid (`00..01`).
    pub const ROOT: Gfid = Gfid([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

    pub fn is_null(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Build a gfid from two 64-bit words, high word first.
    ///
    /// The storage translator derives stable gfids from (device, inode) pairs
    /// this way; both words zero would collide with [`Gfid::NULL`], so the
    /// low word is forced non-zero in that case.
    pub fn from_parts(hi: u64, lo: u64) -> Gfid {
        let lo = if hi == 0 && lo == 0 { 1 } else { lo };
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&hi.to_be_bytes());
        bytes[8..].copy_from_slice(&lo.to_be_bytes());
        Gfid(bytes)
    }

    /// Canonical lowercase-hex form, used for backing-store file names and
    /// log messages.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(32);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// Parse the canonical hex form back into a gfid.
    pub fn from_hex(text: &str) -> Option<Gfid> {
        if text.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
            let chunk = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(chunk, 16).ok()?;
        }
        Some(Gfid(bytes))
    }
}

impl fmt::Debug for Gfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gfid({})", self.to_hex())
    }
}

impl fmt::Display for Gfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let gfid = Gfid::from_parts(0xdead_beef_0102_0304, 42);
        let hex = gfid.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(Gfid::from_hex(&hex), Some(gfid));
        assert_eq!(Gfid::from_hex("zz"), None);
    }

    #[test]
    fn zero_parts_do_not_collide_with_null() {
        assert!(!Gfid::from_parts(0, 0).is_null());
        assert!(Gfid::NULL.is_null());
        assert!(!Gfid::ROOT.is_null());
    }
}
