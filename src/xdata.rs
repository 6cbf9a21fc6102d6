//! Side-channel metadata carried alongside fop arguments and replies.
//!
//! The keys are a closed set: translators communicate out-of-band facts
//! (codec canaries, replication stamps, reconciliation arguments) through
//! these slots rather than through stringly-typed dictionaries. Unknown keys
//! cannot be constructed, so they cannot silently leak across layers.

use smallvec::SmallVec;

/// Enumerated side-channel keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum XKey {
    /// Payload is deflate-compressed; value is 1.
    DeflateCanary,
    /// Payload is zstd-compressed; value is 1.
    ZstdCanary,
    /// Fop was forwarded by the replication leader; carries the term.
    LeaderTerm,
    /// Fop was issued by the reconciliation worker.
    Reconciler,
    /// Term number argument/reply for reconciliation IPC.
    TermNumber,
    /// First term on disk (term-range reply).
    TermFirst,
    /// Last term of the contiguous run starting at first (term-range reply).
    TermContiguous,
    /// Last term on disk (term-range reply).
    TermLast,
    /// A raw term-log record (next-entry reply).
    TermEntry,
    /// Requested gfid for gfid-based lookup.
    GfidRequest,
}

impl XKey {
    /// Canonical wire name, used when xdata crosses the RPC boundary.
    pub fn as_str(self) -> &'static str {
        match self {
            XKey::DeflateCanary => "trusted.cdc.deflate-canary-val",
            XKey::ZstdCanary => "trusted.cdc.zstd-canary-val",
            XKey::LeaderTerm => "trusted.jbr.term",
            XKey::Reconciler => "trusted.jbr.recon",
            XKey::TermNumber => "trusted.jbr.term-number",
            XKey::TermFirst => "trusted.jbr.term-first",
            XKey::TermContiguous => "trusted.jbr.term-contiguous",
            XKey::TermLast => "trusted.jbr.term-last",
            XKey::TermEntry => "trusted.jbr.term-entry",
            XKey::GfidRequest => "trusted.gfid-request",
        }
    }

    pub fn from_str(name: &str) -> Option<XKey> {
        const ALL: &[XKey] = &[
            XKey::DeflateCanary,
            XKey::ZstdCanary,
            XKey::LeaderTerm,
            XKey::Reconciler,
            XKey::TermNumber,
            XKey::TermFirst,
            XKey::TermContiguous,
            XKey::TermLast,
            XKey::TermEntry,
            XKey::GfidRequest,
        ];
        ALL.iter().copied().find(|k| k.as_str() == name)
    }
}

/// Value slot for a side-channel key.
#[derive(Clone, Debug, PartialEq)]
pub enum XVal {
    U64(u64),
    Bytes(Vec<u8>),
}

impl XVal {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            XVal::U64(v) => Some(*v),
            XVal::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            XVal::Bytes(b) => Some(b),
            XVal::U64(_) => None,
        }
    }
}

/// The metadata bundle. Small and copied freely; most fops carry none.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Xdata {
    slots: SmallVec<[(XKey, XVal); 2]>,
}

impl Xdata {
    pub fn new() -> Xdata {
        Xdata::default()
    }

    /// Insert or replace a slot.
    pub fn set(&mut self, key: XKey, val: XVal) {
        if let Some(slot) = self.slots.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = val;
        } else {
            self.slots.push((key, val));
        }
    }

    pub fn set_u64(&mut self, key: XKey, val: u64) {
        self.set(key, XVal::U64(val));
    }

    pub fn set_flag(&mut self, key: XKey) {
        self.set(key, XVal::U64(1));
    }

    pub fn get(&self, key: XKey) -> Option<&XVal> {
        self.slots.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn get_u64(&self, key: XKey) -> Option<u64> {
        self.get(key).and_then(XVal::as_u64)
    }

    pub fn contains(&self, key: XKey) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: XKey) -> Option<XVal> {
        let idx = self.slots.iter().position(|(k, _)| *k == key)?;
        Some(self.slots.remove(idx).1)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(XKey, XVal)> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_replace() {
        let mut xd = Xdata::new();
        assert!(xd.is_empty());
        xd.set_flag(XKey::DeflateCanary);
        xd.set_u64(XKey::TermNumber, 7);
        assert!(xd.contains(XKey::DeflateCanary));
        assert_eq!(xd.get_u64(XKey::TermNumber), Some(7));

        xd.set_u64(XKey::TermNumber, 9);
        assert_eq!(xd.get_u64(XKey::TermNumber), Some(9));

        assert_eq!(xd.remove(XKey::TermNumber), Some(XVal::U64(9)));
        assert!(!xd.contains(XKey::TermNumber));
    }

    #[test]
    fn key_names_round_trip() {
        for key in [XKey::DeflateCanary, XKey::Reconciler, XKey::TermEntry] {
            assert_eq!(XKey::from_str(key.as_str()), Some(key));
        }
        assert_eq!(XKey::from_str("user.someone-else"), None);
    }
}
