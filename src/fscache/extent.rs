//! Cached-region tracking for the disk cache.
//!
//! Each cached file carries a set of half-open byte ranges `[start, end)`
//! describing what is already mirrored locally. The set is kept sorted,
//! non-overlapping and fully merged: adding a range that bridges neighbours
//! collapses them transitively into one.

use std::fmt;
use std::fmt::Write as _;

/// A half-open cached byte range.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
}

impl Extent {
    fn touches(&self, other: &Extent) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Sorted, merged set of cached extents for one file.
#[derive(Clone, Default, PartialEq)]
pub struct ExtentMap {
    extents: Vec<Extent>,
}

impl ExtentMap {
    pub fn new() -> ExtentMap {
        ExtentMap::default()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Total bytes covered.
    pub fn covered(&self) -> u64 {
        self.extents.iter().map(|e| e.end - e.start).sum()
    }

    /// Record `[start, start + len)` as cached, merging into and across any
    /// touching neighbours.
    pub fn add(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut merged = Extent { start, end: start + len };
        // Sweep out everything the new range touches; each absorbed
        // neighbour may bridge to the next, so one pass over the sorted
        // vector performs the transitive merge.
        self.extents.retain(|ext| {
            if ext.touches(&merged) {
                merged.start = merged.start.min(ext.start);
                merged.end = merged.end.max(ext.end);
                false
            } else {
                true
            }
        });
        let at = self.extents.partition_point(|e| e.start < merged.start);
        self.extents.insert(at, merged);
    }

    /// Drop `[start, start + len)` from the cached set. Idempotent: ranges
    /// not present are ignored; a removal in the middle of an extent splits
    /// it in two.
    pub fn remove(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = start.saturating_add(len);
        let mut result = Vec::with_capacity(self.extents.len() + 1);
        for ext in &self.extents {
            if ext.end <= start || ext.start >= end {
                result.push(*ext);
                continue;
            }
            if ext.start < start {
                result.push(Extent { start: ext.start, end: start });
            }
            if ext.end > end {
                result.push(Extent { start: end, end: ext.end });
            }
        }
        self.extents = result;
    }

    /// Whether `[start, start + len)` is fully cached. When the request runs
    /// past the known end of file, it is satisfied if everything up to EOF
    /// is cached.
    pub fn is_cached(&self, start: u64, len: u64, eof: Option<u64>) -> bool {
        if len == 0 {
            return true;
        }
        let mut end = start + len;
        if let Some(eof) = eof {
            if end > eof {
                if start >= eof {
                    return true;
                }
                end = eof;
            }
        }
        self.extents.iter().any(|ext| ext.start <= start && ext.end >= end)
    }

    /// Whether the whole file `[0, size)` is cached.
    pub fn covers_file(&self, size: u64) -> bool {
        self.is_cached(0, size, None) || size == 0
    }

    /// Serialized form persisted to the backing file's xattr.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for ext in &self.extents {
            let _ = write!(out, "{}-{};", ext.start, ext.end);
        }
        out
    }

    /// Restore from the serialized form; malformed pairs are skipped.
    pub fn parse(text: &str) -> ExtentMap {
        let mut map = ExtentMap::new();
        for pair in text.split(';').filter(|s| !s.is_empty()) {
            let Some((start, end)) = pair.split_once('-') else { continue };
            let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) else {
                continue;
            };
            if end > start {
                map.add(start, end - start);
            }
        }
        map
    }
}

impl fmt::Debug for ExtentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtentMap[{}]", self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_overlap(map: &ExtentMap) -> bool {
        map.extents().windows(2).all(|w| w[0].end <= w[1].start)
    }

    #[test]
    fn add_bridging_merges_transitively() {
        let mut map = ExtentMap::new();
        map.add(0, 100);
        map.add(200, 100);
        assert_eq!(map.extents().len(), 2);
        assert!(!map.is_cached(50, 200, None));

        // Bridging two extents: {[0,100), [200,300)} + [100,200) collapses
        // to one.
        map.add(100, 100);
        assert_eq!(map.extents(), &[Extent { start: 0, end: 300 }]);
        assert!(map.is_cached(50, 200, None));
        assert!(no_overlap(&map));
    }

    #[test]
    fn add_is_idempotent_for_coverage() {
        let mut map = ExtentMap::new();
        map.add(10, 20);
        assert!(map.is_cached(10, 20, None));
        map.add(10, 20);
        assert_eq!(map.extents().len(), 1);
        assert_eq!(map.covered(), 20);
    }

    #[test]
    fn remove_trims_splits_and_deletes() {
        let mut map = ExtentMap::new();
        map.add(0, 1000);

        // Split in the middle.
        map.remove(400, 200);
        assert_eq!(
            map.extents(),
            &[Extent { start: 0, end: 400 }, Extent { start: 600, end: 1000 }]
        );

        // Trim an endpoint.
        map.remove(0, 100);
        assert_eq!(map.extents()[0], Extent { start: 100, end: 400 });

        // Delete exactly.
        map.remove(100, 300);
        assert_eq!(map.extents(), &[Extent { start: 600, end: 1000 }]);

        // Idempotent: removing again changes nothing.
        map.remove(100, 300);
        assert_eq!(map.extents(), &[Extent { start: 600, end: 1000 }]);
        assert!(no_overlap(&map));
    }

    #[test]
    fn remove_after_add_restores_previous_map() {
        let mut map = ExtentMap::new();
        map.add(0, 100);
        let before = map.clone();
        map.add(500, 100);
        map.remove(500, 100);
        assert_eq!(map, before);
    }

    #[test]
    fn eof_extension_rule() {
        let mut map = ExtentMap::new();
        map.add(0, 100);
        // File is 100 bytes; a read of [50, 200) is cached because the file
        // up to EOF is.
        assert!(map.is_cached(50, 150, Some(100)));
        assert!(!map.is_cached(50, 150, None));
        // A read entirely past EOF is trivially cached.
        assert!(map.is_cached(150, 10, Some(100)));
        assert!(map.covers_file(100));
        assert!(!map.covers_file(101));
    }

    #[test]
    fn serialize_round_trip() {
        let mut map = ExtentMap::new();
        map.add(0, 100);
        map.add(4096, 8192);
        let text = map.serialize();
        assert_eq!(text, "0-100;4096-12288;");
        let restored = ExtentMap::parse(&text);
        assert_eq!(restored, map);
        // Junk entries are skipped, not fatal.
        let partial = ExtentMap::parse("0-100;bogus;7-3;200-300;");
        assert_eq!(partial.extents().len(), 2);
    }
}
