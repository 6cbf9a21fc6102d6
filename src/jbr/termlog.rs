//! Append-only term logs.
//!
//! Each term of leader stability owns one file `TERM.<n>` in the log
//! directory, holding fixed 128-byte records appended in commit order. A
//! committed record starts with the two-byte marker `_P`; the first record
//! without the marker bounds the committed prefix, found by binary search so
//! no separate index is needed. Reconciliation reads terms sequentially
//! through [`TermReader`].

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::errno::Errno;
use crate::fop::FopKind;
use crate::gfid::Gfid;

/// Fixed record size.
pub const ENTRY_SIZE: usize = 128;
/// Committed-record marker.
pub const COMMIT_PREFIX: &[u8; 2] = b"_P";

/// One term's worth of committed-operation records on disk.
pub struct TermLog {
    dir: PathBuf,
}

impl TermLog {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<TermLog> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(TermLog { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, term: u32) -> PathBuf {
        self.dir.join(format!("TERM.{term}"))
    }

    /// Render one committed record: marker, term, index, fop, gfid, all
    /// NUL-padded into the fixed slot.
    pub fn make_record(term: u32, index: u64, op: FopKind, gfid: Gfid) -> [u8; ENTRY_SIZE] {
        let mut record = [0u8; ENTRY_SIZE];
        let text = format!(
            "{}{} {} {} {}",
            std::str::from_utf8(COMMIT_PREFIX).expect("ascii"),
            term,
            index,
            op.name(),
            gfid.to_hex()
        );
        let bytes = text.as_bytes();
        let len = bytes.len().min(ENTRY_SIZE);
        record[..len].copy_from_slice(&bytes[..len]);
        record
    }

    /// Append a record to `TERM.<term>`.
    pub fn append(&self, term: u32, record: &[u8; ENTRY_SIZE]) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(self.path_of(term))?;
        file.write_all(record)?;
        Ok(())
    }

    /// Terms present on disk: (first, last-contiguous-from-first, last).
    pub fn term_range(&self) -> io::Result<Option<(u32, u32, u32)>> {
        let mut terms: Vec<u32> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(text) = name.to_str() else { continue };
            let Some(number) = text.strip_prefix("TERM.") else { continue };
            match number.parse::<u32>() {
                Ok(term) => terms.push(term),
                Err(_) => warn!("ignoring malformed term file {text:?}"),
            }
        }
        if terms.is_empty() {
            return Ok(None);
        }
        terms.sort_unstable();
        let first = terms[0];
        let mut contiguous = first;
        for &term in &terms[1..] {
            if term == contiguous + 1 {
                contiguous = term;
            } else {
                break;
            }
        }
        Ok(Some((first, contiguous, *terms.last().expect("non-empty"))))
    }

    /// Number of committed records in `TERM.<term>`, by binary search for
    /// the first record whose prefix is not the commit marker.
    pub fn committed_count(&self, term: u32) -> io::Result<u64> {
        let mut file = File::open(self.path_of(term))?;
        let size = file.metadata()?.len();
        let total = size / ENTRY_SIZE as u64;
        let (mut lo, mut hi) = (0u64, total);
        let mut prefix = [0u8; 2];
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            file.seek(SeekFrom::Start(mid * ENTRY_SIZE as u64))?;
            file.read_exact(&mut prefix)?;
            if &prefix == COMMIT_PREFIX {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        debug!("term {term}: {lo} of {total} records committed");
        Ok(lo)
    }

    /// Open a term for sequential reading.
    pub fn open(&self, term: u32) -> io::Result<TermReader> {
        Ok(TermReader { file: File::open(self.path_of(term))?, buf: [0; ENTRY_SIZE] })
    }
}

impl std::fmt::Debug for TermLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TermLog({:?})", self.dir)
    }
}

/// Sequential reader over one term file. The read buffer is owned here, so
/// one reader serves one reconciler; callers serialize access.
pub struct TermReader {
    file: File,
    buf: [u8; ENTRY_SIZE],
}

impl TermReader {
    /// The next full record, or ENODATA once the file is exhausted. A
    /// trailing partial record also ends the stream.
    pub fn next_entry(&mut self) -> Result<[u8; ENTRY_SIZE], Errno> {
        let mut filled = 0;
        while filled < ENTRY_SIZE {
            match self.file.read(&mut self.buf[filled..]) {
                Ok(0) => {
                    if filled > 0 {
                        warn!("term log ends with a {filled}-byte partial record");
                    }
                    return Err(Errno::ENODATA);
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Errno::from(err)),
            }
        }
        Ok(self.buf)
    }
}

impl std::fmt::Debug for TermReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TermReader")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_prefix(prefix: &[u8; 2], n: u8) -> [u8; ENTRY_SIZE] {
        let mut record = [n; ENTRY_SIZE];
        record[..2].copy_from_slice(prefix);
        record
    }

    #[test]
    fn append_and_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = TermLog::new(dir.path().join("journal")).unwrap();
        for i in 0..5u8 {
            log.append(3, &record_with_prefix(COMMIT_PREFIX, i)).unwrap();
        }
        let mut reader = log.open(3).unwrap();
        for i in 0..5u8 {
            let entry = reader.next_entry().unwrap();
            assert_eq!(&entry[..2], COMMIT_PREFIX);
            assert_eq!(entry[2], i);
        }
        assert_eq!(reader.next_entry(), Err(Errno::ENODATA));
    }

    #[test]
    fn committed_count_stops_at_first_unmarked() {
        let dir = tempfile::tempdir().unwrap();
        let log = TermLog::new(dir.path()).unwrap();
        for i in 0..7u8 {
            log.append(1, &record_with_prefix(COMMIT_PREFIX, i)).unwrap();
        }
        for i in 0..3u8 {
            log.append(1, &record_with_prefix(b"__", i)).unwrap();
        }
        assert_eq!(log.committed_count(1).unwrap(), 7);
    }

    #[test]
    fn committed_count_handles_all_and_none() {
        let dir = tempfile::tempdir().unwrap();
        let log = TermLog::new(dir.path()).unwrap();
        log.append(2, &record_with_prefix(COMMIT_PREFIX, 0)).unwrap();
        log.append(2, &record_with_prefix(COMMIT_PREFIX, 1)).unwrap();
        assert_eq!(log.committed_count(2).unwrap(), 2);

        log.append(4, &record_with_prefix(b"xx", 0)).unwrap();
        assert_eq!(log.committed_count(4).unwrap(), 0);
    }

    #[test]
    fn term_range_reports_contiguity() {
        let dir = tempfile::tempdir().unwrap();
        let log = TermLog::new(dir.path()).unwrap();
        assert_eq!(log.term_range().unwrap(), None);
        for term in [2u32, 3, 4, 7] {
            log.append(term, &record_with_prefix(COMMIT_PREFIX, 0)).unwrap();
        }
        assert_eq!(log.term_range().unwrap(), Some((2, 4, 7)));
    }

    #[test]
    fn record_format_carries_marker_term_and_fop() {
        let record = TermLog::make_record(9, 41, FopKind::Writev, Gfid::from_parts(1, 2));
        assert_eq!(&record[..2], COMMIT_PREFIX);
        let text = std::str::from_utf8(&record).unwrap();
        assert!(text.contains("9 41 writev"));
        assert_eq!(record.len(), ENTRY_SIZE);
    }
}
