//! Dirty-fd tracking for the periodic fsync sweep.
//!
//! Writes register their fd here; a background thread drains the list every
//! few seconds and fsyncs each fd through the local child. Lock order: this
//! global list lock first, then any per-fd lock, matching what the flush
//! thread observes.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::fdtable::Fd;

/// The global dirty-fd list.
#[derive(Default)]
pub struct DirtyFds {
    list: Mutex<Vec<Arc<Fd>>>,
}

impl DirtyFds {
    pub fn new() -> DirtyFds {
        DirtyFds::default()
    }

    /// Record `fd` as dirty; one entry per fd regardless of write count.
    pub fn mark(&self, fd: &Arc<Fd>) {
        let mut list = self.list.lock();
        if !list.iter().any(|held| Arc::ptr_eq(held, fd)) {
            list.push(fd.clone());
        }
    }

    /// Take the whole list, leaving it empty for the next interval.
    pub fn drain(&self) -> Vec<Arc<Fd>> {
        std::mem::take(&mut self.list.lock())
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }
}

impl std::fmt::Debug for DirtyFds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DirtyFds({})", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fop::OpenFlags;
    use crate::itable::InodeTable;

    #[test]
    fn mark_dedupes_and_drain_clears() {
        let dirty = DirtyFds::new();
        let table = InodeTable::new();
        let fd1 = Fd::new(table.root(), OpenFlags::RDWR, 1);
        let fd2 = Fd::new(table.root(), OpenFlags::RDWR, 1);

        dirty.mark(&fd1);
        dirty.mark(&fd1);
        dirty.mark(&fd2);
        assert_eq!(dirty.len(), 2);

        let drained = dirty.drain();
        assert_eq!(drained.len(), 2);
        assert!(dirty.is_empty());
    }
}
