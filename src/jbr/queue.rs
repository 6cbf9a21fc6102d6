//! Per-inode operation ordering.
//!
//! Conflicting operations on one inode serialize through an active/pending
//! pair of lists: an arriving operation is admitted straight into the active
//! set when it is empty, otherwise parked as a stub on the pending list.
//! Completion pops the pending head into the active slot and hands its stub
//! back to the caller, who resumes it after releasing the queue lock (the
//! resume re-enters the fop table, which must not run under this lock).

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::stack::Stub;

#[derive(Default)]
struct Inner {
    active: usize,
    pending: VecDeque<Stub>,
}

/// The active/pending pair for one inode.
#[derive(Default)]
pub struct InodeQueue {
    inner: Mutex<Inner>,
}

impl InodeQueue {
    pub fn new() -> InodeQueue {
        InodeQueue::default()
    }

    /// Admit an operation: returns the stub back for immediate resumption if
    /// the active set was free, or parks it and returns None.
    #[must_use]
    pub fn admit(&self, stub: Stub) -> Option<Stub> {
        let mut inner = self.inner.lock();
        if inner.active > 0 {
            inner.pending.push_back(stub);
            None
        } else {
            inner.active += 1;
            Some(stub)
        }
    }

    /// Finish the running operation. If something is pending, its slot is
    /// reserved before the stub is returned, so the caller resumes it without
    /// re-admitting.
    #[must_use]
    pub fn leave(&self) -> Option<Stub> {
        let mut inner = self.inner.lock();
        debug_assert!(inner.active > 0, "leave without admit");
        inner.active = inner.active.saturating_sub(1);
        if inner.active == 0 {
            if let Some(stub) = inner.pending.pop_front() {
                inner.active += 1;
                return Some(stub);
            }
        }
        None
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.inner.lock().active
    }
}

impl std::fmt::Debug for InodeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        write!(f, "InodeQueue(active: {}, pending: {})", inner.active, inner.pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fop::FopKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stub(counter: &Arc<AtomicUsize>) -> Stub {
        let counter = counter.clone();
        Stub::new(FopKind::Writev, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn first_op_is_admitted_rest_park() {
        let queue = InodeQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let first = queue.admit(stub(&ran)).expect("empty queue admits");
        first.resume();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        assert!(queue.admit(stub(&ran)).is_none(), "second op parks");
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.active_len(), 1);

        // Completion transfers the slot to the parked op.
        let next = queue.leave().expect("pending head promoted");
        assert_eq!(queue.active_len(), 1);
        assert_eq!(queue.pending_len(), 0);
        next.resume();
        assert_eq!(ran.load(Ordering::SeqCst), 2);

        assert!(queue.leave().is_none());
        assert_eq!(queue.active_len(), 0);
    }

    #[test]
    fn pending_is_fifo() {
        let queue = InodeQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let tagged = |tag: u32| {
            let order = order.clone();
            Stub::new(FopKind::Writev, move || order.lock().push(tag))
        };

        queue.admit(tagged(0)).expect("admitted").resume();
        assert!(queue.admit(tagged(1)).is_none());
        assert!(queue.admit(tagged(2)).is_none());

        queue.leave().expect("first pending").resume();
        queue.leave().expect("second pending").resume();
        assert!(queue.leave().is_none());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
