//! Page bookkeeping for the read-ahead cache.
//!
//! One lock per open file covers the page list and every page's waitqueue.
//! Completion callbacks are collected under the lock and fired after it is
//! released, keeping the lock order file-lock < nothing.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::errno::Errno;
use crate::fop::{Attr, Payload, ReadReply};
use crate::stack::Unwinder;
use crate::xdata::Xdata;

/// State of one cached page.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum PageState {
    /// A fetch is outstanding; exactly one per page.
    InFlight,
    /// Payload is valid.
    Ready,
}

pub(crate) struct PageEntry {
    pub(crate) state: PageState,
    /// Prefetched with no user waiting on it yet.
    pub(crate) dirty: bool,
    /// Superseded by a concurrent write while in flight.
    pub(crate) poisoned: bool,
    pub(crate) payload: Payload,
    /// FIFO of user reads blocked on this page.
    pub(crate) waitq: Vec<WaitingRead>,
}

impl PageEntry {
    pub(crate) fn in_flight(dirty: bool) -> PageEntry {
        PageEntry {
            state: PageState::InFlight,
            dirty,
            poisoned: false,
            payload: Payload::new(),
            waitq: Vec::new(),
        }
    }
}

/// A user read waiting on one page.
pub(crate) struct WaitingRead {
    pub(crate) read: std::sync::Arc<PendingRead>,
    pub(crate) page_offset: u64,
}

struct PendingInner {
    remaining: usize,
    pages: BTreeMap<u64, Payload>,
    error: Option<Errno>,
    attr: Option<Attr>,
    unw: Option<Unwinder<ReadReply>>,
}

/// One user read assembled from one or more pages.
pub(crate) struct PendingRead {
    offset: u64,
    size: usize,
    inner: Mutex<PendingInner>,
}

impl PendingRead {
    pub(crate) fn new(offset: u64, size: usize, page_count: usize, unw: Unwinder<ReadReply>) -> Self {
        PendingRead {
            offset,
            size,
            inner: Mutex::new(PendingInner {
                remaining: page_count,
                pages: BTreeMap::new(),
                error: None,
                attr: None,
                unw: Some(unw),
            }),
        }
    }

    /// Record one page's outcome; fires the user unwind when it was the
    /// last one. Safe to call from any thread; never called under the file
    /// lock.
    pub(crate) fn page_done(&self, page_offset: u64, result: Result<(Payload, Option<Attr>), Errno>) {
        let fire = {
            let mut inner = self.inner.lock();
            match result {
                Ok((payload, attr)) => {
                    inner.pages.insert(page_offset, payload);
                    if let Some(attr) = attr {
                        inner.attr = Some(attr);
                    }
                }
                Err(errno) => {
                    // ECANCELED (poisoning) outranks other failures: the
                    // caller must not conclude the data was merely unreadable
                    // when it raced a write.
                    if inner.error != Some(Errno::ECANCELED) {
                        inner.error = Some(errno);
                    }
                }
            }
            inner.remaining -= 1;
            if inner.remaining == 0 { inner.unw.take() } else { None }
        };
        if let Some(unw) = fire {
            self.finish(unw);
        }
    }

    fn finish(&self, unw: Unwinder<ReadReply>) {
        let inner = self.inner.lock();
        if let Some(errno) = inner.error {
            drop(inner);
            unw.errno(errno);
            return;
        }
        let Some(first) = inner.pages.keys().next().copied() else {
            drop(inner);
            unw.okay(ReadReply {
                payload: Payload::new(),
                attr: Attr::synthetic_dir(crate::gfid::Gfid::NULL),
                xdata: Xdata::new(),
            });
            return;
        };
        let mut assembled = Payload::new();
        for payload in inner.pages.values() {
            assembled.append(payload.clone());
        }
        let skip = (self.offset - first) as usize;
        let payload = assembled.slice(skip, self.size);
        let attr = inner.attr.unwrap_or_else(|| Attr::synthetic_dir(crate::gfid::Gfid::NULL));
        drop(inner);
        unw.okay(ReadReply { payload, attr, xdata: Xdata::new() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fop::FopKind;
    use crate::stack::{Frame, SyncCall};
    use std::sync::Arc;

    fn attr() -> Attr {
        Attr::synthetic_dir(crate::gfid::Gfid::ROOT)
    }

    #[test]
    fn single_page_read_slices_user_range() {
        let call = SyncCall::<ReadReply>::new();
        let read =
            Arc::new(PendingRead::new(100, 20, 1, call.unwinder(Frame::internal(), FopKind::Readv)));
        let page: Vec<u8> = (0..=255u8).collect();
        read.page_done(0, Ok((Payload::from_vec(page), Some(attr()))));
        let reply = call.wait().unwrap();
        let bytes = reply.payload.contiguous();
        assert_eq!(bytes.len(), 20);
        assert_eq!(bytes[0], 100);
        assert_eq!(bytes[19], 119);
    }

    #[test]
    fn multi_page_read_assembles_in_offset_order() {
        let call = SyncCall::<ReadReply>::new();
        let read =
            Arc::new(PendingRead::new(10, 20, 2, call.unwinder(Frame::internal(), FopKind::Readv)));
        // Second page completes first.
        read.page_done(16, Ok((Payload::from_vec(vec![2u8; 16]), None)));
        read.page_done(0, Ok((Payload::from_vec(vec![1u8; 16]), Some(attr()))));
        let reply = call.wait().unwrap();
        let bytes = reply.payload.contiguous();
        assert_eq!(bytes.len(), 20);
        assert!(bytes[..6].iter().all(|&b| b == 1));
        assert!(bytes[6..].iter().all(|&b| b == 2));
    }

    #[test]
    fn cancellation_wins_over_other_errors() {
        let call = SyncCall::<ReadReply>::new();
        let read =
            Arc::new(PendingRead::new(0, 32, 2, call.unwinder(Frame::internal(), FopKind::Readv)));
        read.page_done(0, Err(Errno::ECANCELED));
        read.page_done(16, Err(Errno::EIO));
        assert_eq!(call.wait().unwrap_err(), Errno::ECANCELED);
    }
}
