//! Sequential read-ahead translator.
//!
//! Prefetches page-aligned regions of sequentially read files into an
//! in-memory cache keyed by (fd, page offset). Exactly one fetch is ever
//! outstanding per page; later readers attach to the page's waitqueue.
//! Writes purge overlapping pages, poisoning the ones still in flight so
//! their eventual data is discarded instead of served stale.

mod page;

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::errno::Errno;
use crate::fdtable::Fd;
use crate::fop::{
    EntryReply, Loc, OpenFlags, Payload, PrePostReply, ReadReply, WriteReply,
};
use crate::options::{OptSpec, OptType, Options};
use crate::stack::{Frame, Unwinder};
use crate::xdata::Xdata;
use crate::xlator::{XlCore, Xlator};

use page::{PageEntry, PageState, PendingRead, WaitingRead};

const OPTIONS: &[OptSpec] = &[
    OptSpec { key: "page-size", typ: OptType::Size, default: "131072", desc: "prefetch page size" },
    OptSpec {
        key: "page-count",
        typ: OptType::Int { min: 1, max: 16 },
        default: "4",
        desc: "maximum pages prefetched ahead of a sequential reader",
    },
];

struct RaInner {
    pages: BTreeMap<u64, PageEntry>,
    /// Where the next read lands if the consumer is sequential.
    expected_offset: u64,
    /// Current read-ahead window in pages; zero disables prefetch.
    window: usize,
}

/// Per-fd cache state.
struct RaFile {
    inner: Mutex<RaInner>,
}

impl RaFile {
    fn new() -> Arc<RaFile> {
        Arc::new(RaFile {
            inner: Mutex::new(RaInner { pages: BTreeMap::new(), expected_offset: 0, window: 0 }),
        })
    }
}

/// Readahead translator.
pub struct ReadAhead {
    core: XlCore,
    page_size: u64,
    max_window: usize,
}

impl ReadAhead {
    pub fn new(name: &str, options: &Options, child: Arc<dyn Xlator>) -> Arc<ReadAhead> {
        let mut page_size = options.get_size("page-size");
        if page_size == 0 {
            page_size = page_size::get() as u64;
        }
        Arc::new(ReadAhead {
            core: XlCore::new(name, vec![child]),
            page_size,
            max_window: options.get_int("page-count") as usize,
        })
    }

    pub fn option_table() -> &'static [OptSpec] {
        OPTIONS
    }

    fn file_ctx(&self, fd: &Fd) -> Option<Arc<RaFile>> {
        fd.ctx_get::<Arc<RaFile>>(self.core.id())
    }

    /// Cache policy at open time: O_DIRECT and write-only opens bypass.
    fn attach_ctx(&self, fd: &Fd, flags: OpenFlags) {
        if flags.contains(OpenFlags::DIRECT) || flags.is_write_only() {
            debug!("{}: bypassing cache for fd with flags {flags:?}", self.core.name());
            return;
        }
        fd.ctx_insert(self.core.id(), RaFile::new());
    }

    fn align_down(&self, offset: u64) -> u64 {
        offset - (offset % self.page_size)
    }

    /// Purge `[start, end)`: ready pages are dropped, in-flight pages are
    /// poisoned so their arrival is discarded (and waiters cancelled).
    fn flush_region(&self, file: &RaFile, start: u64, end: u64) {
        let mut inner = file.inner.lock();
        let first = self.align_down(start);
        let doomed: Vec<u64> = inner
            .pages
            .range(first..end)
            .map(|(off, _)| *off)
            .collect();
        for off in doomed {
            let in_flight = {
                let entry = inner.pages.get_mut(&off).expect("listed above");
                if entry.state == PageState::InFlight {
                    trace!("poisoning in-flight page at {off}");
                    entry.poisoned = true;
                    true
                } else {
                    false
                }
            };
            if !in_flight {
                inner.pages.remove(&off);
            }
        }
    }

    /// Issue the child read that fills the page at `page_off`.
    fn fetch_page(&self, frame: &Frame, fd: &Arc<Fd>, file: &Arc<RaFile>, page_off: u64) {
        let child = self.core.first_child().expect("has child").clone();
        let file = file.clone();
        let fd2 = fd.clone();
        let page_size = self.page_size;
        let unw = Unwinder::new(
            frame.detach(),
            crate::fop::FopKind::Readv,
            move |res: crate::stack::FopResult<ReadReply>| {
                // Under the file lock: settle the page, collect wakeups.
                let mut wakeups: Vec<(WaitingRead, Result<(Payload, Option<crate::fop::Attr>), Errno>)> =
                    Vec::new();
                {
                    let mut inner = file.inner.lock();
                    let mut remove = false;
                    {
                        let Some(entry) = inner.pages.get_mut(&page_off) else {
                            return; // purged and removed while in flight
                        };
                        let waiters = std::mem::take(&mut entry.waitq);
                        if entry.poisoned {
                            // Stale by a concurrent write: never surface.
                            for waiter in waiters {
                                wakeups.push((waiter, Err(Errno::ECANCELED)));
                            }
                            remove = true;
                        } else {
                            match &res {
                                Ok(reply) => {
                                    entry.state = PageState::Ready;
                                    entry.payload = reply.payload.clone();
                                    entry.dirty = waiters.is_empty();
                                    for waiter in waiters {
                                        wakeups.push((
                                            waiter,
                                            Ok((reply.payload.clone(), Some(reply.attr))),
                                        ));
                                    }
                                }
                                Err(errno) => {
                                    for waiter in waiters {
                                        wakeups.push((waiter, Err(*errno)));
                                    }
                                    remove = true;
                                }
                            }
                        }
                    }
                    if remove {
                        inner.pages.remove(&page_off);
                    }
                }
                // Waitqueue is FIFO; deliver in order, outside the lock.
                for (waiter, outcome) in wakeups {
                    waiter.read.page_done(waiter.page_offset, outcome);
                }
            },
        );
        trace!("fetching page at {page_off}");
        child.readv(frame.detach(), fd2, page_size as usize, page_off, 0, Xdata::new(), unw);
    }
}

impl Xlator for ReadAhead {
    fn core(&self) -> &XlCore {
        &self.core
    }

    fn option_specs(&self) -> &'static [OptSpec] {
        OPTIONS
    }

    fn release(&self, fd: &Fd) {
        fd.ctx_remove(self.core.id());
    }

    fn open(&self, frame: Frame, loc: Loc, flags: OpenFlags, fd: Arc<Fd>, unw: Unwinder<()>) {
        // Context is attached before winding: a failed open never sees a
        // read, and attaching early avoids a race with the first readv.
        self.attach_ctx(&fd, flags);
        self.core.first_child().expect("has child").open(frame, loc, flags, fd, unw);
    }

    fn create(
        &self,
        frame: Frame,
        loc: Loc,
        flags: OpenFlags,
        mode: u32,
        umask: u32,
        fd: Arc<Fd>,
        xdata: Xdata,
        unw: Unwinder<EntryReply>,
    ) {
        self.attach_ctx(&fd, flags);
        self.core
            .first_child()
            .expect("has child")
            .create(frame, loc, flags, mode, umask, fd, xdata, unw);
    }

    fn readv(
        &self,
        frame: Frame,
        fd: Arc<Fd>,
        size: usize,
        offset: u64,
        flags: u32,
        xdata: Xdata,
        unw: Unwinder<ReadReply>,
    ) {
        let Some(file) = self.file_ctx(&fd) else {
            // Bypass mode for this fd.
            self.core.first_child().expect("has child").readv(frame, fd, size, offset, flags, xdata, unw);
            return;
        };
        if size == 0 {
            unw.okay(ReadReply {
                payload: Payload::new(),
                attr: fd.inode().attr().unwrap_or_else(|| crate::fop::Attr::synthetic_dir(crate::gfid::Gfid::NULL)),
                xdata: Xdata::new(),
            });
            return;
        }

        let first_page = self.align_down(offset);
        let end = offset + size as u64;
        let page_count = ((end - first_page) as usize).div_ceil(self.page_size as usize);
        let read = Arc::new(PendingRead::new(offset, size, page_count, unw));

        let mut fetches: Vec<u64> = Vec::new();
        let mut hits: Vec<(u64, Payload)> = Vec::new();
        let prefetch_from;
        let prefetch_pages;
        {
            let mut inner = file.inner.lock();
            // Sequential-access detection: consecutive reads grow the window
            // monotonically to the cap; any deviation zeroes it.
            if offset == inner.expected_offset {
                inner.window = (inner.window + 1).min(self.max_window);
            } else {
                inner.window = 0;
            }
            inner.expected_offset = end;
            prefetch_pages = inner.window;
            prefetch_from = self.align_down(end - 1) + self.page_size;

            let mut page_off = first_page;
            while page_off < end {
                match inner.pages.get_mut(&page_off) {
                    Some(entry) if entry.state == PageState::Ready => {
                        hits.push((page_off, entry.payload.clone()));
                        entry.dirty = false;
                    }
                    Some(entry) => {
                        entry.dirty = false;
                        entry.waitq.push(WaitingRead { read: read.clone(), page_offset: page_off });
                    }
                    None => {
                        let mut entry = PageEntry::in_flight(false);
                        entry.waitq.push(WaitingRead { read: read.clone(), page_offset: page_off });
                        inner.pages.insert(page_off, entry);
                        fetches.push(page_off);
                    }
                }
                page_off += self.page_size;
            }

            // Dirty prefetch pages for the window beyond the read.
            for i in 0..prefetch_pages {
                let off = prefetch_from + i as u64 * self.page_size;
                if !inner.pages.contains_key(&off) {
                    inner.pages.insert(off, PageEntry::in_flight(true));
                    fetches.push(off);
                }
            }
        }

        let attr = fd.inode().attr();
        for (page_off, payload) in hits {
            read.page_done(page_off, Ok((payload, attr)));
        }
        for page_off in fetches {
            self.fetch_page(&frame, &fd, &file, page_off);
        }
    }

    fn writev(
        &self,
        frame: Frame,
        fd: Arc<Fd>,
        payload: Payload,
        offset: u64,
        flags: u32,
        xdata: Xdata,
        unw: Unwinder<WriteReply>,
    ) {
        if let Some(file) = self.file_ctx(&fd) {
            // Purge-before-write-return: overlapping cache must be gone (or
            // poisoned) before the write is allowed to proceed downward.
            self.flush_region(&file, offset, offset + payload.len() as u64);
        }
        self.core.first_child().expect("has child").writev(frame, fd, payload, offset, flags, xdata, unw);
    }

    fn ftruncate(&self, frame: Frame, fd: Arc<Fd>, offset: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        if let Some(file) = self.file_ctx(&fd) {
            self.flush_region(&file, offset, u64::MAX);
        }
        self.core.first_child().expect("has child").ftruncate(frame, fd, offset, xdata, unw);
    }

    fn truncate(&self, frame: Frame, loc: Loc, offset: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        // Path-based truncate cannot find the fd ctx directly; conservative
        // option is taken by the per-fd flush in ftruncate and by writers.
        self.core.first_child().expect("has child").truncate(frame, loc, offset, xdata, unw);
    }

    fn discard(&self, frame: Frame, fd: Arc<Fd>, offset: u64, len: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        if let Some(file) = self.file_ctx(&fd) {
            self.flush_region(&file, offset, offset.saturating_add(len));
        }
        self.core.first_child().expect("has child").discard(frame, fd, offset, len, xdata, unw);
    }

    fn zerofill(&self, frame: Frame, fd: Arc<Fd>, offset: u64, len: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        if let Some(file) = self.file_ctx(&fd) {
            self.flush_region(&file, offset, offset.saturating_add(len));
        }
        self.core.first_child().expect("has child").zerofill(frame, fd, offset, len, xdata, unw);
    }

    fn flush(&self, frame: Frame, fd: Arc<Fd>, unw: Unwinder<()>) {
        if let Some(file) = self.file_ctx(&fd) {
            self.flush_region(&file, 0, u64::MAX);
        }
        self.core.first_child().expect("has child").flush(frame, fd, unw);
    }

    fn fsync(&self, frame: Frame, fd: Arc<Fd>, datasync: bool, unw: Unwinder<PrePostReply>) {
        if let Some(file) = self.file_ctx(&fd) {
            self.flush_region(&file, 0, u64::MAX);
        }
        self.core.first_child().expect("has child").fsync(frame, fd, datasync, unw);
    }
}

impl std::fmt::Debug for ReadAhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReadAhead(page_size {}, window {})", self.page_size, self.max_window)
    }
}
