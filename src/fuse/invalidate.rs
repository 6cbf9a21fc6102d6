//! Reverse invalidation upcalls.
//!
//! When downstream layers report an inode or entry as changed, the bridge
//! emits `FUSE_NOTIFY_INVAL_INODE` / `FUSE_NOTIFY_INVAL_ENTRY` to the
//! kernel. The writes happen on a dedicated thread feeding from a queue, so
//! request dispatch never blocks behind a slow device write.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::IoSlice;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use zerocopy::IntoBytes;

use super::abi;
use super::channel::ChannelSender;

/// One queued upcall.
#[derive(Debug)]
pub(super) enum Invalidation {
    Inode { nodeid: u64 },
    Entry { parent: u64, name: OsString },
}

struct Queue {
    items: Mutex<VecDeque<Invalidation>>,
    cond: Condvar,
}

/// The invalidation pipeline: enqueue from any thread, drain on one.
pub(super) struct InvalQueue {
    queue: Arc<Queue>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl InvalQueue {
    pub(super) fn start(sender: ChannelSender) -> InvalQueue {
        let queue = Arc::new(Queue { items: Mutex::new(VecDeque::new()), cond: Condvar::new() });
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let queue = queue.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("fuse-inval".into())
                .spawn(move || {
                    loop {
                        let item = {
                            let mut items = queue.items.lock();
                            loop {
                                if let Some(item) = items.pop_front() {
                                    break item;
                                }
                                if stop.load(Ordering::SeqCst) {
                                    return;
                                }
                                queue.cond.wait(&mut items);
                            }
                        };
                        write_notify(&sender, &item);
                    }
                })
                .expect("spawn invalidation thread")
        };
        InvalQueue { queue, stop, worker: Mutex::new(Some(worker)) }
    }

    /// Never blocks: the request path only appends and signals.
    pub(super) fn push(&self, item: Invalidation) {
        self.queue.items.lock().push_back(item);
        self.queue.cond.notify_one();
    }

    pub(super) fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.cond.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for InvalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InvalQueue({} queued)", self.queue.items.lock().len())
    }
}

fn write_notify(sender: &ChannelSender, item: &Invalidation) {
    match item {
        Invalidation::Inode { nodeid } => {
            let body = abi::fuse_notify_inval_inode_out { ino: *nodeid, off: 0, len: -1 };
            let header = abi::fuse_out_header {
                len: (size_of::<abi::fuse_out_header>() + size_of_val(&body)) as u32,
                error: abi::FUSE_NOTIFY_INVAL_INODE,
                unique: 0,
            };
            debug!("inval inode nodeid {nodeid}");
            if let Err(err) =
                sender.send(&[IoSlice::new(header.as_bytes()), IoSlice::new(body.as_bytes())])
            {
                warn!("inode invalidation write failed: {err}");
            }
        }
        Invalidation::Entry { parent, name } => {
            let name = name.as_bytes();
            let body = abi::fuse_notify_inval_entry_out {
                parent: *parent,
                namelen: name.len() as u32,
                padding: 0,
            };
            let header = abi::fuse_out_header {
                len: (size_of::<abi::fuse_out_header>() + size_of_val(&body) + name.len() + 1)
                    as u32,
                error: abi::FUSE_NOTIFY_INVAL_ENTRY,
                unique: 0,
            };
            debug!("inval entry {name:?} under nodeid {parent}");
            if let Err(err) = sender.send(&[
                IoSlice::new(header.as_bytes()),
                IoSlice::new(body.as_bytes()),
                IoSlice::new(name),
                IoSlice::new(&[0]),
            ]) {
                warn!("entry invalidation write failed: {err}");
            }
        }
    }
}
