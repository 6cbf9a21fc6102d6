//! Open-file handles and the bridge-side handle table.
//!
//! An [`Fd`] is the stack-wide identity of one open; translators hang their
//! per-open state off its context slots. The [`FdTable`] maps the numeric
//! handles handed to the kernel back to `Fd`s. Per-fd state is guarded by
//! per-fd locks, below the inode lock in the global order.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::fop::{Flock, LkType, OpenFlags};
use crate::itable::Inode;
use crate::stack::LockOwner;
use crate::xlator::XlatorId;

/// One open file or directory handle.
pub struct Fd {
    inode: Arc<Inode>,
    flags: OpenFlags,
    pid: u32,
    is_dir: bool,
    released: AtomicBool,
    lock_owner: Mutex<LockOwner>,
    /// Posix locks currently held through this handle.
    locks: Mutex<Vec<Flock>>,
    ctx: Mutex<HashMap<u32, Box<dyn Any + Send>>>,
}

impl Fd {
    pub fn new(inode: Arc<Inode>, flags: OpenFlags, pid: u32) -> Arc<Fd> {
        Fd::new_inner(inode, flags, pid, false)
    }

    pub fn new_dir(inode: Arc<Inode>, flags: OpenFlags, pid: u32) -> Arc<Fd> {
        Fd::new_inner(inode, flags, pid, true)
    }

    fn new_inner(inode: Arc<Inode>, flags: OpenFlags, pid: u32, is_dir: bool) -> Arc<Fd> {
        Arc::new(Fd {
            inode,
            flags,
            pid,
            is_dir,
            released: AtomicBool::new(false),
            lock_owner: Mutex::new(LockOwner::default()),
            locks: Mutex::new(Vec::new()),
            ctx: Mutex::new(HashMap::new()),
        })
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Mark released; returns false if it already was (release is one-shot).
    pub fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }

    pub fn lock_owner(&self) -> LockOwner {
        *self.lock_owner.lock()
    }

    pub fn set_lock_owner(&self, owner: LockOwner) {
        *self.lock_owner.lock() = owner;
    }

    /// Record a granted lock, merging the trivial replace-by-same-range case;
    /// an unlock removes every lock of the same owner that it covers.
    pub fn track_lock(&self, lock: Flock) {
        let mut locks = self.locks.lock();
        match lock.typ {
            LkType::Unlock => {
                locks.retain(|held| {
                    !(held.owner == lock.owner
                        && held.start >= lock.start
                        && held.end <= lock.end)
                });
            }
            _ => {
                locks.retain(|held| {
                    !(held.owner == lock.owner
                        && held.start == lock.start
                        && held.end == lock.end)
                });
                locks.push(lock);
            }
        }
    }

    pub fn held_locks(&self) -> Vec<Flock> {
        self.locks.lock().clone()
    }

    pub fn has_locks(&self) -> bool {
        !self.locks.lock().is_empty()
    }

    pub fn clear_locks(&self) {
        self.locks.lock().clear();
    }

    pub fn ctx_insert<T: Any + Send>(&self, id: XlatorId, value: T) {
        self.ctx.lock().insert(id.0, Box::new(value));
    }

    pub fn ctx_get<T: Any + Send + Clone>(&self, id: XlatorId) -> Option<T> {
        self.ctx.lock().get(&id.0).and_then(|b| b.downcast_ref::<T>()).cloned()
    }

    pub fn ctx_remove(&self, id: XlatorId) -> Option<Box<dyn Any + Send>> {
        self.ctx.lock().remove(&id.0)
    }

    pub fn ctx_clear(&self) {
        self.ctx.lock().clear();
    }
}

impl fmt::Debug for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fd")
            .field("inode", &self.inode.gfid())
            .field("flags", &self.flags)
            .field("dir", &self.is_dir)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Numeric-handle map for fds exposed across an external boundary (the FUSE
/// fh space, or the server's remote-fd space).
pub struct FdTable {
    map: Mutex<HashMap<u64, Arc<Fd>>>,
    next: AtomicU64,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable { map: Mutex::new(HashMap::new()), next: AtomicU64::new(1) }
    }

    /// Insert an fd, returning its fresh handle. Handles are never reused
    /// within a table's lifetime.
    pub fn insert(&self, fd: Arc<Fd>) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::SeqCst);
        self.map.lock().insert(handle, fd);
        handle
    }

    pub fn get(&self, handle: u64) -> Option<Arc<Fd>> {
        self.map.lock().get(&handle).cloned()
    }

    pub fn remove(&self, handle: u64) -> Option<Arc<Fd>> {
        self.map.lock().remove(&handle)
    }

    /// Snapshot of all live fds (reopen walks use this).
    pub fn all(&self) -> Vec<Arc<Fd>> {
        self.map.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        FdTable::new()
    }
}

impl fmt::Debug for FdTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FdTable({} open)", self.len())
    }
}
