//! The translator ABI.
//!
//! A translator receives typed fops, may transform or answer them, and winds
//! the rest to its children. Default method bodies forward to the first
//! child, so a translator overrides only the operations it participates in.
//! These methods correspond to the uniform fop table every layer of the
//! stack exposes.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::debug;
use parking_lot::Mutex;

use crate::errno::Errno;
use crate::fdtable::Fd;
use crate::fop::{
    Attr, EntrylkCmd, EntryReply, Flock, IpcReply, LkCmd, LkType, Loc, OpenFlags, ParentReply,
    Payload, PrePostReply, ReadReply, ReaddirReply, ReadlinkReply, SetattrArgs, Statvfs,
    WriteReply, XattrReply, XattropOp,
};
use crate::gfid::Gfid;
use crate::itable::Inode;
use crate::options::{Options, OptionError, OptSpec};
use crate::stack::{Frame, Unwinder};
use crate::xdata::Xdata;

/// Identity of one translator instance, used to key context slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct XlatorId(pub u32);

static NEXT_XLATOR_ID: AtomicU32 = AtomicU32::new(1);

/// Lifecycle and notification events delivered through `notify`.
#[derive(Clone, Debug)]
pub enum Event {
    /// Child `index` became serviceable.
    ChildUp(usize),
    /// Child `index` went away.
    ChildDown(usize),
    ParentUp,
    ParentDown,
    /// A cached inode's data or attributes are no longer valid downstream.
    InvalInode { gfid: Gfid },
    /// A cached entry under a parent is no longer valid downstream.
    InvalEntry { pargfid: Gfid, name: OsString },
    /// The graph is being torn down.
    Cleanup,
}

/// Shared bookkeeping every translator embeds.
pub struct XlCore {
    name: String,
    id: XlatorId,
    children: Vec<Arc<dyn Xlator>>,
    parents: Mutex<Vec<Weak<dyn Xlator>>>,
    self_ref: OnceLock<Weak<dyn Xlator>>,
}

impl XlCore {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn Xlator>>) -> XlCore {
        XlCore {
            name: name.into(),
            id: XlatorId(NEXT_XLATOR_ID.fetch_add(1, Ordering::Relaxed)),
            children,
            parents: Mutex::new(Vec::new()),
            self_ref: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> XlatorId {
        self.id
    }

    pub fn children(&self) -> &[Arc<dyn Xlator>] {
        &self.children
    }

    pub fn first_child(&self) -> Option<&Arc<dyn Xlator>> {
        self.children.first()
    }

    /// Index of `child` in this translator's ordered child list.
    pub fn child_index(&self, child: &Arc<dyn Xlator>) -> Option<usize> {
        self.children.iter().position(|c| Arc::ptr_eq(c, child))
    }

    fn add_parent(&self, parent: &Arc<dyn Xlator>) {
        self.parents.lock().push(Arc::downgrade(parent));
    }

    fn set_self(&self, this: &Arc<dyn Xlator>) {
        let _ = self.self_ref.set(Arc::downgrade(this));
    }

    fn self_arc(&self) -> Option<Arc<dyn Xlator>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    /// This translator as a trait object; available once the graph is
    /// assembled. Used to re-enter one's own fop table from a stub.
    pub fn self_xlator(&self) -> Option<Arc<dyn Xlator>> {
        self.self_arc()
    }

    /// Deliver an event to every parent, rewriting child-relative events to
    /// the index this translator occupies in each parent.
    pub fn emit_upward(&self, event: &Event) {
        let Some(this) = self.self_arc() else { return };
        let parents: Vec<_> =
            self.parents.lock().iter().filter_map(Weak::upgrade).collect();
        for parent in parents {
            let event = match event {
                Event::ChildUp(_) => match parent.core().child_index(&this) {
                    Some(idx) => Event::ChildUp(idx),
                    None => continue,
                },
                Event::ChildDown(_) => match parent.core().child_index(&this) {
                    Some(idx) => Event::ChildDown(idx),
                    None => continue,
                },
                other => other.clone(),
            };
            parent.notify(&event);
        }
    }
}

impl fmt::Debug for XlCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XlCore")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("children", &self.children.len())
            .finish()
    }
}

macro_rules! forward {
    ($self:ident, $unw:ident, $($call:tt)*) => {
        match $self.core().first_child() {
            Some(child) => child.$($call)*,
            None => $unw.errno(Errno::ENOSYS),
        }
    };
}

/// A pluggable layer in the translator tree.
#[allow(clippy::too_many_arguments)]
pub trait Xlator: Send + Sync + 'static {
    fn core(&self) -> &XlCore;

    /// Called once, after children are initialized, before the first fop.
    fn init(&self) -> io::Result<()> {
        Ok(())
    }

    /// Called once at teardown, after parents have finished.
    fn fini(&self) {}

    /// Lifecycle notification. The default republishes child state changes
    /// and invalidations upward and fans parent events downward.
    fn notify(&self, event: &Event) {
        match event {
            Event::ChildUp(_) | Event::ChildDown(_) | Event::InvalInode { .. } | Event::InvalEntry { .. } => {
                self.core().emit_upward(event);
            }
            Event::ParentUp | Event::ParentDown | Event::Cleanup => {
                for child in self.core().children() {
                    child.notify(event);
                }
            }
        }
    }

    /// Configuration keys this translator accepts.
    fn option_specs(&self) -> &'static [OptSpec] {
        &[]
    }

    /// Apply a new validated option set at runtime.
    fn reconfigure(&self, _options: &Options) -> Result<(), OptionError> {
        Ok(())
    }

    /// Append a statedump section for this translator.
    fn dump(&self, out: &mut String) {
        out.push_str(&format!("[{}]\n", self.core().name()));
    }

    // Per-entity teardown callbacks.

    /// The inode is leaving the table; drop any context owned here.
    fn forget(&self, _inode: &Inode) {}

    /// The fd saw its last reference; drop any context owned here.
    fn release(&self, _fd: &Fd) {}

    /// Directory-handle variant of `release`.
    fn releasedir(&self, _fd: &Fd) {}

    // Fops. Defaults forward to the first child.

    fn lookup(&self, frame: Frame, loc: Loc, xdata: Xdata, unw: Unwinder<EntryReply>) {
        forward!(self, unw, lookup(frame, loc, xdata, unw));
    }

    fn stat(&self, frame: Frame, loc: Loc, unw: Unwinder<Attr>) {
        forward!(self, unw, stat(frame, loc, unw));
    }

    fn setattr(&self, frame: Frame, loc: Loc, args: SetattrArgs, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        forward!(self, unw, setattr(frame, loc, args, xdata, unw));
    }

    fn readlink(&self, frame: Frame, loc: Loc, unw: Unwinder<ReadlinkReply>) {
        forward!(self, unw, readlink(frame, loc, unw));
    }

    fn mknod(&self, frame: Frame, loc: Loc, mode: u32, rdev: u32, umask: u32, xdata: Xdata, unw: Unwinder<EntryReply>) {
        forward!(self, unw, mknod(frame, loc, mode, rdev, umask, xdata, unw));
    }

    fn mkdir(&self, frame: Frame, loc: Loc, mode: u32, umask: u32, xdata: Xdata, unw: Unwinder<EntryReply>) {
        forward!(self, unw, mkdir(frame, loc, mode, umask, xdata, unw));
    }

    fn unlink(&self, frame: Frame, loc: Loc, xdata: Xdata, unw: Unwinder<ParentReply>) {
        forward!(self, unw, unlink(frame, loc, xdata, unw));
    }

    fn rmdir(&self, frame: Frame, loc: Loc, xdata: Xdata, unw: Unwinder<ParentReply>) {
        forward!(self, unw, rmdir(frame, loc, xdata, unw));
    }

    fn symlink(&self, frame: Frame, target: OsString, loc: Loc, umask: u32, xdata: Xdata, unw: Unwinder<EntryReply>) {
        forward!(self, unw, symlink(frame, target, loc, umask, xdata, unw));
    }

    fn rename(&self, frame: Frame, oldloc: Loc, newloc: Loc, xdata: Xdata, unw: Unwinder<Attr>) {
        forward!(self, unw, rename(frame, oldloc, newloc, xdata, unw));
    }

    fn link(&self, frame: Frame, oldloc: Loc, newloc: Loc, xdata: Xdata, unw: Unwinder<EntryReply>) {
        forward!(self, unw, link(frame, oldloc, newloc, xdata, unw));
    }

    fn truncate(&self, frame: Frame, loc: Loc, offset: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        forward!(self, unw, truncate(frame, loc, offset, xdata, unw));
    }

    fn ftruncate(&self, frame: Frame, fd: Arc<Fd>, offset: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        forward!(self, unw, ftruncate(frame, fd, offset, xdata, unw));
    }

    fn open(&self, frame: Frame, loc: Loc, flags: OpenFlags, fd: Arc<Fd>, unw: Unwinder<()>) {
        forward!(self, unw, open(frame, loc, flags, fd, unw));
    }

    fn create(&self, frame: Frame, loc: Loc, flags: OpenFlags, mode: u32, umask: u32, fd: Arc<Fd>, xdata: Xdata, unw: Unwinder<EntryReply>) {
        forward!(self, unw, create(frame, loc, flags, mode, umask, fd, xdata, unw));
    }

    fn readv(&self, frame: Frame, fd: Arc<Fd>, size: usize, offset: u64, flags: u32, xdata: Xdata, unw: Unwinder<ReadReply>) {
        forward!(self, unw, readv(frame, fd, size, offset, flags, xdata, unw));
    }

    fn writev(&self, frame: Frame, fd: Arc<Fd>, payload: Payload, offset: u64, flags: u32, xdata: Xdata, unw: Unwinder<WriteReply>) {
        forward!(self, unw, writev(frame, fd, payload, offset, flags, xdata, unw));
    }

    fn statfs(&self, frame: Frame, loc: Loc, unw: Unwinder<Statvfs>) {
        forward!(self, unw, statfs(frame, loc, unw));
    }

    fn flush(&self, frame: Frame, fd: Arc<Fd>, unw: Unwinder<()>) {
        forward!(self, unw, flush(frame, fd, unw));
    }

    fn fsync(&self, frame: Frame, fd: Arc<Fd>, datasync: bool, unw: Unwinder<PrePostReply>) {
        forward!(self, unw, fsync(frame, fd, datasync, unw));
    }

    fn setxattr(&self, frame: Frame, loc: Loc, name: OsString, value: Vec<u8>, flags: i32, xdata: Xdata, unw: Unwinder<()>) {
        forward!(self, unw, setxattr(frame, loc, name, value, flags, xdata, unw));
    }

    fn getxattr(&self, frame: Frame, loc: Loc, name: OsString, unw: Unwinder<XattrReply>) {
        forward!(self, unw, getxattr(frame, loc, name, unw));
    }

    fn removexattr(&self, frame: Frame, loc: Loc, name: OsString, xdata: Xdata, unw: Unwinder<()>) {
        forward!(self, unw, removexattr(frame, loc, name, xdata, unw));
    }

    fn opendir(&self, frame: Frame, loc: Loc, fd: Arc<Fd>, unw: Unwinder<()>) {
        forward!(self, unw, opendir(frame, loc, fd, unw));
    }

    fn readdir(&self, frame: Frame, fd: Arc<Fd>, size: usize, offset: u64, unw: Unwinder<ReaddirReply>) {
        forward!(self, unw, readdir(frame, fd, size, offset, unw));
    }

    fn fsyncdir(&self, frame: Frame, fd: Arc<Fd>, datasync: bool, unw: Unwinder<()>) {
        forward!(self, unw, fsyncdir(frame, fd, datasync, unw));
    }

    fn access(&self, frame: Frame, loc: Loc, mask: u32, unw: Unwinder<()>) {
        forward!(self, unw, access(frame, loc, mask, unw));
    }

    fn lk(&self, frame: Frame, fd: Arc<Fd>, cmd: LkCmd, lock: Flock, xdata: Xdata, unw: Unwinder<Flock>) {
        forward!(self, unw, lk(frame, fd, cmd, lock, xdata, unw));
    }

    fn inodelk(&self, frame: Frame, volume: String, loc: Loc, cmd: LkCmd, lock: Flock, xdata: Xdata, unw: Unwinder<()>) {
        forward!(self, unw, inodelk(frame, volume, loc, cmd, lock, xdata, unw));
    }

    fn entrylk(&self, frame: Frame, volume: String, loc: Loc, basename: OsString, cmd: EntrylkCmd, typ: LkType, xdata: Xdata, unw: Unwinder<()>) {
        forward!(self, unw, entrylk(frame, volume, loc, basename, cmd, typ, xdata, unw));
    }

    fn xattrop(&self, frame: Frame, loc: Loc, op: XattropOp, pairs: Vec<(OsString, Vec<u8>)>, xdata: Xdata, unw: Unwinder<Vec<(OsString, Vec<u8>)>>) {
        forward!(self, unw, xattrop(frame, loc, op, pairs, xdata, unw));
    }

    fn fallocate(&self, frame: Frame, fd: Arc<Fd>, mode: i32, offset: u64, len: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        forward!(self, unw, fallocate(frame, fd, mode, offset, len, xdata, unw));
    }

    fn discard(&self, frame: Frame, fd: Arc<Fd>, offset: u64, len: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        forward!(self, unw, discard(frame, fd, offset, len, xdata, unw));
    }

    fn zerofill(&self, frame: Frame, fd: Arc<Fd>, offset: u64, len: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        forward!(self, unw, zerofill(frame, fd, offset, len, xdata, unw));
    }

    fn ipc(&self, frame: Frame, op: i32, xdata: Xdata, unw: Unwinder<IpcReply>) {
        forward!(self, unw, ipc(frame, op, xdata, unw));
    }

    fn lease(&self, frame: Frame, loc: Loc, cmd: LkCmd, typ: LkType, unw: Unwinder<LkType>) {
        forward!(self, unw, lease(frame, loc, cmd, typ, unw));
    }

    fn seek(&self, frame: Frame, fd: Arc<Fd>, offset: u64, whence: crate::fop::SeekWhence, unw: Unwinder<u64>) {
        forward!(self, unw, seek(frame, fd, offset, whence, unw));
    }
}

/// An assembled translator tree.
///
/// Construction walks the tree, wires parent links, initializes bottom-up
/// and delivers `ParentUp` top-down. The collected translator list doubles
/// as the statedump registry.
pub struct Graph {
    root: Arc<dyn Xlator>,
    all: Vec<Arc<dyn Xlator>>,
}

impl Graph {
    pub fn assemble(root: Arc<dyn Xlator>) -> io::Result<Graph> {
        let mut all: Vec<Arc<dyn Xlator>> = Vec::new();
        collect(&root, &mut all);
        for xl in &all {
            xl.core().set_self(xl);
            for child in xl.core().children() {
                child.core().add_parent(xl);
            }
        }
        // Children first: a translator may depend on its children being live.
        for xl in all.iter().rev() {
            xl.init().map_err(|err| {
                io::Error::new(err.kind(), format!("init of {} failed: {err}", xl.core().name()))
            })?;
        }
        root.notify(&Event::ParentUp);
        debug!("graph assembled with {} translators", all.len());
        Ok(Graph { root, all })
    }

    pub fn root(&self) -> &Arc<dyn Xlator> {
        &self.root
    }

    pub fn translators(&self) -> &[Arc<dyn Xlator>] {
        &self.all
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Xlator>> {
        self.all.iter().find(|xl| xl.core().name() == name)
    }

    /// Fan the forget callback to every translator, then drop all context.
    pub fn forget_inode(&self, inode: &Inode) {
        for xl in &self.all {
            xl.forget(inode);
        }
        inode.ctx_clear();
    }

    /// Release an fd exactly once: fan the release callbacks, then drop all
    /// per-fd context. Subsequent calls are no-ops.
    pub fn release_fd(&self, fd: &Fd) {
        if !fd.mark_released() {
            return;
        }
        for xl in &self.all {
            if fd.is_dir() {
                xl.releasedir(fd);
            } else {
                xl.release(fd);
            }
        }
        fd.ctx_clear();
    }

    pub fn statedump(&self) -> String {
        let mut out = String::new();
        for xl in &self.all {
            xl.dump(&mut out);
        }
        out
    }

    /// Tear the graph down: parents finish before children.
    pub fn teardown(&self) {
        self.root.notify(&Event::ParentDown);
        for xl in &self.all {
            xl.fini();
        }
    }
}

fn collect(xl: &Arc<dyn Xlator>, all: &mut Vec<Arc<dyn Xlator>>) {
    if all.iter().any(|seen| Arc::ptr_eq(seen, xl)) {
        return;
    }
    all.push(xl.clone());
    for child in xl.core().children() {
        collect(child, all);
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Graph({} translators, root {})", self.all.len(), self.root.core().name())
    }
}
