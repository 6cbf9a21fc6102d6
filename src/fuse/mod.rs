//! Kernel FUSE bridge.
//!
//! Translates the kernel request stream into fops descending the translator
//! tree and maps replies back onto the wire. Owns the nodeid space handed to
//! the kernel, the lookup-count lifecycle, the resolver, the reverse
//! invalidation pipeline and the per-request credential assembly.
//!
//! Worker threads read the device in parallel; INIT completes before any
//! other operation is serviced; DESTROY drains and stops the workers.

pub mod abi;
pub mod channel;
pub mod mount;

mod gids;
mod invalidate;
mod resolve;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::io::IoSlice;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::errno::Errno;
use crate::fdtable::{Fd, FdTable};
use crate::fop::{
    Attr, EntryReply, FileType, Flock, FopKind, LkCmd, LkType, OpenFlags, ParentReply, Payload,
    PrePostReply, ReadReply, ReaddirReply, ReadlinkReply, SeekWhence, SetattrArgs, Statvfs,
    WriteReply, XattrReply,
};
use crate::gfid::Gfid;
use crate::itable::{Inode, InodeTable};
use crate::options::{OptSpec, OptType, Options};
use crate::stack::{Caller, FopResult, Frame, LockOwner, Unwinder};
use crate::xdata::Xdata;
use crate::xlator::{Event, Graph, XlCore, Xlator};

use abi::Opcode;
use channel::{Channel, ChannelSender};
use gids::GidCache;
use invalidate::{InvalQueue, Invalidation};
use resolve::Resolver;

const OPTIONS: &[OptSpec] = &[
    OptSpec {
        key: "worker-threads",
        typ: OptType::Int { min: 1, max: 32 },
        default: "2",
        desc: "device reader threads",
    },
    OptSpec {
        key: "attribute-timeout-ms",
        typ: OptType::Int { min: 0, max: 3_600_000 },
        default: "1000",
        desc: "kernel attr cache validity",
    },
    OptSpec {
        key: "entry-timeout-ms",
        typ: OptType::Int { min: 0, max: 3_600_000 },
        default: "1000",
        desc: "kernel entry cache validity",
    },
    OptSpec { key: "resolve-gids", typ: OptType::Bool, default: "on", desc: "fetch supplementary groups per request" },
    OptSpec {
        key: "gid-cache-timeout",
        typ: OptType::Int { min: 1, max: 3600 },
        default: "30",
        desc: "seconds a resolved group list stays cached",
    },
    OptSpec {
        key: "special-xattr-pids",
        typ: OptType::StrList,
        default: "",
        desc: "pids whose system.* xattrs flip into trusted.*",
    },
];

/// Enough for max_write plus headers.
const BUFFER_SIZE: usize = MAX_WRITE + 4096;
const MAX_WRITE: usize = 1024 * 1024;

/// Xattr namespaces requests may touch at all.
const XATTR_ALLOWED_PREFIXES: &[&str] = &["user.", "trusted.", "system.", "security."];

struct Node {
    inode: Arc<Inode>,
    generation: u64,
}

#[derive(Default)]
struct NodeMapInner {
    by_id: HashMap<u64, Node>,
    by_gfid: HashMap<Gfid, u64>,
    next_id: u64,
    next_generation: u64,
}

/// The (nodeid, generation) space handed to the kernel. The root is pinned
/// at nodeid 1; other ids come from a monotonic counter that skips values
/// still in use.
struct NodeMap {
    inner: Mutex<NodeMapInner>,
}

impl NodeMap {
    fn new(root: Arc<Inode>) -> NodeMap {
        let mut inner = NodeMapInner {
            next_id: abi::FUSE_ROOT_ID,
            ..NodeMapInner::default()
        };
        inner.by_gfid.insert(Gfid::ROOT, abi::FUSE_ROOT_ID);
        inner.by_id.insert(abi::FUSE_ROOT_ID, Node { inode: root, generation: 0 });
        NodeMap { inner: Mutex::new(inner) }
    }

    fn get(&self, nodeid: u64) -> Option<Arc<Inode>> {
        self.inner.lock().by_id.get(&nodeid).map(|n| n.inode.clone())
    }

    /// Map an inode (with gfid) to its nodeid, allocating one if new.
    fn bind(&self, inode: &Arc<Inode>) -> Result<(u64, u64), Errno> {
        let gfid = inode.gfid().ok_or(Errno::ESTALE)?;
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_gfid.get(&gfid) {
            let generation = inner.by_id.get(&id).map(|n| n.generation).unwrap_or(0);
            return Ok((id, generation));
        }
        loop {
            inner.next_id = inner.next_id.wrapping_add(1);
            let candidate = inner.next_id;
            if candidate <= abi::FUSE_ROOT_ID || inner.by_id.contains_key(&candidate) {
                continue;
            }
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner.by_id.insert(candidate, Node { inode: inode.clone(), generation });
            inner.by_gfid.insert(gfid, candidate);
            return Ok((candidate, generation));
        }
    }

    fn unbind(&self, nodeid: u64) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.by_id.remove(&nodeid) {
            if let Some(gfid) = node.inode.gfid() {
                inner.by_gfid.remove(&gfid);
            }
        }
    }

    fn nodeid_of(&self, gfid: Gfid) -> Option<u64> {
        self.inner.lock().by_gfid.get(&gfid).copied()
    }
}

/// The bridge translator: the root of a client-side graph.
pub struct FuseBridge {
    core: XlCore,
    self_weak: Weak<FuseBridge>,
    itable: Arc<InodeTable>,
    fds: FdTable,
    nodes: NodeMap,
    graph: OnceLock<Weak<Graph>>,
    inval: OnceLock<InvalQueue>,
    init_done: AtomicBool,
    destroyed: AtomicBool,
    /// In-flight request uniques; value flips to true on INTERRUPT.
    interrupts: Mutex<HashMap<u64, bool>>,
    gids: GidCache,
    special_pids: Vec<u32>,
    attr_timeout: Duration,
    entry_timeout: Duration,
    worker_count: usize,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl FuseBridge {
    pub fn new(name: &str, options: &Options, child: Arc<dyn Xlator>) -> Arc<FuseBridge> {
        let itable = InodeTable::new();
        let root = itable.root();
        let name = name.to_string();
        Arc::new_cyclic(|weak| FuseBridge {
            core: XlCore::new(name, vec![child]),
            self_weak: weak.clone(),
            itable: itable.clone(),
            fds: FdTable::new(),
            nodes: NodeMap::new(root),
            graph: OnceLock::new(),
            inval: OnceLock::new(),
            init_done: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            interrupts: Mutex::new(HashMap::new()),
            gids: GidCache::new(
                options.get_bool("resolve-gids"),
                Duration::from_secs(options.get_int("gid-cache-timeout") as u64),
            ),
            special_pids: options
                .get_list("special-xattr-pids")
                .iter()
                .filter_map(|p| p.parse().ok())
                .collect(),
            attr_timeout: Duration::from_millis(options.get_int("attribute-timeout-ms") as u64),
            entry_timeout: Duration::from_millis(options.get_int("entry-timeout-ms") as u64),
            worker_count: options.get_int("worker-threads") as usize,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn option_table() -> &'static [OptSpec] {
        OPTIONS
    }

    pub fn inode_table(&self) -> &Arc<InodeTable> {
        &self.itable
    }

    /// Start serving the device. `graph` must be the assembled graph this
    /// bridge is the root of; it is held weakly so the owner controls
    /// teardown.
    pub fn serve(self: &Arc<Self>, graph: &Arc<Graph>, device: OwnedFd) -> io::Result<()> {
        assert!(Arc::ptr_eq(graph.root(), &(self.clone() as Arc<dyn Xlator>)));
        self.graph.set(Arc::downgrade(graph)).map_err(|_| io::Error::other("already serving"))?;
        let chan = Channel::new(device);
        let _ = self.inval.set(InvalQueue::start(chan.sender()));
        let mut workers = self.workers.lock();
        for index in 0..self.worker_count {
            let bridge = self.clone();
            let chan = chan.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("fuse-worker-{index}"))
                    .spawn(move || bridge.worker_loop(chan))?,
            );
        }
        Ok(())
    }

    /// Wait for the workers to drain (device closed or DESTROY seen).
    pub fn join(&self) {
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
        if let Some(inval) = self.inval.get() {
            inval.shutdown();
        }
    }

    fn arc(&self) -> Arc<FuseBridge> {
        self.self_weak.upgrade().expect("bridge alive during dispatch")
    }

    fn graph_ref(&self) -> Option<Arc<Graph>> {
        self.graph.get().and_then(Weak::upgrade)
    }

    fn child(&self) -> Arc<dyn Xlator> {
        self.core.first_child().expect("bridge has a child").clone()
    }

    fn resolver(&self) -> Resolver {
        Resolver::new(self.itable.clone(), self.child())
    }

    fn worker_loop(self: Arc<Self>, chan: Channel) {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let sender = chan.sender();
        loop {
            if self.destroyed.load(Ordering::SeqCst) {
                return;
            }
            let len = match chan.receive(&mut buffer) {
                Ok(len) => len,
                Err(err) => match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                    Some(libc::ENOENT) => continue,
                    _ => {
                        debug!("fuse worker exiting: {err}");
                        return;
                    }
                },
            };
            self.handle(&buffer[..len], &sender);
        }
    }

    // Request tracking for INTERRUPT.

    fn track(&self, unique: u64) {
        self.interrupts.lock().insert(unique, false);
    }

    fn untrack(&self, unique: u64) {
        self.interrupts.lock().remove(&unique);
    }

    fn mark_interrupted(&self, unique: u64) {
        let mut interrupts = self.interrupts.lock();
        if let Some(flag) = interrupts.get_mut(&unique) {
            *flag = true;
            debug!("request {unique} marked interrupted");
        }
    }

    fn frame_for(&self, header: &abi::fuse_in_header, owner: LockOwner) -> Frame {
        let groups = self.gids.lookup(header.pid, header.uid, header.gid);
        Frame::root(
            Caller { uid: header.uid, gid: header.gid, pid: header.pid, groups },
            owner,
        )
    }

    /// Per-request xattr namespace policy.
    fn xattr_name(&self, pid: u32, raw: &OsStr) -> Result<OsString, Errno> {
        let text = raw.to_string_lossy();
        if !XATTR_ALLOWED_PREFIXES.iter().any(|p| text.starts_with(p)) {
            return Err(Errno::EOPNOTSUPP);
        }
        if self.special_pids.contains(&pid) {
            if let Some(rest) = text.strip_prefix("system.") {
                return Ok(OsString::from(format!("trusted.{rest}")));
            }
        }
        Ok(raw.to_os_string())
    }

    fn attr_to_wire(&self, attr: &Attr, nodeid: u64) -> abi::fuse_attr {
        fn split(when: SystemTime) -> (u64, u32) {
            match when.duration_since(SystemTime::UNIX_EPOCH) {
                Ok(dur) => (dur.as_secs(), dur.subsec_nanos()),
                Err(_) => (0, 0),
            }
        }
        let (atime, atimensec) = split(attr.atime);
        let (mtime, mtimensec) = split(attr.mtime);
        let (ctime, ctimensec) = split(attr.ctime);
        abi::fuse_attr {
            ino: if nodeid == abi::FUSE_ROOT_ID { abi::FUSE_ROOT_ID } else { attr.ino },
            size: attr.size,
            blocks: attr.blocks,
            atime,
            mtime,
            ctime,
            atimensec,
            mtimensec,
            ctimensec,
            mode: attr.kind.to_mode_bits() | attr.perm as u32,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: attr.blksize,
            padding: 0,
            ..Default::default()
        }
    }

    fn entry_out(&self, nodeid: u64, generation: u64, attr: &Attr) -> abi::fuse_entry_out {
        abi::fuse_entry_out {
            nodeid,
            generation,
            entry_valid: self.entry_timeout.as_secs(),
            attr_valid: self.attr_timeout.as_secs(),
            entry_valid_nsec: self.entry_timeout.subsec_nanos(),
            attr_valid_nsec: self.attr_timeout.subsec_nanos(),
            attr: self.attr_to_wire(attr, nodeid),
        }
    }

    fn attr_out(&self, attr: &Attr, nodeid: u64) -> abi::fuse_attr_out {
        abi::fuse_attr_out {
            attr_valid: self.attr_timeout.as_secs(),
            attr_valid_nsec: self.attr_timeout.subsec_nanos(),
            dummy: 0,
            attr: self.attr_to_wire(attr, nodeid),
        }
    }

    /// Stitch a lookup-style reply into the tables and answer the kernel.
    fn send_entry(
        &self,
        sender: &ChannelSender,
        unique: u64,
        parent: &Arc<Inode>,
        name: &OsStr,
        reply: &EntryReply,
        open_fh: Option<u64>,
    ) {
        let canonical = self.itable.link(reply.inode.clone(), reply.attr.gfid, parent, name);
        canonical.set_attr(reply.attr);
        match self.nodes.bind(&canonical) {
            Ok((nodeid, generation)) => {
                canonical.nlookup_inc();
                let entry = self.entry_out(nodeid, generation, &reply.attr);
                match open_fh {
                    None => send_struct(sender, unique, &entry),
                    Some(fh) => {
                        let open = abi::fuse_open_out { fh, open_flags: 0, padding: 0 };
                        send_parts(sender, unique, &[entry.as_bytes(), open.as_bytes()]);
                    }
                }
            }
            Err(errno) => send_err(sender, unique, errno),
        }
    }

    /// Reply-builder plumbing shared by every dispatched fop.
    fn unwinder<R: Send + 'static>(
        self: &Arc<Self>,
        frame: Frame,
        op: FopKind,
        sender: &ChannelSender,
        unique: u64,
        ok: impl FnOnce(&FuseBridge, &ChannelSender, u64, R) + Send + 'static,
    ) -> Unwinder<R> {
        let bridge = self.clone();
        let sender = sender.clone();
        Unwinder::new(frame, op, move |res: FopResult<R>| {
            bridge.untrack(unique);
            match res {
                Ok(reply) => ok(&bridge, &sender, unique, reply),
                Err(errno) => send_err(&sender, unique, errno),
            }
        })
    }

    fn handle(self: &Arc<Self>, data: &[u8], sender: &ChannelSender) {
        let Ok((header, payload)) = abi::fuse_in_header::read_from_prefix(data) else {
            error!("short fuse request ({} bytes)", data.len());
            return;
        };
        let unique = header.unique;
        let opcode = match Opcode::try_from(header.opcode) {
            Ok(opcode) => opcode,
            Err(_) => {
                warn!("unknown fuse opcode {}", header.opcode);
                send_err(sender, unique, Errno::ENOSYS);
                return;
            }
        };
        if !self.init_done.load(Ordering::SeqCst) && opcode != Opcode::FUSE_INIT {
            // Nothing is serviced before the handshake.
            if !matches!(opcode, Opcode::FUSE_FORGET | Opcode::FUSE_BATCH_FORGET) {
                send_err(sender, unique, Errno::EIO);
            }
            return;
        }
        match opcode {
            Opcode::FUSE_INIT => self.do_init(&header, payload, sender),
            Opcode::FUSE_DESTROY => {
                info!("destroy received, draining");
                self.destroyed.store(true, Ordering::SeqCst);
                send_empty(sender, unique);
            }
            Opcode::FUSE_FORGET => {
                if let Ok((arg, _)) = abi::fuse_forget_in::read_from_prefix(payload) {
                    self.do_forget(header.nodeid, arg.nlookup);
                }
            }
            Opcode::FUSE_BATCH_FORGET => {
                if let Ok((batch, rest)) = abi::fuse_batch_forget_in::read_from_prefix(payload) {
                    let mut rest = rest;
                    for _ in 0..batch.count {
                        let Ok((one, tail)) = abi::fuse_forget_one::read_from_prefix(rest) else {
                            break;
                        };
                        self.do_forget(one.nodeid, one.nlookup);
                        rest = tail;
                    }
                }
            }
            Opcode::FUSE_INTERRUPT => {
                if let Ok((arg, _)) = abi::fuse_interrupt_in::read_from_prefix(payload) {
                    self.mark_interrupted(arg.unique);
                }
                // INTERRUPT itself is never answered.
            }
            _ => {
                self.track(unique);
                if let Err(errno) = self.dispatch_fop(opcode, &header, payload, sender) {
                    self.untrack(unique);
                    send_err(sender, unique, errno);
                }
            }
        }
    }

    fn do_init(&self, header: &abi::fuse_in_header, payload: &[u8], sender: &ChannelSender) {
        let Ok((arg, _)) = abi::fuse_init_in::read_from_prefix(payload) else {
            send_err(sender, header.unique, Errno::EIO);
            return;
        };
        if arg.major != abi::FUSE_KERNEL_VERSION {
            error!("unsupported kernel abi {}.{}", arg.major, arg.minor);
            send_err(sender, header.unique, Errno::EPROTO);
            return;
        }
        let minor = arg.minor.min(abi::FUSE_KERNEL_MINOR_VERSION);
        let supported = abi::FUSE_ASYNC_READ
            | abi::FUSE_POSIX_LOCKS
            | abi::FUSE_ATOMIC_O_TRUNC
            | abi::FUSE_BIG_WRITES
            | abi::FUSE_AUTO_INVAL_DATA;
        let out = abi::fuse_init_out {
            major: abi::FUSE_KERNEL_VERSION,
            minor,
            max_readahead: arg.max_readahead,
            flags: arg.flags & supported,
            max_background: 16,
            congestion_threshold: 12,
            max_write: MAX_WRITE as u32,
            time_gran: 1,
            max_pages: (MAX_WRITE / page_size::get()) as u16,
            padding: 0,
            unused: [0; 8],
        };
        self.init_done.store(true, Ordering::SeqCst);
        info!("init: kernel abi {}.{}, negotiated 7.{minor}", arg.major, arg.minor);
        send_struct(sender, header.unique, &out);
    }

    fn do_forget(&self, nodeid: u64, nlookup: u64) {
        let Some(inode) = self.nodes.get(nodeid) else { return };
        let purged = self.itable.forget(&inode, nlookup);
        if inode.nlookup() == 0 {
            self.nodes.unbind(nodeid);
        }
        if let (Some(inode), Some(graph)) = (purged, self.graph_ref()) {
            graph.forget_inode(&inode);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch_fop(
        self: &Arc<Self>,
        opcode: Opcode,
        header: &abi::fuse_in_header,
        payload: &[u8],
        sender: &ChannelSender,
    ) -> Result<(), Errno> {
        let unique = header.unique;
        let child = self.child();
        let resolver = self.resolver();
        let inode = self.nodes.get(header.nodeid);
        let need_inode = || inode.clone().ok_or(Errno::ESTALE);

        match opcode {
            Opcode::FUSE_LOOKUP => {
                let parent = need_inode()?;
                let name = parse_name(payload)?;
                let loc = resolver.entry_loc(&parent, &name)?;
                let frame = self.frame_for(header, LockOwner::default());
                let parent2 = parent.clone();
                let name2 = name.clone();
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Lookup,
                    sender,
                    unique,
                    move |bridge, sender, unique, reply: EntryReply| {
                        bridge.send_entry(sender, unique, &parent2, &name2, &reply, None);
                    },
                );
                child.lookup(frame, loc, Xdata::new(), unw);
            }
            Opcode::FUSE_GETATTR => {
                let inode = need_inode()?;
                let loc = resolver.loc_of(&inode)?;
                let nodeid = header.nodeid;
                let frame = self.frame_for(header, LockOwner::default());
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Stat,
                    sender,
                    unique,
                    move |bridge, sender, unique, attr: Attr| {
                        send_struct(sender, unique, &bridge.attr_out(&attr, nodeid));
                    },
                );
                child.stat(frame, loc, unw);
            }
            Opcode::FUSE_SETATTR => {
                let inode = need_inode()?;
                let (arg, _) =
                    abi::fuse_setattr_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let loc = resolver.loc_of(&inode)?;
                let args = setattr_args(arg);
                let owner = if arg.valid & abi::FATTR_LOCKOWNER != 0 {
                    LockOwner::from_kernel(arg.lock_owner)
                } else {
                    LockOwner::default()
                };
                let nodeid = header.nodeid;
                let frame = self.frame_for(header, owner);
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Setattr,
                    sender,
                    unique,
                    move |bridge, sender, unique, reply: PrePostReply| {
                        send_struct(sender, unique, &bridge.attr_out(&reply.post, nodeid));
                    },
                );
                child.setattr(frame, loc, args, Xdata::new(), unw);
            }
            Opcode::FUSE_READLINK => {
                let inode = need_inode()?;
                let loc = resolver.loc_of(&inode)?;
                let frame = self.frame_for(header, LockOwner::default());
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Readlink,
                    sender,
                    unique,
                    move |_bridge, sender, unique, reply: ReadlinkReply| {
                        send_data(sender, unique, reply.target.as_bytes());
                    },
                );
                child.readlink(frame, loc, unw);
            }
            Opcode::FUSE_SYMLINK => {
                let parent = need_inode()?;
                let (name, target) = parse_two_names(payload)?;
                let loc = resolver.entry_loc(&parent, &name)?;
                let frame = self.frame_for(header, LockOwner::default());
                let parent2 = parent.clone();
                let name2 = name.clone();
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Symlink,
                    sender,
                    unique,
                    move |bridge, sender, unique, reply: EntryReply| {
                        bridge.send_entry(sender, unique, &parent2, &name2, &reply, None);
                    },
                );
                child.symlink(frame, target, loc, 0, Xdata::new(), unw);
            }
            Opcode::FUSE_MKNOD => {
                let parent = need_inode()?;
                let (arg, rest) =
                    abi::fuse_mknod_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let name = parse_name(rest)?;
                let loc = resolver.entry_loc(&parent, &name)?;
                let frame = self.frame_for(header, LockOwner::default());
                let parent2 = parent.clone();
                let name2 = name.clone();
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Mknod,
                    sender,
                    unique,
                    move |bridge, sender, unique, reply: EntryReply| {
                        bridge.send_entry(sender, unique, &parent2, &name2, &reply, None);
                    },
                );
                child.mknod(frame, loc, arg.mode, arg.rdev, arg.umask, Xdata::new(), unw);
            }
            Opcode::FUSE_MKDIR => {
                let parent = need_inode()?;
                let (arg, rest) =
                    abi::fuse_mkdir_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let name = parse_name(rest)?;
                let loc = resolver.entry_loc(&parent, &name)?;
                let frame = self.frame_for(header, LockOwner::default());
                let parent2 = parent.clone();
                let name2 = name.clone();
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Mkdir,
                    sender,
                    unique,
                    move |bridge, sender, unique, reply: EntryReply| {
                        bridge.send_entry(sender, unique, &parent2, &name2, &reply, None);
                    },
                );
                child.mkdir(frame, loc, arg.mode, arg.umask, Xdata::new(), unw);
            }
            Opcode::FUSE_UNLINK | Opcode::FUSE_RMDIR => {
                let parent = need_inode()?;
                let name = parse_name(payload)?;
                let frame = self.frame_for(header, LockOwner::default());
                let bridge = self.clone();
                let sender2 = sender.clone();
                let is_rmdir = opcode == Opcode::FUSE_RMDIR;
                let parent2 = parent.clone();
                let name2 = name.clone();
                // Resolve-before-descend: the entry must be known before the
                // removal travels down.
                resolver.resolve_entry(
                    &frame.clone(),
                    parent,
                    name,
                    Box::new(move |resolved| {
                        let loc = match resolved {
                            Ok(loc) => loc,
                            Err(errno) => {
                                bridge.untrack(unique);
                                send_err(&sender2, unique, errno);
                                return;
                            }
                        };
                        let child = bridge.child();
                        let op = if is_rmdir { FopKind::Rmdir } else { FopKind::Unlink };
                        let unw = bridge.arc().unwinder(
                            frame.clone(),
                            op,
                            &sender2,
                            unique,
                            move |bridge, sender, unique, _reply: ParentReply| {
                                bridge.itable.unlink(&parent2, &name2);
                                send_empty(sender, unique);
                            },
                        );
                        if is_rmdir {
                            child.rmdir(frame, loc, Xdata::new(), unw);
                        } else {
                            child.unlink(frame, loc, Xdata::new(), unw);
                        }
                    }),
                );
            }
            Opcode::FUSE_RENAME | Opcode::FUSE_RENAME2 => {
                let parent = need_inode()?;
                let (newdir, rest) = if opcode == Opcode::FUSE_RENAME {
                    let (arg, rest) =
                        abi::fuse_rename_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                    (arg.newdir, rest)
                } else {
                    let (arg, rest) =
                        abi::fuse_rename2_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                    (arg.newdir, rest)
                };
                let (oldname, newname) = parse_two_names_bytes(rest)?;
                let newparent = self.nodes.get(newdir).ok_or(Errno::ESTALE)?;
                let frame = self.frame_for(header, LockOwner::default());
                let bridge = self.clone();
                let sender2 = sender.clone();
                let parent2 = parent.clone();
                let newparent2 = newparent.clone();
                let oldname2 = oldname.clone();
                let newname2 = newname.clone();
                resolver.resolve_entry(
                    &frame.clone(),
                    parent,
                    oldname,
                    Box::new(move |resolved| {
                        let oldloc = match resolved {
                            Ok(loc) => loc,
                            Err(errno) => {
                                bridge.untrack(unique);
                                send_err(&sender2, unique, errno);
                                return;
                            }
                        };
                        let newloc =
                            match bridge.resolver().entry_loc(&newparent2, &newname2) {
                                Ok(loc) => loc,
                                Err(errno) => {
                                    bridge.untrack(unique);
                                    send_err(&sender2, unique, errno);
                                    return;
                                }
                            };
                        let child = bridge.child();
                        let unw = bridge.arc().unwinder(
                            frame.clone(),
                            FopKind::Rename,
                            &sender2,
                            unique,
                            move |bridge, sender, unique, _attr: Attr| {
                                bridge.itable.rename(&parent2, &oldname2, &newparent2, &newname2);
                                send_empty(sender, unique);
                            },
                        );
                        child.rename(frame, oldloc, newloc, Xdata::new(), unw);
                    }),
                );
            }
            Opcode::FUSE_LINK => {
                let newparent = need_inode()?;
                let (arg, rest) =
                    abi::fuse_link_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let name = parse_name(rest)?;
                let old = self.nodes.get(arg.oldnodeid).ok_or(Errno::ESTALE)?;
                let oldloc = resolver.loc_of(&old)?;
                let newloc = resolver.entry_loc(&newparent, &name)?;
                let frame = self.frame_for(header, LockOwner::default());
                let parent2 = newparent.clone();
                let name2 = name.clone();
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Link,
                    sender,
                    unique,
                    move |bridge, sender, unique, reply: EntryReply| {
                        bridge.send_entry(sender, unique, &parent2, &name2, &reply, None);
                    },
                );
                child.link(frame, oldloc, newloc, Xdata::new(), unw);
            }
            Opcode::FUSE_OPEN => {
                let inode = need_inode()?;
                let (arg, _) =
                    abi::fuse_open_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let loc = resolver.loc_of(&inode)?;
                let flags = OpenFlags::from_bits_retain(arg.flags);
                let fd = Fd::new(inode, flags, header.pid);
                let frame = self.frame_for(header, LockOwner::default());
                let fd2 = fd.clone();
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Open,
                    sender,
                    unique,
                    move |bridge, sender, unique, (): ()| {
                        let fh = bridge.fds.insert(fd2);
                        send_struct(sender, unique, &abi::fuse_open_out { fh, open_flags: 0, padding: 0 });
                    },
                );
                child.open(frame, loc, flags, fd, unw);
            }
            Opcode::FUSE_CREATE => {
                let parent = need_inode()?;
                let (arg, rest) =
                    abi::fuse_create_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let name = parse_name(rest)?;
                let loc = resolver.entry_loc(&parent, &name)?;
                let flags = OpenFlags::from_bits_retain(arg.flags);
                let new_inode = loc.inode.clone().expect("entry loc has an inode");
                let fd = Fd::new(new_inode, flags, header.pid);
                let frame = self.frame_for(header, LockOwner::default());
                let fd2 = fd.clone();
                let parent2 = parent.clone();
                let name2 = name.clone();
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Create,
                    sender,
                    unique,
                    move |bridge, sender, unique, reply: EntryReply| {
                        let fh = bridge.fds.insert(fd2);
                        bridge.send_entry(sender, unique, &parent2, &name2, &reply, Some(fh));
                    },
                );
                child.create(frame, loc, flags, arg.mode, arg.umask, fd, Xdata::new(), unw);
            }
            Opcode::FUSE_READ => {
                let (arg, _) =
                    abi::fuse_read_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let fd = self.fds.get(arg.fh).ok_or(Errno::EBADF)?;
                let owner = if arg.read_flags & abi::FUSE_READ_LOCKOWNER != 0 {
                    LockOwner::from_kernel(arg.lock_owner)
                } else {
                    LockOwner::default()
                };
                let size = arg.size as usize;
                let frame = self.frame_for(header, owner);
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Readv,
                    sender,
                    unique,
                    move |_bridge, sender, unique, reply: ReadReply| {
                        let data = reply.payload.contiguous();
                        let data = &data[..data.len().min(size)];
                        send_data(sender, unique, data);
                    },
                );
                child.readv(frame, fd, size, arg.offset, arg.flags, Xdata::new(), unw);
            }
            Opcode::FUSE_WRITE => {
                let (arg, rest) =
                    abi::fuse_write_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                if rest.len() < arg.size as usize {
                    return Err(Errno::EIO);
                }
                let fd = self.fds.get(arg.fh).ok_or(Errno::EBADF)?;
                let owner = if arg.write_flags & abi::FUSE_WRITE_LOCKOWNER != 0 {
                    LockOwner::from_kernel(arg.lock_owner)
                } else {
                    LockOwner::default()
                };
                let payload = Payload::from_vec(rest[..arg.size as usize].to_vec());
                let frame = self.frame_for(header, owner);
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Writev,
                    sender,
                    unique,
                    move |_bridge, sender, unique, reply: WriteReply| {
                        send_struct(
                            sender,
                            unique,
                            &abi::fuse_write_out { size: reply.count as u32, padding: 0 },
                        );
                    },
                );
                child.writev(frame, fd, payload, arg.offset, arg.flags, Xdata::new(), unw);
            }
            Opcode::FUSE_STATFS => {
                let inode = need_inode().unwrap_or_else(|_| self.itable.root());
                let loc = resolver.loc_of(&inode)?;
                let frame = self.frame_for(header, LockOwner::default());
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Statfs,
                    sender,
                    unique,
                    move |_bridge, sender, unique, vfs: Statvfs| {
                        let out = abi::fuse_statfs_out {
                            st: abi::fuse_kstatfs {
                                blocks: vfs.blocks,
                                bfree: vfs.bfree,
                                bavail: vfs.bavail,
                                files: vfs.files,
                                ffree: vfs.ffree,
                                bsize: vfs.bsize as u32,
                                namelen: vfs.namemax as u32,
                                frsize: vfs.frsize as u32,
                                padding: 0,
                                spare: [0; 6],
                            },
                        };
                        send_struct(sender, unique, &out);
                    },
                );
                child.statfs(frame, loc, unw);
            }
            Opcode::FUSE_RELEASE | Opcode::FUSE_RELEASEDIR => {
                let (arg, _) =
                    abi::fuse_release_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                if let Some(fd) = self.fds.remove(arg.fh) {
                    if let Some(graph) = self.graph_ref() {
                        graph.release_fd(&fd);
                    }
                }
                self.untrack(unique);
                send_empty(sender, unique);
            }
            Opcode::FUSE_FSYNC | Opcode::FUSE_FSYNCDIR => {
                let (arg, _) =
                    abi::fuse_fsync_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let fd = self.fds.get(arg.fh).ok_or(Errno::EBADF)?;
                let datasync = arg.fsync_flags & 1 != 0;
                let frame = self.frame_for(header, LockOwner::default());
                if opcode == Opcode::FUSE_FSYNC {
                    let unw = self.unwinder(
                        frame.clone(),
                        FopKind::Fsync,
                        sender,
                        unique,
                        move |_bridge, sender, unique, _reply: PrePostReply| {
                            send_empty(sender, unique);
                        },
                    );
                    child.fsync(frame, fd, datasync, unw);
                } else {
                    let unw = self.unwinder(
                        frame.clone(),
                        FopKind::Fsyncdir,
                        sender,
                        unique,
                        move |_bridge, sender, unique, (): ()| send_empty(sender, unique),
                    );
                    child.fsyncdir(frame, fd, datasync, unw);
                }
            }
            Opcode::FUSE_SETXATTR => {
                let inode = need_inode()?;
                let (arg, rest) =
                    abi::fuse_setxattr_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let name_end = memchr::memchr(0, rest).ok_or(Errno::EIO)?;
                let name = self.xattr_name(header.pid, OsStr::from_bytes(&rest[..name_end]))?;
                let value = rest
                    .get(name_end + 1..name_end + 1 + arg.size as usize)
                    .ok_or(Errno::EIO)?
                    .to_vec();
                let loc = resolver.loc_of(&inode)?;
                let frame = self.frame_for(header, LockOwner::default());
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Setxattr,
                    sender,
                    unique,
                    move |_bridge, sender, unique, (): ()| send_empty(sender, unique),
                );
                child.setxattr(frame, loc, name, value, arg.flags as i32, Xdata::new(), unw);
            }
            Opcode::FUSE_GETXATTR | Opcode::FUSE_LISTXATTR => {
                let inode = need_inode()?;
                let (arg, rest) =
                    abi::fuse_getxattr_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let name = if opcode == Opcode::FUSE_GETXATTR {
                    self.xattr_name(header.pid, &parse_name(rest)?)?
                } else {
                    // Empty name means "list the names" downstream.
                    OsString::new()
                };
                let loc = resolver.loc_of(&inode)?;
                let wanted = arg.size as usize;
                let frame = self.frame_for(header, LockOwner::default());
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Getxattr,
                    sender,
                    unique,
                    move |_bridge, sender, unique, reply: XattrReply| {
                        if wanted == 0 {
                            send_struct(
                                sender,
                                unique,
                                &abi::fuse_getxattr_out {
                                    size: reply.value.len() as u32,
                                    padding: 0,
                                },
                            );
                        } else if reply.value.len() > wanted {
                            send_err(sender, unique, Errno::ERANGE);
                        } else {
                            send_data(sender, unique, &reply.value);
                        }
                    },
                );
                child.getxattr(frame, loc, name, unw);
            }
            Opcode::FUSE_REMOVEXATTR => {
                let inode = need_inode()?;
                let name = self.xattr_name(header.pid, &parse_name(payload)?)?;
                let loc = resolver.loc_of(&inode)?;
                let frame = self.frame_for(header, LockOwner::default());
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Removexattr,
                    sender,
                    unique,
                    move |_bridge, sender, unique, (): ()| send_empty(sender, unique),
                );
                child.removexattr(frame, loc, name, Xdata::new(), unw);
            }
            Opcode::FUSE_FLUSH => {
                let (arg, _) =
                    abi::fuse_flush_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let fd = self.fds.get(arg.fh).ok_or(Errno::EBADF)?;
                let frame = self.frame_for(header, LockOwner::from_kernel(arg.lock_owner));
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Flush,
                    sender,
                    unique,
                    move |_bridge, sender, unique, (): ()| send_empty(sender, unique),
                );
                child.flush(frame, fd, unw);
            }
            Opcode::FUSE_OPENDIR => {
                let inode = need_inode()?;
                let loc = resolver.loc_of(&inode)?;
                let fd = Fd::new_dir(inode, OpenFlags::DIRECTORY, header.pid);
                let frame = self.frame_for(header, LockOwner::default());
                let fd2 = fd.clone();
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Opendir,
                    sender,
                    unique,
                    move |bridge, sender, unique, (): ()| {
                        let fh = bridge.fds.insert(fd2);
                        send_struct(sender, unique, &abi::fuse_open_out { fh, open_flags: 0, padding: 0 });
                    },
                );
                child.opendir(frame, loc, fd, unw);
            }
            Opcode::FUSE_READDIR => {
                let (arg, _) =
                    abi::fuse_read_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let fd = self.fds.get(arg.fh).ok_or(Errno::EBADF)?;
                let size = arg.size as usize;
                let frame = self.frame_for(header, LockOwner::default());
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Readdir,
                    sender,
                    unique,
                    move |_bridge, sender, unique, reply: ReaddirReply| {
                        send_data(sender, unique, &dirent_buffer(&reply, size));
                    },
                );
                child.readdir(frame, fd, size, arg.offset, unw);
            }
            Opcode::FUSE_GETLK | Opcode::FUSE_SETLK | Opcode::FUSE_SETLKW => {
                let (arg, _) =
                    abi::fuse_lk_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let fd = self.fds.get(arg.fh).ok_or(Errno::EBADF)?;
                let owner = LockOwner::from_kernel(arg.owner);
                fd.set_lock_owner(owner);
                let cmd = match opcode {
                    Opcode::FUSE_GETLK => LkCmd::Get,
                    Opcode::FUSE_SETLK => LkCmd::Set,
                    _ => LkCmd::SetWait,
                };
                let lock = Flock {
                    typ: LkType::from_raw(arg.lk.typ as i32).ok_or(Errno::EINVAL)?,
                    start: arg.lk.start,
                    end: arg.lk.end,
                    pid: arg.lk.pid,
                    owner,
                };
                let frame = self.frame_for(header, owner);
                let is_get = cmd == LkCmd::Get;
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Lk,
                    sender,
                    unique,
                    move |_bridge, sender, unique, reply: Flock| {
                        if is_get {
                            let out = abi::fuse_lk_out {
                                lk: abi::fuse_file_lock {
                                    start: reply.start,
                                    end: reply.end,
                                    typ: reply.typ.to_raw() as u32,
                                    pid: reply.pid,
                                },
                            };
                            send_struct(sender, unique, &out);
                        } else {
                            send_empty(sender, unique);
                        }
                    },
                );
                child.lk(frame, fd, cmd, lock, Xdata::new(), unw);
            }
            Opcode::FUSE_ACCESS => {
                let inode = need_inode()?;
                let (arg, _) =
                    abi::fuse_access_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let loc = resolver.loc_of(&inode)?;
                let frame = self.frame_for(header, LockOwner::default());
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Access,
                    sender,
                    unique,
                    move |_bridge, sender, unique, (): ()| send_empty(sender, unique),
                );
                child.access(frame, loc, arg.mask, unw);
            }
            Opcode::FUSE_BMAP => {
                // No block-device backing; nothing sensible to map.
                self.untrack(unique);
                send_err(sender, unique, Errno::EOPNOTSUPP);
            }
            Opcode::FUSE_FALLOCATE => {
                let (arg, _) =
                    abi::fuse_fallocate_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let fd = self.fds.get(arg.fh).ok_or(Errno::EBADF)?;
                let frame = self.frame_for(header, LockOwner::default());
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Fallocate,
                    sender,
                    unique,
                    move |_bridge, sender, unique, _reply: PrePostReply| {
                        send_empty(sender, unique);
                    },
                );
                if arg.mode & libc::FALLOC_FL_PUNCH_HOLE as u32 != 0 {
                    child.discard(frame, fd, arg.offset, arg.length, Xdata::new(), unw);
                } else {
                    child.fallocate(frame, fd, arg.mode as i32, arg.offset, arg.length, Xdata::new(), unw);
                }
            }
            Opcode::FUSE_LSEEK => {
                let (arg, _) =
                    abi::fuse_lseek_in::read_from_prefix(payload).map_err(|_| Errno::EIO)?;
                let fd = self.fds.get(arg.fh).ok_or(Errno::EBADF)?;
                let whence = match arg.whence as i32 {
                    libc::SEEK_DATA => SeekWhence::Data,
                    libc::SEEK_HOLE => SeekWhence::Hole,
                    _ => return Err(Errno::EINVAL),
                };
                let frame = self.frame_for(header, LockOwner::default());
                let unw = self.unwinder(
                    frame.clone(),
                    FopKind::Seek,
                    sender,
                    unique,
                    move |_bridge, sender, unique, offset: u64| {
                        send_struct(sender, unique, &abi::fuse_lseek_out { offset });
                    },
                );
                child.seek(frame, fd, arg.offset, whence, unw);
            }
            // Handled before dispatch.
            Opcode::FUSE_INIT
            | Opcode::FUSE_DESTROY
            | Opcode::FUSE_FORGET
            | Opcode::FUSE_BATCH_FORGET
            | Opcode::FUSE_INTERRUPT => unreachable!("handled in the outer dispatcher"),
        }
        Ok(())
    }
}

impl Xlator for FuseBridge {
    fn core(&self) -> &XlCore {
        &self.core
    }

    fn fini(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        if let Some(inval) = self.inval.get() {
            inval.shutdown();
        }
    }

    fn option_specs(&self) -> &'static [OptSpec] {
        OPTIONS
    }

    fn dump(&self, out: &mut String) {
        out.push_str(&format!(
            "[{}]\ninit_done: {}\ninodes: {}\nopen_fds: {}\n",
            self.core.name(),
            self.init_done.load(Ordering::SeqCst),
            self.itable.len(),
            self.fds.len(),
        ));
    }

    fn notify(&self, event: &Event) {
        match event {
            Event::InvalInode { gfid } => {
                if let (Some(nodeid), Some(inval)) = (self.nodes.nodeid_of(*gfid), self.inval.get())
                {
                    inval.push(Invalidation::Inode { nodeid });
                }
            }
            Event::InvalEntry { pargfid, name } => {
                if let (Some(parent), Some(inval)) =
                    (self.nodes.nodeid_of(*pargfid), self.inval.get())
                {
                    inval.push(Invalidation::Entry { parent, name: name.clone() });
                }
            }
            Event::ChildUp(_) => debug!("{}: graph serviceable", self.core.name()),
            Event::ChildDown(_) => warn!("{}: graph lost its child", self.core.name()),
            other => {
                for child in self.core.children() {
                    child.notify(other);
                }
            }
        }
    }
}

impl std::fmt::Debug for FuseBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseBridge")
            .field("init_done", &self.init_done.load(Ordering::SeqCst))
            .field("inodes", &self.itable.len())
            .finish()
    }
}

fn setattr_args(arg: abi::fuse_setattr_in) -> SetattrArgs {
    fn time_of(secs: u64, nanos: u32) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::new(secs, nanos)
    }
    let now = SystemTime::now();
    SetattrArgs {
        mode: (arg.valid & abi::FATTR_MODE != 0).then_some(arg.mode),
        uid: (arg.valid & abi::FATTR_UID != 0).then_some(arg.uid),
        gid: (arg.valid & abi::FATTR_GID != 0).then_some(arg.gid),
        size: (arg.valid & abi::FATTR_SIZE != 0).then_some(arg.size),
        atime: if arg.valid & abi::FATTR_ATIME_NOW != 0 {
            Some(now)
        } else {
            (arg.valid & abi::FATTR_ATIME != 0).then(|| time_of(arg.atime, arg.atimensec))
        },
        mtime: if arg.valid & abi::FATTR_MTIME_NOW != 0 {
            Some(now)
        } else {
            (arg.valid & abi::FATTR_MTIME != 0).then(|| time_of(arg.mtime, arg.mtimensec))
        },
    }
}

fn parse_name(payload: &[u8]) -> Result<OsString, Errno> {
    let end = memchr::memchr(0, payload).unwrap_or(payload.len());
    if end == 0 {
        return Err(Errno::EINVAL);
    }
    Ok(OsString::from_vec(payload[..end].to_vec()))
}

fn parse_two_names(payload: &[u8]) -> Result<(OsString, OsString), Errno> {
    parse_two_names_bytes(payload)
}

fn parse_two_names_bytes(payload: &[u8]) -> Result<(OsString, OsString), Errno> {
    let first_end = memchr::memchr(0, payload).ok_or(Errno::EINVAL)?;
    let rest = &payload[first_end + 1..];
    let second = parse_name(rest)?;
    if first_end == 0 {
        return Err(Errno::EINVAL);
    }
    Ok((OsString::from_vec(payload[..first_end].to_vec()), second))
}

fn dirent_type(kind: FileType) -> u32 {
    (kind.to_mode_bits() >> 12) as u32
}

fn dirent_buffer(reply: &ReaddirReply, cap: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(cap.min(64 * 1024));
    for entry in &reply.entries {
        let name = entry.name.as_bytes();
        let record = size_of::<abi::fuse_dirent>() + name.len();
        let padded = record.div_ceil(abi::FUSE_DIRENT_ALIGN) * abi::FUSE_DIRENT_ALIGN;
        if out.len() + padded > cap {
            break;
        }
        let dirent = abi::fuse_dirent {
            ino: entry.ino,
            off: entry.offset,
            namelen: name.len() as u32,
            typ: dirent_type(entry.kind),
        };
        out.extend_from_slice(dirent.as_bytes());
        out.extend_from_slice(name);
        out.resize(out.len() + (padded - record), 0);
    }
    out
}

// Wire reply helpers.

fn send_parts(sender: &ChannelSender, unique: u64, parts: &[&[u8]]) {
    let body_len: usize = parts.iter().map(|p| p.len()).sum();
    let header = abi::fuse_out_header {
        len: (size_of::<abi::fuse_out_header>() + body_len) as u32,
        error: 0,
        unique,
    };
    let mut iov: Vec<IoSlice<'_>> = Vec::with_capacity(parts.len() + 1);
    let header_bytes = header.as_bytes();
    iov.push(IoSlice::new(header_bytes));
    for part in parts {
        iov.push(IoSlice::new(part));
    }
    if let Err(err) = sender.send(&iov) {
        warn!("reply write failed for {unique}: {err}");
    }
}

fn send_struct<T: IntoBytes + Immutable>(sender: &ChannelSender, unique: u64, body: &T) {
    send_parts(sender, unique, &[body.as_bytes()]);
}

fn send_data(sender: &ChannelSender, unique: u64, data: &[u8]) {
    send_parts(sender, unique, &[data]);
}

fn send_empty(sender: &ChannelSender, unique: u64) {
    send_parts(sender, unique, &[]);
}

/// The single negation step: positive errno becomes the kernel's negative
/// error field.
fn send_err(sender: &ChannelSender, unique: u64, errno: Errno) {
    let header = abi::fuse_out_header {
        len: size_of::<abi::fuse_out_header>() as u32,
        error: -errno.code(),
        unique,
    };
    if let Err(err) = sender.send(&[IoSlice::new(header.as_bytes())]) {
        warn!("error reply write failed for {unique}: {err}");
    }
}

#[cfg(test)]
mod tests;
