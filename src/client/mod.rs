//! Client-side RPC translator.
//!
//! The bottom of a client graph: every fop is encoded onto the connection
//! and the reply decoded back into the typed reply structs. Per-fd state
//! (the server's remote fd number, granted locks, the post-disconnect wait
//! queue) lives in the fd's context slot.
//!
//! Reconnect discipline: when the transport comes back, every surviving fd
//! is reopened against the server before any queued operation on it is
//! allowed out; an operation must never run against a connection whose fd
//! it does not own. Granted locks are re-issued after the reopen; with
//! strict-locks, an fd that held locks at disconnect time is poisoned
//! instead and every later operation on it fails with EBADF. Operations on
//! an unreopened fd that are logically stateless may fall back to the
//! server-side anonymous fd.

use std::ffi::OsString;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::errno::Errno;
use crate::fdtable::Fd;
use crate::fop::{
    Attr, EntrylkCmd, EntryReply, Flock, FopKind, IpcReply, LkCmd, LkType, Loc, OpenFlags,
    ParentReply, Payload, PrePostReply, ReadReply, ReaddirReply, ReadlinkReply, SeekWhence,
    SetattrArgs, Statvfs, WriteReply, XattrReply, XattropOp,
};
use crate::gfid::Gfid;
use crate::options::{OptSpec, OptType, Options};
use crate::rpc::codec::{self, WireRep, WireReq};
use crate::rpc::conn::{ConnConfig, ConnEvent, RpcConn};
use crate::rpc::{CallbackProc, FOPS_VERSION, FopProc, PROG_FOPS, REMOTE_FD_ANON, REMOTE_FD_NONE};
use crate::stack::{FopResult, Frame, Stub, SyncCall, Unwinder};
use crate::xdata::Xdata;
use crate::xlator::{Event, XlCore, Xlator};

const OPTIONS: &[OptSpec] = &[
    OptSpec { key: "remote-host", typ: OptType::Str, default: "127.0.0.1:24007", desc: "server address" },
    OptSpec { key: "remote-subvolume", typ: OptType::Str, default: "stackfs", desc: "volume name sent in setvolume" },
    OptSpec { key: "strict-locks", typ: OptType::Bool, default: "off", desc: "poison fds that held locks across a disconnect" },
    OptSpec {
        key: "ping-interval",
        typ: OptType::Int { min: 1, max: 600 },
        default: "10",
        desc: "seconds between keepalive pings",
    },
    OptSpec {
        key: "reconnect-delay-ms",
        typ: OptType::Int { min: 10, max: 60000 },
        default: "500",
        desc: "pause between reconnect attempts",
    },
];

/// Per-fd remote state.
struct ClientFd {
    remote: AtomicI64,
    gfid: Mutex<Gfid>,
    flags: OpenFlags,
    is_dir: bool,
    path: Mutex<String>,
    failed: AtomicBool,
    /// Locks granted through this handle, for post-reopen recovery.
    locks: Mutex<Vec<Flock>>,
    /// Fops parked until the reopen completes.
    waitq: Mutex<Vec<Stub>>,
}

impl ClientFd {
    fn new(gfid: Gfid, flags: OpenFlags, is_dir: bool, path: String) -> Arc<ClientFd> {
        Arc::new(ClientFd {
            remote: AtomicI64::new(REMOTE_FD_NONE),
            gfid: Mutex::new(gfid),
            flags,
            is_dir,
            path: Mutex::new(path),
            failed: AtomicBool::new(false),
            locks: Mutex::new(Vec::new()),
            waitq: Mutex::new(Vec::new()),
        })
    }

    fn drain_waitq(&self) {
        let parked: Vec<Stub> = std::mem::take(&mut *self.waitq.lock());
        for stub in parked {
            stub.resume();
        }
    }
}

enum Gate {
    /// Send with this remote fd.
    Use(i64),
    /// Remote fd not usable yet; the fop must wait for the reopen.
    Park(Arc<ClientFd>),
    Fail(Errno),
}

/// The client translator; a leaf whose child is the network.
pub struct Client {
    core: XlCore,
    self_weak: Weak<Client>,
    addr: String,
    volume: String,
    strict_locks: bool,
    ping_interval: Duration,
    reconnect_delay: Duration,
    conn: OnceLock<Arc<RpcConn>>,
    /// Registry of fds opened through this translator, walked at reopen.
    fds: Mutex<Vec<Weak<Fd>>>,
}

impl Client {
    pub fn new(name: &str, options: &Options) -> Arc<Client> {
        let name = name.to_string();
        Arc::new_cyclic(|weak| Client {
            core: XlCore::new(name, vec![]),
            self_weak: weak.clone(),
            addr: options.get_str("remote-host").to_string(),
            volume: options.get_str("remote-subvolume").to_string(),
            strict_locks: options.get_bool("strict-locks"),
            ping_interval: Duration::from_secs(options.get_int("ping-interval") as u64),
            reconnect_delay: Duration::from_millis(options.get_int("reconnect-delay-ms") as u64),
            conn: OnceLock::new(),
            fds: Mutex::new(Vec::new()),
        })
    }

    pub fn option_table() -> &'static [OptSpec] {
        OPTIONS
    }

    fn arc(&self) -> Arc<Client> {
        self.self_weak.upgrade().expect("client alive during dispatch")
    }

    fn conn(&self) -> Option<&Arc<RpcConn>> {
        self.conn.get()
    }

    fn slot(&self, fd: &Fd) -> Option<Arc<ClientFd>> {
        fd.ctx_get::<Arc<ClientFd>>(self.core.id())
    }

    /// Whether a fop may run against the server's anonymous fd while the
    /// real one is still unopened.
    fn anon_ok(kind: FopKind) -> bool {
        matches!(
            kind,
            FopKind::Readv
                | FopKind::Writev
                | FopKind::Fsync
                | FopKind::Ftruncate
                | FopKind::Fallocate
                | FopKind::Discard
                | FopKind::Zerofill
        )
    }

    fn gate(&self, fd: &Fd, kind: FopKind) -> Gate {
        let Some(ctx) = self.slot(fd) else {
            // Never opened through us; stateless ops may go anonymous.
            return if Self::anon_ok(kind) { Gate::Use(REMOTE_FD_ANON) } else { Gate::Fail(Errno::EBADF) };
        };
        if ctx.failed.load(Ordering::SeqCst) {
            return Gate::Fail(Errno::EBADF);
        }
        let remote = ctx.remote.load(Ordering::SeqCst);
        if remote >= 0 {
            return Gate::Use(remote);
        }
        // An fd that holds locks is stateful on the server; it must wait for
        // the reopen verdict instead of slipping out anonymously.
        if Self::anon_ok(kind) && ctx.locks.lock().is_empty() {
            return Gate::Use(REMOTE_FD_ANON);
        }
        Gate::Park(ctx)
    }

    /// Transport state, as last reported by the connection.
    pub fn is_connected(&self) -> bool {
        self.conn().map(|c| c.is_connected()).unwrap_or(false)
    }

    /// Issue one fop call; the decoder maps the generic reply record into
    /// the fop's typed reply.
    fn call<R: Send + 'static>(
        &self,
        kind: FopKind,
        req: &WireReq,
        unw: Unwinder<R>,
        dec: impl FnOnce(WireRep) -> Result<R, Errno> + Send + 'static,
    ) {
        let Some(conn) = self.conn() else {
            unw.errno(Errno::ENOTCONN);
            return;
        };
        conn.call(
            PROG_FOPS,
            FOPS_VERSION,
            FopProc::of(kind) as u32,
            req.encode(),
            Box::new(move |res| match res {
                Err(errno) => unw.errno(errno),
                Ok(payload) => match WireRep::decode(&payload).and_then(dec) {
                    Ok(reply) => unw.okay(reply),
                    Err(errno) => unw.errno(errno),
                },
            }),
        );
    }

    fn loc_req(&self, frame: &Frame, loc: &Loc) -> WireReq {
        WireReq {
            gfid: if loc.gfid.is_null() {
                loc.inode.as_ref().and_then(|i| i.gfid()).unwrap_or(Gfid::NULL)
            } else {
                loc.gfid
            },
            pargfid: if loc.pargfid.is_null() {
                loc.parent.as_ref().and_then(|i| i.gfid()).unwrap_or(Gfid::NULL)
            } else {
                loc.pargfid
            },
            path: loc.path.to_string_lossy().into_owned(),
            name: loc.name.as_ref().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            pid: frame.pid(),
            ..Default::default()
        }
    }

    fn fd_req(&self, frame: &Frame, fd: &Fd, remote: i64) -> WireReq {
        let mut req = WireReq {
            fd: remote,
            pid: frame.pid(),
            ..Default::default()
        };
        if let Some(ctx) = self.slot(fd) {
            req.gfid = *ctx.gfid.lock();
            req.path = ctx.path.lock().clone();
            req.flags = ctx.flags.bits();
        } else if let Some(gfid) = fd.inode().gfid() {
            req.gfid = gfid;
        }
        req
    }

    fn entry_from(loc: &Loc, rep: WireRep) -> Result<EntryReply, Errno> {
        let attr = rep.attr.ok_or(Errno::EPROTO)?;
        let inode = loc.inode.clone().unwrap_or_else(crate::itable::Inode::detached);
        inode.set_gfid(attr.gfid);
        inode.set_attr(attr);
        Ok(EntryReply { inode, attr, postparent: rep.post, xdata: rep.xdata })
    }

    fn pre_post_from(rep: WireRep) -> Result<PrePostReply, Errno> {
        Ok(PrePostReply {
            pre: rep.pre.ok_or(Errno::EPROTO)?,
            post: rep.post.ok_or(Errno::EPROTO)?,
        })
    }

    // Connection lifecycle.

    fn on_event(&self, event: ConnEvent) {
        match event {
            ConnEvent::Connected => {
                let this = self.arc();
                // The event fires on the reader thread; the reopen walk
                // blocks on replies, so it gets its own thread.
                if let Err(err) =
                    thread::Builder::new().name("client-reopen".into()).spawn(move || this.reopen_all())
                {
                    warn!("failed to spawn reopen walk: {err}");
                }
            }
            ConnEvent::Disconnected => {
                info!("{}: transport down", self.core.name());
                for fd in self.live_fds() {
                    if let Some(ctx) = self.slot(&fd) {
                        ctx.remote.store(REMOTE_FD_NONE, Ordering::SeqCst);
                    }
                }
                self.core.emit_upward(&Event::ChildDown(0));
            }
        }
    }

    fn live_fds(&self) -> Vec<Arc<Fd>> {
        let mut registry = self.fds.lock();
        registry.retain(|weak| weak.strong_count() > 0);
        registry.iter().filter_map(Weak::upgrade).collect()
    }

    /// Walk every registered fd: reopen it on the new connection and replay
    /// its locks. Queued fops drain only after their fd is settled.
    fn reopen_all(self: Arc<Self>) {
        for fd in self.live_fds() {
            let Some(ctx) = self.slot(&fd) else { continue };
            if fd.is_released() || ctx.failed.load(Ordering::SeqCst) {
                ctx.drain_waitq();
                continue;
            }
            if self.strict_locks && !ctx.locks.lock().is_empty() {
                // Held locks did not survive the server's view of the
                // disconnect; the handle is permanently poisoned.
                warn!("{}: fd with locks poisoned after reconnect", self.core.name());
                ctx.failed.store(true, Ordering::SeqCst);
                ctx.drain_waitq();
                continue;
            }
            if let Err(errno) = self.reopen_one(&ctx) {
                warn!("{}: reopen failed: {errno}", self.core.name());
                ctx.failed.store(true, Ordering::SeqCst);
            }
            ctx.drain_waitq();
        }
        self.core.emit_upward(&Event::ChildUp(0));
    }

    fn reopen_one(&self, ctx: &Arc<ClientFd>) -> Result<(), Errno> {
        let req = WireReq {
            gfid: *ctx.gfid.lock(),
            path: ctx.path.lock().clone(),
            flags: ctx.flags.bits(),
            ..Default::default()
        };
        let call = SyncCall::<i64>::new();
        let kind = if ctx.is_dir { FopKind::Opendir } else { FopKind::Open };
        self.call(kind, &req, call.unwinder(Frame::internal(), kind), |rep| Ok(rep.fd));
        let remote = call.wait_timeout(Duration::from_secs(30))?;
        ctx.remote.store(remote, Ordering::SeqCst);
        debug!("{}: reopened fd as remote {remote}", self.core.name());

        // Re-issue each granted lock in order; the first failure aborts the
        // recovery and fails the fd.
        let locks: Vec<Flock> = ctx.locks.lock().clone();
        for lock in locks {
            let mut req = WireReq {
                fd: remote,
                gfid: *ctx.gfid.lock(),
                cmd: codec::lk_cmd_tag(LkCmd::Set),
                lock: Some(lock),
                ..Default::default()
            };
            req.path = ctx.path.lock().clone();
            let call = SyncCall::<Flock>::new();
            self.call(FopKind::Lk, &req, call.unwinder(Frame::internal(), FopKind::Lk), |rep| {
                rep.lock.ok_or(Errno::EPROTO)
            });
            call.wait_timeout(Duration::from_secs(30))?;
        }
        Ok(())
    }

    fn record_lock(&self, fd: &Fd, lock: Flock) {
        if let Some(ctx) = self.slot(fd) {
            let mut locks = ctx.locks.lock();
            match lock.typ {
                LkType::Unlock => locks.retain(|held| {
                    !(held.owner == lock.owner && held.start >= lock.start && held.end <= lock.end)
                }),
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
        fd.track_lock(lock);
    }
}

impl Xlator for Client {
    fn core(&self) -> &XlCore {
        &self.core
    }

    fn init(&self) -> io::Result<()> {
        let weak = self.self_weak.clone();
        let conn = RpcConn::start(
            ConnConfig {
                addr: self.addr.clone(),
                volume: self.volume.clone(),
                ping_interval: self.ping_interval,
                reconnect_delay: self.reconnect_delay,
            },
            Box::new(move |event| {
                if let Some(client) = weak.upgrade() {
                    client.on_event(event);
                }
            }),
        );
        let weak = self.self_weak.clone();
        conn.set_callback_handler(Box::new(move |proc, payload| {
            let Some(client) = weak.upgrade() else { return };
            match proc {
                CallbackProc::InvalInode => {
                    let mut dec = codec::Dec::new(&payload);
                    if let Ok(gfid) = dec.get_gfid() {
                        client.core.emit_upward(&Event::InvalInode { gfid });
                    }
                }
                CallbackProc::InvalEntry => {
                    let mut dec = codec::Dec::new(&payload);
                    if let (Ok(pargfid), Ok(name)) = (dec.get_gfid(), dec.get_str()) {
                        client
                            .core
                            .emit_upward(&Event::InvalEntry { pargfid, name: name.into() });
                    }
                }
                CallbackProc::FetchSpec => {}
            }
        }));
        self.conn.set(conn).map_err(|_| io::Error::other("client initialized twice"))?;
        Ok(())
    }

    fn fini(&self) {
        if let Some(conn) = self.conn() {
            conn.shutdown();
        }
    }

    fn option_specs(&self) -> &'static [OptSpec] {
        OPTIONS
    }

    fn dump(&self, out: &mut String) {
        out.push_str(&format!(
            "[{}]\nconnected: {}\ntracked_fds: {}\n",
            self.core.name(),
            self.conn().map(|c| c.is_connected()).unwrap_or(false),
            self.fds.lock().len(),
        ));
    }

    fn release(&self, fd: &Fd) {
        if let Some(ctx) = self.slot(fd) {
            let remote = ctx.remote.swap(REMOTE_FD_NONE, Ordering::SeqCst);
            if remote >= 0 {
                if let Some(conn) = self.conn() {
                    let req = WireReq { fd: remote, ..Default::default() };
                    conn.call(
                        PROG_FOPS,
                        FOPS_VERSION,
                        FopProc::Release as u32,
                        req.encode(),
                        Box::new(|_res| {}),
                    );
                }
            }
        }
        fd.ctx_remove(self.core.id());
    }

    fn releasedir(&self, fd: &Fd) {
        if let Some(ctx) = self.slot(fd) {
            let remote = ctx.remote.swap(REMOTE_FD_NONE, Ordering::SeqCst);
            if remote >= 0 {
                if let Some(conn) = self.conn() {
                    let req = WireReq { fd: remote, ..Default::default() };
                    conn.call(
                        PROG_FOPS,
                        FOPS_VERSION,
                        FopProc::Releasedir as u32,
                        req.encode(),
                        Box::new(|_res| {}),
                    );
                }
            }
        }
        fd.ctx_remove(self.core.id());
    }

    fn lookup(&self, frame: Frame, loc: Loc, xdata: Xdata, unw: Unwinder<EntryReply>) {
        let mut req = self.loc_req(&frame, &loc);
        req.xdata = xdata;
        let loc2 = loc.clone();
        self.call(FopKind::Lookup, &req, unw, move |rep| Client::entry_from(&loc2, rep));
    }

    fn stat(&self, frame: Frame, loc: Loc, unw: Unwinder<Attr>) {
        let req = self.loc_req(&frame, &loc);
        self.call(FopKind::Stat, &req, unw, |rep| rep.attr.ok_or(Errno::EPROTO));
    }

    fn setattr(&self, frame: Frame, loc: Loc, args: SetattrArgs, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let mut req = self.loc_req(&frame, &loc);
        req.setattr = Some(args);
        req.xdata = xdata;
        self.call(FopKind::Setattr, &req, unw, Client::pre_post_from);
    }

    fn readlink(&self, frame: Frame, loc: Loc, unw: Unwinder<ReadlinkReply>) {
        let req = self.loc_req(&frame, &loc);
        self.call(FopKind::Readlink, &req, unw, |rep| {
            Ok(ReadlinkReply { target: rep.target.into(), attr: rep.attr.ok_or(Errno::EPROTO)? })
        });
    }

    fn mknod(&self, frame: Frame, loc: Loc, mode: u32, rdev: u32, umask: u32, xdata: Xdata, unw: Unwinder<EntryReply>) {
        let mut req = self.loc_req(&frame, &loc);
        req.mode = mode;
        req.rdev = rdev;
        req.umask = umask;
        req.xdata = xdata;
        let loc2 = loc.clone();
        self.call(FopKind::Mknod, &req, unw, move |rep| Client::entry_from(&loc2, rep));
    }

    fn mkdir(&self, frame: Frame, loc: Loc, mode: u32, umask: u32, xdata: Xdata, unw: Unwinder<EntryReply>) {
        let mut req = self.loc_req(&frame, &loc);
        req.mode = mode;
        req.umask = umask;
        req.xdata = xdata;
        let loc2 = loc.clone();
        self.call(FopKind::Mkdir, &req, unw, move |rep| Client::entry_from(&loc2, rep));
    }

    fn unlink(&self, frame: Frame, loc: Loc, xdata: Xdata, unw: Unwinder<ParentReply>) {
        let mut req = self.loc_req(&frame, &loc);
        req.xdata = xdata;
        self.call(FopKind::Unlink, &req, unw, |rep| {
            Ok(ParentReply { preparent: rep.pre, postparent: rep.post })
        });
    }

    fn rmdir(&self, frame: Frame, loc: Loc, xdata: Xdata, unw: Unwinder<ParentReply>) {
        let mut req = self.loc_req(&frame, &loc);
        req.xdata = xdata;
        self.call(FopKind::Rmdir, &req, unw, |rep| {
            Ok(ParentReply { preparent: rep.pre, postparent: rep.post })
        });
    }

    fn symlink(&self, frame: Frame, target: OsString, loc: Loc, umask: u32, xdata: Xdata, unw: Unwinder<EntryReply>) {
        let mut req = self.loc_req(&frame, &loc);
        req.name2 = target.to_string_lossy().into_owned();
        req.umask = umask;
        req.xdata = xdata;
        let loc2 = loc.clone();
        self.call(FopKind::Symlink, &req, unw, move |rep| Client::entry_from(&loc2, rep));
    }

    fn rename(&self, frame: Frame, oldloc: Loc, newloc: Loc, xdata: Xdata, unw: Unwinder<Attr>) {
        let mut req = self.loc_req(&frame, &oldloc);
        req.name2 = newloc.path.to_string_lossy().into_owned();
        let newpargfid = if newloc.pargfid.is_null() {
            newloc.parent.as_ref().and_then(|i| i.gfid()).unwrap_or(Gfid::NULL)
        } else {
            newloc.pargfid
        };
        req.pairs.push(("pargfid".into(), newpargfid.to_hex().into_bytes()));
        req.xdata = xdata;
        self.call(FopKind::Rename, &req, unw, |rep| rep.attr.ok_or(Errno::EPROTO));
    }

    fn link(&self, frame: Frame, oldloc: Loc, newloc: Loc, xdata: Xdata, unw: Unwinder<EntryReply>) {
        let mut req = self.loc_req(&frame, &oldloc);
        req.pargfid = if newloc.pargfid.is_null() {
            newloc.parent.as_ref().and_then(|i| i.gfid()).unwrap_or(Gfid::NULL)
        } else {
            newloc.pargfid
        };
        req.name = newloc.name.as_ref().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        req.name2 = newloc.path.to_string_lossy().into_owned();
        req.xdata = xdata;
        let loc2 = newloc.clone();
        self.call(FopKind::Link, &req, unw, move |rep| Client::entry_from(&loc2, rep));
    }

    fn truncate(&self, frame: Frame, loc: Loc, offset: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let mut req = self.loc_req(&frame, &loc);
        req.offset = offset;
        req.xdata = xdata;
        self.call(FopKind::Truncate, &req, unw, Client::pre_post_from);
    }

    fn ftruncate(&self, frame: Frame, fd: Arc<Fd>, offset: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let this = self.arc();
        match self.gate(&fd, FopKind::Ftruncate) {
            Gate::Fail(errno) => unw.errno(errno),
            Gate::Park(ctx) => ctx.waitq.lock().push(Stub::new(FopKind::Ftruncate, move || {
                this.ftruncate(frame, fd, offset, xdata, unw)
            })),
            Gate::Use(remote) => {
                let mut req = self.fd_req(&frame, &fd, remote);
                req.offset = offset;
                req.xdata = xdata;
                self.call(FopKind::Ftruncate, &req, unw, Client::pre_post_from);
            }
        }
    }

    fn open(&self, frame: Frame, loc: Loc, flags: OpenFlags, fd: Arc<Fd>, unw: Unwinder<()>) {
        let gfid = if loc.gfid.is_null() {
            loc.inode.as_ref().and_then(|i| i.gfid()).unwrap_or(Gfid::NULL)
        } else {
            loc.gfid
        };
        let path = loc.path.to_string_lossy().into_owned();
        let ctx = ClientFd::new(gfid, flags, false, path);
        fd.ctx_insert(self.core.id(), ctx.clone());
        self.fds.lock().push(Arc::downgrade(&fd));

        let mut req = self.loc_req(&frame, &loc);
        req.flags = flags.bits();
        let unw = unw.map(move |res: FopResult<i64>| {
            res.map(|remote| {
                ctx.remote.store(remote, Ordering::SeqCst);
                ctx.drain_waitq();
            })
        });
        // The mapped unwinder wants the remote fd; decode it from the reply.
        let inner: Unwinder<i64> = unw;
        self.call(FopKind::Open, &req, inner, |rep| Ok(rep.fd));
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
        let path = loc.path.to_string_lossy().into_owned();
        let ctx = ClientFd::new(Gfid::NULL, flags, false, path);
        fd.ctx_insert(self.core.id(), ctx.clone());
        self.fds.lock().push(Arc::downgrade(&fd));

        let mut req = self.loc_req(&frame, &loc);
        req.flags = flags.bits();
        req.mode = mode;
        req.umask = umask;
        req.xdata = xdata;
        let loc2 = loc.clone();
        self.call(FopKind::Create, &req, unw, move |rep| {
            let remote = rep.fd;
            let reply = Client::entry_from(&loc2, rep)?;
            *ctx.gfid.lock() = reply.attr.gfid;
            ctx.remote.store(remote, Ordering::SeqCst);
            ctx.drain_waitq();
            Ok(reply)
        });
    }

    fn readv(&self, frame: Frame, fd: Arc<Fd>, size: usize, offset: u64, flags: u32, xdata: Xdata, unw: Unwinder<ReadReply>) {
        let this = self.arc();
        match self.gate(&fd, FopKind::Readv) {
            Gate::Fail(errno) => unw.errno(errno),
            Gate::Park(ctx) => ctx.waitq.lock().push(Stub::new(FopKind::Readv, move || {
                this.readv(frame, fd, size, offset, flags, xdata, unw)
            })),
            Gate::Use(remote) => {
                let mut req = self.fd_req(&frame, &fd, remote);
                req.size = size as u64;
                req.offset = offset;
                req.aux = flags;
                req.xdata = xdata;
                self.call(FopKind::Readv, &req, unw, |rep| {
                    Ok(ReadReply {
                        payload: Payload::from_vec(rep.data),
                        attr: rep.attr.ok_or(Errno::EPROTO)?,
                        xdata: rep.xdata,
                    })
                });
            }
        }
    }

    fn writev(&self, frame: Frame, fd: Arc<Fd>, payload: Payload, offset: u64, flags: u32, xdata: Xdata, unw: Unwinder<WriteReply>) {
        let this = self.arc();
        match self.gate(&fd, FopKind::Writev) {
            Gate::Fail(errno) => unw.errno(errno),
            Gate::Park(ctx) => ctx.waitq.lock().push(Stub::new(FopKind::Writev, move || {
                this.writev(frame, fd, payload, offset, flags, xdata, unw)
            })),
            Gate::Use(remote) => {
                let mut req = self.fd_req(&frame, &fd, remote);
                req.data = payload.contiguous().to_vec();
                req.offset = offset;
                req.aux = flags;
                req.xdata = xdata;
                self.call(FopKind::Writev, &req, unw, |rep| {
                    Ok(WriteReply {
                        count: rep.count as usize,
                        pre: rep.pre.ok_or(Errno::EPROTO)?,
                        post: rep.post.ok_or(Errno::EPROTO)?,
                        xdata: rep.xdata,
                    })
                });
            }
        }
    }

    fn statfs(&self, frame: Frame, loc: Loc, unw: Unwinder<Statvfs>) {
        let req = self.loc_req(&frame, &loc);
        self.call(FopKind::Statfs, &req, unw, |rep| rep.statvfs.ok_or(Errno::EPROTO));
    }

    fn flush(&self, frame: Frame, fd: Arc<Fd>, unw: Unwinder<()>) {
        let this = self.arc();
        match self.gate(&fd, FopKind::Flush) {
            Gate::Fail(errno) => unw.errno(errno),
            Gate::Park(ctx) => ctx
                .waitq
                .lock()
                .push(Stub::new(FopKind::Flush, move || this.flush(frame, fd, unw))),
            Gate::Use(remote) => {
                let req = self.fd_req(&frame, &fd, remote);
                self.call(FopKind::Flush, &req, unw, |_rep| Ok(()));
            }
        }
    }

    fn fsync(&self, frame: Frame, fd: Arc<Fd>, datasync: bool, unw: Unwinder<PrePostReply>) {
        let this = self.arc();
        match self.gate(&fd, FopKind::Fsync) {
            Gate::Fail(errno) => unw.errno(errno),
            Gate::Park(ctx) => ctx.waitq.lock().push(Stub::new(FopKind::Fsync, move || {
                this.fsync(frame, fd, datasync, unw)
            })),
            Gate::Use(remote) => {
                let mut req = self.fd_req(&frame, &fd, remote);
                req.aux = datasync as u32;
                self.call(FopKind::Fsync, &req, unw, Client::pre_post_from);
            }
        }
    }

    fn setxattr(&self, frame: Frame, loc: Loc, name: OsString, value: Vec<u8>, flags: i32, xdata: Xdata, unw: Unwinder<()>) {
        let mut req = self.loc_req(&frame, &loc);
        req.name2 = name.to_string_lossy().into_owned();
        req.data = value;
        req.aux = flags as u32;
        req.xdata = xdata;
        self.call(FopKind::Setxattr, &req, unw, |_rep| Ok(()));
    }

    fn getxattr(&self, frame: Frame, loc: Loc, name: OsString, unw: Unwinder<XattrReply>) {
        let mut req = self.loc_req(&frame, &loc);
        req.name2 = name.to_string_lossy().into_owned();
        self.call(FopKind::Getxattr, &req, unw, |rep| Ok(XattrReply { value: rep.data }));
    }

    fn removexattr(&self, frame: Frame, loc: Loc, name: OsString, xdata: Xdata, unw: Unwinder<()>) {
        let mut req = self.loc_req(&frame, &loc);
        req.name2 = name.to_string_lossy().into_owned();
        req.xdata = xdata;
        self.call(FopKind::Removexattr, &req, unw, |_rep| Ok(()));
    }

    fn opendir(&self, frame: Frame, loc: Loc, fd: Arc<Fd>, unw: Unwinder<()>) {
        let gfid = if loc.gfid.is_null() {
            loc.inode.as_ref().and_then(|i| i.gfid()).unwrap_or(Gfid::NULL)
        } else {
            loc.gfid
        };
        let ctx = ClientFd::new(gfid, OpenFlags::DIRECTORY, true, loc.path.to_string_lossy().into_owned());
        fd.ctx_insert(self.core.id(), ctx.clone());
        self.fds.lock().push(Arc::downgrade(&fd));

        let req = self.loc_req(&frame, &loc);
        let unw = unw.map(move |res: FopResult<i64>| {
            res.map(|remote| {
                ctx.remote.store(remote, Ordering::SeqCst);
                ctx.drain_waitq();
            })
        });
        let inner: Unwinder<i64> = unw;
        self.call(FopKind::Opendir, &req, inner, |rep| Ok(rep.fd));
    }

    fn readdir(&self, frame: Frame, fd: Arc<Fd>, size: usize, offset: u64, unw: Unwinder<ReaddirReply>) {
        let this = self.arc();
        match self.gate(&fd, FopKind::Readdir) {
            Gate::Fail(errno) => unw.errno(errno),
            Gate::Park(ctx) => ctx.waitq.lock().push(Stub::new(FopKind::Readdir, move || {
                this.readdir(frame, fd, size, offset, unw)
            })),
            Gate::Use(remote) => {
                let mut req = self.fd_req(&frame, &fd, remote);
                req.size = size as u64;
                req.offset = offset;
                self.call(FopKind::Readdir, &req, unw, |rep| Ok(ReaddirReply { entries: rep.entries }));
            }
        }
    }

    fn fsyncdir(&self, frame: Frame, fd: Arc<Fd>, datasync: bool, unw: Unwinder<()>) {
        let this = self.arc();
        match self.gate(&fd, FopKind::Fsyncdir) {
            Gate::Fail(errno) => unw.errno(errno),
            Gate::Park(ctx) => ctx.waitq.lock().push(Stub::new(FopKind::Fsyncdir, move || {
                this.fsyncdir(frame, fd, datasync, unw)
            })),
            Gate::Use(remote) => {
                let mut req = self.fd_req(&frame, &fd, remote);
                req.aux = datasync as u32;
                self.call(FopKind::Fsyncdir, &req, unw, |_rep| Ok(()));
            }
        }
    }

    fn access(&self, frame: Frame, loc: Loc, mask: u32, unw: Unwinder<()>) {
        let mut req = self.loc_req(&frame, &loc);
        req.aux = mask;
        self.call(FopKind::Access, &req, unw, |_rep| Ok(()));
    }

    fn lk(&self, frame: Frame, fd: Arc<Fd>, cmd: LkCmd, lock: Flock, xdata: Xdata, unw: Unwinder<Flock>) {
        let this = self.arc();
        match self.gate(&fd, FopKind::Lk) {
            Gate::Fail(errno) => unw.errno(errno),
            Gate::Park(ctx) => ctx.waitq.lock().push(Stub::new(FopKind::Lk, move || {
                this.lk(frame, fd, cmd, lock, xdata, unw)
            })),
            Gate::Use(remote) => {
                let mut req = self.fd_req(&frame, &fd, remote);
                req.cmd = codec::lk_cmd_tag(cmd);
                req.lock = Some(lock);
                req.xdata = xdata;
                let fd2 = fd.clone();
                let unw = unw.map(move |res: FopResult<Flock>| {
                    if let Ok(granted) = &res {
                        if cmd != LkCmd::Get {
                            // Granted locks are remembered for recovery.
                            this.record_lock(&fd2, *granted);
                        }
                    }
                    res
                });
                self.call(FopKind::Lk, &req, unw, |rep| rep.lock.ok_or(Errno::EPROTO));
            }
        }
    }

    fn inodelk(&self, frame: Frame, volume: String, loc: Loc, cmd: LkCmd, lock: Flock, xdata: Xdata, unw: Unwinder<()>) {
        let mut req = self.loc_req(&frame, &loc);
        req.name = volume;
        req.cmd = codec::lk_cmd_tag(cmd);
        req.lock = Some(lock);
        req.xdata = xdata;
        self.call(FopKind::Inodelk, &req, unw, |_rep| Ok(()));
    }

    fn entrylk(
        &self,
        frame: Frame,
        volume: String,
        loc: Loc,
        basename: OsString,
        cmd: EntrylkCmd,
        typ: LkType,
        xdata: Xdata,
        unw: Unwinder<()>,
    ) {
        let mut req = self.loc_req(&frame, &loc);
        req.name = volume;
        req.name2 = basename.to_string_lossy().into_owned();
        req.cmd = codec::entrylk_cmd_tag(cmd);
        req.aux = (typ == LkType::Write) as u32;
        req.xdata = xdata;
        self.call(FopKind::Entrylk, &req, unw, |_rep| Ok(()));
    }

    fn xattrop(
        &self,
        frame: Frame,
        loc: Loc,
        op: XattropOp,
        pairs: Vec<(OsString, Vec<u8>)>,
        xdata: Xdata,
        unw: Unwinder<Vec<(OsString, Vec<u8>)>>,
    ) {
        let mut req = self.loc_req(&frame, &loc);
        req.cmd = codec::xattrop_tag(op);
        req.pairs = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string_lossy().into_owned(), v))
            .collect();
        req.xdata = xdata;
        self.call(FopKind::Xattrop, &req, unw, |rep| {
            Ok(rep.pairs.into_iter().map(|(k, v)| (OsString::from(k), v)).collect())
        });
    }

    fn fallocate(&self, frame: Frame, fd: Arc<Fd>, mode: i32, offset: u64, len: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let this = self.arc();
        match self.gate(&fd, FopKind::Fallocate) {
            Gate::Fail(errno) => unw.errno(errno),
            Gate::Park(ctx) => ctx.waitq.lock().push(Stub::new(FopKind::Fallocate, move || {
                this.fallocate(frame, fd, mode, offset, len, xdata, unw)
            })),
            Gate::Use(remote) => {
                let mut req = self.fd_req(&frame, &fd, remote);
                req.aux = mode as u32;
                req.offset = offset;
                req.size = len;
                req.xdata = xdata;
                self.call(FopKind::Fallocate, &req, unw, Client::pre_post_from);
            }
        }
    }

    fn discard(&self, frame: Frame, fd: Arc<Fd>, offset: u64, len: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let this = self.arc();
        match self.gate(&fd, FopKind::Discard) {
            Gate::Fail(errno) => unw.errno(errno),
            Gate::Park(ctx) => ctx.waitq.lock().push(Stub::new(FopKind::Discard, move || {
                this.discard(frame, fd, offset, len, xdata, unw)
            })),
            Gate::Use(remote) => {
                let mut req = self.fd_req(&frame, &fd, remote);
                req.offset = offset;
                req.size = len;
                req.xdata = xdata;
                self.call(FopKind::Discard, &req, unw, Client::pre_post_from);
            }
        }
    }

    fn zerofill(&self, frame: Frame, fd: Arc<Fd>, offset: u64, len: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let this = self.arc();
        match self.gate(&fd, FopKind::Zerofill) {
            Gate::Fail(errno) => unw.errno(errno),
            Gate::Park(ctx) => ctx.waitq.lock().push(Stub::new(FopKind::Zerofill, move || {
                this.zerofill(frame, fd, offset, len, xdata, unw)
            })),
            Gate::Use(remote) => {
                let mut req = self.fd_req(&frame, &fd, remote);
                req.offset = offset;
                req.size = len;
                req.xdata = xdata;
                self.call(FopKind::Zerofill, &req, unw, Client::pre_post_from);
            }
        }
    }

    fn ipc(&self, frame: Frame, op: i32, xdata: Xdata, unw: Unwinder<IpcReply>) {
        let mut req = WireReq { pid: frame.pid(), ..Default::default() };
        req.aux = op as u32;
        req.xdata = xdata;
        self.call(FopKind::Ipc, &req, unw, |rep| Ok(IpcReply { xdata: rep.xdata }));
    }

    fn lease(&self, frame: Frame, loc: Loc, cmd: LkCmd, typ: LkType, unw: Unwinder<LkType>) {
        let mut req = self.loc_req(&frame, &loc);
        req.cmd = codec::lk_cmd_tag(cmd);
        req.aux = (typ == LkType::Write) as u32;
        self.call(FopKind::Lease, &req, unw, |rep| {
            Ok(if rep.count == 1 { LkType::Write } else { LkType::Read })
        });
    }

    fn seek(&self, frame: Frame, fd: Arc<Fd>, offset: u64, whence: SeekWhence, unw: Unwinder<u64>) {
        let this = self.arc();
        match self.gate(&fd, FopKind::Seek) {
            Gate::Fail(errno) => unw.errno(errno),
            Gate::Park(ctx) => ctx.waitq.lock().push(Stub::new(FopKind::Seek, move || {
                this.seek(frame, fd, offset, whence, unw)
            })),
            Gate::Use(remote) => {
                let mut req = self.fd_req(&frame, &fd, remote);
                req.offset = offset;
                req.cmd = codec::seek_tag(whence);
                self.call(FopKind::Seek, &req, unw, |rep| Ok(rep.count));
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("volume", &self.volume)
            .field("strict_locks", &self.strict_locks)
            .finish()
    }
}
