//! RPC server: decodes fop frames and drives them through a server-side
//! translator graph.
//!
//! Each accepted connection gets a reader thread, its own remote-fd table
//! and a shared writer handle that reply unwinders use directly, so a slow
//! operation never blocks unrelated replies. The handshake program
//! negotiates the fops version before any fop is accepted; the callback
//! program pushes invalidation upcalls to connected clients.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::errno::Errno;
use crate::fdtable::{Fd, FdTable};
use crate::fop::{
    Attr, EntryReply, Flock, FopKind, IpcReply, LkType, Loc, OpenFlags, ParentReply, Payload,
    PrePostReply, ReadReply, ReaddirReply, ReadlinkReply, Statvfs, WriteReply, XattrReply,
};
use crate::gfid::Gfid;
use crate::itable::{Inode, InodeTable};
use crate::stack::{Caller, FopResult, Frame, SyncCall, Unwinder};
use crate::xlator::Graph;

use super::codec::{self, WireRep, WireReq};
use super::conn::{read_frame, write_frame};
use super::{
    CALLBACK_VERSION, CallbackProc, FLAG_REPLY, FOPS_VERSION, FopProc, HandshakeProc,
    PROG_CALLBACK, PROG_FOPS, PROG_HANDSHAKE, REMOTE_FD_ANON, RpcHeader,
};

struct ConnShared {
    writer: Mutex<TcpStream>,
    fds: FdTable,
    volume_ok: AtomicBool,
}

impl ConnShared {
    fn send(&self, header: &RpcHeader, payload: &[u8]) {
        let mut writer = self.writer.lock();
        if let Err(err) = write_frame(&mut writer, header, payload) {
            debug!("reply write failed: {err}");
        }
    }
}

/// The server half: accept loop plus per-connection dispatchers.
pub struct RpcServer {
    graph: Arc<Graph>,
    itable: Arc<InodeTable>,
    addr: std::net::SocketAddr,
    stop: Arc<AtomicBool>,
    conns: Arc<Mutex<Vec<Arc<ConnShared>>>>,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RpcServer {
    pub fn start(
        listener: TcpListener,
        graph: Arc<Graph>,
        itable: Arc<InodeTable>,
    ) -> io::Result<Arc<RpcServer>> {
        let addr = listener.local_addr()?;
        let server = Arc::new(RpcServer {
            graph,
            itable,
            addr,
            stop: Arc::new(AtomicBool::new(false)),
            conns: Arc::new(Mutex::new(Vec::new())),
            accept_thread: Mutex::new(None),
        });
        let accept = {
            let server = server.clone();
            thread::Builder::new().name("rpc-accept".into()).spawn(move || {
                loop {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            if server.stop.load(Ordering::SeqCst) {
                                return;
                            }
                            debug!("accepted rpc connection from {peer}");
                            server.clone().spawn_connection(stream);
                        }
                        Err(err) => {
                            if server.stop.load(Ordering::SeqCst) {
                                return;
                            }
                            warn!("accept failed: {err}");
                            thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
            })?
        };
        *server.accept_thread.lock() = Some(accept);
        info!("rpc server listening on {addr}");
        Ok(server)
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // Unblock the accept loop.
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        for conn in self.conns.lock().drain(..) {
            let _ = conn.writer.lock().shutdown(std::net::Shutdown::Both);
        }
    }

    /// Drop every live connection while keeping the listener up; clients
    /// are expected to reconnect and rebuild their fd state.
    pub fn disconnect_all(&self) {
        for conn in self.conns.lock().iter() {
            let _ = conn.writer.lock().shutdown(std::net::Shutdown::Both);
        }
    }

    /// Push an inode invalidation to every connected client.
    pub fn notify_inval_inode(&self, gfid: Gfid) {
        let mut enc = codec::Enc::new();
        enc.put_gfid(gfid);
        let payload = enc.finish();
        let header = RpcHeader::request(0, PROG_CALLBACK, CALLBACK_VERSION, CallbackProc::InvalInode as u32);
        for conn in self.conns.lock().iter() {
            conn.send(&header, &payload);
        }
    }

    fn spawn_connection(self: Arc<Self>, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(err) => {
                warn!("connection clone failed: {err}");
                return;
            }
        };
        let shared = Arc::new(ConnShared {
            writer: Mutex::new(writer),
            fds: FdTable::new(),
            volume_ok: AtomicBool::new(false),
        });
        self.conns.lock().push(shared.clone());
        let server = self.clone();
        let result = thread::Builder::new().name("rpc-conn".into()).spawn(move || {
            let mut stream = stream;
            loop {
                match read_frame(&mut stream) {
                    Ok((header, payload)) => server.dispatch(&shared, header, payload),
                    Err(err) => {
                        debug!("connection closed: {err}");
                        break;
                    }
                }
            }
            // Connection teardown releases every fd it still holds.
            for fd in shared.fds.all() {
                server.graph.release_fd(&fd);
            }
            server.conns.lock().retain(|c| !Arc::ptr_eq(c, &shared));
        });
        if let Err(err) = result {
            warn!("failed to spawn connection thread: {err}");
        }
    }

    fn dispatch(&self, conn: &Arc<ConnShared>, header: RpcHeader, payload: Vec<u8>) {
        if header.flags.get() & FLAG_REPLY != 0 {
            // Replies to our own callback pushes need no bookkeeping.
            return;
        }
        match header.program.get() {
            PROG_HANDSHAKE => self.dispatch_handshake(conn, header, payload),
            PROG_FOPS => {
                if !conn.volume_ok.load(Ordering::SeqCst) {
                    conn.send(&header.reply_to(-1, libc::EACCES), &[]);
                    return;
                }
                self.dispatch_fop(conn, header, payload);
            }
            other => {
                warn!("request for unknown program {other}");
                conn.send(&header.reply_to(-1, libc::ENOSYS), &[]);
            }
        }
    }

    fn dispatch_handshake(&self, conn: &Arc<ConnShared>, header: RpcHeader, payload: Vec<u8>) {
        match HandshakeProc::try_from(header.procedure.get()) {
            Ok(HandshakeProc::SetVolume) => {
                let mut dec = codec::Dec::new(&payload);
                let volume = dec.get_str().unwrap_or_default();
                let client_fops = dec.get_u32().unwrap_or(0);
                if client_fops != FOPS_VERSION {
                    warn!("client offered fops version {client_fops}, want {FOPS_VERSION}");
                    conn.send(&header.reply_to(-1, libc::EPROTO), &[]);
                    return;
                }
                debug!("setvolume for {volume:?}");
                conn.volume_ok.store(true, Ordering::SeqCst);
                let mut enc = codec::Enc::new();
                enc.put_u32(FOPS_VERSION);
                conn.send(&header.reply_to(0, 0), &enc.finish());
            }
            Ok(HandshakeProc::Ping) => conn.send(&header.reply_to(0, 0), &[]),
            Ok(HandshakeProc::GetSpec) => {
                let mut enc = codec::Enc::new();
                enc.put_str("volume served by stackfs rpc server");
                conn.send(&header.reply_to(0, 0), &enc.finish());
            }
            Err(_) => conn.send(&header.reply_to(-1, libc::ENOSYS), &[]),
        }
    }

    fn inode_for(&self, gfid: Gfid) -> Option<Arc<Inode>> {
        if gfid.is_null() {
            return None;
        }
        match self.itable.find(gfid) {
            Some(inode) => Some(inode),
            None => Some(self.itable.link_by_gfid(self.itable.new_unlinked(), gfid)),
        }
    }

    fn loc_from(&self, req: &WireReq) -> Loc {
        Loc {
            parent: self.inode_for(req.pargfid),
            inode: self.inode_for(req.gfid).or_else(|| Some(crate::itable::Inode::detached())),
            name: (!req.name.is_empty()).then(|| req.name.clone().into()),
            path: PathBuf::from(&req.path),
            gfid: req.gfid,
            pargfid: req.pargfid,
        }
    }

    fn frame_for(&self, _header: &RpcHeader, req: &WireReq) -> Frame {
        // The request record carries the caller's pid; the lock owner rides
        // on the lock itself when one is present.
        let caller = Caller { uid: 0, gid: 0, pid: req.pid, groups: Default::default() };
        let owner = req.lock.map(|l| l.owner).unwrap_or_default();
        Frame::root(caller, owner)
    }

    /// Resolve the fd a request names. Anonymous fds get a transient open by
    /// gfid that is released once the operation's reply is sent.
    fn acquire_fd(&self, conn: &ConnShared, req: &WireReq, dir: bool) -> Result<(Arc<Fd>, bool), Errno> {
        if req.fd >= 0 {
            return conn.fds.get(req.fd as u64).ok_or(Errno::EBADF).map(|fd| (fd, false));
        }
        if req.fd != REMOTE_FD_ANON {
            return Err(Errno::EBADF);
        }
        let inode = self.inode_for(req.gfid).ok_or(Errno::ESTALE)?;
        let path = if req.path.is_empty() {
            self.itable.path_of(&inode).ok_or(Errno::ESTALE)?
        } else {
            PathBuf::from(&req.path)
        };
        let loc = Loc {
            parent: None,
            inode: Some(inode.clone()),
            name: None,
            path,
            gfid: req.gfid,
            pargfid: Gfid::NULL,
        };
        let flags = OpenFlags::from_bits_retain(req.flags).union(OpenFlags::RDWR);
        let fd = if dir {
            Fd::new_dir(inode, flags, 0)
        } else {
            Fd::new(inode, flags, 0)
        };
        let call = SyncCall::<()>::new();
        if dir {
            self.graph.root().opendir(
                Frame::internal(),
                loc,
                fd.clone(),
                call.unwinder(Frame::internal(), FopKind::Opendir),
            );
        } else {
            self.graph.root().open(
                Frame::internal(),
                loc,
                flags,
                fd.clone(),
                call.unwinder(Frame::internal(), FopKind::Open),
            );
        }
        call.wait()?;
        Ok((fd, true))
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch_fop(&self, conn: &Arc<ConnShared>, header: RpcHeader, payload: Vec<u8>) {
        let proc = match FopProc::try_from(header.procedure.get()) {
            Ok(proc) => proc,
            Err(_) => {
                conn.send(&header.reply_to(-1, libc::ENOSYS), &[]);
                return;
            }
        };
        let req = match WireReq::decode(&payload) {
            Ok(req) => req,
            Err(errno) => {
                conn.send(&header.reply_to(-1, errno.code()), &[]);
                return;
            }
        };
        let frame = self.frame_for(&header, &req);
        let root = self.graph.root().clone();
        let graph = self.graph.clone();
        let itable = self.itable.clone();
        let conn2 = conn.clone();

        // Every arm funnels through this: encode the WireRep or the errno.
        let send = move |result: Result<WireRep, Errno>| match result {
            Ok(rep) => {
                let count = rep.count.min(i32::MAX as u64) as i32;
                conn2.send(&header.reply_to(count, 0), &rep.encode());
            }
            Err(errno) => conn2.send(&header.reply_to(-1, errno.code()), &[]),
        };

        macro_rules! fd_or_bail {
            ($dir:expr) => {
                match self.acquire_fd(conn, &req, $dir) {
                    Ok(pair) => pair,
                    Err(errno) => {
                        send(Err(errno));
                        return;
                    }
                }
            };
        }

        // Transient (anonymous) fds are released after the reply is built.
        let release_transient = {
            let graph = graph.clone();
            move |fd: &Arc<Fd>, transient: bool| {
                if transient {
                    graph.release_fd(fd);
                }
            }
        };

        match proc {
            FopProc::Lookup => {
                let loc = self.loc_from(&req);
                let parent = loc.parent.clone();
                let name = loc.name.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Lookup, move |res: FopResult<EntryReply>| {
                    send(res.map(|reply| {
                        // Keep the server-side dentry graph current so
                        // gfid-only requests can still find a path.
                        if let (Some(parent), Some(name)) = (&parent, &name) {
                            itable.link(reply.inode.clone(), reply.attr.gfid, parent, name);
                        } else {
                            itable.link_by_gfid(reply.inode.clone(), reply.attr.gfid);
                        }
                        reply.inode.set_attr(reply.attr);
                        WireRep {
                            attr: Some(reply.attr),
                            post: reply.postparent,
                            xdata: reply.xdata,
                            ..Default::default()
                        }
                    }));
                });
                root.lookup(frame, loc, req.xdata.clone(), unw);
            }
            FopProc::Stat => {
                let unw = Unwinder::new(frame.clone(), FopKind::Stat, move |res: FopResult<Attr>| {
                    send(res.map(|attr| WireRep { attr: Some(attr), ..Default::default() }));
                });
                root.stat(frame, self.loc_from(&req), unw);
            }
            FopProc::Setattr => {
                let args = req.setattr.unwrap_or_default();
                let unw = Unwinder::new(frame.clone(), FopKind::Setattr, move |res: FopResult<PrePostReply>| {
                    send(res.map(|r| WireRep { pre: Some(r.pre), post: Some(r.post), ..Default::default() }));
                });
                root.setattr(frame, self.loc_from(&req), args, req.xdata.clone(), unw);
            }
            FopProc::Readlink => {
                let unw = Unwinder::new(frame.clone(), FopKind::Readlink, move |res: FopResult<ReadlinkReply>| {
                    send(res.map(|r| WireRep {
                        attr: Some(r.attr),
                        target: r.target.to_string_lossy().into_owned(),
                        ..Default::default()
                    }));
                });
                root.readlink(frame, self.loc_from(&req), unw);
            }
            FopProc::Mknod => {
                let loc = self.loc_from(&req);
                let unw = self.entry_unwinder(frame.clone(), FopKind::Mknod, loc.clone(), send);
                root.mknod(frame, loc, req.mode, req.rdev, req.umask, req.xdata.clone(), unw);
            }
            FopProc::Mkdir => {
                let loc = self.loc_from(&req);
                let unw = self.entry_unwinder(frame.clone(), FopKind::Mkdir, loc.clone(), send);
                root.mkdir(frame, loc, req.mode, req.umask, req.xdata.clone(), unw);
            }
            FopProc::Unlink => {
                let loc = self.loc_from(&req);
                let itable2 = self.itable.clone();
                let parent = loc.parent.clone();
                let name = loc.name.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Unlink, move |res: FopResult<ParentReply>| {
                    send(res.map(|r| {
                        if let (Some(parent), Some(name)) = (&parent, &name) {
                            itable2.unlink(parent, name);
                        }
                        WireRep { pre: r.preparent, post: r.postparent, ..Default::default() }
                    }));
                });
                root.unlink(frame, loc, req.xdata.clone(), unw);
            }
            FopProc::Rmdir => {
                let loc = self.loc_from(&req);
                let itable2 = self.itable.clone();
                let parent = loc.parent.clone();
                let name = loc.name.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Rmdir, move |res: FopResult<ParentReply>| {
                    send(res.map(|r| {
                        if let (Some(parent), Some(name)) = (&parent, &name) {
                            itable2.unlink(parent, name);
                        }
                        WireRep { pre: r.preparent, post: r.postparent, ..Default::default() }
                    }));
                });
                root.rmdir(frame, loc, req.xdata.clone(), unw);
            }
            FopProc::Symlink => {
                let loc = self.loc_from(&req);
                let unw = self.entry_unwinder(frame.clone(), FopKind::Symlink, loc.clone(), send);
                root.symlink(frame, req.name2.clone().into(), loc, req.umask, req.xdata.clone(), unw);
            }
            FopProc::Rename => {
                let oldloc = self.loc_from(&req);
                // The destination travels as (name2 = path, aux gfid pair in
                // pairs[0] when present).
                let newloc = Loc {
                    parent: req
                        .pairs
                        .first()
                        .and_then(|(_, v)| Gfid::from_hex(&String::from_utf8_lossy(v)))
                        .and_then(|g| self.inode_for(g)),
                    inode: None,
                    name: std::path::Path::new(&req.name2)
                        .file_name()
                        .map(|n| n.to_os_string()),
                    path: PathBuf::from(&req.name2),
                    gfid: Gfid::NULL,
                    pargfid: req
                        .pairs
                        .first()
                        .and_then(|(_, v)| Gfid::from_hex(&String::from_utf8_lossy(v)))
                        .unwrap_or(Gfid::NULL),
                };
                let itable2 = self.itable.clone();
                let old_parent = oldloc.parent.clone();
                let old_name = oldloc.name.clone();
                let new_parent = newloc.parent.clone();
                let new_name = newloc.name.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Rename, move |res: FopResult<Attr>| {
                    send(res.map(|attr| {
                        if let (Some(op), Some(on), Some(np), Some(nn)) =
                            (&old_parent, &old_name, &new_parent, &new_name)
                        {
                            itable2.rename(op, on, np, nn);
                        }
                        WireRep { attr: Some(attr), ..Default::default() }
                    }));
                });
                root.rename(frame, oldloc, newloc, req.xdata.clone(), unw);
            }
            FopProc::Link => {
                let oldloc = Loc {
                    parent: None,
                    inode: self.inode_for(req.gfid),
                    name: None,
                    path: PathBuf::from(&req.path),
                    gfid: req.gfid,
                    pargfid: Gfid::NULL,
                };
                let newloc = Loc {
                    parent: self.inode_for(req.pargfid),
                    inode: None,
                    name: (!req.name.is_empty()).then(|| req.name.clone().into()),
                    path: PathBuf::from(&req.name2),
                    gfid: Gfid::NULL,
                    pargfid: req.pargfid,
                };
                let unw = self.entry_unwinder(frame.clone(), FopKind::Link, newloc.clone(), send);
                root.link(frame, oldloc, newloc, req.xdata.clone(), unw);
            }
            FopProc::Truncate => {
                let unw = Unwinder::new(frame.clone(), FopKind::Truncate, move |res: FopResult<PrePostReply>| {
                    send(res.map(|r| WireRep { pre: Some(r.pre), post: Some(r.post), ..Default::default() }));
                });
                root.truncate(frame, self.loc_from(&req), req.offset, req.xdata.clone(), unw);
            }
            FopProc::Ftruncate => {
                let (fd, transient) = fd_or_bail!(false);
                let fd2 = fd.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Ftruncate, move |res: FopResult<PrePostReply>| {
                    release_transient(&fd2, transient);
                    send(res.map(|r| WireRep { pre: Some(r.pre), post: Some(r.post), ..Default::default() }));
                });
                root.ftruncate(frame, fd, req.offset, req.xdata.clone(), unw);
            }
            FopProc::Open => {
                let loc = self.loc_from(&req);
                let inode = loc.inode.clone().expect("loc has an inode");
                let flags = OpenFlags::from_bits_retain(req.flags);
                let fd = Fd::new(inode, flags, req.pid);
                let conn3 = conn.clone();
                let fd2 = fd.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Open, move |res: FopResult<()>| {
                    send(res.map(|()| {
                        let handle = conn3.fds.insert(fd2.clone());
                        WireRep { fd: handle as i64, ..Default::default() }
                    }));
                });
                root.open(frame, loc, flags, fd, unw);
            }
            FopProc::Create => {
                let loc = self.loc_from(&req);
                let inode = loc.inode.clone().expect("loc has an inode");
                let flags = OpenFlags::from_bits_retain(req.flags);
                let fd = Fd::new(inode, flags, req.pid);
                let conn3 = conn.clone();
                let fd2 = fd.clone();
                let itable2 = self.itable.clone();
                let parent = loc.parent.clone();
                let name = loc.name.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Create, move |res: FopResult<EntryReply>| {
                    send(res.map(|reply| {
                        if let (Some(parent), Some(name)) = (&parent, &name) {
                            itable2.link(reply.inode.clone(), reply.attr.gfid, parent, name);
                        }
                        reply.inode.set_attr(reply.attr);
                        let handle = conn3.fds.insert(fd2.clone());
                        WireRep {
                            attr: Some(reply.attr),
                            post: reply.postparent,
                            fd: handle as i64,
                            xdata: reply.xdata,
                            ..Default::default()
                        }
                    }));
                });
                root.create(frame, loc, flags, req.mode, req.umask, fd, req.xdata.clone(), unw);
            }
            FopProc::Readv => {
                let (fd, transient) = fd_or_bail!(false);
                let fd2 = fd.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Readv, move |res: FopResult<ReadReply>| {
                    release_transient(&fd2, transient);
                    send(res.map(|r| WireRep {
                        attr: Some(r.attr),
                        count: r.payload.len() as u64,
                        data: r.payload.contiguous().to_vec(),
                        xdata: r.xdata,
                        ..Default::default()
                    }));
                });
                root.readv(frame, fd, req.size as usize, req.offset, req.aux, req.xdata.clone(), unw);
            }
            FopProc::Writev => {
                let (fd, transient) = fd_or_bail!(false);
                let fd2 = fd.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Writev, move |res: FopResult<WriteReply>| {
                    release_transient(&fd2, transient);
                    send(res.map(|r| WireRep {
                        pre: Some(r.pre),
                        post: Some(r.post),
                        count: r.count as u64,
                        xdata: r.xdata,
                        ..Default::default()
                    }));
                });
                let payload = Payload::from_vec(req.data.clone());
                root.writev(frame, fd, payload, req.offset, req.aux, req.xdata.clone(), unw);
            }
            FopProc::Statfs => {
                let unw = Unwinder::new(frame.clone(), FopKind::Statfs, move |res: FopResult<Statvfs>| {
                    send(res.map(|vfs| WireRep { statvfs: Some(vfs), ..Default::default() }));
                });
                root.statfs(frame, self.loc_from(&req), unw);
            }
            FopProc::Flush => {
                let (fd, transient) = fd_or_bail!(false);
                let fd2 = fd.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Flush, move |res: FopResult<()>| {
                    release_transient(&fd2, transient);
                    send(res.map(|()| WireRep::default()));
                });
                root.flush(frame, fd, unw);
            }
            FopProc::Fsync => {
                let (fd, transient) = fd_or_bail!(false);
                let fd2 = fd.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Fsync, move |res: FopResult<PrePostReply>| {
                    release_transient(&fd2, transient);
                    send(res.map(|r| WireRep { pre: Some(r.pre), post: Some(r.post), ..Default::default() }));
                });
                root.fsync(frame, fd, req.aux != 0, unw);
            }
            FopProc::Setxattr => {
                let unw = Unwinder::new(frame.clone(), FopKind::Setxattr, move |res: FopResult<()>| {
                    send(res.map(|()| WireRep::default()));
                });
                root.setxattr(
                    frame,
                    self.loc_from(&req),
                    req.name2.clone().into(),
                    req.data.clone(),
                    req.aux as i32,
                    req.xdata.clone(),
                    unw,
                );
            }
            FopProc::Getxattr => {
                let unw = Unwinder::new(frame.clone(), FopKind::Getxattr, move |res: FopResult<XattrReply>| {
                    send(res.map(|r| WireRep {
                        count: r.value.len() as u64,
                        data: r.value,
                        ..Default::default()
                    }));
                });
                root.getxattr(frame, self.loc_from(&req), req.name2.clone().into(), unw);
            }
            FopProc::Removexattr => {
                let unw = Unwinder::new(frame.clone(), FopKind::Removexattr, move |res: FopResult<()>| {
                    send(res.map(|()| WireRep::default()));
                });
                root.removexattr(frame, self.loc_from(&req), req.name2.clone().into(), req.xdata.clone(), unw);
            }
            FopProc::Opendir => {
                let loc = self.loc_from(&req);
                let inode = loc.inode.clone().expect("loc has an inode");
                let fd = Fd::new_dir(inode, OpenFlags::DIRECTORY, req.pid);
                let conn3 = conn.clone();
                let fd2 = fd.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Opendir, move |res: FopResult<()>| {
                    send(res.map(|()| {
                        let handle = conn3.fds.insert(fd2.clone());
                        WireRep { fd: handle as i64, ..Default::default() }
                    }));
                });
                root.opendir(frame, loc, fd, unw);
            }
            FopProc::Readdir => {
                let (fd, transient) = fd_or_bail!(true);
                let fd2 = fd.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Readdir, move |res: FopResult<ReaddirReply>| {
                    release_transient(&fd2, transient);
                    send(res.map(|r| WireRep { entries: r.entries, ..Default::default() }));
                });
                root.readdir(frame, fd, req.size as usize, req.offset, unw);
            }
            FopProc::Fsyncdir => {
                let (fd, transient) = fd_or_bail!(true);
                let fd2 = fd.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Fsyncdir, move |res: FopResult<()>| {
                    release_transient(&fd2, transient);
                    send(res.map(|()| WireRep::default()));
                });
                root.fsyncdir(frame, fd, req.aux != 0, unw);
            }
            FopProc::Access => {
                let unw = Unwinder::new(frame.clone(), FopKind::Access, move |res: FopResult<()>| {
                    send(res.map(|()| WireRep::default()));
                });
                root.access(frame, self.loc_from(&req), req.aux, unw);
            }
            FopProc::Lk => {
                let (fd, transient) = fd_or_bail!(false);
                let Some(lock) = req.lock else {
                    send(Err(Errno::EINVAL));
                    return;
                };
                let cmd = match codec::lk_cmd_from_tag(req.cmd) {
                    Ok(cmd) => cmd,
                    Err(errno) => {
                        send(Err(errno));
                        return;
                    }
                };
                let fd2 = fd.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Lk, move |res: FopResult<Flock>| {
                    release_transient(&fd2, transient);
                    send(res.map(|lock| WireRep { lock: Some(lock), ..Default::default() }));
                });
                root.lk(frame, fd, cmd, lock, req.xdata.clone(), unw);
            }
            FopProc::Inodelk => {
                let Some(lock) = req.lock else {
                    send(Err(Errno::EINVAL));
                    return;
                };
                let cmd = match codec::lk_cmd_from_tag(req.cmd) {
                    Ok(cmd) => cmd,
                    Err(errno) => {
                        send(Err(errno));
                        return;
                    }
                };
                let unw = Unwinder::new(frame.clone(), FopKind::Inodelk, move |res: FopResult<()>| {
                    send(res.map(|()| WireRep::default()));
                });
                root.inodelk(frame, req.name.clone(), self.loc_from(&req), cmd, lock, req.xdata.clone(), unw);
            }
            FopProc::Entrylk => {
                let cmd = match codec::entrylk_cmd_from_tag(req.cmd) {
                    Ok(cmd) => cmd,
                    Err(errno) => {
                        send(Err(errno));
                        return;
                    }
                };
                let typ = if req.aux == 1 { LkType::Write } else { LkType::Read };
                let unw = Unwinder::new(frame.clone(), FopKind::Entrylk, move |res: FopResult<()>| {
                    send(res.map(|()| WireRep::default()));
                });
                root.entrylk(
                    frame,
                    req.name.clone(),
                    self.loc_from(&req),
                    req.name2.clone().into(),
                    cmd,
                    typ,
                    req.xdata.clone(),
                    unw,
                );
            }
            FopProc::Xattrop => {
                let op = match codec::xattrop_from_tag(req.cmd) {
                    Ok(op) => op,
                    Err(errno) => {
                        send(Err(errno));
                        return;
                    }
                };
                let pairs: Vec<(std::ffi::OsString, Vec<u8>)> =
                    req.pairs.iter().map(|(k, v)| (k.clone().into(), v.clone())).collect();
                let unw = Unwinder::new(
                    frame.clone(),
                    FopKind::Xattrop,
                    move |res: FopResult<Vec<(std::ffi::OsString, Vec<u8>)>>| {
                        send(res.map(|pairs| WireRep {
                            pairs: pairs
                                .into_iter()
                                .map(|(k, v)| (k.to_string_lossy().into_owned(), v))
                                .collect(),
                            ..Default::default()
                        }));
                    },
                );
                root.xattrop(frame, self.loc_from(&req), op, pairs, req.xdata.clone(), unw);
            }
            FopProc::Fallocate | FopProc::Discard | FopProc::Zerofill => {
                let (fd, transient) = fd_or_bail!(false);
                let fd2 = fd.clone();
                let kind = match proc {
                    FopProc::Fallocate => FopKind::Fallocate,
                    FopProc::Discard => FopKind::Discard,
                    _ => FopKind::Zerofill,
                };
                let unw = Unwinder::new(frame.clone(), kind, move |res: FopResult<PrePostReply>| {
                    release_transient(&fd2, transient);
                    send(res.map(|r| WireRep { pre: Some(r.pre), post: Some(r.post), ..Default::default() }));
                });
                match proc {
                    FopProc::Fallocate => {
                        root.fallocate(frame, fd, req.aux as i32, req.offset, req.size, req.xdata.clone(), unw)
                    }
                    FopProc::Discard => root.discard(frame, fd, req.offset, req.size, req.xdata.clone(), unw),
                    _ => root.zerofill(frame, fd, req.offset, req.size, req.xdata.clone(), unw),
                }
            }
            FopProc::Ipc => {
                let unw = Unwinder::new(frame.clone(), FopKind::Ipc, move |res: FopResult<IpcReply>| {
                    send(res.map(|r| WireRep { xdata: r.xdata, ..Default::default() }));
                });
                root.ipc(frame, req.aux as i32, req.xdata.clone(), unw);
            }
            FopProc::Lease => {
                let cmd = match codec::lk_cmd_from_tag(req.cmd) {
                    Ok(cmd) => cmd,
                    Err(errno) => {
                        send(Err(errno));
                        return;
                    }
                };
                let typ = if req.aux == 1 { LkType::Write } else { LkType::Read };
                let unw = Unwinder::new(frame.clone(), FopKind::Lease, move |res: FopResult<LkType>| {
                    send(res.map(|typ| WireRep {
                        count: if typ == LkType::Write { 1 } else { 0 },
                        ..Default::default()
                    }));
                });
                root.lease(frame, self.loc_from(&req), cmd, typ, unw);
            }
            FopProc::Seek => {
                let (fd, transient) = fd_or_bail!(false);
                let whence = match codec::seek_from_tag(req.cmd) {
                    Ok(whence) => whence,
                    Err(errno) => {
                        send(Err(errno));
                        return;
                    }
                };
                let fd2 = fd.clone();
                let unw = Unwinder::new(frame.clone(), FopKind::Seek, move |res: FopResult<u64>| {
                    release_transient(&fd2, transient);
                    send(res.map(|offset| WireRep { count: offset, ..Default::default() }));
                });
                root.seek(frame, fd, req.offset, whence, unw);
            }
            FopProc::Release | FopProc::Releasedir => {
                if req.fd >= 0 {
                    if let Some(fd) = conn.fds.remove(req.fd as u64) {
                        graph.release_fd(&fd);
                    }
                }
                send(Ok(WireRep::default()));
            }
        }
    }

    fn entry_unwinder(
        &self,
        frame: Frame,
        op: FopKind,
        loc: Loc,
        send: impl FnOnce(Result<WireRep, Errno>) + Send + 'static,
    ) -> Unwinder<EntryReply> {
        let itable = self.itable.clone();
        let parent = loc.parent.clone();
        let name = loc.name.clone();
        Unwinder::new(frame, op, move |res: FopResult<EntryReply>| {
            send(res.map(|reply| {
                if let (Some(parent), Some(name)) = (&parent, &name) {
                    itable.link(reply.inode.clone(), reply.attr.gfid, parent, name);
                }
                reply.inode.set_attr(reply.attr);
                WireRep {
                    attr: Some(reply.attr),
                    post: reply.postparent,
                    xdata: reply.xdata,
                    ..Default::default()
                }
            }));
        })
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("addr", &self.addr)
            .field("connections", &self.conns.lock().len())
            .finish()
    }
}
