//! Journaled-based replication, server side.
//!
//! Child 0 is the local store; the remaining children reach the peer
//! replicas. The effective leader accepts client mutations, fans them to all
//! children, and reports success only after strictly more than the
//! configured percentage of peers acknowledged; committed operations append
//! a record to the current term's log. Followers reject client mutations
//! with EREMOTE unless the request carries the leader's (or the
//! reconciler's) stamp, in which case they apply locally and journal under
//! the stamped term.
//!
//! Locking fops run a two-phase protocol: acquisition locks locally before
//! the peers, release unlocks the peers before the local store, and a
//! quorum failure on either path rolls the completed side back and returns
//! EROFS.

pub mod flush;
pub mod queue;
pub mod termlog;

use std::ffi::OsString;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::errno::Errno;
use crate::fdtable::Fd;
use crate::fop::{
    EntrylkCmd, EntryReply, Flock, FopKind, IpcReply, LkCmd, LkType, Loc, ParentReply, Payload,
    PrePostReply, SetattrArgs, WriteReply, XattropOp,
};
use crate::gfid::Gfid;
use crate::itable::Inode;
use crate::options::{OptSpec, OptType, Options};
use crate::stack::{FanOut, FopResult, Frame, Stub, SyncCall, Unwinder};
use crate::xdata::{XKey, XVal, Xdata};
use crate::xlator::{Event, XlCore, Xlator};

use flush::DirtyFds;
use queue::InodeQueue;
use termlog::TermLog;

/// Reserved IPC operation codes for reconciliation.
pub const JBR_IPC_BASE: i32 = 0x0e2d_66a5;
pub const JBR_IPC_TERM_RANGE: i32 = JBR_IPC_BASE + 1;
pub const JBR_IPC_OPEN_TERM: i32 = JBR_IPC_BASE + 2;
pub const JBR_IPC_NEXT_ENTRY: i32 = JBR_IPC_BASE + 3;

const OPTIONS: &[OptSpec] = &[
    OptSpec { key: "config-leader", typ: OptType::Bool, default: "off", desc: "statically configured leader" },
    OptSpec { key: "quorum-pct", typ: OptType::Percent, default: "50", desc: "peer acknowledgment threshold" },
    OptSpec { key: "term-dir", typ: OptType::Path, default: "/var/lib/stackfs/jbr", desc: "term log directory" },
    OptSpec {
        key: "flush-interval",
        typ: OptType::Int { min: 1, max: 3600 },
        default: "5",
        desc: "seconds between dirty-fd fsync sweeps",
    },
];

enum Role {
    Leader,
    /// Applying a stamped request under the given term.
    Follower(u32),
}

type WindFn<R> = Arc<dyn Fn(&Arc<dyn Xlator>, Frame, Xdata, Unwinder<R>) + Send + Sync>;

/// The replication translator.
pub struct Jbr {
    core: XlCore,
    self_weak: Weak<Jbr>,
    config_leader: bool,
    leader: AtomicBool,
    quorum_pct: f64,
    term: AtomicU32,
    index: AtomicU64,
    log: TermLog,
    /// Reconciliation reader; one reconciler at a time by contract.
    reader: Mutex<Option<termlog::TermReader>>,
    child_up: Mutex<Vec<bool>>,
    /// Whether we last reported CHILD_UP upward.
    reported_up: Mutex<bool>,
    dirty: Arc<DirtyFds>,
    flush_interval: u64,
    stop: Arc<AtomicBool>,
    flusher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Jbr {
    /// `children[0]` is the local store; the rest are peer links.
    pub fn new(name: &str, options: &Options, children: Vec<Arc<dyn Xlator>>) -> io::Result<Arc<Jbr>> {
        assert!(!children.is_empty(), "jbr needs at least a local child");
        let n = children.len();
        let config_leader = options.get_bool("config-leader");
        let log = TermLog::new(options.get_str("term-dir"))?;
        let quorum_pct = options.get_percent("quorum-pct");
        let flush_interval = options.get_int("flush-interval") as u64;
        let name = name.to_string();
        Ok(Arc::new_cyclic(|weak| Jbr {
            core: XlCore::new(name, children),
            self_weak: weak.clone(),
            config_leader,
            leader: AtomicBool::new(config_leader),
            quorum_pct,
            term: AtomicU32::new(1),
            index: AtomicU64::new(0),
            log,
            reader: Mutex::new(None),
            child_up: Mutex::new(vec![false; n]),
            reported_up: Mutex::new(false),
            dirty: Arc::new(DirtyFds::new()),
            flush_interval,
            stop: Arc::new(AtomicBool::new(false)),
            flusher: Mutex::new(None),
        }))
    }

    pub fn option_table() -> &'static [OptSpec] {
        OPTIONS
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn current_term(&self) -> u32 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn term_log(&self) -> &TermLog {
        &self.log
    }

    fn arc(&self) -> Arc<Jbr> {
        self.self_weak.upgrade().expect("jbr alive during fop dispatch")
    }

    fn peer_count(&self) -> usize {
        self.core.children().len() - 1
    }

    /// Strictly more than `quorum_pct`% of the peers must acknowledge. A
    /// single-replica deployment has no peers and trivially meets quorum.
    fn quorum_required(&self) -> f64 {
        self.peer_count() as f64 * self.quorum_pct / 100.0
    }

    fn quorum_met(&self, acks: usize) -> bool {
        self.peer_count() == 0 || (acks as f64) > self.quorum_required()
    }

    fn up_peers(&self) -> usize {
        self.child_up.lock().iter().skip(1).filter(|up| **up).count()
    }

    fn role_for(&self, xdata: &Xdata) -> Result<Role, Errno> {
        let stamp = xdata.get_u64(XKey::LeaderTerm).map(|t| t as u32);
        let from_recon = xdata.contains(XKey::Reconciler);
        if self.is_leader() {
            // No point attempting a write that cannot reach quorum.
            if !self.quorum_met(self.up_peers()) {
                warn!(
                    "{}: quorum not met ({} of {} peers up, pct {})",
                    self.core.name(),
                    self.up_peers(),
                    self.peer_count(),
                    self.quorum_pct
                );
                return Err(Errno::EROFS);
            }
            Ok(Role::Leader)
        } else if let Some(term) = stamp {
            Ok(Role::Follower(term))
        } else if from_recon {
            Ok(Role::Follower(self.current_term()))
        } else {
            // A client mutation landed on a non-leader: it lives elsewhere.
            Err(Errno::EREMOTE)
        }
    }

    fn queue_of(&self, inode: &Arc<Inode>) -> Arc<InodeQueue> {
        if let Some(queue) = inode.ctx_get::<Arc<InodeQueue>>(self.core.id()) {
            return queue;
        }
        let queue = Arc::new(InodeQueue::new());
        inode.ctx_insert(self.core.id(), queue.clone());
        // A racing insert may have replaced ours; read back the stored one.
        inode.ctx_get::<Arc<InodeQueue>>(self.core.id()).unwrap_or(queue)
    }

    fn journal(&self, term: u32, op: FopKind, gfid: Gfid) {
        let index = self.index.fetch_add(1, Ordering::SeqCst);
        let record = TermLog::make_record(term, index, op, gfid);
        if let Err(err) = self.log.append(term, &record) {
            warn!("{}: term log append failed: {err}", self.core.name());
        }
    }

    fn finish(queue: Option<&Arc<InodeQueue>>) {
        if let Some(queue) = queue {
            if let Some(next) = queue.leave() {
                next.resume();
            }
        }
    }

    /// Replicate one mutating, non-locking fop.
    fn replicate<R: Send + 'static>(
        &self,
        frame: Frame,
        op: FopKind,
        inode: Option<Arc<Inode>>,
        gfid: Gfid,
        xdata: Xdata,
        unw: Unwinder<R>,
        wind: WindFn<R>,
    ) {
        let role = match self.role_for(&xdata) {
            Ok(role) => role,
            Err(errno) => {
                unw.errno(errno);
                return;
            }
        };
        let queue = inode.as_ref().map(|i| self.queue_of(i));
        let this = self.arc();
        let q2 = queue.clone();
        let body = Stub::new(op, move || match role {
            Role::Follower(term) => this.apply_local(frame, op, term, gfid, xdata, unw, wind, q2),
            Role::Leader => this.dispatch_leader(frame, op, gfid, xdata, unw, wind, q2),
        });
        match queue {
            Some(queue) => {
                if let Some(stub) = queue.admit(body) {
                    stub.resume();
                }
            }
            None => body.resume(),
        }
    }

    /// Follower path: apply locally, journal under the stamped term.
    #[allow(clippy::too_many_arguments)]
    fn apply_local<R: Send + 'static>(
        self: Arc<Self>,
        frame: Frame,
        op: FopKind,
        term: u32,
        gfid: Gfid,
        xdata: Xdata,
        unw: Unwinder<R>,
        wind: WindFn<R>,
        queue: Option<Arc<InodeQueue>>,
    ) {
        let local = self.core.first_child().expect("has local child").clone();
        let this = self.clone();
        let unw = unw.map(move |res: FopResult<R>| {
            if res.is_ok() {
                this.journal(term, op, gfid);
            }
            Self::finish(queue.as_ref());
            res
        });
        wind(&local, frame.child(), xdata, unw);
    }

    /// Leader path: fan out to every child, judge peer quorum, journal.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_leader<R: Send + 'static>(
        self: Arc<Self>,
        frame: Frame,
        op: FopKind,
        gfid: Gfid,
        xdata: Xdata,
        unw: Unwinder<R>,
        wind: WindFn<R>,
        queue: Option<Arc<InodeQueue>>,
    ) {
        let children = self.core.children().to_vec();
        let term = self.current_term();
        let this = self.clone();
        let fan = Arc::new(FanOut::new(children.len(), move |mut results: Vec<FopResult<R>>| {
            let local = results.remove(0);
            let peer_acks = results.iter().filter(|r| r.is_ok()).count();
            Self::finish(queue.as_ref());
            match local {
                Err(errno) => unw.errno(errno),
                Ok(reply) => {
                    if this.quorum_met(peer_acks) {
                        this.journal(term, op, gfid);
                        unw.okay(reply);
                    } else {
                        warn!(
                            "{}: {} lost quorum ({} of {} peer acks, need > {:.2})",
                            this.core.name(),
                            op,
                            peer_acks,
                            this.peer_count(),
                            this.quorum_required()
                        );
                        unw.errno(Errno::EROFS);
                    }
                }
            }
        }));
        let mut stamped = xdata.clone();
        stamped.set_u64(XKey::LeaderTerm, term as u64);
        for (idx, child) in children.iter().enumerate() {
            let fan = fan.clone();
            let sub = Unwinder::new(frame.child(), op, move |res: FopResult<R>| {
                fan.complete(idx, res);
            });
            let xdata = if idx == 0 { xdata.clone() } else { stamped.clone() };
            wind(child, frame.child(), xdata, sub);
        }
    }

    /// Two-phase lock handling shared by lk/inodelk/entrylk.
    ///
    /// `wind` issues the requested operation on a child; `inverse` issues
    /// the rollback operation (unlock for an acquire, re-lock for a
    /// release). Results of rollback winds are dropped.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_lock<R: Clone + Send + 'static>(
        &self,
        frame: Frame,
        op: FopKind,
        inode: Option<Arc<Inode>>,
        gfid: Gfid,
        is_unlock: bool,
        xdata: Xdata,
        unw: Unwinder<R>,
        wind: WindFn<R>,
        inverse: WindFn<R>,
    ) {
        let role = match self.role_for(&xdata) {
            Ok(role) => role,
            Err(errno) => {
                unw.errno(errno);
                return;
            }
        };
        let queue = inode.as_ref().map(|i| self.queue_of(i));
        let this = self.arc();
        let q2 = queue.clone();
        let body = Stub::new(op, move || match role {
            Role::Follower(term) => this.apply_local(frame, op, term, gfid, xdata, unw, wind, q2),
            Role::Leader if is_unlock => {
                this.lock_release(frame, op, gfid, xdata, unw, wind, inverse, q2)
            }
            Role::Leader => this.lock_acquire(frame, op, gfid, xdata, unw, wind, inverse, q2),
        });
        match queue {
            Some(queue) => {
                if let Some(stub) = queue.admit(body) {
                    stub.resume();
                }
            }
            None => body.resume(),
        }
    }

    /// Acquire: local first, then peers; quorum failure unlocks the local
    /// store again.
    #[allow(clippy::too_many_arguments)]
    fn lock_acquire<R: Clone + Send + 'static>(
        self: Arc<Self>,
        frame: Frame,
        op: FopKind,
        gfid: Gfid,
        xdata: Xdata,
        unw: Unwinder<R>,
        wind: WindFn<R>,
        inverse: WindFn<R>,
        queue: Option<Arc<InodeQueue>>,
    ) {
        let children = self.core.children().to_vec();
        let local = children[0].clone();
        let term = self.current_term();
        let this = self.clone();
        let frame2 = frame.clone();
        let wind_peers = wind.clone();
        let xdata_local = xdata.clone();
        let local_unw = Unwinder::new(frame.child(), op, move |res: FopResult<R>| {
            let granted = match res {
                Err(errno) => {
                    Self::finish(queue.as_ref());
                    unw.errno(errno);
                    return;
                }
                Ok(granted) => granted,
            };
            let peers = children[1..].to_vec();
            if peers.is_empty() {
                this.journal(term, op, gfid);
                Self::finish(queue.as_ref());
                unw.okay(granted);
                return;
            }
            let mut stamped = xdata.clone();
            stamped.set_u64(XKey::LeaderTerm, term as u64);
            let this2 = this.clone();
            let local2 = children[0].clone();
            let inverse2 = inverse.clone();
            let frame3 = frame2.clone();
            let fan = Arc::new(FanOut::new(peers.len(), move |results: Vec<FopResult<R>>| {
                let acks = results.iter().filter(|r| r.is_ok()).count();
                if this2.quorum_met(acks) {
                    this2.journal(term, op, gfid);
                    Self::finish(queue.as_ref());
                    unw.okay(granted);
                } else {
                    warn!("{}: lock quorum failed, rolling back local lock", this2.core.name());
                    let ignore = Unwinder::new(frame3.detach(), op, |_res: FopResult<R>| {});
                    inverse2(&local2, frame3.detach(), Xdata::new(), ignore);
                    Self::finish(queue.as_ref());
                    unw.errno(Errno::EROFS);
                }
            }));
            for (idx, peer) in peers.iter().enumerate() {
                let fan = fan.clone();
                let sub = Unwinder::new(frame2.child(), op, move |res: FopResult<R>| {
                    fan.complete(idx, res);
                });
                wind_peers(peer, frame2.child(), stamped.clone(), sub);
            }
        });
        wind(&local, frame.child(), xdata_local, local_unw);
    }

    /// Release: peers first, then local; quorum failure re-locks the peers
    /// that already released and keeps the local lock held.
    #[allow(clippy::too_many_arguments)]
    fn lock_release<R: Clone + Send + 'static>(
        self: Arc<Self>,
        frame: Frame,
        op: FopKind,
        gfid: Gfid,
        xdata: Xdata,
        unw: Unwinder<R>,
        wind: WindFn<R>,
        inverse: WindFn<R>,
        queue: Option<Arc<InodeQueue>>,
    ) {
        let children = self.core.children().to_vec();
        let term = self.current_term();
        let peers: Vec<_> = children[1..].to_vec();
        let local = children[0].clone();
        let mut stamped = xdata.clone();
        stamped.set_u64(XKey::LeaderTerm, term as u64);

        if peers.is_empty() {
            let this = self.clone();
            let unw = unw.map(move |res: FopResult<R>| {
                if res.is_ok() {
                    this.journal(term, op, gfid);
                }
                Self::finish(queue.as_ref());
                res
            });
            wind(&local, frame.child(), xdata, unw);
            return;
        }

        let this = self.clone();
        let frame2 = frame.clone();
        let wind_local = wind.clone();
        let stamped2 = stamped.clone();
        let fan = Arc::new(FanOut::new(peers.len(), {
            let peers = peers.clone();
            move |results: Vec<FopResult<R>>| {
                let acks = results.iter().filter(|r| r.is_ok()).count();
                if this.quorum_met(acks) {
                    let this2 = this.clone();
                    let q2 = queue.clone();
                    let local_unw = Unwinder::new(frame2.child(), op, move |res: FopResult<R>| {
                        if res.is_ok() {
                            this2.journal(term, op, gfid);
                        }
                        Self::finish(q2.as_ref());
                        unw.unwind(res);
                    });
                    wind_local(&local, frame2.child(), xdata.clone(), local_unw);
                } else {
                    // Partial release: restore the followers that let go.
                    warn!(
                        "{}: unlock quorum failed ({acks} acks), rolling followers back",
                        this.core.name()
                    );
                    for (idx, result) in results.iter().enumerate() {
                        if result.is_ok() {
                            let ignore =
                                Unwinder::new(frame2.detach(), op, |_res: FopResult<R>| {});
                            inverse(&peers[idx], frame2.detach(), stamped2.clone(), ignore);
                        }
                    }
                    Self::finish(queue.as_ref());
                    unw.errno(Errno::EROFS);
                }
            }
        }));
        for (idx, peer) in children[1..].iter().enumerate() {
            let fan = fan.clone();
            let sub = Unwinder::new(frame.child(), op, move |res: FopResult<R>| {
                fan.complete(idx, res);
            });
            wind(peer, frame.child(), stamped.clone(), sub);
        }
    }

    fn handle_ipc(&self, op: i32, xdata: Xdata, unw: Unwinder<IpcReply>) {
        match op {
            JBR_IPC_TERM_RANGE => match self.log.term_range() {
                Ok(Some((first, contiguous, last))) => {
                    let mut reply = Xdata::new();
                    reply.set_u64(XKey::TermFirst, first as u64);
                    reply.set_u64(XKey::TermContiguous, contiguous as u64);
                    reply.set_u64(XKey::TermLast, last as u64);
                    unw.okay(IpcReply { xdata: reply });
                }
                Ok(None) => unw.errno(Errno::ENOENT),
                Err(err) => unw.errno(Errno::from(err)),
            },
            JBR_IPC_OPEN_TERM => {
                let Some(term) = xdata.get_u64(XKey::TermNumber) else {
                    unw.errno(Errno::EINVAL);
                    return;
                };
                match self.log.open(term as u32) {
                    Ok(reader) => {
                        *self.reader.lock() = Some(reader);
                        debug!("{}: opened term {term} for reconciliation", self.core.name());
                        unw.okay(IpcReply::default());
                    }
                    Err(err) => unw.errno(Errno::from(err)),
                }
            }
            JBR_IPC_NEXT_ENTRY => {
                let mut slot = self.reader.lock();
                let Some(reader) = slot.as_mut() else {
                    unw.errno(Errno::EINVAL);
                    return;
                };
                match reader.next_entry() {
                    Ok(entry) => {
                        let mut reply = Xdata::new();
                        reply.set(XKey::TermEntry, XVal::Bytes(entry.to_vec()));
                        drop(slot);
                        unw.okay(IpcReply { xdata: reply });
                    }
                    Err(errno) => {
                        if errno == Errno::ENODATA {
                            *slot = None;
                        }
                        drop(slot);
                        unw.errno(errno);
                    }
                }
            }
            _ => match self.core.first_child() {
                Some(child) => child.ipc(Frame::internal(), op, xdata, unw),
                None => unw.errno(Errno::ENOSYS),
            },
        }
    }
}

impl Xlator for Jbr {
    fn core(&self) -> &XlCore {
        &self.core
    }

    fn init(&self) -> io::Result<()> {
        let dirty = self.dirty.clone();
        let stop = self.stop.clone();
        let interval = Duration::from_secs(self.flush_interval);
        let local = self.core.first_child().expect("has local child").clone();
        let handle = thread::Builder::new().name("jbr-flush".into()).spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                // Global dirty-list lock is taken and released inside
                // drain(), before any per-fd state is touched.
                for fd in dirty.drain() {
                    let call = SyncCall::<PrePostReply>::new();
                    local.fsync(
                        Frame::internal(),
                        fd.clone(),
                        false,
                        call.unwinder(Frame::internal(), FopKind::Fsync),
                    );
                    if let Err(errno) = call.wait_timeout(Duration::from_secs(30)) {
                        warn!("background fsync failed: {errno}");
                    }
                }
            }
        })?;
        *self.flusher.lock() = Some(handle);
        Ok(())
    }

    fn fini(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
    }

    fn option_specs(&self) -> &'static [OptSpec] {
        OPTIONS
    }

    fn dump(&self, out: &mut String) {
        out.push_str(&format!(
            "[{}]\nleader: {}\nterm: {}\npeers_up: {}/{}\npending_flush: {}\n",
            self.core.name(),
            self.is_leader(),
            self.current_term(),
            self.up_peers(),
            self.peer_count(),
            self.dirty.len(),
        ));
    }

    fn notify(&self, event: &Event) {
        match event {
            Event::ChildUp(idx) | Event::ChildDown(idx) => {
                let now_up = matches!(event, Event::ChildUp(_));
                let idx = *idx;
                {
                    let mut up = self.child_up.lock();
                    if idx >= up.len() || up[idx] == now_up {
                        return; // spurious duplicate, filtered
                    }
                    up[idx] = now_up;
                }
                // Emergency takeover, two-replica case only: when the link
                // to the config leader drops, the surviving replica leads.
                if !self.config_leader && self.core.children().len() == 2 && idx == 1 {
                    if now_up {
                        if self.leader.swap(false, Ordering::SeqCst) {
                            info!("{}: config leader is back, stepping down", self.core.name());
                        }
                    } else if !self.leader.swap(true, Ordering::SeqCst) {
                        let term = self.term.fetch_add(1, Ordering::SeqCst) + 1;
                        info!("{}: peer lost, assuming leadership for term {term}", self.core.name());
                    }
                }
                // Propagate availability only across the quorum edge, and
                // only from the leader.
                let quorum_now = self.quorum_met(self.up_peers());
                let mut reported = self.reported_up.lock();
                if quorum_now && self.is_leader() && !*reported {
                    *reported = true;
                    self.core.emit_upward(&Event::ChildUp(0));
                } else if !quorum_now && *reported {
                    *reported = false;
                    self.core.emit_upward(&Event::ChildDown(0));
                }
            }
            other => {
                for child in self.core.children() {
                    child.notify(other);
                }
            }
        }
    }

    fn forget(&self, inode: &Inode) {
        inode.ctx_remove(self.core.id());
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
        let inode = fd.inode().clone();
        let gfid = inode.gfid().unwrap_or_default();
        let dirty = self.dirty.clone();
        let fd_mark = fd.clone();
        let unw = unw.map(move |res: FopResult<WriteReply>| {
            if res.is_ok() {
                dirty.mark(&fd_mark);
            }
            res
        });
        let wind: WindFn<WriteReply> = Arc::new(move |child, frame, xdata, unw| {
            child.writev(frame, fd.clone(), payload.clone(), offset, flags, xdata, unw)
        });
        self.replicate(frame, FopKind::Writev, Some(inode), gfid, xdata, unw, wind);
    }

    fn truncate(&self, frame: Frame, loc: Loc, offset: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let inode = loc.inode.clone();
        let gfid = loc.gfid;
        let wind: WindFn<PrePostReply> = Arc::new(move |child, frame, xdata, unw| {
            child.truncate(frame, loc.clone(), offset, xdata, unw)
        });
        self.replicate(frame, FopKind::Truncate, inode, gfid, xdata, unw, wind);
    }

    fn ftruncate(&self, frame: Frame, fd: Arc<Fd>, offset: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let inode = fd.inode().clone();
        let gfid = inode.gfid().unwrap_or_default();
        let wind: WindFn<PrePostReply> = Arc::new(move |child, frame, xdata, unw| {
            child.ftruncate(frame, fd.clone(), offset, xdata, unw)
        });
        self.replicate(frame, FopKind::Ftruncate, Some(inode), gfid, xdata, unw, wind);
    }

    fn setattr(&self, frame: Frame, loc: Loc, args: SetattrArgs, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let inode = loc.inode.clone();
        let gfid = loc.gfid;
        let wind: WindFn<PrePostReply> = Arc::new(move |child, frame, xdata, unw| {
            child.setattr(frame, loc.clone(), args, xdata, unw)
        });
        self.replicate(frame, FopKind::Setattr, inode, gfid, xdata, unw, wind);
    }

    fn mknod(&self, frame: Frame, loc: Loc, mode: u32, rdev: u32, umask: u32, xdata: Xdata, unw: Unwinder<EntryReply>) {
        let inode = loc.parent.clone();
        let gfid = loc.pargfid;
        let wind: WindFn<EntryReply> = Arc::new(move |child, frame, xdata, unw| {
            child.mknod(frame, loc.clone(), mode, rdev, umask, xdata, unw)
        });
        self.replicate(frame, FopKind::Mknod, inode, gfid, xdata, unw, wind);
    }

    fn mkdir(&self, frame: Frame, loc: Loc, mode: u32, umask: u32, xdata: Xdata, unw: Unwinder<EntryReply>) {
        let inode = loc.parent.clone();
        let gfid = loc.pargfid;
        let wind: WindFn<EntryReply> = Arc::new(move |child, frame, xdata, unw| {
            child.mkdir(frame, loc.clone(), mode, umask, xdata, unw)
        });
        self.replicate(frame, FopKind::Mkdir, inode, gfid, xdata, unw, wind);
    }

    fn unlink(&self, frame: Frame, loc: Loc, xdata: Xdata, unw: Unwinder<ParentReply>) {
        let inode = loc.parent.clone();
        let gfid = loc.pargfid;
        let wind: WindFn<ParentReply> = Arc::new(move |child, frame, xdata, unw| {
            child.unlink(frame, loc.clone(), xdata, unw)
        });
        self.replicate(frame, FopKind::Unlink, inode, gfid, xdata, unw, wind);
    }

    fn rmdir(&self, frame: Frame, loc: Loc, xdata: Xdata, unw: Unwinder<ParentReply>) {
        let inode = loc.parent.clone();
        let gfid = loc.pargfid;
        let wind: WindFn<ParentReply> = Arc::new(move |child, frame, xdata, unw| {
            child.rmdir(frame, loc.clone(), xdata, unw)
        });
        self.replicate(frame, FopKind::Rmdir, inode, gfid, xdata, unw, wind);
    }

    fn symlink(&self, frame: Frame, target: OsString, loc: Loc, umask: u32, xdata: Xdata, unw: Unwinder<EntryReply>) {
        let inode = loc.parent.clone();
        let gfid = loc.pargfid;
        let wind: WindFn<EntryReply> = Arc::new(move |child, frame, xdata, unw| {
            child.symlink(frame, target.clone(), loc.clone(), umask, xdata, unw)
        });
        self.replicate(frame, FopKind::Symlink, inode, gfid, xdata, unw, wind);
    }

    fn rename(&self, frame: Frame, oldloc: Loc, newloc: Loc, xdata: Xdata, unw: Unwinder<crate::fop::Attr>) {
        let inode = oldloc.parent.clone();
        let gfid = oldloc.pargfid;
        let wind: WindFn<crate::fop::Attr> = Arc::new(move |child, frame, xdata, unw| {
            child.rename(frame, oldloc.clone(), newloc.clone(), xdata, unw)
        });
        self.replicate(frame, FopKind::Rename, inode, gfid, xdata, unw, wind);
    }

    fn link(&self, frame: Frame, oldloc: Loc, newloc: Loc, xdata: Xdata, unw: Unwinder<EntryReply>) {
        let inode = oldloc.inode.clone();
        let gfid = oldloc.gfid;
        let wind: WindFn<EntryReply> = Arc::new(move |child, frame, xdata, unw| {
            child.link(frame, oldloc.clone(), newloc.clone(), xdata, unw)
        });
        self.replicate(frame, FopKind::Link, inode, gfid, xdata, unw, wind);
    }

    fn create(
        &self,
        frame: Frame,
        loc: Loc,
        flags: crate::fop::OpenFlags,
        mode: u32,
        umask: u32,
        fd: Arc<Fd>,
        xdata: Xdata,
        unw: Unwinder<EntryReply>,
    ) {
        let inode = loc.parent.clone();
        let gfid = loc.pargfid;
        let wind: WindFn<EntryReply> = Arc::new(move |child, frame, xdata, unw| {
            child.create(frame, loc.clone(), flags, mode, umask, fd.clone(), xdata, unw)
        });
        self.replicate(frame, FopKind::Create, inode, gfid, xdata, unw, wind);
    }

    fn setxattr(&self, frame: Frame, loc: Loc, name: OsString, value: Vec<u8>, flags: i32, xdata: Xdata, unw: Unwinder<()>) {
        let inode = loc.inode.clone();
        let gfid = loc.gfid;
        let wind: WindFn<()> = Arc::new(move |child, frame, xdata, unw| {
            child.setxattr(frame, loc.clone(), name.clone(), value.clone(), flags, xdata, unw)
        });
        self.replicate(frame, FopKind::Setxattr, inode, gfid, xdata, unw, wind);
    }

    fn removexattr(&self, frame: Frame, loc: Loc, name: OsString, xdata: Xdata, unw: Unwinder<()>) {
        let inode = loc.inode.clone();
        let gfid = loc.gfid;
        let wind: WindFn<()> = Arc::new(move |child, frame, xdata, unw| {
            child.removexattr(frame, loc.clone(), name.clone(), xdata, unw)
        });
        self.replicate(frame, FopKind::Removexattr, inode, gfid, xdata, unw, wind);
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
        let inode = loc.inode.clone();
        let gfid = loc.gfid;
        let wind: WindFn<Vec<(OsString, Vec<u8>)>> = Arc::new(move |child, frame, xdata, unw| {
            child.xattrop(frame, loc.clone(), op, pairs.clone(), xdata, unw)
        });
        self.replicate(frame, FopKind::Xattrop, inode, gfid, xdata, unw, wind);
    }

    fn fallocate(&self, frame: Frame, fd: Arc<Fd>, mode: i32, offset: u64, len: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let inode = fd.inode().clone();
        let gfid = inode.gfid().unwrap_or_default();
        let wind: WindFn<PrePostReply> = Arc::new(move |child, frame, xdata, unw| {
            child.fallocate(frame, fd.clone(), mode, offset, len, xdata, unw)
        });
        self.replicate(frame, FopKind::Fallocate, Some(inode), gfid, xdata, unw, wind);
    }

    fn discard(&self, frame: Frame, fd: Arc<Fd>, offset: u64, len: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let inode = fd.inode().clone();
        let gfid = inode.gfid().unwrap_or_default();
        let wind: WindFn<PrePostReply> = Arc::new(move |child, frame, xdata, unw| {
            child.discard(frame, fd.clone(), offset, len, xdata, unw)
        });
        self.replicate(frame, FopKind::Discard, Some(inode), gfid, xdata, unw, wind);
    }

    fn zerofill(&self, frame: Frame, fd: Arc<Fd>, offset: u64, len: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let inode = fd.inode().clone();
        let gfid = inode.gfid().unwrap_or_default();
        let wind: WindFn<PrePostReply> = Arc::new(move |child, frame, xdata, unw| {
            child.zerofill(frame, fd.clone(), offset, len, xdata, unw)
        });
        self.replicate(frame, FopKind::Zerofill, Some(inode), gfid, xdata, unw, wind);
    }

    fn lk(&self, frame: Frame, fd: Arc<Fd>, cmd: LkCmd, lock: Flock, xdata: Xdata, unw: Unwinder<Flock>) {
        if cmd == LkCmd::Get {
            self.core.first_child().expect("has child").lk(frame, fd, cmd, lock, xdata, unw);
            return;
        }
        let inode = fd.inode().clone();
        let gfid = inode.gfid().unwrap_or_default();
        let is_unlock = lock.typ == LkType::Unlock;
        let fd2 = fd.clone();
        let wind: WindFn<Flock> = Arc::new(move |child, frame, xdata, unw| {
            child.lk(frame, fd.clone(), cmd, lock, xdata, unw)
        });
        let mut inverse_lock = lock;
        inverse_lock.typ = if is_unlock { LkType::Write } else { LkType::Unlock };
        let inverse: WindFn<Flock> = Arc::new(move |child, frame, xdata, unw| {
            child.lk(frame, fd2.clone(), LkCmd::Set, inverse_lock, xdata, unw)
        });
        self.dispatch_lock(frame, FopKind::Lk, Some(inode), gfid, is_unlock, xdata, unw, wind, inverse);
    }

    fn inodelk(&self, frame: Frame, volume: String, loc: Loc, cmd: LkCmd, lock: Flock, xdata: Xdata, unw: Unwinder<()>) {
        let inode = loc.inode.clone();
        let gfid = loc.gfid;
        let is_unlock = lock.typ == LkType::Unlock;
        let volume2 = volume.clone();
        let loc2 = loc.clone();
        let wind: WindFn<()> = Arc::new(move |child, frame, xdata, unw| {
            child.inodelk(frame, volume.clone(), loc.clone(), cmd, lock, xdata, unw)
        });
        let mut inverse_lock = lock;
        inverse_lock.typ = if is_unlock { LkType::Write } else { LkType::Unlock };
        let inverse: WindFn<()> = Arc::new(move |child, frame, xdata, unw| {
            child.inodelk(frame, volume2.clone(), loc2.clone(), LkCmd::Set, inverse_lock, xdata, unw)
        });
        self.dispatch_lock(frame, FopKind::Inodelk, inode, gfid, is_unlock, xdata, unw, wind, inverse);
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
        let inode = loc.inode.clone().or_else(|| loc.parent.clone());
        let gfid = if loc.gfid.is_null() { loc.pargfid } else { loc.gfid };
        let is_unlock = cmd == EntrylkCmd::Unlock;
        let volume2 = volume.clone();
        let loc2 = loc.clone();
        let basename2 = basename.clone();
        let wind: WindFn<()> = Arc::new(move |child, frame, xdata, unw| {
            child.entrylk(frame, volume.clone(), loc.clone(), basename.clone(), cmd, typ, xdata, unw)
        });
        let inverse_cmd = if is_unlock { EntrylkCmd::Lock } else { EntrylkCmd::Unlock };
        let inverse: WindFn<()> = Arc::new(move |child, frame, xdata, unw| {
            child.entrylk(
                frame,
                volume2.clone(),
                loc2.clone(),
                basename2.clone(),
                inverse_cmd,
                typ,
                xdata,
                unw,
            )
        });
        self.dispatch_lock(frame, FopKind::Entrylk, inode, gfid, is_unlock, xdata, unw, wind, inverse);
    }

    fn ipc(&self, _frame: Frame, op: i32, xdata: Xdata, unw: Unwinder<IpcReply>) {
        self.handle_ipc(op, xdata, unw);
    }
}

impl std::fmt::Debug for Jbr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jbr")
            .field("leader", &self.is_leader())
            .field("term", &self.current_term())
            .field("peers", &self.peer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests;
