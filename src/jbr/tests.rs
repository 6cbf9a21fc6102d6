use super::*;
use crate::fop::{Attr, OpenFlags, ReadReply};
use crate::itable::InodeTable;
use crate::xlator::Graph;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;

/// In-memory replica stub: applies writes, grants locks, and can be driven
/// up/down or made to fail specific fops.
struct MockReplica {
    core: XlCore,
    initially_up: bool,
    writes: Mutex<Vec<(u64, usize, Xdata)>>,
    locks: Mutex<Vec<Flock>>,
    fail_writes: AtomicBool,
    fail_unlocks: AtomicBool,
    fsyncs: AtomicUsize,
}

impl MockReplica {
    fn new(name: &str, initially_up: bool) -> Arc<MockReplica> {
        Arc::new(MockReplica {
            core: XlCore::new(name, vec![]),
            initially_up,
            writes: Mutex::new(Vec::new()),
            locks: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_unlocks: AtomicBool::new(false),
            fsyncs: AtomicUsize::new(0),
        })
    }

    fn set_up(&self, up: bool) {
        let event = if up { Event::ChildUp(0) } else { Event::ChildDown(0) };
        self.core.emit_upward(&event);
    }

    fn attr() -> Attr {
        Attr::synthetic_dir(Gfid::ROOT)
    }
}

impl Xlator for MockReplica {
    fn core(&self) -> &XlCore {
        &self.core
    }

    fn notify(&self, event: &Event) {
        if matches!(event, Event::ParentUp) && self.initially_up {
            self.core.emit_upward(&Event::ChildUp(0));
        }
    }

    fn writev(
        &self,
        _frame: Frame,
        _fd: Arc<Fd>,
        payload: Payload,
        offset: u64,
        _flags: u32,
        xdata: Xdata,
        unw: Unwinder<WriteReply>,
    ) {
        if self.fail_writes.load(Ordering::SeqCst) {
            unw.errno(Errno::ENOTCONN);
            return;
        }
        self.writes.lock().push((offset, payload.len(), xdata));
        let attr = Self::attr();
        unw.okay(WriteReply { count: payload.len(), pre: attr, post: attr, xdata: Xdata::new() });
    }

    fn readv(
        &self,
        _frame: Frame,
        _fd: Arc<Fd>,
        size: usize,
        _offset: u64,
        _flags: u32,
        _xdata: Xdata,
        unw: Unwinder<ReadReply>,
    ) {
        unw.okay(ReadReply {
            payload: Payload::from_vec(vec![0u8; size]),
            attr: Self::attr(),
            xdata: Xdata::new(),
        });
    }

    fn lk(
        &self,
        _frame: Frame,
        _fd: Arc<Fd>,
        _cmd: LkCmd,
        lock: Flock,
        _xdata: Xdata,
        unw: Unwinder<Flock>,
    ) {
        match lock.typ {
            LkType::Unlock => {
                if self.fail_unlocks.load(Ordering::SeqCst) {
                    unw.errno(Errno::ENOTCONN);
                    return;
                }
                self.locks.lock().retain(|held| {
                    !(held.owner == lock.owner && held.start == lock.start && held.end == lock.end)
                });
            }
            _ => self.locks.lock().push(lock),
        }
        unw.okay(lock);
    }

    fn fsync(&self, _frame: Frame, _fd: Arc<Fd>, _datasync: bool, unw: Unwinder<PrePostReply>) {
        self.fsyncs.fetch_add(1, Ordering::SeqCst);
        let attr = Self::attr();
        unw.okay(PrePostReply { pre: attr, post: attr });
    }
}

/// Parent that records availability events coming up from jbr.
struct Watcher {
    core: XlCore,
    events: Mutex<Vec<(bool, usize)>>,
}

impl Xlator for Watcher {
    fn core(&self) -> &XlCore {
        &self.core
    }

    fn notify(&self, event: &Event) {
        match event {
            Event::ChildUp(idx) => self.events.lock().push((true, *idx)),
            Event::ChildDown(idx) => self.events.lock().push((false, *idx)),
            other => {
                for child in self.core.children() {
                    child.notify(other);
                }
            }
        }
    }
}

struct Rig {
    _graph: Graph,
    jbr: Arc<Jbr>,
    local: Arc<MockReplica>,
    peers: Vec<Arc<MockReplica>>,
    watcher: Arc<Watcher>,
    _term_dir: tempfile::TempDir,
}

fn rig(peer_count: usize, config_leader: bool, quorum_pct: &str) -> Rig {
    let term_dir = tempfile::tempdir().unwrap();
    let local = MockReplica::new("local", true);
    let peers: Vec<_> =
        (0..peer_count).map(|i| MockReplica::new(&format!("peer{i}"), true)).collect();
    let mut children: Vec<Arc<dyn Xlator>> = vec![local.clone()];
    children.extend(peers.iter().map(|p| p.clone() as Arc<dyn Xlator>));

    let mut raw = HashMap::new();
    raw.insert("config-leader".to_string(), if config_leader { "on" } else { "off" }.to_string());
    raw.insert("quorum-pct".to_string(), quorum_pct.to_string());
    raw.insert("term-dir".to_string(), term_dir.path().to_str().unwrap().to_string());
    raw.insert("flush-interval".to_string(), "3600".to_string());
    let opts = Options::validate(Jbr::option_table(), &raw).unwrap();
    let jbr = Jbr::new("jbr", &opts, children).unwrap();
    let watcher = Arc::new(Watcher {
        core: XlCore::new("watcher", vec![jbr.clone()]),
        events: Mutex::new(Vec::new()),
    });
    let graph = Graph::assemble(watcher.clone()).unwrap();
    Rig { _graph: graph, jbr, local, peers, watcher, _term_dir: term_dir }
}

fn test_fd() -> Arc<Fd> {
    let table = InodeTable::new();
    let inode = table.new_unlinked();
    inode.set_gfid(Gfid::from_parts(0xaa, 0xbb));
    Fd::new(inode, OpenFlags::RDWR, 1)
}

fn write(rig: &Rig, fd: &Arc<Fd>, xdata: Xdata) -> FopResult<WriteReply> {
    let call = SyncCall::<WriteReply>::new();
    rig.jbr.writev(
        Frame::internal(),
        fd.clone(),
        Payload::from_vec(vec![7u8; 64]),
        0,
        0,
        xdata,
        call.unwinder(Frame::internal(), FopKind::Writev),
    );
    call.wait_timeout(Duration::from_secs(5))
}

fn set_lk(rig: &Rig, fd: &Arc<Fd>, typ: LkType) -> FopResult<Flock> {
    let lock = Flock {
        typ,
        start: 0,
        end: 1023,
        pid: 1,
        owner: crate::stack::LockOwner::from_kernel(0x77),
    };
    let call = SyncCall::<Flock>::new();
    rig.jbr.lk(
        Frame::internal(),
        fd.clone(),
        LkCmd::Set,
        lock,
        Xdata::new(),
        call.unwinder(Frame::internal(), FopKind::Lk),
    );
    call.wait_timeout(Duration::from_secs(5))
}

#[test]
fn leader_write_commits_with_quorum_and_journals() {
    let rig = rig(2, true, "50");
    let fd = test_fd();
    let reply = write(&rig, &fd, Xdata::new()).unwrap();
    assert_eq!(reply.count, 64);

    // Both peers saw the write, stamped with the leader's term.
    for peer in &rig.peers {
        let writes = peer.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].2.get_u64(XKey::LeaderTerm), Some(1));
    }
    assert_eq!(rig.local.writes.lock().len(), 1);

    // One committed record in TERM.1.
    let mut reader = rig.jbr.term_log().open(1).unwrap();
    let entry = reader.next_entry().unwrap();
    assert_eq!(&entry[..2], termlog::COMMIT_PREFIX);
    assert_eq!(reader.next_entry(), Err(Errno::ENODATA));
    assert_eq!(rig.jbr.term_log().committed_count(1).unwrap(), 1);
}

#[test]
fn non_leader_rejects_unstamped_but_applies_stamped() {
    let rig = rig(1, false, "50");
    let fd = test_fd();

    assert_eq!(write(&rig, &fd, Xdata::new()).unwrap_err(), Errno::EREMOTE);
    assert!(rig.local.writes.lock().is_empty());

    // Leader-stamped: applied locally only, journaled under the stamp term.
    let mut stamped = Xdata::new();
    stamped.set_u64(XKey::LeaderTerm, 4);
    write(&rig, &fd, stamped).unwrap();
    assert_eq!(rig.local.writes.lock().len(), 1);
    assert!(rig.peers[0].writes.lock().is_empty());
    assert_eq!(rig.jbr.term_log().committed_count(4).unwrap(), 1);

    // Reconciler-stamped requests are also allowed through.
    let mut recon = Xdata::new();
    recon.set_flag(XKey::Reconciler);
    write(&rig, &fd, recon).unwrap();
    assert_eq!(rig.local.writes.lock().len(), 2);
}

#[test]
fn write_quorum_loss_returns_erofs() {
    let rig = rig(2, true, "50");
    let fd = test_fd();
    // One of two peers failing leaves one ack: 1 > 1.0 is false.
    rig.peers[1].fail_writes.store(true, Ordering::SeqCst);
    assert_eq!(write(&rig, &fd, Xdata::new()).unwrap_err(), Errno::EROFS);
}

#[test]
fn unlock_quorum_loss_rolls_back_followers() {
    let rig = rig(2, true, "50");
    let fd = test_fd();

    // Acquire: local first, then both peers.
    set_lk(&rig, &fd, LkType::Write).unwrap();
    assert_eq!(rig.local.locks.lock().len(), 1);
    assert_eq!(rig.peers[0].locks.lock().len(), 1);
    assert_eq!(rig.peers[1].locks.lock().len(), 1);

    // Release with one follower down: quorum (2 of 2 peers) not met.
    rig.peers[1].fail_unlocks.store(true, Ordering::SeqCst);
    assert_eq!(set_lk(&rig, &fd, LkType::Unlock).unwrap_err(), Errno::EROFS);

    // The follower that released was re-locked; the leader never released.
    assert_eq!(rig.peers[0].locks.lock().len(), 1);
    assert_eq!(rig.local.locks.lock().len(), 1);
}

#[test]
fn failed_acquire_unlocks_local_again() {
    let rig = rig(2, true, "100");
    let fd = test_fd();
    // 100%: strictly more than 2 acks can never happen with 2 peers failing
    // one; make one peer reject lock grants by failing its writes path via
    // unlock flag reuse is not applicable, so fail both by dropping a peer.
    rig.peers[0].fail_unlocks.store(false, Ordering::SeqCst);
    // With quorum-pct 100 both peers must ack and "strictly more than 2" is
    // impossible, so every acquire rolls back.
    assert_eq!(set_lk(&rig, &fd, LkType::Write).unwrap_err(), Errno::EROFS);
    assert!(rig.local.locks.lock().is_empty(), "local lock rolled back");
}

#[test]
fn conflicting_ops_serialize_per_inode() {
    let rig = rig(1, true, "0");
    let fd = test_fd();
    let queue = rig.jbr.queue_of(fd.inode());

    // Occupy the active slot directly, then submit a write: it must park.
    let gate = queue.admit(Stub::new(FopKind::Writev, || {})).expect("admitted");
    gate.resume();

    let call = SyncCall::<WriteReply>::new();
    rig.jbr.writev(
        Frame::internal(),
        fd.clone(),
        Payload::from_vec(vec![1u8; 8]),
        0,
        0,
        Xdata::new(),
        call.unwinder(Frame::internal(), FopKind::Writev),
    );
    assert_eq!(queue.pending_len(), 1);
    assert!(rig.local.writes.lock().is_empty());

    // Completing the occupant resumes the parked write.
    if let Some(next) = queue.leave() {
        next.resume();
    }
    call.wait_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(rig.local.writes.lock().len(), 1);
}

#[test]
fn two_replica_takeover_and_stepdown() {
    let rig = rig(1, false, "50");
    assert!(!rig.jbr.is_leader());
    let term_before = rig.jbr.current_term();

    rig.peers[0].set_up(false);
    assert!(rig.jbr.is_leader(), "survivor assumes leadership");
    assert_eq!(rig.jbr.current_term(), term_before + 1);

    rig.peers[0].set_up(true);
    assert!(!rig.jbr.is_leader(), "steps down when the config leader returns");
}

#[test]
fn child_up_propagates_only_with_quorum() {
    let rig = rig(2, true, "50");
    // Assembly brought everything up: the watcher saw one CHILD_UP.
    let ups: Vec<_> = rig.watcher.events.lock().clone();
    assert_eq!(ups.iter().filter(|(up, _)| *up).count(), 1);

    // Losing one peer of two drops quorum (need strictly more than 1).
    rig.peers[0].set_up(false);
    let events = rig.watcher.events.lock().clone();
    assert_eq!(events.last(), Some(&(false, 0)));

    // Recovery re-raises exactly one CHILD_UP.
    rig.peers[0].set_up(true);
    let events = rig.watcher.events.lock().clone();
    assert_eq!(events.last(), Some(&(true, 0)));
    // Duplicate notifications are filtered.
    rig.peers[0].set_up(true);
    assert_eq!(rig.watcher.events.lock().len(), events.len());
}

#[test]
fn reconciliation_ipc_walks_the_term_log() {
    let rig = rig(1, true, "0");
    let fd = test_fd();
    write(&rig, &fd, Xdata::new()).unwrap();
    write(&rig, &fd, Xdata::new()).unwrap();

    let ipc = |op: i32, xdata: Xdata| {
        let call = SyncCall::<IpcReply>::new();
        rig.jbr.ipc(Frame::internal(), op, xdata, call.unwinder(Frame::internal(), FopKind::Ipc));
        call.wait_timeout(Duration::from_secs(5))
    };

    let range = ipc(JBR_IPC_TERM_RANGE, Xdata::new()).unwrap();
    assert_eq!(range.xdata.get_u64(XKey::TermFirst), Some(1));
    assert_eq!(range.xdata.get_u64(XKey::TermLast), Some(1));

    let mut open = Xdata::new();
    open.set_u64(XKey::TermNumber, 1);
    ipc(JBR_IPC_OPEN_TERM, open).unwrap();

    let first = ipc(JBR_IPC_NEXT_ENTRY, Xdata::new()).unwrap();
    let entry = first.xdata.get(XKey::TermEntry).and_then(XVal::as_bytes).unwrap().to_vec();
    assert_eq!(entry.len(), termlog::ENTRY_SIZE);
    assert_eq!(&entry[..2], termlog::COMMIT_PREFIX);

    ipc(JBR_IPC_NEXT_ENTRY, Xdata::new()).unwrap();
    assert_eq!(ipc(JBR_IPC_NEXT_ENTRY, Xdata::new()).unwrap_err(), Errno::ENODATA);

    // Opening without a term number is invalid.
    assert_eq!(ipc(JBR_IPC_OPEN_TERM, Xdata::new()).unwrap_err(), Errno::EINVAL);
}

#[test]
fn background_flush_syncs_dirty_fds() {
    let term_dir = tempfile::tempdir().unwrap();
    let local = MockReplica::new("local", true);
    let mut raw = HashMap::new();
    raw.insert("config-leader".to_string(), "on".to_string());
    raw.insert("quorum-pct".to_string(), "0".to_string());
    raw.insert("term-dir".to_string(), term_dir.path().to_str().unwrap().to_string());
    raw.insert("flush-interval".to_string(), "1".to_string());
    let opts = Options::validate(Jbr::option_table(), &raw).unwrap();
    let jbr = Jbr::new("jbr", &opts, vec![local.clone()]).unwrap();
    let graph = Graph::assemble(jbr.clone()).unwrap();

    let fd = test_fd();
    let call = SyncCall::<WriteReply>::new();
    jbr.writev(
        Frame::internal(),
        fd,
        Payload::from_vec(vec![1u8; 16]),
        0,
        0,
        Xdata::new(),
        call.unwinder(Frame::internal(), FopKind::Writev),
    );
    call.wait().unwrap();

    // The 1-second sweep fsyncs the dirty fd through the local child.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while local.fsyncs.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert!(local.fsyncs.load(Ordering::SeqCst) >= 1);
    graph.teardown();
}
