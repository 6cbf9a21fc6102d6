use super::*;
use crate::options::Options;
use crate::storage::Storage;
use std::collections::HashMap as StdMap;
use std::os::fd::{FromRawFd, IntoRawFd};
use std::os::unix::net::UnixDatagram;
use std::path::Path;

/// Drives the bridge the way the kernel would: writes request datagrams,
/// reads reply datagrams.
struct KernelSide {
    sock: UnixDatagram,
    unique: u64,
}

impl KernelSide {
    fn send(&mut self, opcode: Opcode, nodeid: u64, body: &[u8]) -> u64 {
        self.unique += 1;
        let header = abi::fuse_in_header {
            len: (size_of::<abi::fuse_in_header>() + body.len()) as u32,
            opcode: opcode as u32,
            unique: self.unique,
            nodeid,
            uid: 1000,
            gid: 1000,
            pid: 4242,
            padding: 0,
        };
        let mut frame = header.as_bytes().to_vec();
        frame.extend_from_slice(body);
        self.sock.send(&frame).unwrap();
        self.unique
    }

    fn recv(&mut self) -> (abi::fuse_out_header, Vec<u8>) {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let n = self.sock.recv(&mut buf).unwrap();
        let (header, body) = abi::fuse_out_header::read_from_prefix(&buf[..n]).unwrap();
        (header, body.to_vec())
    }

    /// Round trip expecting success; returns the reply body.
    fn call(&mut self, opcode: Opcode, nodeid: u64, body: &[u8]) -> Vec<u8> {
        let unique = self.send(opcode, nodeid, body);
        let (header, reply) = self.recv();
        assert_eq!(header.unique, unique, "reply out of order");
        assert_eq!(header.error, 0, "unexpected errno {} for {opcode:?}", header.error);
        reply
    }

    fn call_err(&mut self, opcode: Opcode, nodeid: u64, body: &[u8]) -> i32 {
        let unique = self.send(opcode, nodeid, body);
        let (header, _) = self.recv();
        assert_eq!(header.unique, unique);
        assert!(header.error < 0, "expected an error for {opcode:?}");
        -header.error
    }

    fn init(&mut self) {
        let arg = abi::fuse_init_in {
            major: abi::FUSE_KERNEL_VERSION,
            minor: abi::FUSE_KERNEL_MINOR_VERSION,
            max_readahead: 128 * 1024,
            flags: abi::FUSE_ASYNC_READ | abi::FUSE_BIG_WRITES | abi::FUSE_POSIX_LOCKS,
        };
        let reply = self.call(Opcode::FUSE_INIT, 0, arg.as_bytes());
        let (out, _) = abi::fuse_init_out::read_from_prefix(&reply).unwrap();
        assert_eq!(out.major, abi::FUSE_KERNEL_VERSION);
        assert_eq!(out.minor, abi::FUSE_KERNEL_MINOR_VERSION);
        assert!(out.max_write >= 64 * 1024);
    }

    fn lookup(&mut self, parent: u64, name: &str) -> abi::fuse_entry_out {
        let mut body = name.as_bytes().to_vec();
        body.push(0);
        let reply = self.call(Opcode::FUSE_LOOKUP, parent, &body);
        let (entry, _) = abi::fuse_entry_out::read_from_prefix(&reply).unwrap();
        entry
    }

    fn open(&mut self, nodeid: u64, flags: u32) -> u64 {
        let arg = abi::fuse_open_in { flags, open_flags: 0 };
        let reply = self.call(Opcode::FUSE_OPEN, nodeid, arg.as_bytes());
        let (out, _) = abi::fuse_open_out::read_from_prefix(&reply).unwrap();
        out.fh
    }
}

fn rig(export: &Path) -> (KernelSide, Arc<FuseBridge>, Arc<Graph>) {
    let mut raw = StdMap::new();
    raw.insert("export".to_string(), export.to_str().unwrap().to_string());
    let storage_opts = Options::validate(Storage::option_table(), &raw).unwrap();
    let storage = Storage::new("posix", &storage_opts);

    let mut raw = StdMap::new();
    raw.insert("worker-threads".to_string(), "2".to_string());
    raw.insert("resolve-gids".to_string(), "off".to_string());
    raw.insert("special-xattr-pids".to_string(), "4242".to_string());
    let bridge_opts = Options::validate(FuseBridge::option_table(), &raw).unwrap();
    let bridge = FuseBridge::new("fuse", &bridge_opts, storage);
    let graph = Arc::new(Graph::assemble(bridge.clone()).unwrap());

    let (kernel_sock, device_sock) = UnixDatagram::pair().unwrap();
    kernel_sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let device = unsafe { OwnedFd::from_raw_fd(device_sock.into_raw_fd()) };
    bridge.serve(&graph, device).unwrap();

    (KernelSide { sock: kernel_sock, unique: 0 }, bridge, graph)
}

#[test]
fn requests_before_init_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (mut kernel, _bridge, _graph) = rig(dir.path());
    let arg = abi::fuse_getattr_in { getattr_flags: 0, dummy: 0, fh: 0 };
    let errno = kernel.call_err(Opcode::FUSE_GETATTR, 1, arg.as_bytes());
    assert_eq!(errno, libc::EIO);
    kernel.init();
}

#[test]
fn lookup_assigns_nodeid_and_counts_lookups() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"hello").unwrap();
    let (mut kernel, bridge, graph) = rig(dir.path());
    kernel.init();

    let entry = kernel.lookup(1, "a");
    assert!(entry.nodeid > 1, "fresh nodeid expected");
    assert!(entry.generation > 0);
    assert_eq!(entry.attr.size, 5);

    // A second lookup reuses the nodeid and bumps the count.
    let again = kernel.lookup(1, "a");
    assert_eq!(again.nodeid, entry.nodeid);
    let inode = bridge.nodes.get(entry.nodeid).unwrap();
    assert_eq!(inode.nlookup(), 2);

    // GETATTR by the assigned nodeid resolves through the dentry graph.
    let arg = abi::fuse_getattr_in { getattr_flags: 0, dummy: 0, fh: 0 };
    let reply = kernel.call(Opcode::FUSE_GETATTR, entry.nodeid, arg.as_bytes());
    let (out, _) = abi::fuse_attr_out::read_from_prefix(&reply).unwrap();
    assert_eq!(out.attr.size, 5);

    // FORGET far beyond the count saturates at zero and unbinds the nodeid.
    let forget = abi::fuse_forget_in { nlookup: 100 };
    kernel.send(Opcode::FUSE_FORGET, entry.nodeid, forget.as_bytes());
    // FORGET has no reply; prove it took effect through the next request.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let arg = abi::fuse_getattr_in { getattr_flags: 0, dummy: 0, fh: 0 };
        let errno = kernel.call_err(Opcode::FUSE_GETATTR, entry.nodeid, arg.as_bytes());
        if errno == libc::ESTALE {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "forget never applied");
    }
    let _ = graph;
}

#[test]
fn lookup_of_missing_name_is_enoent() {
    let dir = tempfile::tempdir().unwrap();
    let (mut kernel, _bridge, _graph) = rig(dir.path());
    kernel.init();
    let mut body = b"nope".to_vec();
    body.push(0);
    assert_eq!(kernel.call_err(Opcode::FUSE_LOOKUP, 1, &body), libc::ENOENT);
}

#[test]
fn create_write_read_release_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (mut kernel, _bridge, _graph) = rig(dir.path());
    kernel.init();

    // CREATE returns entry + open handle in one reply.
    let arg = abi::fuse_create_in {
        flags: libc::O_RDWR as u32,
        mode: 0o644,
        umask: 0,
        open_flags: 0,
    };
    let mut body = arg.as_bytes().to_vec();
    body.extend_from_slice(b"file.txt\0");
    let reply = kernel.call(Opcode::FUSE_CREATE, 1, &body);
    let (entry, rest) = abi::fuse_entry_out::read_from_prefix(&reply).unwrap();
    let (open, _) = abi::fuse_open_out::read_from_prefix(rest).unwrap();
    assert!(entry.nodeid > 1);
    let fh = open.fh;

    // WRITE then READ the same range.
    let data = b"stacked bytes";
    let warg = abi::fuse_write_in {
        fh,
        offset: 0,
        size: data.len() as u32,
        write_flags: 0,
        lock_owner: 0,
        flags: 0,
        padding: 0,
    };
    let mut body = warg.as_bytes().to_vec();
    body.extend_from_slice(data);
    let reply = kernel.call(Opcode::FUSE_WRITE, entry.nodeid, &body);
    let (wout, _) = abi::fuse_write_out::read_from_prefix(&reply).unwrap();
    assert_eq!(wout.size as usize, data.len());

    let rarg = abi::fuse_read_in {
        fh,
        offset: 0,
        size: 64,
        read_flags: 0,
        lock_owner: 0,
        flags: 0,
        padding: 0,
    };
    let reply = kernel.call(Opcode::FUSE_READ, entry.nodeid, rarg.as_bytes());
    assert_eq!(&reply, data);

    let rel = abi::fuse_release_in { fh, flags: 0, release_flags: 0, lock_owner: 0 };
    kernel.call(Opcode::FUSE_RELEASE, entry.nodeid, rel.as_bytes());

    // The file landed in the export directory.
    assert_eq!(std::fs::read(dir.path().join("file.txt")).unwrap(), data);
}

#[test]
fn readdir_returns_padded_dirents() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("one"), b"1").unwrap();
    std::fs::write(dir.path().join("two"), b"2").unwrap();
    let (mut kernel, _bridge, _graph) = rig(dir.path());
    kernel.init();

    let reply = kernel.call(Opcode::FUSE_OPENDIR, 1, abi::fuse_open_in { flags: 0, open_flags: 0 }.as_bytes());
    let (open, _) = abi::fuse_open_out::read_from_prefix(&reply).unwrap();

    let rarg = abi::fuse_read_in {
        fh: open.fh,
        offset: 0,
        size: 4096,
        read_flags: 0,
        lock_owner: 0,
        flags: 0,
        padding: 0,
    };
    let reply = kernel.call(Opcode::FUSE_READDIR, 1, rarg.as_bytes());
    let mut names = Vec::new();
    let mut at = 0usize;
    while at + size_of::<abi::fuse_dirent>() <= reply.len() {
        let (dirent, _) = abi::fuse_dirent::read_from_prefix(&reply[at..]).unwrap();
        let name_at = at + size_of::<abi::fuse_dirent>();
        let name = &reply[name_at..name_at + dirent.namelen as usize];
        names.push(String::from_utf8_lossy(name).into_owned());
        let record = size_of::<abi::fuse_dirent>() + dirent.namelen as usize;
        at += record.div_ceil(abi::FUSE_DIRENT_ALIGN) * abi::FUSE_DIRENT_ALIGN;
    }
    names.sort();
    assert_eq!(names, ["one", "two"]);
}

#[test]
fn mkdir_and_rmdir_update_the_dentry_graph() {
    let dir = tempfile::tempdir().unwrap();
    let (mut kernel, bridge, _graph) = rig(dir.path());
    kernel.init();

    let arg = abi::fuse_mkdir_in { mode: 0o755, umask: 0 };
    let mut body = arg.as_bytes().to_vec();
    body.extend_from_slice(b"sub\0");
    let reply = kernel.call(Opcode::FUSE_MKDIR, 1, &body);
    let (entry, _) = abi::fuse_entry_out::read_from_prefix(&reply).unwrap();
    assert!(dir.path().join("sub").is_dir());
    assert!(bridge.itable.lookup_child(Gfid::ROOT, OsStr::new("sub")).is_some());

    kernel.call(Opcode::FUSE_RMDIR, 1, b"sub\0");
    assert!(!dir.path().join("sub").exists());
    assert!(bridge.itable.lookup_child(Gfid::ROOT, OsStr::new("sub")).is_none());
    let _ = entry;
}

#[test]
fn interrupt_is_never_answered() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"x").unwrap();
    let (mut kernel, _bridge, _graph) = rig(dir.path());
    kernel.init();

    // INTERRUPT for an unknown request produces no reply; the next reply on
    // the wire must belong to the following request.
    let arg = abi::fuse_interrupt_in { unique: 9999 };
    kernel.send(Opcode::FUSE_INTERRUPT, 0, arg.as_bytes());
    let entry = kernel.lookup(1, "a");
    assert!(entry.nodeid > 1);
}

#[test]
fn statfs_reports_the_export() {
    let dir = tempfile::tempdir().unwrap();
    let (mut kernel, _bridge, _graph) = rig(dir.path());
    kernel.init();
    let reply = kernel.call(Opcode::FUSE_STATFS, 1, &[]);
    let (out, _) = abi::fuse_statfs_out::read_from_prefix(&reply).unwrap();
    assert!(out.st.bsize > 0);
    assert!(out.st.blocks > 0);
}

#[test]
fn record_locks_via_setlk_and_getlk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"data").unwrap();
    let (mut kernel, _bridge, _graph) = rig(dir.path());
    kernel.init();

    let entry = kernel.lookup(1, "a");
    let fh = kernel.open(entry.nodeid, libc::O_RDWR as u32);

    let setlk = abi::fuse_lk_in {
        fh,
        owner: 0x1111,
        lk: abi::fuse_file_lock {
            start: 0,
            end: 99,
            typ: libc::F_WRLCK as u32,
            pid: 4242,
        },
        lk_flags: 0,
        padding: 0,
    };
    kernel.call(Opcode::FUSE_SETLK, entry.nodeid, setlk.as_bytes());

    // A different owner probing the range sees the write lock.
    let getlk = abi::fuse_lk_in {
        fh,
        owner: 0x2222,
        lk: abi::fuse_file_lock {
            start: 50,
            end: 60,
            typ: libc::F_RDLCK as u32,
            pid: 4243,
        },
        lk_flags: 0,
        padding: 0,
    };
    let reply = kernel.call(Opcode::FUSE_GETLK, entry.nodeid, getlk.as_bytes());
    let (out, _) = abi::fuse_lk_out::read_from_prefix(&reply).unwrap();
    assert_eq!(out.lk.typ, libc::F_WRLCK as u32);
}

#[test]
fn xattr_namespace_policy() {
    let dir = tempfile::tempdir().unwrap();
    let (_kernel, bridge, _graph) = rig(dir.path());

    // Special pid (4242 per rig options): system.* flips to trusted.*.
    let flipped = bridge.xattr_name(4242, OsStr::new("system.posix_acl")).unwrap();
    assert_eq!(flipped, OsString::from("trusted.posix_acl"));

    // Ordinary pid keeps the namespace.
    let kept = bridge.xattr_name(1, OsStr::new("system.posix_acl")).unwrap();
    assert_eq!(kept, OsString::from("system.posix_acl"));

    // Outside the allow-list nothing crosses.
    assert_eq!(
        bridge.xattr_name(1, OsStr::new("vendor.private")).unwrap_err(),
        Errno::EOPNOTSUPP
    );
}

#[test]
fn invalidations_surface_as_kernel_notifies() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"x").unwrap();
    let (mut kernel, bridge, _graph) = rig(dir.path());
    kernel.init();
    let entry = kernel.lookup(1, "a");

    let gfid = bridge.nodes.get(entry.nodeid).unwrap().gfid().unwrap();
    bridge.notify(&Event::InvalInode { gfid });

    let (header, body) = kernel.recv();
    assert_eq!(header.unique, 0);
    assert_eq!(header.error, abi::FUSE_NOTIFY_INVAL_INODE);
    let (inval, _) = abi::fuse_notify_inval_inode_out::read_from_prefix(&body).unwrap();
    assert_eq!(inval.ino, entry.nodeid);
}
