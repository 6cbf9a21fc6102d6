//! Full-file disk cache translator.
//!
//! Read data is mirrored into per-gfid backing files under a local cache
//! directory; repeated reads are served with `pread` against the backing fd
//! and the cached attribute snapshot, skipping the round trip entirely. The
//! extent map of mirrored regions is persisted to an xattr on the backing
//! file at flush time and restored on open. A background sweeper enforces a
//! disk-reserve admission policy and evicts idle files.

pub mod extent;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::errno::Errno;
use crate::fdtable::Fd;
use crate::fop::{
    Attr, EntryReply, Loc, OpenFlags, Payload, PrePostReply, ReadReply, WriteReply,
};
use crate::itable::Inode;
use crate::options::{OptSpec, OptType, Options};
use crate::stack::{Frame, Unwinder};
use crate::xdata::Xdata;
use crate::xlator::{XlCore, Xlator};

use extent::ExtentMap;

const OPTIONS: &[OptSpec] = &[
    OptSpec { key: "cache-dir", typ: OptType::Path, default: "/var/cache/stackfs", desc: "backing store directory" },
    OptSpec { key: "disk-reserve", typ: OptType::Percent, default: "10", desc: "stop inserting when free space falls below this" },
    OptSpec { key: "filters", typ: OptType::StrList, default: "", desc: "up to three path globs eligible for caching; empty caches everything" },
    OptSpec {
        key: "idle-timeout",
        typ: OptType::Int { min: 1, max: 86400 },
        default: "300",
        desc: "seconds of inactivity before a cached file is evicted",
    },
    OptSpec {
        key: "sweep-interval",
        typ: OptType::Int { min: 1, max: 3600 },
        default: "15",
        desc: "seconds between admission-control sweeps",
    },
];

/// Xattr on the backing file holding the serialized extent map.
const EXTENT_XATTR: &str = "user.stackfs.extents";
/// Idle sweeps happen once per this many reserve checks.
const IDLE_SWEEP_CYCLE: u64 = 10;
const MAX_FILTERS: usize = 3;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Per-inode cache state, hung off the inode's context slot.
struct FscInode {
    local_path: PathBuf,
    backing: Mutex<Option<Arc<File>>>,
    extents: Mutex<ExtentMap>,
    attr: Mutex<Option<Attr>>,
    direct: AtomicBool,
    last_use: AtomicU64,
}

impl FscInode {
    fn touch(&self) {
        self.last_use.store(now_secs(), Ordering::Relaxed);
    }

    fn backing_file(&self) -> Option<Arc<File>> {
        self.backing.lock().clone()
    }

    /// Open (or create) the backing file and restore its extent map.
    fn ensure_backing(&self) -> Result<Arc<File>, Errno> {
        let mut slot = self.backing.lock();
        if let Some(file) = slot.as_ref() {
            return Ok(file.clone());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.local_path)
            .map_err(Errno::from)?;
        let file = Arc::new(file);
        if let Some(saved) = fgetxattr(&file, EXTENT_XATTR) {
            let map = ExtentMap::parse(&String::from_utf8_lossy(&saved));
            debug!("restored {} cached extents for {:?}", map.extents().len(), self.local_path);
            *self.extents.lock() = map;
        }
        *slot = Some(file.clone());
        Ok(file)
    }

    fn persist_extents(&self) {
        if let Some(file) = self.backing_file() {
            let text = self.extents.lock().serialize();
            if let Err(err) = fsetxattr(&file, EXTENT_XATTR, text.as_bytes()) {
                warn!("failed to persist extent map for {:?}: {err}", self.local_path);
            }
        }
    }

    fn evict(&self) {
        self.persist_extents();
        *self.backing.lock() = None;
        self.direct.store(false, Ordering::Relaxed);
    }
}

/// State shared with the sweeper thread.
struct SweepState {
    cache_dir: PathBuf,
    reserve_pct: f64,
    idle_timeout: u64,
    /// Admission closed: reads still hit existing extents, inserts bypass.
    full: AtomicBool,
    registry: Mutex<Vec<std::sync::Weak<FscInode>>>,
}

impl SweepState {
    fn run_sweep(&self, cycle: u64) {
        match nix::sys::statvfs::statvfs(&self.cache_dir) {
            Ok(vfs) => {
                let total = vfs.blocks() as u128 * vfs.fragment_size() as u128;
                let free = vfs.blocks_available() as u128 * vfs.fragment_size() as u128;
                let was_full = self.full.load(Ordering::Relaxed);
                let now_full = total > 0 && free <= total * self.reserve_pct as u128 / 100;
                if was_full != now_full {
                    info!(
                        "fs-cache admission {} (free {} of {})",
                        if now_full { "closed" } else { "open" },
                        free,
                        total
                    );
                    self.full.store(now_full, Ordering::Relaxed);
                }
            }
            Err(err) => warn!("statvfs of cache dir failed: {err}"),
        }

        if cycle % IDLE_SWEEP_CYCLE == 0 {
            let cutoff = now_secs().saturating_sub(self.idle_timeout);
            let mut registry = self.registry.lock();
            registry.retain(|weak| match weak.upgrade() {
                Some(ctx) => {
                    if ctx.last_use.load(Ordering::Relaxed) < cutoff
                        && ctx.backing_file().is_some()
                    {
                        debug!("evicting idle cached file {:?}", ctx.local_path);
                        ctx.evict();
                    }
                    true
                }
                None => false,
            });
        }
    }
}

/// The fs-cache translator.
pub struct FsCache {
    core: XlCore,
    filters: Vec<String>,
    sweep_interval: u64,
    sweep: Arc<SweepState>,
    stop: Arc<AtomicBool>,
    sweeper: Mutex<Option<thread::JoinHandle<()>>>,
}

impl FsCache {
    pub fn new(name: &str, options: &Options, child: Arc<dyn Xlator>) -> Arc<FsCache> {
        let mut filters: Vec<String> = options.get_list("filters").to_vec();
        if filters.len() > MAX_FILTERS {
            warn!("fs-cache: keeping only the first {MAX_FILTERS} filters");
            filters.truncate(MAX_FILTERS);
        }
        Arc::new(FsCache {
            core: XlCore::new(name, vec![child]),
            filters,
            sweep_interval: options.get_int("sweep-interval") as u64,
            sweep: Arc::new(SweepState {
                cache_dir: PathBuf::from(options.get_str("cache-dir")),
                reserve_pct: options.get_percent("disk-reserve"),
                idle_timeout: options.get_int("idle-timeout") as u64,
                full: AtomicBool::new(false),
                registry: Mutex::new(Vec::new()),
            }),
            stop: Arc::new(AtomicBool::new(false)),
            sweeper: Mutex::new(None),
        })
    }

    pub fn option_table() -> &'static [OptSpec] {
        OPTIONS
    }

    /// Whether admission is currently closed.
    pub fn is_full(&self) -> bool {
        self.sweep.full.load(Ordering::Relaxed)
    }

    fn eligible(&self, path: &std::path::Path) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        let text = path.to_string_lossy();
        self.filters.iter().any(|pat| glob_match(pat, &text))
    }

    fn ctx_of(&self, inode: &Inode) -> Option<Arc<FscInode>> {
        inode.ctx_get::<Arc<FscInode>>(self.core.id())
    }

    fn ctx_or_create(&self, inode: &Inode, gfid: crate::gfid::Gfid) -> Arc<FscInode> {
        if let Some(ctx) = self.ctx_of(inode) {
            return ctx;
        }
        let ctx = Arc::new(FscInode {
            local_path: self.sweep.cache_dir.join(gfid.to_hex()),
            backing: Mutex::new(None),
            extents: Mutex::new(ExtentMap::new()),
            attr: Mutex::new(None),
            direct: AtomicBool::new(false),
            last_use: AtomicU64::new(now_secs()),
        });
        inode.ctx_insert(self.core.id(), ctx.clone());
        self.sweep.registry.lock().push(Arc::downgrade(&ctx));
        ctx
    }
}

impl Xlator for FsCache {
    fn core(&self) -> &XlCore {
        &self.core
    }

    fn init(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.sweep.cache_dir)?;
        let sweep = self.sweep.clone();
        let stop = self.stop.clone();
        let interval = Duration::from_secs(self.sweep_interval);
        let handle = thread::Builder::new().name("fsc-sweeper".into()).spawn(move || {
            let mut cycle = 0u64;
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                cycle += 1;
                sweep.run_sweep(cycle);
            }
        })?;
        *self.sweeper.lock() = Some(handle);
        Ok(())
    }

    fn fini(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
    }

    fn option_specs(&self) -> &'static [OptSpec] {
        OPTIONS
    }

    fn forget(&self, inode: &Inode) {
        if let Some(ctx) = self.ctx_of(inode) {
            ctx.evict();
        }
    }

    fn lookup(&self, frame: Frame, loc: Loc, xdata: Xdata, unw: Unwinder<EntryReply>) {
        let this = self.core.id();
        let unw = unw.map(move |res: crate::stack::FopResult<EntryReply>| {
            let reply = res?;
            // Refresh the attr snapshot we serve from on cached reads.
            if let Some(ctx) = reply.inode.ctx_get::<Arc<FscInode>>(this) {
                *ctx.attr.lock() = Some(reply.attr);
            }
            Ok(reply)
        });
        self.core.first_child().expect("has child").lookup(frame, loc, xdata, unw);
    }

    fn open(&self, frame: Frame, loc: Loc, flags: OpenFlags, fd: Arc<Fd>, unw: Unwinder<()>) {
        if self.eligible(&loc.path) && !flags.contains(OpenFlags::DIRECT) {
            if let Some(gfid) = fd.inode().gfid().or(if loc.gfid.is_null() { None } else { Some(loc.gfid) }) {
                let ctx = self.ctx_or_create(fd.inode(), gfid);
                ctx.touch();
                if let Err(err) = ctx.ensure_backing() {
                    warn!("fs-cache backing open failed for {:?}: {err}", loc.path);
                }
            }
        }
        self.core.first_child().expect("has child").open(frame, loc, flags, fd, unw);
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
        let Some(ctx) = self.ctx_of(fd.inode()) else {
            self.core.first_child().expect("has child").readv(frame, fd, size, offset, flags, xdata, unw);
            return;
        };
        ctx.touch();
        let attr = *ctx.attr.lock();
        let eof = attr.map(|a| a.size);
        let cached = ctx.extents.lock().is_cached(offset, size as u64, eof);
        if cached {
            if let Some(file) = ctx.backing_file() {
                let mut buf = vec![0u8; size];
                match file.read_at(&mut buf, offset) {
                    Ok(got) => {
                        buf.truncate(got);
                        // Served locally: the attr snapshot stands in for a
                        // stat round trip, with size taken from the store.
                        let mut attr = attr.unwrap_or_else(|| {
                            Attr::synthetic_dir(fd.inode().gfid().unwrap_or_default())
                        });
                        if let Ok(meta) = file.metadata() {
                            attr.size = attr.size.max(meta.len());
                        }
                        debug!("fs-cache hit: {got} bytes at {offset}");
                        unw.okay(ReadReply {
                            payload: Payload::from_vec(buf),
                            attr,
                            xdata: Xdata::new(),
                        });
                        return;
                    }
                    Err(err) => {
                        warn!("backing pread failed, falling through: {err}");
                    }
                }
            }
        }

        // Miss: fetch downstream, then mirror the returned bytes.
        let full = self.is_full();
        let ctx2 = ctx.clone();
        let unw = unw.map(move |res: crate::stack::FopResult<ReadReply>| {
            let reply = res?;
            *ctx2.attr.lock() = Some(reply.attr);
            if !full {
                if let Ok(file) = ctx2.ensure_backing() {
                    let bytes = reply.payload.contiguous();
                    match file.write_all_at(&bytes, offset) {
                        Ok(()) => {
                            let mut extents = ctx2.extents.lock();
                            extents.add(offset, bytes.len() as u64);
                            let whole = extents.covers_file(reply.attr.size);
                            drop(extents);
                            if whole {
                                ctx2.direct_switch(&file);
                            }
                        }
                        Err(err) => warn!("backing write-back failed: {err}"),
                    }
                }
            }
            Ok(reply)
        });
        self.core.first_child().expect("has child").readv(frame, fd, size, offset, flags, xdata, unw);
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
        if let Some(ctx) = self.ctx_of(fd.inode()) {
            // This is a read mirror: a write just invalidates the overlap.
            ctx.extents.lock().remove(offset, payload.len() as u64);
            ctx.touch();
        }
        self.core.first_child().expect("has child").writev(frame, fd, payload, offset, flags, xdata, unw);
    }

    fn truncate(&self, frame: Frame, loc: Loc, offset: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        if let Some(ctx) = loc.inode.as_ref().and_then(|i| self.ctx_of(i)) {
            ctx.extents.lock().remove(offset, u64::MAX - offset);
        }
        self.core.first_child().expect("has child").truncate(frame, loc, offset, xdata, unw);
    }

    fn ftruncate(&self, frame: Frame, fd: Arc<Fd>, offset: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        if let Some(ctx) = self.ctx_of(fd.inode()) {
            ctx.extents.lock().remove(offset, u64::MAX - offset);
        }
        self.core.first_child().expect("has child").ftruncate(frame, fd, offset, xdata, unw);
    }

    fn flush(&self, frame: Frame, fd: Arc<Fd>, unw: Unwinder<()>) {
        if let Some(ctx) = self.ctx_of(fd.inode()) {
            ctx.persist_extents();
        }
        self.core.first_child().expect("has child").flush(frame, fd, unw);
    }
}

impl FscInode {
    /// Switch the backing fd to O_DIRECT and drop page-cache copies once the
    /// whole file is mirrored; double-buffering stops paying off there.
    fn direct_switch(&self, file: &File) {
        if self.direct.swap(true, Ordering::Relaxed) {
            return;
        }
        let fd = file.as_raw_fd();
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_DIRECT);
            }
            libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_DONTNEED);
        }
        debug!("backing file {:?} switched to O_DIRECT", self.local_path);
    }
}

fn fgetxattr(file: &File, name: &str) -> Option<Vec<u8>> {
    let cname = std::ffi::CString::new(name).ok()?;
    let fd = file.as_raw_fd();
    let size = unsafe { libc::fgetxattr(fd, cname.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        return None;
    }
    let mut buf = vec![0u8; size as usize];
    let got = unsafe { libc::fgetxattr(fd, cname.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
    if got < 0 {
        return None;
    }
    buf.truncate(got as usize);
    Some(buf)
}

fn fsetxattr(file: &File, name: &str, value: &[u8]) -> Result<(), Errno> {
    let cname = std::ffi::CString::new(name).map_err(|_| Errno::EINVAL)?;
    if unsafe {
        libc::fsetxattr(file.as_raw_fd(), cname.as_ptr(), value.as_ptr().cast(), value.len(), 0)
    } != 0
    {
        return Err(Errno::last_os_error());
    }
    Ok(())
}

/// Minimal glob: `*` matches any run, `?` any single byte.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (usize::MAX, 0usize);
    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = p;
            mark = t;
            p += 1;
        } else if star != usize::MAX {
            p = star + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

impl std::fmt::Debug for FsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsCache")
            .field("cache_dir", &self.sweep.cache_dir)
            .field("full", &self.is_full())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fop::FopKind;
    use crate::gfid::Gfid;
    use crate::itable::InodeTable;
    use crate::stack::SyncCall;
    use crate::xlator::Graph;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    struct CountingStore {
        core: XlCore,
        data: Vec<u8>,
        reads: AtomicUsize,
    }

    impl Xlator for CountingStore {
        fn core(&self) -> &XlCore {
            &self.core
        }

        fn open(&self, _frame: Frame, _loc: Loc, _flags: OpenFlags, _fd: Arc<Fd>, unw: Unwinder<()>) {
            unw.okay(());
        }

        fn readv(
            &self,
            _frame: Frame,
            _fd: Arc<Fd>,
            size: usize,
            offset: u64,
            _flags: u32,
            _xdata: Xdata,
            unw: Unwinder<ReadReply>,
        ) {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let start = (offset as usize).min(self.data.len());
            let end = (start + size).min(self.data.len());
            let mut attr = Attr::synthetic_dir(Gfid::ROOT);
            attr.size = self.data.len() as u64;
            unw.okay(ReadReply {
                payload: Payload::from_vec(self.data[start..end].to_vec()),
                attr,
                xdata: Xdata::new(),
            });
        }

        fn writev(
            &self,
            _frame: Frame,
            _fd: Arc<Fd>,
            payload: Payload,
            _offset: u64,
            _flags: u32,
            _xdata: Xdata,
            unw: Unwinder<WriteReply>,
        ) {
            let attr = Attr::synthetic_dir(Gfid::ROOT);
            unw.okay(WriteReply { count: payload.len(), pre: attr, post: attr, xdata: Xdata::new() });
        }

        fn flush(&self, _frame: Frame, _fd: Arc<Fd>, unw: Unwinder<()>) {
            unw.okay(());
        }
    }

    fn build(cache_dir: &std::path::Path, filters: &str) -> (Graph, Arc<CountingStore>) {
        let store = Arc::new(CountingStore {
            core: XlCore::new("store", vec![]),
            data: (0..32 * 1024usize).map(|i| (i % 199) as u8).collect(),
            reads: AtomicUsize::new(0),
        });
        let mut raw = HashMap::new();
        raw.insert("cache-dir".to_string(), cache_dir.to_str().unwrap().to_string());
        raw.insert("sweep-interval".to_string(), "3600".to_string());
        if !filters.is_empty() {
            raw.insert("filters".to_string(), filters.to_string());
        }
        let opts = Options::validate(FsCache::option_table(), &raw).unwrap();
        let graph = Graph::assemble(FsCache::new("fs-cache", &opts, store.clone())).unwrap();
        (graph, store)
    }

    fn open_fd(graph: &Graph, table: &Arc<InodeTable>, path: &str, gfid: Gfid) -> Arc<Fd> {
        let inode = table.new_unlinked();
        inode.set_gfid(gfid);
        let fd = Fd::new(inode.clone(), OpenFlags::empty(), 1);
        let mut loc = Loc::default();
        loc.path = PathBuf::from(path);
        loc.gfid = gfid;
        loc.inode = Some(inode);
        let call = SyncCall::<()>::new();
        graph.root().open(
            Frame::internal(),
            loc,
            OpenFlags::empty(),
            fd.clone(),
            call.unwinder(Frame::internal(), FopKind::Open),
        );
        call.wait().unwrap();
        fd
    }

    fn read(graph: &Graph, fd: &Arc<Fd>, offset: u64, size: usize) -> Vec<u8> {
        let call = SyncCall::<ReadReply>::new();
        graph.root().readv(
            Frame::internal(),
            fd.clone(),
            size,
            offset,
            0,
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Readv),
        );
        call.wait().unwrap().payload.contiguous().to_vec()
    }

    #[test]
    fn second_read_is_served_from_backing_store() {
        let dir = tempfile::tempdir().unwrap();
        let (graph, store) = build(dir.path(), "");
        let table = InodeTable::new();
        let fd = open_fd(&graph, &table, "/data/file.bin", Gfid::from_parts(9, 9));

        let first = read(&graph, &fd, 0, 4096);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        let second = read(&graph, &fd, 0, 4096);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1, "second read must be local");
        assert_eq!(first, second);

        // The backing file exists under the gfid name and holds the bytes.
        let backing = dir.path().join(Gfid::from_parts(9, 9).to_hex());
        assert!(backing.exists());
    }

    #[test]
    fn write_invalidates_overlapping_extent() {
        let dir = tempfile::tempdir().unwrap();
        let (graph, store) = build(dir.path(), "");
        let table = InodeTable::new();
        let fd = open_fd(&graph, &table, "/f", Gfid::from_parts(8, 8));

        read(&graph, &fd, 0, 4096);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);

        let call = SyncCall::<WriteReply>::new();
        graph.root().writev(
            Frame::internal(),
            fd.clone(),
            Payload::from_vec(vec![1u8; 512]),
            0,
            0,
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Writev),
        );
        call.wait().unwrap();

        // The overlap is gone: the next read goes downstream again.
        read(&graph, &fd, 0, 512);
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn extent_map_survives_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let gfid = Gfid::from_parts(7, 7);
        {
            let (graph, _store) = build(dir.path(), "");
            let table = InodeTable::new();
            let fd = open_fd(&graph, &table, "/f", gfid);
            read(&graph, &fd, 0, 8192);
            let call = SyncCall::<()>::new();
            graph.root().flush(
                Frame::internal(),
                fd,
                call.unwinder(Frame::internal(), FopKind::Flush),
            );
            call.wait().unwrap();
        }
        // Fresh graph, fresh inode: the map restores from the xattr on open
        // and the read is served locally without touching the store.
        let (graph, store) = build(dir.path(), "");
        let table = InodeTable::new();
        let fd = open_fd(&graph, &table, "/f", gfid);
        let data = read(&graph, &fd, 0, 8192);
        if store.reads.load(Ordering::SeqCst) == 0 {
            assert_eq!(data.len(), 8192);
        } else {
            // Xattrs unsupported on this filesystem: cache degraded to a miss.
            assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn filters_restrict_eligibility() {
        let dir = tempfile::tempdir().unwrap();
        let (graph, store) = build(dir.path(), "/media/*;*.iso");
        let table = InodeTable::new();

        let fd = open_fd(&graph, &table, "/home/user/notes.txt", Gfid::from_parts(5, 5));
        read(&graph, &fd, 0, 128);
        read(&graph, &fd, 0, 128);
        assert_eq!(store.reads.load(Ordering::SeqCst), 2, "filtered path is never cached");

        let fd = open_fd(&graph, &table, "/media/movie.mkv", Gfid::from_parts(5, 6));
        read(&graph, &fd, 0, 128);
        read(&graph, &fd, 0, 128);
        assert_eq!(store.reads.load(Ordering::SeqCst), 3, "matching path is cached");
    }

    #[test]
    fn glob_matcher_semantics() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*.iso", "disk.iso"));
        assert!(!glob_match("*.iso", "disk.img"));
        assert!(glob_match("/media/*", "/media/a/b/c"));
        assert!(glob_match("file-?.dat", "file-7.dat"));
        assert!(!glob_match("file-?.dat", "file-77.dat"));
        assert!(glob_match("", ""));
    }
}
