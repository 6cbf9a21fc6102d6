//! Local storage translator.
//!
//! The bottom of a server-side graph: fops land on a directory tree on the
//! local filesystem. Gfids are fabricated from (device, inode) pairs so they
//! are stable for the life of the export. Record locks (`lk`, `inodelk`,
//! `entrylk`) are kept in in-memory tables per exported volume, with blocked
//! `SetWait` requests parked as stubs and retried on unlock.

use std::collections::HashMap;
use std::ffi::{CString, OsString};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::errno::Errno;
use crate::fdtable::Fd;
use crate::fop::{
    Attr, DirEntry, EntrylkCmd, EntryReply, FileType, Flock, FopKind, IpcReply, LkCmd, LkType,
    Loc, OpenFlags, ParentReply, Payload, PrePostReply, ReadReply, ReaddirReply, ReadlinkReply,
    SeekWhence, SetattrArgs, Statvfs, WriteReply, XattrReply, XattropOp,
};
use crate::gfid::Gfid;
use crate::options::{OptSpec, OptType, Options};
use crate::stack::{Frame, Stub, Unwinder};
use crate::xdata::Xdata;
use crate::xlator::{Event, XlCore, Xlator};

const OPTIONS: &[OptSpec] = &[
    OptSpec { key: "export", typ: OptType::Path, default: "/", desc: "exported directory" },
    OptSpec {
        key: "volume-id",
        typ: OptType::Str,
        default: "storage",
        desc: "name used in lock tables and logs",
    },
];

struct FileCtx {
    file: Arc<File>,
}

struct DirCtx {
    path: PathBuf,
    entries: Mutex<Vec<DirEntry>>,
}

/// Record-lock table entry list per (gfid, volume) key.
#[derive(Default)]
struct LockDomain {
    granted: Vec<Flock>,
    waiters: Vec<(Flock, Stub)>,
}

#[derive(Default)]
struct LockTables {
    /// Posix record locks from `lk` and `inodelk`.
    byte_range: HashMap<(Gfid, String), LockDomain>,
    /// Entry locks: (gfid, volume, basename) -> holder.
    entries: HashMap<(Gfid, String, OsString), Flock>,
}

/// POSIX-backed bottom translator.
pub struct Storage {
    core: XlCore,
    export: PathBuf,
    volume: String,
    locks: Mutex<LockTables>,
}

impl Storage {
    pub fn new(name: &str, options: &Options) -> Arc<Storage> {
        Arc::new(Storage {
            core: XlCore::new(name, vec![]),
            export: PathBuf::from(options.get_str("export")),
            volume: options.get_str("volume-id").to_string(),
            locks: Mutex::new(LockTables::default()),
        })
    }

    pub fn option_table() -> &'static [OptSpec] {
        OPTIONS
    }

    fn real_path(&self, loc: &Loc) -> PathBuf {
        let rel = loc.path.strip_prefix("/").unwrap_or(&loc.path);
        self.export.join(rel)
    }

    fn file_of(&self, fd: &Fd) -> Result<Arc<File>, Errno> {
        fd.ctx_get::<Arc<FileCtx>>(self.core.id())
            .map(|ctx| ctx.file.clone())
            .ok_or(Errno::EBADF)
    }

    fn dir_of(&self, fd: &Fd) -> Result<Arc<DirCtx>, Errno> {
        fd.ctx_get::<Arc<DirCtx>>(self.core.id()).ok_or(Errno::EBADF)
    }

    fn attr_of_path(&self, path: &Path, follow: bool) -> Result<Attr, Errno> {
        let meta = if follow { std::fs::metadata(path) } else { std::fs::symlink_metadata(path) };
        meta.map(|m| attr_from_meta(&m)).map_err(Errno::from)
    }

    fn attr_of_file(&self, file: &File) -> Result<Attr, Errno> {
        file.metadata().map(|m| attr_from_meta(&m)).map_err(Errno::from)
    }

    fn entry_reply(&self, loc: &Loc, path: &Path) -> Result<EntryReply, Errno> {
        let attr = self.attr_of_path(path, false)?;
        let inode = loc.inode.clone().unwrap_or_else(crate::itable::Inode::detached);
        inode.set_gfid(attr.gfid);
        inode.set_attr(attr);
        let postparent = path.parent().and_then(|p| self.attr_of_path(p, true).ok());
        Ok(EntryReply { inode, attr, postparent, xdata: Xdata::new() })
    }

    fn pre_post<F: FnOnce() -> Result<(), Errno>>(
        &self,
        file: &File,
        op: F,
    ) -> Result<PrePostReply, Errno> {
        let pre = self.attr_of_file(file)?;
        op()?;
        let post = self.attr_of_file(file)?;
        Ok(PrePostReply { pre, post })
    }

    /// True when `a` and `b` overlap and at least one of them writes.
    fn conflicts(a: &Flock, b: &Flock) -> bool {
        if a.owner == b.owner {
            return false;
        }
        if a.typ == LkType::Read && b.typ == LkType::Read {
            return false;
        }
        a.start <= b.end && b.start <= a.end
    }

    fn try_grant(domain: &mut LockDomain, lock: Flock) -> Result<(), Errno> {
        if domain.granted.iter().any(|held| Self::conflicts(held, &lock)) {
            return Err(Errno::EAGAIN);
        }
        // Same-owner re-grant over the same range replaces.
        domain
            .granted
            .retain(|held| !(held.owner == lock.owner && held.start == lock.start && held.end == lock.end));
        domain.granted.push(lock);
        Ok(())
    }

    fn apply_unlock(domain: &mut LockDomain, lock: &Flock) {
        domain.granted.retain(|held| {
            !(held.owner == lock.owner && held.start >= lock.start && held.end <= lock.end)
        });
    }

    /// Unlock `lock`'s range and wake every parked waiter; each re-enters
    /// the lock fop through its stub and retries the grant.
    fn byte_unlock(&self, key: (Gfid, String), lock: &Flock) {
        let woken = {
            let mut tables = self.locks.lock();
            let domain = tables.byte_range.entry(key).or_default();
            Self::apply_unlock(domain, lock);
            std::mem::take(&mut domain.waiters)
        };
        for (_, stub) in woken {
            stub.resume();
        }
    }

    /// One grant attempt under the table lock.
    fn byte_try(&self, key: (Gfid, String), lock: Flock) -> Result<(), Errno> {
        let mut tables = self.locks.lock();
        let domain = tables.byte_range.entry(key).or_default();
        Self::try_grant(domain, lock)
    }

    /// Park a blocked SetWait request. Re-checks the conflict under the
    /// lock: when it vanished in the meantime the stub comes back for an
    /// immediate retry instead of sleeping forever.
    #[must_use]
    fn byte_park(&self, key: (Gfid, String), lock: Flock, stub: Stub) -> Option<Stub> {
        let mut tables = self.locks.lock();
        let domain = tables.byte_range.entry(key).or_default();
        if domain.granted.iter().any(|held| Self::conflicts(held, &lock)) {
            domain.waiters.push((lock, stub));
            None
        } else {
            Some(stub)
        }
    }

    fn getlk(&self, key: (Gfid, String), probe: &Flock) -> Flock {
        let tables = self.locks.lock();
        if let Some(domain) = tables.byte_range.get(&key) {
            if let Some(held) = domain.granted.iter().find(|held| Self::conflicts(held, probe)) {
                return *held;
            }
        }
        Flock { typ: LkType::Unlock, ..*probe }
    }
}

impl Xlator for Storage {
    fn core(&self) -> &XlCore {
        &self.core
    }

    fn init(&self) -> io::Result<()> {
        let meta = std::fs::metadata(&self.export)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("export {:?} is not a directory", self.export),
            ));
        }
        debug!("{}: exporting {:?}", self.core.name(), self.export);
        Ok(())
    }

    fn notify(&self, event: &Event) {
        // The export is local, so it is serviceable as soon as the graph is.
        if matches!(event, Event::ParentUp) {
            self.core.emit_upward(&Event::ChildUp(0));
        }
    }

    fn option_specs(&self) -> &'static [OptSpec] {
        OPTIONS
    }

    fn release(&self, fd: &Fd) {
        fd.ctx_remove(self.core.id());
    }

    fn releasedir(&self, fd: &Fd) {
        fd.ctx_remove(self.core.id());
    }

    fn lookup(&self, _frame: Frame, loc: Loc, _xdata: Xdata, unw: Unwinder<EntryReply>) {
        let path = self.real_path(&loc);
        unw.unwind(self.entry_reply(&loc, &path));
    }

    fn stat(&self, _frame: Frame, loc: Loc, unw: Unwinder<Attr>) {
        unw.unwind(self.attr_of_path(&self.real_path(&loc), false));
    }

    fn setattr(
        &self,
        _frame: Frame,
        loc: Loc,
        args: SetattrArgs,
        _xdata: Xdata,
        unw: Unwinder<PrePostReply>,
    ) {
        let path = self.real_path(&loc);
        let result = (|| {
            let pre = self.attr_of_path(&path, false)?;
            if let Some(mode) = args.mode {
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
                    .map_err(Errno::from)?;
            }
            if args.uid.is_some() || args.gid.is_some() {
                let cpath = cstring_path(&path)?;
                let uid = args.uid.map(|v| v as libc::uid_t).unwrap_or(u32::MAX);
                let gid = args.gid.map(|v| v as libc::gid_t).unwrap_or(u32::MAX);
                if unsafe { libc::chown(cpath.as_ptr(), uid, gid) } != 0 {
                    return Err(Errno::last_os_error());
                }
            }
            if let Some(size) = args.size {
                let file = OpenOptions::new().write(true).open(&path).map_err(Errno::from)?;
                file.set_len(size).map_err(Errno::from)?;
            }
            if args.atime.is_some() || args.mtime.is_some() {
                set_times(&path, args.atime, args.mtime)?;
            }
            let post = self.attr_of_path(&path, false)?;
            Ok(PrePostReply { pre, post })
        })();
        unw.unwind(result);
    }

    fn readlink(&self, _frame: Frame, loc: Loc, unw: Unwinder<ReadlinkReply>) {
        let path = self.real_path(&loc);
        let result = (|| {
            let target = std::fs::read_link(&path).map_err(Errno::from)?;
            let attr = self.attr_of_path(&path, false)?;
            Ok(ReadlinkReply { target: target.into_os_string(), attr })
        })();
        unw.unwind(result);
    }

    fn mknod(
        &self,
        _frame: Frame,
        loc: Loc,
        mode: u32,
        rdev: u32,
        umask: u32,
        _xdata: Xdata,
        unw: Unwinder<EntryReply>,
    ) {
        let path = self.real_path(&loc);
        let result = (|| {
            let cpath = cstring_path(&path)?;
            if unsafe { libc::mknod(cpath.as_ptr(), (mode & !umask) as libc::mode_t, rdev as libc::dev_t) } != 0 {
                return Err(Errno::last_os_error());
            }
            self.entry_reply(&loc, &path)
        })();
        unw.unwind(result);
    }

    fn mkdir(
        &self,
        _frame: Frame,
        loc: Loc,
        mode: u32,
        umask: u32,
        _xdata: Xdata,
        unw: Unwinder<EntryReply>,
    ) {
        let path = self.real_path(&loc);
        let result = (|| {
            let cpath = cstring_path(&path)?;
            if unsafe { libc::mkdir(cpath.as_ptr(), (mode & !umask) as libc::mode_t) } != 0 {
                return Err(Errno::last_os_error());
            }
            self.entry_reply(&loc, &path)
        })();
        unw.unwind(result);
    }

    fn unlink(&self, _frame: Frame, loc: Loc, _xdata: Xdata, unw: Unwinder<ParentReply>) {
        let path = self.real_path(&loc);
        let result = (|| {
            let preparent = path.parent().and_then(|p| self.attr_of_path(p, true).ok());
            std::fs::remove_file(&path).map_err(Errno::from)?;
            let postparent = path.parent().and_then(|p| self.attr_of_path(p, true).ok());
            Ok(ParentReply { preparent, postparent })
        })();
        unw.unwind(result);
    }

    fn rmdir(&self, _frame: Frame, loc: Loc, _xdata: Xdata, unw: Unwinder<ParentReply>) {
        let path = self.real_path(&loc);
        let result = (|| {
            let preparent = path.parent().and_then(|p| self.attr_of_path(p, true).ok());
            std::fs::remove_dir(&path).map_err(Errno::from)?;
            let postparent = path.parent().and_then(|p| self.attr_of_path(p, true).ok());
            Ok(ParentReply { preparent, postparent })
        })();
        unw.unwind(result);
    }

    fn symlink(
        &self,
        _frame: Frame,
        target: OsString,
        loc: Loc,
        _umask: u32,
        _xdata: Xdata,
        unw: Unwinder<EntryReply>,
    ) {
        let path = self.real_path(&loc);
        let result = (|| {
            std::os::unix::fs::symlink(&target, &path).map_err(Errno::from)?;
            self.entry_reply(&loc, &path)
        })();
        unw.unwind(result);
    }

    fn rename(&self, _frame: Frame, oldloc: Loc, newloc: Loc, _xdata: Xdata, unw: Unwinder<Attr>) {
        let old = self.real_path(&oldloc);
        let new = self.real_path(&newloc);
        let result = (|| {
            std::fs::rename(&old, &new).map_err(Errno::from)?;
            self.attr_of_path(&new, false)
        })();
        unw.unwind(result);
    }

    fn link(&self, _frame: Frame, oldloc: Loc, newloc: Loc, _xdata: Xdata, unw: Unwinder<EntryReply>) {
        let old = self.real_path(&oldloc);
        let new = self.real_path(&newloc);
        let result = (|| {
            std::fs::hard_link(&old, &new).map_err(Errno::from)?;
            self.entry_reply(&newloc, &new)
        })();
        unw.unwind(result);
    }

    fn truncate(&self, _frame: Frame, loc: Loc, offset: u64, _xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let path = self.real_path(&loc);
        let result = (|| {
            let file = OpenOptions::new().write(true).open(&path).map_err(Errno::from)?;
            self.pre_post(&file, || file.set_len(offset).map_err(Errno::from))
        })();
        unw.unwind(result);
    }

    fn ftruncate(&self, _frame: Frame, fd: Arc<Fd>, offset: u64, _xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let result = self.file_of(&fd).and_then(|file| {
            self.pre_post(&file, || file.set_len(offset).map_err(Errno::from))
        });
        unw.unwind(result);
    }

    fn open(&self, _frame: Frame, loc: Loc, flags: OpenFlags, fd: Arc<Fd>, unw: Unwinder<()>) {
        let path = self.real_path(&loc);
        let result = (|| {
            let file = open_with_flags(&path, flags, None)?;
            fd.ctx_insert(self.core.id(), Arc::new(FileCtx { file: Arc::new(file) }));
            Ok(())
        })();
        unw.unwind(result);
    }

    fn create(
        &self,
        _frame: Frame,
        loc: Loc,
        flags: OpenFlags,
        mode: u32,
        umask: u32,
        fd: Arc<Fd>,
        _xdata: Xdata,
        unw: Unwinder<EntryReply>,
    ) {
        let path = self.real_path(&loc);
        let result = (|| {
            let file = open_with_flags(&path, flags | OpenFlags::CREAT, Some(mode & !umask))?;
            fd.ctx_insert(self.core.id(), Arc::new(FileCtx { file: Arc::new(file) }));
            self.entry_reply(&loc, &path)
        })();
        unw.unwind(result);
    }

    fn readv(
        &self,
        _frame: Frame,
        fd: Arc<Fd>,
        size: usize,
        offset: u64,
        _flags: u32,
        _xdata: Xdata,
        unw: Unwinder<ReadReply>,
    ) {
        let result = self.file_of(&fd).and_then(|file| {
            let mut buf = vec![0u8; size];
            let mut filled = 0;
            while filled < size {
                match file.read_at(&mut buf[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(Errno::from(err)),
                }
            }
            buf.truncate(filled);
            let attr = self.attr_of_file(&file)?;
            Ok(ReadReply { payload: Payload::from_vec(buf), attr, xdata: Xdata::new() })
        });
        unw.unwind(result);
    }

    fn writev(
        &self,
        _frame: Frame,
        fd: Arc<Fd>,
        payload: Payload,
        offset: u64,
        _flags: u32,
        _xdata: Xdata,
        unw: Unwinder<WriteReply>,
    ) {
        let result = self.file_of(&fd).and_then(|file| {
            let pre = self.attr_of_file(&file)?;
            let mut written = 0u64;
            for buf in payload.iter() {
                file.write_all_at(buf, offset + written).map_err(Errno::from)?;
                written += buf.len() as u64;
            }
            let post = self.attr_of_file(&file)?;
            Ok(WriteReply { count: written as usize, pre, post, xdata: Xdata::new() })
        });
        unw.unwind(result);
    }

    fn statfs(&self, _frame: Frame, loc: Loc, unw: Unwinder<Statvfs>) {
        let path = self.real_path(&loc);
        let result = nix::sys::statvfs::statvfs(&path)
            .map(|vfs| Statvfs {
                bsize: vfs.block_size() as u64,
                frsize: vfs.fragment_size() as u64,
                blocks: vfs.blocks(),
                bfree: vfs.blocks_free(),
                bavail: vfs.blocks_available(),
                files: vfs.files(),
                ffree: vfs.files_free(),
                namemax: vfs.name_max() as u64,
            })
            .map_err(Errno::from);
        unw.unwind(result);
    }

    fn flush(&self, _frame: Frame, _fd: Arc<Fd>, unw: Unwinder<()>) {
        unw.okay(());
    }

    fn fsync(&self, _frame: Frame, fd: Arc<Fd>, datasync: bool, unw: Unwinder<PrePostReply>) {
        let result = self.file_of(&fd).and_then(|file| {
            self.pre_post(&file, || {
                if datasync { file.sync_data() } else { file.sync_all() }.map_err(Errno::from)
            })
        });
        unw.unwind(result);
    }

    fn setxattr(
        &self,
        _frame: Frame,
        loc: Loc,
        name: OsString,
        value: Vec<u8>,
        flags: i32,
        _xdata: Xdata,
        unw: Unwinder<()>,
    ) {
        unw.unwind(xattr_set(&self.real_path(&loc), &name, &value, flags));
    }

    fn getxattr(&self, _frame: Frame, loc: Loc, name: OsString, unw: Unwinder<XattrReply>) {
        let path = self.real_path(&loc);
        // An empty name asks for the NUL-joined name list (LISTXATTR).
        let result = if name.is_empty() {
            xattr_list(&path).map(|value| XattrReply { value })
        } else {
            xattr_get(&path, &name).map(|value| XattrReply { value })
        };
        unw.unwind(result);
    }

    fn removexattr(&self, _frame: Frame, loc: Loc, name: OsString, _xdata: Xdata, unw: Unwinder<()>) {
        let path = self.real_path(&loc);
        let result = (|| {
            let cpath = cstring_path(&path)?;
            let cname = cstring_os(&name)?;
            if unsafe { libc::removexattr(cpath.as_ptr(), cname.as_ptr()) } != 0 {
                return Err(Errno::last_os_error());
            }
            Ok(())
        })();
        unw.unwind(result);
    }

    fn opendir(&self, _frame: Frame, loc: Loc, fd: Arc<Fd>, unw: Unwinder<()>) {
        let path = self.real_path(&loc);
        let result = (|| {
            let mut entries = Vec::new();
            let iter = std::fs::read_dir(&path).map_err(Errno::from)?;
            for (index, entry) in iter.enumerate() {
                let entry = entry.map_err(Errno::from)?;
                let meta = entry.metadata().map_err(Errno::from)?;
                let kind = FileType::from_mode(meta.mode()).unwrap_or(FileType::RegularFile);
                entries.push(DirEntry {
                    name: entry.file_name(),
                    ino: meta.ino(),
                    kind,
                    offset: index as u64 + 1,
                });
            }
            fd.ctx_insert(
                self.core.id(),
                Arc::new(DirCtx { path, entries: Mutex::new(entries) }),
            );
            Ok(())
        })();
        unw.unwind(result);
    }

    fn readdir(&self, _frame: Frame, fd: Arc<Fd>, size: usize, offset: u64, unw: Unwinder<ReaddirReply>) {
        let result = self.dir_of(&fd).map(|ctx| {
            let entries = ctx.entries.lock();
            let mut out = Vec::new();
            let mut used = 0usize;
            for entry in entries.iter().skip(offset as usize) {
                // Approximate the kernel dirent footprint to honor the size cap.
                let cost = 64 + entry.name.len();
                if used + cost > size && !out.is_empty() {
                    break;
                }
                used += cost;
                out.push(entry.clone());
            }
            ReaddirReply { entries: out }
        });
        unw.unwind(result);
    }

    fn fsyncdir(&self, _frame: Frame, fd: Arc<Fd>, _datasync: bool, unw: Unwinder<()>) {
        let result = self.dir_of(&fd).and_then(|ctx| {
            File::open(&ctx.path).and_then(|dir| dir.sync_all()).map_err(Errno::from)
        });
        unw.unwind(result);
    }

    fn access(&self, _frame: Frame, loc: Loc, mask: u32, unw: Unwinder<()>) {
        let path = self.real_path(&loc);
        let result = (|| {
            let cpath = cstring_path(&path)?;
            if unsafe { libc::access(cpath.as_ptr(), mask as libc::c_int) } != 0 {
                return Err(Errno::last_os_error());
            }
            Ok(())
        })();
        unw.unwind(result);
    }

    fn lk(&self, frame: Frame, fd: Arc<Fd>, cmd: LkCmd, lock: Flock, xdata: Xdata, unw: Unwinder<Flock>) {
        let Some(gfid) = fd.inode().gfid() else {
            unw.errno(Errno::EBADF);
            return;
        };
        let key = (gfid, self.volume.clone());
        if cmd == LkCmd::Get {
            let reply = self.getlk(key, &lock);
            unw.okay(reply);
            return;
        }
        if lock.typ == LkType::Unlock {
            self.byte_unlock(key, &lock);
            unw.okay(lock);
            return;
        }
        match self.byte_try(key.clone(), lock) {
            Ok(()) => unw.okay(lock),
            Err(errno) if cmd == LkCmd::Set => unw.errno(errno),
            Err(_) => {
                // Blocked SetWait: park a stub that re-enters this fop when
                // the conflicting range unlocks.
                let this = self.core.self_xlator().expect("storage registered in a graph");
                let stub = Stub::new(FopKind::Lk, move || {
                    this.lk(frame, fd, cmd, lock, xdata, unw);
                });
                if let Some(stub) = self.byte_park(key, lock, stub) {
                    stub.resume();
                }
            }
        }
    }

    fn inodelk(
        &self,
        frame: Frame,
        volume: String,
        loc: Loc,
        cmd: LkCmd,
        lock: Flock,
        xdata: Xdata,
        unw: Unwinder<()>,
    ) {
        let gfid = if loc.gfid.is_null() {
            loc.inode.as_ref().and_then(|i| i.gfid()).unwrap_or(Gfid::NULL)
        } else {
            loc.gfid
        };
        if gfid.is_null() {
            unw.errno(Errno::EINVAL);
            return;
        }
        let key = (gfid, volume.clone());
        if cmd == LkCmd::Get {
            unw.okay(());
            return;
        }
        if lock.typ == LkType::Unlock {
            self.byte_unlock(key, &lock);
            unw.okay(());
            return;
        }
        match self.byte_try(key.clone(), lock) {
            Ok(()) => unw.okay(()),
            Err(errno) if cmd == LkCmd::Set => unw.errno(errno),
            Err(_) => {
                let this = self.core.self_xlator().expect("storage registered in a graph");
                let stub = Stub::new(FopKind::Inodelk, move || {
                    this.inodelk(frame, volume, loc, cmd, lock, xdata, unw);
                });
                if let Some(stub) = self.byte_park(key, lock, stub) {
                    stub.resume();
                }
            }
        }
    }

    fn entrylk(
        &self,
        frame: Frame,
        volume: String,
        loc: Loc,
        basename: OsString,
        cmd: EntrylkCmd,
        typ: LkType,
        _xdata: Xdata,
        unw: Unwinder<()>,
    ) {
        let gfid = if loc.gfid.is_null() {
            loc.inode.as_ref().and_then(|i| i.gfid()).unwrap_or(Gfid::NULL)
        } else {
            loc.gfid
        };
        let key = (gfid, volume, basename);
        let owner = Flock {
            typ,
            start: 0,
            end: u64::MAX,
            pid: frame.pid(),
            owner: frame.lock_owner(),
        };
        let mut tables = self.locks.lock();
        let result = match cmd {
            EntrylkCmd::Lock | EntrylkCmd::LockNonblock => match tables.entries.get(&key) {
                Some(held) if held.owner != owner.owner => Err(Errno::EAGAIN),
                _ => {
                    tables.entries.insert(key, owner);
                    Ok(())
                }
            },
            EntrylkCmd::Unlock => match tables.entries.get(&key) {
                Some(held) if held.owner == owner.owner => {
                    tables.entries.remove(&key);
                    Ok(())
                }
                _ => Err(Errno::EINVAL),
            },
        };
        drop(tables);
        unw.unwind(result);
    }

    fn xattrop(
        &self,
        _frame: Frame,
        loc: Loc,
        op: XattropOp,
        pairs: Vec<(OsString, Vec<u8>)>,
        _xdata: Xdata,
        unw: Unwinder<Vec<(OsString, Vec<u8>)>>,
    ) {
        let path = self.real_path(&loc);
        let result = (|| {
            let mut out = Vec::with_capacity(pairs.len());
            for (name, value) in pairs {
                let stored = xattr_get(&path, &name).unwrap_or_default();
                match op {
                    XattropOp::AddArray64 => {
                        let summed = add_int64_arrays(&stored, &value);
                        xattr_set(&path, &name, &summed, 0)?;
                        out.push((name, summed));
                    }
                    XattropOp::GetAndSet => {
                        xattr_set(&path, &name, &value, 0)?;
                        out.push((name, stored));
                    }
                }
            }
            Ok(out)
        })();
        unw.unwind(result);
    }

    fn fallocate(
        &self,
        _frame: Frame,
        fd: Arc<Fd>,
        mode: i32,
        offset: u64,
        len: u64,
        _xdata: Xdata,
        unw: Unwinder<PrePostReply>,
    ) {
        let result = self.file_of(&fd).and_then(|file| {
            self.pre_post(&file, || {
                if unsafe {
                    libc::fallocate(file.as_raw_fd(), mode, offset as libc::off_t, len as libc::off_t)
                } != 0
                {
                    return Err(Errno::last_os_error());
                }
                Ok(())
            })
        });
        unw.unwind(result);
    }

    fn discard(&self, _frame: Frame, fd: Arc<Fd>, offset: u64, len: u64, _xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let result = self.file_of(&fd).and_then(|file| {
            self.pre_post(&file, || {
                let mode = libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE;
                if unsafe {
                    libc::fallocate(file.as_raw_fd(), mode, offset as libc::off_t, len as libc::off_t)
                } != 0
                {
                    return Err(Errno::last_os_error());
                }
                Ok(())
            })
        });
        unw.unwind(result);
    }

    fn zerofill(&self, _frame: Frame, fd: Arc<Fd>, offset: u64, len: u64, _xdata: Xdata, unw: Unwinder<PrePostReply>) {
        let result = self.file_of(&fd).and_then(|file| {
            self.pre_post(&file, || {
                let zeros = vec![0u8; 64 * 1024];
                let mut done = 0u64;
                while done < len {
                    let chunk = ((len - done) as usize).min(zeros.len());
                    file.write_all_at(&zeros[..chunk], offset + done).map_err(Errno::from)?;
                    done += chunk as u64;
                }
                Ok(())
            })
        });
        unw.unwind(result);
    }

    fn ipc(&self, _frame: Frame, op: i32, _xdata: Xdata, unw: Unwinder<IpcReply>) {
        warn!("{}: unhandled ipc op {op}", self.core.name());
        unw.errno(Errno::ENOSYS);
    }

    fn lease(&self, _frame: Frame, _loc: Loc, _cmd: LkCmd, _typ: LkType, unw: Unwinder<LkType>) {
        unw.errno(Errno::ENOSYS);
    }

    fn seek(&self, _frame: Frame, fd: Arc<Fd>, offset: u64, whence: SeekWhence, unw: Unwinder<u64>) {
        let result = self.file_of(&fd).and_then(|file| {
            let mode = match whence {
                SeekWhence::Data => libc::SEEK_DATA,
                SeekWhence::Hole => libc::SEEK_HOLE,
            };
            let pos = unsafe { libc::lseek(file.as_raw_fd(), offset as libc::off_t, mode) };
            if pos < 0 { Err(Errno::last_os_error()) } else { Ok(pos as u64) }
        });
        unw.unwind(result);
    }
}

fn attr_from_meta(meta: &std::fs::Metadata) -> Attr {
    Attr {
        gfid: Gfid::from_parts(meta.dev(), meta.ino()),
        ino: meta.ino(),
        kind: FileType::from_mode(meta.mode()).unwrap_or(FileType::RegularFile),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        size: meta.size(),
        blksize: meta.blksize() as u32,
        blocks: meta.blocks(),
        atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        ctime: SystemTime::UNIX_EPOCH + std::time::Duration::new(meta.ctime().max(0) as u64, 0),
    }
}

fn open_with_flags(path: &Path, flags: OpenFlags, mode: Option<u32>) -> Result<File, Errno> {
    let mut opts = OpenOptions::new();
    opts.read(!flags.is_write_only());
    opts.write(!flags.is_read_only());
    if flags.contains(OpenFlags::CREAT) {
        opts.create(true);
    }
    if flags.contains(OpenFlags::TRUNC) {
        opts.truncate(true);
    }
    if flags.contains(OpenFlags::APPEND) {
        opts.append(true);
    }
    if flags.contains(OpenFlags::EXCL) {
        opts.create_new(true);
    }
    let custom = flags.bits()
        & !(OpenFlags::WRONLY
            | OpenFlags::RDWR
            | OpenFlags::CREAT
            | OpenFlags::TRUNC
            | OpenFlags::APPEND
            | OpenFlags::EXCL)
            .bits();
    opts.custom_flags(custom as i32);
    if let Some(mode) = mode {
        opts.mode(mode);
    }
    opts.open(path).map_err(Errno::from)
}

fn cstring_path(path: &Path) -> Result<CString, Errno> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

fn cstring_os(name: &std::ffi::OsStr) -> Result<CString, Errno> {
    CString::new(name.as_bytes()).map_err(|_| Errno::EINVAL)
}

fn xattr_get(path: &Path, name: &std::ffi::OsStr) -> Result<Vec<u8>, Errno> {
    let cpath = cstring_path(path)?;
    let cname = cstring_os(name)?;
    let size = unsafe { libc::getxattr(cpath.as_ptr(), cname.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        return Err(Errno::last_os_error());
    }
    let mut buf = vec![0u8; size as usize];
    let got = unsafe {
        libc::getxattr(cpath.as_ptr(), cname.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
    };
    if got < 0 {
        return Err(Errno::last_os_error());
    }
    buf.truncate(got as usize);
    Ok(buf)
}

fn xattr_list(path: &Path) -> Result<Vec<u8>, Errno> {
    let cpath = cstring_path(path)?;
    let size = unsafe { libc::listxattr(cpath.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        return Err(Errno::last_os_error());
    }
    let mut buf = vec![0u8; size as usize];
    let got = unsafe { libc::listxattr(cpath.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
    if got < 0 {
        return Err(Errno::last_os_error());
    }
    buf.truncate(got as usize);
    Ok(buf)
}

fn xattr_set(path: &Path, name: &std::ffi::OsStr, value: &[u8], flags: i32) -> Result<(), Errno> {
    let cpath = cstring_path(path)?;
    let cname = cstring_os(name)?;
    if unsafe {
        libc::setxattr(cpath.as_ptr(), cname.as_ptr(), value.as_ptr().cast(), value.len(), flags)
    } != 0
    {
        return Err(Errno::last_os_error());
    }
    Ok(())
}

/// Element-wise little-endian i64 addition, the xattrop combining rule.
fn add_int64_arrays(stored: &[u8], add: &[u8]) -> Vec<u8> {
    let len = stored.len().max(add.len());
    let words = len.div_ceil(8);
    let mut out = vec![0u8; words * 8];
    for i in 0..words {
        let a = read_i64_le(stored, i * 8);
        let b = read_i64_le(add, i * 8);
        out[i * 8..i * 8 + 8].copy_from_slice(&a.wrapping_add(b).to_le_bytes());
    }
    out
}

fn read_i64_le(buf: &[u8], offset: usize) -> i64 {
    let mut word = [0u8; 8];
    for (i, slot) in word.iter_mut().enumerate() {
        *slot = buf.get(offset + i).copied().unwrap_or(0);
    }
    i64::from_le_bytes(word)
}

fn set_times(
    path: &Path,
    atime: Option<SystemTime>,
    mtime: Option<SystemTime>,
) -> Result<(), Errno> {
    fn to_timespec(when: Option<SystemTime>) -> libc::timespec {
        match when.and_then(|w| w.duration_since(SystemTime::UNIX_EPOCH).ok()) {
            Some(dur) => libc::timespec {
                tv_sec: dur.as_secs() as libc::time_t,
                tv_nsec: dur.subsec_nanos() as libc::c_long,
            },
            None => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT },
        }
    }
    let cpath = cstring_path(path)?;
    let times = [to_timespec(atime), to_timespec(mtime)];
    if unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) } != 0 {
        return Err(Errno::last_os_error());
    }
    Ok(())
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("export", &self.export)
            .field("volume", &self.volume)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itable::InodeTable;
    use crate::stack::SyncCall;
    use crate::xlator::Graph;
    use std::collections::HashMap;

    fn storage_graph(export: &Path) -> (Graph, Arc<InodeTable>) {
        let mut raw = HashMap::new();
        raw.insert("export".to_string(), export.to_str().unwrap().to_string());
        let opts = Options::validate(Storage::option_table(), &raw).unwrap();
        let storage = Storage::new("posix", &opts);
        (Graph::assemble(storage).unwrap(), InodeTable::new())
    }

    fn loc_for(table: &Arc<InodeTable>, path: &str) -> Loc {
        let mut loc = Loc::default();
        loc.path = PathBuf::from(path);
        loc.inode = Some(table.new_unlinked());
        loc
    }

    #[test]
    fn create_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (graph, table) = storage_graph(dir.path());
        let root = graph.root().clone();

        let loc = loc_for(&table, "/hello.txt");
        let fd = Fd::new(table.root(), OpenFlags::RDWR, 1);
        let call = SyncCall::<EntryReply>::new();
        root.create(
            Frame::internal(),
            loc,
            OpenFlags::RDWR,
            0o644,
            0,
            fd.clone(),
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Create),
        );
        let entry = call.wait().unwrap();
        assert_eq!(entry.attr.kind, FileType::RegularFile);
        assert!(!entry.attr.gfid.is_null());

        let call = SyncCall::<WriteReply>::new();
        root.writev(
            Frame::internal(),
            fd.clone(),
            Payload::from_vec(b"stacked".to_vec()),
            0,
            0,
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Writev),
        );
        assert_eq!(call.wait().unwrap().count, 7);

        let call = SyncCall::<ReadReply>::new();
        root.readv(
            Frame::internal(),
            fd,
            16,
            0,
            0,
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Readv),
        );
        let reply = call.wait().unwrap();
        assert_eq!(&*reply.payload.contiguous(), b"stacked");
        assert_eq!(reply.attr.size, 7);
    }

    #[test]
    fn lookup_missing_is_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let (graph, table) = storage_graph(dir.path());
        let call = SyncCall::<EntryReply>::new();
        graph.root().lookup(
            Frame::internal(),
            loc_for(&table, "/nope"),
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Lookup),
        );
        assert_eq!(call.wait().unwrap_err(), Errno::ENOENT);
    }

    #[test]
    fn record_locks_conflict_across_owners() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let (graph, table) = storage_graph(dir.path());
        let root = graph.root().clone();

        let inode = table.new_unlinked();
        inode.set_gfid(Gfid::from_parts(3, 3));
        let fd = Fd::new(inode.clone(), OpenFlags::RDWR, 1);
        let fd2 = Fd::new(inode, OpenFlags::RDWR, 2);

        let lock = |owner: u64, typ| Flock {
            typ,
            start: 0,
            end: 1023,
            pid: 1,
            owner: crate::stack::LockOwner::from_kernel(owner),
        };

        let call = SyncCall::<Flock>::new();
        root.lk(
            Frame::internal(),
            fd,
            LkCmd::Set,
            lock(1, LkType::Write),
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Lk),
        );
        assert!(call.wait().is_ok());

        let call = SyncCall::<Flock>::new();
        root.lk(
            Frame::internal(),
            fd2.clone(),
            LkCmd::Set,
            lock(2, LkType::Read),
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Lk),
        );
        assert_eq!(call.wait().unwrap_err(), Errno::EAGAIN);

        // getlk reports the conflicting holder.
        let call = SyncCall::<Flock>::new();
        root.lk(
            Frame::internal(),
            fd2,
            LkCmd::Get,
            lock(2, LkType::Read),
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Lk),
        );
        let seen = call.wait().unwrap();
        assert_eq!(seen.typ, LkType::Write);
    }

    #[test]
    fn setwait_lock_parks_until_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let (graph, table) = storage_graph(dir.path());
        let root = graph.root().clone();
        let inode = table.new_unlinked();
        inode.set_gfid(Gfid::from_parts(4, 4));
        let fd = Fd::new(inode, OpenFlags::RDWR, 1);

        let lock = |owner: u64, typ| Flock {
            typ,
            start: 0,
            end: u64::MAX,
            pid: 1,
            owner: crate::stack::LockOwner::from_kernel(owner),
        };

        let call = SyncCall::<Flock>::new();
        root.lk(
            Frame::internal(),
            fd.clone(),
            LkCmd::Set,
            lock(1, LkType::Write),
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Lk),
        );
        call.wait().unwrap();

        let blocked = SyncCall::<Flock>::new();
        root.lk(
            Frame::internal(),
            fd.clone(),
            LkCmd::SetWait,
            lock(2, LkType::Write),
            Xdata::new(),
            blocked.unwinder(Frame::internal(), FopKind::Lk),
        );

        // Releasing the first lock resumes the waiter.
        let call = SyncCall::<Flock>::new();
        root.lk(
            Frame::internal(),
            fd,
            LkCmd::Set,
            lock(1, LkType::Unlock),
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Lk),
        );
        call.wait().unwrap();
        assert!(blocked.wait_timeout(std::time::Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn xattrop_accumulates_counters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let (graph, table) = storage_graph(dir.path());

        let pairs = vec![(OsString::from("user.pending"), 5i64.to_le_bytes().to_vec())];
        let call = SyncCall::<Vec<(OsString, Vec<u8>)>>::new();
        graph.root().xattrop(
            Frame::internal(),
            loc_for(&table, "/f"),
            XattropOp::AddArray64,
            pairs.clone(),
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Xattrop),
        );
        match call.wait() {
            Ok(out) => {
                assert_eq!(read_i64_le(&out[0].1, 0), 5);
                let call = SyncCall::<Vec<(OsString, Vec<u8>)>>::new();
                graph.root().xattrop(
                    Frame::internal(),
                    loc_for(&table, "/f"),
                    XattropOp::AddArray64,
                    pairs,
                    Xdata::new(),
                    call.unwinder(Frame::internal(), FopKind::Xattrop),
                );
                assert_eq!(read_i64_le(&call.wait().unwrap()[0].1, 0), 10);
            }
            // Some filesystems running the test suite lack user xattrs.
            Err(errno) => assert_eq!(errno, Errno::EOPNOTSUPP),
        }
    }

    #[test]
    fn add_arrays_of_unequal_length() {
        let a = 7i64.to_le_bytes().to_vec();
        let sum = add_int64_arrays(&a, &[]);
        assert_eq!(read_i64_le(&sum, 0), 7);
        let mut b = 1i64.to_le_bytes().to_vec();
        b.extend_from_slice(&2i64.to_le_bytes());
        let sum = add_int64_arrays(&a, &b);
        assert_eq!(read_i64_le(&sum, 0), 8);
        assert_eq!(read_i64_le(&sum, 8), 2);
    }
}
