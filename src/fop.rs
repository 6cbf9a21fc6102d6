//! Filesystem operation ("fop") argument and reply types.
//!
//! Every operation that traverses the translator stack is described here:
//! the operation tag, its typed arguments and its typed reply. Translators
//! exchange these values directly instead of a serialized form; the client
//! RPC translator and the FUSE bridge are the only places where they are
//! mapped onto a wire format.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::gfid::Gfid;
use crate::itable::Inode;
use crate::xdata::Xdata;

/// Operation tags for every fop in the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FopKind {
    Lookup,
    Stat,
    Setattr,
    Readlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Symlink,
    Rename,
    Link,
    Truncate,
    Ftruncate,
    Open,
    Create,
    Readv,
    Writev,
    Statfs,
    Flush,
    Fsync,
    Setxattr,
    Getxattr,
    Removexattr,
    Opendir,
    Readdir,
    Fsyncdir,
    Access,
    Lk,
    Inodelk,
    Entrylk,
    Xattrop,
    Fallocate,
    Discard,
    Zerofill,
    Ipc,
    Lease,
    Seek,
}

impl FopKind {
    pub fn name(self) -> &'static str {
        match self {
            FopKind::Lookup => "lookup",
            FopKind::Stat => "stat",
            FopKind::Setattr => "setattr",
            FopKind::Readlink => "readlink",
            FopKind::Mknod => "mknod",
            FopKind::Mkdir => "mkdir",
            FopKind::Unlink => "unlink",
            FopKind::Rmdir => "rmdir",
            FopKind::Symlink => "symlink",
            FopKind::Rename => "rename",
            FopKind::Link => "link",
            FopKind::Truncate => "truncate",
            FopKind::Ftruncate => "ftruncate",
            FopKind::Open => "open",
            FopKind::Create => "create",
            FopKind::Readv => "readv",
            FopKind::Writev => "writev",
            FopKind::Statfs => "statfs",
            FopKind::Flush => "flush",
            FopKind::Fsync => "fsync",
            FopKind::Setxattr => "setxattr",
            FopKind::Getxattr => "getxattr",
            FopKind::Removexattr => "removexattr",
            FopKind::Opendir => "opendir",
            FopKind::Readdir => "readdir",
            FopKind::Fsyncdir => "fsyncdir",
            FopKind::Access => "access",
            FopKind::Lk => "lk",
            FopKind::Inodelk => "inodelk",
            FopKind::Entrylk => "entrylk",
            FopKind::Xattrop => "xattrop",
            FopKind::Fallocate => "fallocate",
            FopKind::Discard => "discard",
            FopKind::Zerofill => "zerofill",
            FopKind::Ipc => "ipc",
            FopKind::Lease => "lease",
            FopKind::Seek => "seek",
        }
    }

    /// Whether the fop mutates namespace or data. Mutating fops are the
    /// ones replication must order and quorum-gate.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            FopKind::Setattr
                | FopKind::Mknod
                | FopKind::Mkdir
                | FopKind::Unlink
                | FopKind::Rmdir
                | FopKind::Symlink
                | FopKind::Rename
                | FopKind::Link
                | FopKind::Truncate
                | FopKind::Ftruncate
                | FopKind::Create
                | FopKind::Writev
                | FopKind::Setxattr
                | FopKind::Removexattr
                | FopKind::Xattrop
                | FopKind::Fallocate
                | FopKind::Discard
                | FopKind::Zerofill
                | FopKind::Lk
                | FopKind::Inodelk
                | FopKind::Entrylk
        )
    }

    /// Whether the fop is a lock acquisition/release operation, which the
    /// replication layer handles with a two-phase protocol.
    pub fn is_locking(self) -> bool {
        matches!(self, FopKind::Lk | FopKind::Inodelk | FopKind::Entrylk)
    }
}

impl fmt::Display for FopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FopKind {
    type Err = ();

    fn from_str(s: &str) -> Result<FopKind, ()> {
        const ALL: &[FopKind] = &[
            FopKind::Lookup,
            FopKind::Stat,
            FopKind::Setattr,
            FopKind::Readlink,
            FopKind::Mknod,
            FopKind::Mkdir,
            FopKind::Unlink,
            FopKind::Rmdir,
            FopKind::Symlink,
            FopKind::Rename,
            FopKind::Link,
            FopKind::Truncate,
            FopKind::Ftruncate,
            FopKind::Open,
            FopKind::Create,
            FopKind::Readv,
            FopKind::Writev,
            FopKind::Statfs,
            FopKind::Flush,
            FopKind::Fsync,
            FopKind::Setxattr,
            FopKind::Getxattr,
            FopKind::Removexattr,
            FopKind::Opendir,
            FopKind::Readdir,
            FopKind::Fsyncdir,
            FopKind::Access,
            FopKind::Lk,
            FopKind::Inodelk,
            FopKind::Entrylk,
            FopKind::Xattrop,
            FopKind::Fallocate,
            FopKind::Discard,
            FopKind::Zerofill,
            FopKind::Ipc,
            FopKind::Lease,
            FopKind::Seek,
        ];
        ALL.iter().copied().find(|k| k.name() == s).ok_or(())
    }
}

/// File types, mirrored from the mode word.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    NamedPipe,
    CharDevice,
    BlockDevice,
    Directory,
    RegularFile,
    Symlink,
    Socket,
}

impl FileType {
    pub fn from_mode(mode: u32) -> Option<FileType> {
        match mode & libc::S_IFMT {
            libc::S_IFIFO => Some(FileType::NamedPipe),
            libc::S_IFCHR => Some(FileType::CharDevice),
            libc::S_IFBLK => Some(FileType::BlockDevice),
            libc::S_IFDIR => Some(FileType::Directory),
            libc::S_IFREG => Some(FileType::RegularFile),
            libc::S_IFLNK => Some(FileType::Symlink),
            libc::S_IFSOCK => Some(FileType::Socket),
            _ => None,
        }
    }

    pub fn to_mode_bits(self) -> u32 {
        match self {
            FileType::NamedPipe => libc::S_IFIFO,
            FileType::CharDevice => libc::S_IFCHR,
            FileType::BlockDevice => libc::S_IFBLK,
            FileType::Directory => libc::S_IFDIR,
            FileType::RegularFile => libc::S_IFREG,
            FileType::Symlink => libc::S_IFLNK,
            FileType::Socket => libc::S_IFSOCK,
        }
    }
}

/// Attribute snapshot of a filesystem object.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Attr {
    pub gfid: Gfid,
    pub ino: u64,
    pub kind: FileType,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Attr {
    /// A minimal directory attribute used for synthesized objects (e.g. the
    /// root before the first lookup reply arrives).
    pub fn synthetic_dir(gfid: Gfid) -> Attr {
        Attr {
            gfid,
            ino: 1,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 4096,
            blksize: 4096,
            blocks: 8,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
        }
    }
}

bitflags! {
    /// Open flags carried on open/create and fd state.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const WRONLY = libc::O_WRONLY as u32;
        const RDWR = libc::O_RDWR as u32;
        const APPEND = libc::O_APPEND as u32;
        const CREAT = libc::O_CREAT as u32;
        const TRUNC = libc::O_TRUNC as u32;
        const EXCL = libc::O_EXCL as u32;
        const DIRECT = libc::O_DIRECT as u32;
        const SYNC = libc::O_SYNC as u32;
        const NONBLOCK = libc::O_NONBLOCK as u32;
        const DIRECTORY = libc::O_DIRECTORY as u32;
        const NOFOLLOW = libc::O_NOFOLLOW as u32;
        const _ = !0;
    }
}

impl OpenFlags {
    /// O_RDONLY is the absence of both WRONLY and RDWR.
    pub fn is_read_only(self) -> bool {
        !self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }

    pub fn is_write_only(self) -> bool {
        self.contains(OpenFlags::WRONLY)
    }
}

/// Fields a setattr may change; unset fields are left alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetattrArgs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

/// Location of an object in the namespace, as produced by the resolver.
#[derive(Clone, Default)]
pub struct Loc {
    pub parent: Option<Arc<Inode>>,
    pub inode: Option<Arc<Inode>>,
    pub name: Option<OsString>,
    pub path: PathBuf,
    pub gfid: Gfid,
    pub pargfid: Gfid,
}

impl Loc {
    /// A loc naming an object only by gfid (used by gfid-based lookup and
    /// by server-side resolution).
    pub fn from_gfid(gfid: Gfid) -> Loc {
        Loc { gfid, ..Loc::default() }
    }

    /// A loc naming a child of `parent` by name.
    pub fn child_of(parent: &Arc<Inode>, name: &std::ffi::OsStr, path: PathBuf) -> Loc {
        Loc {
            pargfid: parent.gfid().unwrap_or(Gfid::NULL),
            parent: Some(parent.clone()),
            inode: None,
            name: Some(name.to_os_string()),
            path,
            gfid: Gfid::NULL,
        }
    }
}

impl fmt::Debug for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loc")
            .field("path", &self.path)
            .field("gfid", &self.gfid)
            .field("pargfid", &self.pargfid)
            .field("name", &self.name)
            .finish()
    }
}

/// Scatter-gather payload: an ordered list of refcounted buffers.
///
/// Buffers are appended without copying; `contiguous` linearizes on demand.
#[derive(Clone, Default)]
pub struct Payload {
    bufs: SmallVec<[Arc<[u8]>; 2]>,
}

impl Payload {
    pub fn new() -> Payload {
        Payload::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Payload {
        let mut p = Payload::new();
        if !data.is_empty() {
            p.push(Arc::from(data.into_boxed_slice()));
        }
        p
    }

    pub fn push(&mut self, buf: Arc<[u8]>) {
        if !buf.is_empty() {
            self.bufs.push(buf);
        }
    }

    /// Append all buffers of `other`, preserving order.
    pub fn append(&mut self, other: Payload) {
        self.bufs.extend(other.bufs);
    }

    pub fn len(&self) -> usize {
        self.bufs.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffer_count(&self) -> usize {
        self.bufs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<[u8]>> {
        self.bufs.iter()
    }

    /// Linearize into a single buffer. Cheap when there is at most one.
    pub fn contiguous(&self) -> Arc<[u8]> {
        match self.bufs.len() {
            0 => Arc::from(&[][..]),
            1 => self.bufs[0].clone(),
            _ => {
                let mut out = Vec::with_capacity(self.len());
                for buf in &self.bufs {
                    out.extend_from_slice(buf);
                }
                Arc::from(out.into_boxed_slice())
            }
        }
    }

    /// A new payload holding `[offset, offset + len)` of this one.
    /// Clamped to the available bytes.
    pub fn slice(&self, offset: usize, len: usize) -> Payload {
        let mut out = Payload::new();
        let mut skip = offset;
        let mut want = len;
        for buf in &self.bufs {
            if want == 0 {
                break;
            }
            if skip >= buf.len() {
                skip -= buf.len();
                continue;
            }
            let take = (buf.len() - skip).min(want);
            if skip == 0 && take == buf.len() {
                out.push(buf.clone());
            } else {
                out.push(Arc::from(&buf[skip..skip + take]));
            }
            want -= take;
            skip = 0;
        }
        out
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes in {} bufs)", self.len(), self.bufs.len())
    }
}

/// One directory entry in a readdir reply.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub kind: FileType,
    /// Opaque offset of the *next* entry, handed back on the next readdir.
    pub offset: u64,
}

/// statvfs-shaped reply fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statvfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namemax: u64,
}

/// Posix record lock types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LkType {
    Read,
    Write,
    Unlock,
}

impl LkType {
    pub fn from_raw(typ: i32) -> Option<LkType> {
        match typ {
            x if x == libc::F_RDLCK => Some(LkType::Read),
            x if x == libc::F_WRLCK => Some(LkType::Write),
            x if x == libc::F_UNLCK => Some(LkType::Unlock),
            _ => None,
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            LkType::Read => libc::F_RDLCK,
            LkType::Write => libc::F_WRLCK,
            LkType::Unlock => libc::F_UNLCK,
        }
    }
}

/// Posix record lock commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LkCmd {
    Get,
    Set,
    SetWait,
}

/// A posix record lock over `[start, end]` (inclusive, `u64::MAX` = to EOF).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Flock {
    pub typ: LkType,
    pub start: u64,
    pub end: u64,
    pub pid: u32,
    pub owner: crate::stack::LockOwner,
}

/// Entry-lock commands, used to serialize directory entry mutations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntrylkCmd {
    Lock,
    LockNonblock,
    Unlock,
}

/// Xattrop combining operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XattropOp {
    /// Add the supplied values to the stored values, per key.
    AddArray64,
    /// Replace stored values with the supplied ones.
    GetAndSet,
}

/// seek() targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekWhence {
    Data,
    Hole,
}

/// Reply carrying a freshly resolved entry: lookup, mknod, mkdir, symlink,
/// link, create.
#[derive(Clone, Debug)]
pub struct EntryReply {
    pub inode: Arc<Inode>,
    pub attr: Attr,
    pub postparent: Option<Attr>,
    pub xdata: Xdata,
}

/// Reply for fops that change an object and report before/after attributes.
#[derive(Clone, Copy, Debug)]
pub struct PrePostReply {
    pub pre: Attr,
    pub post: Attr,
}

/// Reply for fops that change a directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParentReply {
    pub preparent: Option<Attr>,
    pub postparent: Option<Attr>,
}

/// readv reply: scattered data plus the attribute snapshot observed.
#[derive(Clone, Debug)]
pub struct ReadReply {
    pub payload: Payload,
    pub attr: Attr,
    pub xdata: Xdata,
}

/// writev reply.
#[derive(Clone, Debug)]
pub struct WriteReply {
    pub count: usize,
    pub pre: Attr,
    pub post: Attr,
    pub xdata: Xdata,
}

/// readlink reply.
#[derive(Clone, Debug)]
pub struct ReadlinkReply {
    pub target: OsString,
    pub attr: Attr,
}

/// readdir reply.
#[derive(Clone, Debug, Default)]
pub struct ReaddirReply {
    pub entries: Vec<DirEntry>,
}

/// getxattr reply.
#[derive(Clone, Debug)]
pub struct XattrReply {
    pub value: Vec<u8>,
}

/// ipc reply: an opaque xdata bundle.
#[derive(Clone, Debug, Default)]
pub struct IpcReply {
    pub xdata: Xdata,
}
