//! RPC plumbing between the client translator and the server side.
//!
//! Frames on the wire are `[u32 length][RpcHeader][payload]`, everything
//! little-endian. Three fixed programs are served: the fops program (the
//! operation table), the handshake program (setvolume, getspec, ping) and
//! the callback program (fetchspec, invalidations), with versions agreed
//! during setvolume. Payload layout is the compact generic codec in
//! [`codec`]; no compatibility with any other wire format is intended.

pub mod codec;
pub mod conn;
pub mod server;

use num_enum::TryFromPrimitive;
use zerocopy::byteorder::little_endian::{I32, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::fop::FopKind;

/// Program numbers.
pub const PROG_FOPS: u32 = 1_298_437;
pub const PROG_HANDSHAKE: u32 = 14_398_633;
pub const PROG_CALLBACK: u32 = 52_743_234;

/// Program versions offered by this implementation.
pub const FOPS_VERSION: u32 = 2;
pub const HANDSHAKE_VERSION: u32 = 2;
pub const CALLBACK_VERSION: u32 = 1;

/// Server-side anonymous fd sentinel.
pub const REMOTE_FD_ANON: i64 = -2;
/// "Not opened on this connection yet".
pub const REMOTE_FD_NONE: i64 = -1;

/// Header flags.
pub const FLAG_REPLY: u32 = 1 << 0;

/// Frame header, fixed little-endian layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RpcHeader {
    pub unique: U64,
    pub program: U32,
    pub version: U32,
    pub procedure: U32,
    pub flags: U32,
    pub op_ret: I32,
    pub op_errno: I32,
}

impl RpcHeader {
    pub fn request(unique: u64, program: u32, version: u32, procedure: u32) -> RpcHeader {
        RpcHeader {
            unique: U64::new(unique),
            program: U32::new(program),
            version: U32::new(version),
            procedure: U32::new(procedure),
            flags: U32::new(0),
            op_ret: I32::new(0),
            op_errno: I32::new(0),
        }
    }

    pub fn reply_to(&self, op_ret: i32, op_errno: i32) -> RpcHeader {
        RpcHeader {
            unique: self.unique,
            program: self.program,
            version: self.version,
            procedure: self.procedure,
            flags: U32::new(self.flags.get() | FLAG_REPLY),
            op_ret: I32::new(op_ret),
            op_errno: I32::new(op_errno),
        }
    }

    pub fn is_reply(&self) -> bool {
        self.flags.get() & FLAG_REPLY != 0
    }
}

/// Handshake program procedures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum HandshakeProc {
    SetVolume = 1,
    GetSpec = 2,
    Ping = 3,
}

/// Callback program procedures (server-initiated).
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum CallbackProc {
    FetchSpec = 1,
    InvalInode = 2,
    InvalEntry = 3,
}

/// Fops program procedures, one per operation plus the release pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
pub enum FopProc {
    Lookup = 1,
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
    Release,
    Releasedir,
}

impl FopProc {
    pub fn of(kind: FopKind) -> FopProc {
        match kind {
            FopKind::Lookup => FopProc::Lookup,
            FopKind::Stat => FopProc::Stat,
            FopKind::Setattr => FopProc::Setattr,
            FopKind::Readlink => FopProc::Readlink,
            FopKind::Mknod => FopProc::Mknod,
            FopKind::Mkdir => FopProc::Mkdir,
            FopKind::Unlink => FopProc::Unlink,
            FopKind::Rmdir => FopProc::Rmdir,
            FopKind::Symlink => FopProc::Symlink,
            FopKind::Rename => FopProc::Rename,
            FopKind::Link => FopProc::Link,
            FopKind::Truncate => FopProc::Truncate,
            FopKind::Ftruncate => FopProc::Ftruncate,
            FopKind::Open => FopProc::Open,
            FopKind::Create => FopProc::Create,
            FopKind::Readv => FopProc::Readv,
            FopKind::Writev => FopProc::Writev,
            FopKind::Statfs => FopProc::Statfs,
            FopKind::Flush => FopProc::Flush,
            FopKind::Fsync => FopProc::Fsync,
            FopKind::Setxattr => FopProc::Setxattr,
            FopKind::Getxattr => FopProc::Getxattr,
            FopKind::Removexattr => FopProc::Removexattr,
            FopKind::Opendir => FopProc::Opendir,
            FopKind::Readdir => FopProc::Readdir,
            FopKind::Fsyncdir => FopProc::Fsyncdir,
            FopKind::Access => FopProc::Access,
            FopKind::Lk => FopProc::Lk,
            FopKind::Inodelk => FopProc::Inodelk,
            FopKind::Entrylk => FopProc::Entrylk,
            FopKind::Xattrop => FopProc::Xattrop,
            FopKind::Fallocate => FopProc::Fallocate,
            FopKind::Discard => FopProc::Discard,
            FopKind::Zerofill => FopProc::Zerofill,
            FopKind::Ipc => FopProc::Ipc,
            FopKind::Lease => FopProc::Lease,
            FopKind::Seek => FopProc::Seek,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = RpcHeader::request(42, PROG_FOPS, FOPS_VERSION, FopProc::Writev as u32);
        let bytes = header.as_bytes().to_vec();
        let parsed = RpcHeader::read_from_bytes(&bytes).unwrap();
        assert_eq!(parsed.unique.get(), 42);
        assert_eq!(parsed.program.get(), PROG_FOPS);
        assert!(!parsed.is_reply());

        let reply = parsed.reply_to(-1, libc::ENOENT);
        assert!(reply.is_reply());
        assert_eq!(reply.op_errno.get(), libc::ENOENT);
        assert_eq!(reply.unique.get(), 42);
    }

    #[test]
    fn fop_procs_cover_every_kind() {
        // A missing arm would be a compile error; spot-check the mapping.
        assert_eq!(FopProc::of(FopKind::Lookup), FopProc::Lookup);
        assert_eq!(FopProc::of(FopKind::Seek), FopProc::Seek);
        assert_eq!(FopProc::try_from(FopProc::Writev as u32), Ok(FopProc::Writev));
    }
}
