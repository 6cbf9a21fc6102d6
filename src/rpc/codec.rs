//! Compact little-endian payload codec.
//!
//! The original wire format is treated as an opaque codec and replaced by a
//! generic request/reply record: every fop populates the fields it needs in
//! [`WireReq`], replies come back in [`WireRep`]. Strings carry a length
//! prefix; optional records carry a presence byte. Decoding is strict:
//! truncated input fails with EPROTO rather than producing zeroed fields.

use std::ffi::OsString;
use std::time::{Duration, SystemTime};

use crate::errno::Errno;
use crate::fop::{
    Attr, DirEntry, EntrylkCmd, FileType, Flock, LkCmd, LkType, SeekWhence, SetattrArgs, Statvfs,
    XattropOp,
};
use crate::gfid::Gfid;
use crate::stack::LockOwner;
use crate::xdata::{XKey, XVal, Xdata};

/// Payload writer.
#[derive(Default, Debug)]
pub struct Enc {
    buf: Vec<u8>,
}

impl Enc {
    pub fn new() -> Enc {
        Enc::default()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub fn put_gfid(&mut self, v: Gfid) {
        self.buf.extend_from_slice(&v.0);
    }

    fn put_time(&mut self, v: SystemTime) {
        let dur = v.duration_since(SystemTime::UNIX_EPOCH).unwrap_or(Duration::ZERO);
        self.put_u64(dur.as_secs());
        self.put_u32(dur.subsec_nanos());
    }

    pub fn put_attr(&mut self, v: &Attr) {
        self.put_gfid(v.gfid);
        self.put_u64(v.ino);
        self.put_u8(file_type_tag(v.kind));
        self.put_u16(v.perm);
        self.put_u32(v.nlink);
        self.put_u32(v.uid);
        self.put_u32(v.gid);
        self.put_u32(v.rdev);
        self.put_u64(v.size);
        self.put_u32(v.blksize);
        self.put_u64(v.blocks);
        self.put_time(v.atime);
        self.put_time(v.mtime);
        self.put_time(v.ctime);
    }

    pub fn put_opt_attr(&mut self, v: Option<&Attr>) {
        match v {
            Some(attr) => {
                self.put_u8(1);
                self.put_attr(attr);
            }
            None => self.put_u8(0),
        }
    }

    pub fn put_flock(&mut self, v: &Flock) {
        self.put_u8(match v.typ {
            LkType::Read => 0,
            LkType::Write => 1,
            LkType::Unlock => 2,
        });
        self.put_u64(v.start);
        self.put_u64(v.end);
        self.put_u32(v.pid);
        self.buf.extend_from_slice(&v.owner.0);
    }

    pub fn put_xdata(&mut self, v: &Xdata) {
        let slots: Vec<_> = v.iter().collect();
        self.put_u32(slots.len() as u32);
        for (key, val) in slots {
            self.put_str(key.as_str());
            match val {
                XVal::U64(n) => {
                    self.put_u8(0);
                    self.put_u64(*n);
                }
                XVal::Bytes(b) => {
                    self.put_u8(1);
                    self.put_bytes(b);
                }
            }
        }
    }
}

/// Payload reader.
#[derive(Debug)]
pub struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    pub fn new(buf: &'a [u8]) -> Dec<'a> {
        Dec { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Errno> {
        if self.pos + n > self.buf.len() {
            return Err(Errno::EPROTO);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, Errno> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, Errno> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    pub fn get_u32(&mut self) -> Result<u32, Errno> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    pub fn get_i32(&mut self) -> Result<i32, Errno> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    pub fn get_u64(&mut self) -> Result<u64, Errno> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    pub fn get_i64(&mut self) -> Result<i64, Errno> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, Errno> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_str(&mut self) -> Result<String, Errno> {
        String::from_utf8(self.get_bytes()?).map_err(|_| Errno::EPROTO)
    }

    pub fn get_gfid(&mut self) -> Result<Gfid, Errno> {
        let mut gfid = Gfid::NULL;
        gfid.0.copy_from_slice(self.take(16)?);
        Ok(gfid)
    }

    fn get_time(&mut self) -> Result<SystemTime, Errno> {
        let secs = self.get_u64()?;
        let nanos = self.get_u32()?;
        Ok(SystemTime::UNIX_EPOCH + Duration::new(secs, nanos))
    }

    pub fn get_attr(&mut self) -> Result<Attr, Errno> {
        Ok(Attr {
            gfid: self.get_gfid()?,
            ino: self.get_u64()?,
            kind: file_type_from_tag(self.get_u8()?)?,
            perm: self.get_u16()?,
            nlink: self.get_u32()?,
            uid: self.get_u32()?,
            gid: self.get_u32()?,
            rdev: self.get_u32()?,
            size: self.get_u64()?,
            blksize: self.get_u32()?,
            blocks: self.get_u64()?,
            atime: self.get_time()?,
            mtime: self.get_time()?,
            ctime: self.get_time()?,
        })
    }

    pub fn get_opt_attr(&mut self) -> Result<Option<Attr>, Errno> {
        match self.get_u8()? {
            0 => Ok(None),
            _ => Ok(Some(self.get_attr()?)),
        }
    }

    pub fn get_flock(&mut self) -> Result<Flock, Errno> {
        let typ = match self.get_u8()? {
            0 => LkType::Read,
            1 => LkType::Write,
            2 => LkType::Unlock,
            _ => return Err(Errno::EPROTO),
        };
        let start = self.get_u64()?;
        let end = self.get_u64()?;
        let pid = self.get_u32()?;
        let mut owner = LockOwner::default();
        owner.0.copy_from_slice(self.take(16)?);
        Ok(Flock { typ, start, end, pid, owner })
    }

    pub fn get_xdata(&mut self) -> Result<Xdata, Errno> {
        let count = self.get_u32()?;
        let mut xdata = Xdata::new();
        for _ in 0..count {
            let name = self.get_str()?;
            let tag = self.get_u8()?;
            let val = match tag {
                0 => XVal::U64(self.get_u64()?),
                1 => XVal::Bytes(self.get_bytes()?),
                _ => return Err(Errno::EPROTO),
            };
            // Keys this build does not know are dropped; they cannot be
            // represented in the closed key set.
            if let Some(key) = XKey::from_str(&name) {
                xdata.set(key, val);
            }
        }
        Ok(xdata)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn file_type_tag(kind: FileType) -> u8 {
    match kind {
        FileType::NamedPipe => 0,
        FileType::CharDevice => 1,
        FileType::BlockDevice => 2,
        FileType::Directory => 3,
        FileType::RegularFile => 4,
        FileType::Symlink => 5,
        FileType::Socket => 6,
    }
}

fn file_type_from_tag(tag: u8) -> Result<FileType, Errno> {
    Ok(match tag {
        0 => FileType::NamedPipe,
        1 => FileType::CharDevice,
        2 => FileType::BlockDevice,
        3 => FileType::Directory,
        4 => FileType::RegularFile,
        5 => FileType::Symlink,
        6 => FileType::Socket,
        _ => return Err(Errno::EPROTO),
    })
}

/// Generic fop request record. Every procedure fills the fields it uses and
/// leaves the rest defaulted; the peer only reads what the procedure defines.
#[derive(Debug, Default, Clone)]
pub struct WireReq {
    pub gfid: Gfid,
    pub pargfid: Gfid,
    pub path: String,
    /// Entry name, xattr name, or lock volume depending on the procedure.
    pub name: String,
    /// Secondary string: symlink target, rename destination path, basename.
    pub name2: String,
    pub fd: i64,
    pub offset: u64,
    pub size: u64,
    pub mode: u32,
    pub umask: u32,
    pub rdev: u32,
    pub flags: u32,
    pub cmd: u32,
    pub aux: u32,
    pub pid: u32,
    pub data: Vec<u8>,
    pub pairs: Vec<(String, Vec<u8>)>,
    pub lock: Option<Flock>,
    pub setattr: Option<SetattrArgs>,
    pub xdata: Xdata,
}

impl WireReq {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.put_gfid(self.gfid);
        enc.put_gfid(self.pargfid);
        enc.put_str(&self.path);
        enc.put_str(&self.name);
        enc.put_str(&self.name2);
        enc.put_i64(self.fd);
        enc.put_u64(self.offset);
        enc.put_u64(self.size);
        enc.put_u32(self.mode);
        enc.put_u32(self.umask);
        enc.put_u32(self.rdev);
        enc.put_u32(self.flags);
        enc.put_u32(self.cmd);
        enc.put_u32(self.aux);
        enc.put_u32(self.pid);
        enc.put_bytes(&self.data);
        enc.put_u32(self.pairs.len() as u32);
        for (name, value) in &self.pairs {
            enc.put_str(name);
            enc.put_bytes(value);
        }
        match &self.lock {
            Some(lock) => {
                enc.put_u8(1);
                enc.put_flock(lock);
            }
            None => enc.put_u8(0),
        }
        match &self.setattr {
            Some(args) => {
                enc.put_u8(1);
                encode_setattr(&mut enc, args);
            }
            None => enc.put_u8(0),
        }
        enc.put_xdata(&self.xdata);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<WireReq, Errno> {
        let mut dec = Dec::new(buf);
        let gfid = dec.get_gfid()?;
        let pargfid = dec.get_gfid()?;
        let path = dec.get_str()?;
        let name = dec.get_str()?;
        let name2 = dec.get_str()?;
        let fd = dec.get_i64()?;
        let offset = dec.get_u64()?;
        let size = dec.get_u64()?;
        let mode = dec.get_u32()?;
        let umask = dec.get_u32()?;
        let rdev = dec.get_u32()?;
        let flags = dec.get_u32()?;
        let cmd = dec.get_u32()?;
        let aux = dec.get_u32()?;
        let pid = dec.get_u32()?;
        let data = dec.get_bytes()?;
        let pair_count = dec.get_u32()?;
        let mut pairs = Vec::with_capacity(pair_count as usize);
        for _ in 0..pair_count {
            let name = dec.get_str()?;
            let value = dec.get_bytes()?;
            pairs.push((name, value));
        }
        let lock = match dec.get_u8()? {
            0 => None,
            _ => Some(dec.get_flock()?),
        };
        let setattr = match dec.get_u8()? {
            0 => None,
            _ => Some(decode_setattr(&mut dec)?),
        };
        let xdata = dec.get_xdata()?;
        Ok(WireReq {
            gfid,
            pargfid,
            path,
            name,
            name2,
            fd,
            offset,
            size,
            mode,
            umask,
            rdev,
            flags,
            cmd,
            aux,
            pid,
            data,
            pairs,
            lock,
            setattr,
            xdata,
        })
    }
}

const SA_MODE: u32 = 1 << 0;
const SA_UID: u32 = 1 << 1;
const SA_GID: u32 = 1 << 2;
const SA_SIZE: u32 = 1 << 3;
const SA_ATIME: u32 = 1 << 4;
const SA_MTIME: u32 = 1 << 5;

fn encode_setattr(enc: &mut Enc, args: &SetattrArgs) {
    let mut valid = 0u32;
    if args.mode.is_some() {
        valid |= SA_MODE;
    }
    if args.uid.is_some() {
        valid |= SA_UID;
    }
    if args.gid.is_some() {
        valid |= SA_GID;
    }
    if args.size.is_some() {
        valid |= SA_SIZE;
    }
    if args.atime.is_some() {
        valid |= SA_ATIME;
    }
    if args.mtime.is_some() {
        valid |= SA_MTIME;
    }
    enc.put_u32(valid);
    enc.put_u32(args.mode.unwrap_or(0));
    enc.put_u32(args.uid.unwrap_or(0));
    enc.put_u32(args.gid.unwrap_or(0));
    enc.put_u64(args.size.unwrap_or(0));
    enc.put_time(args.atime.unwrap_or(SystemTime::UNIX_EPOCH));
    enc.put_time(args.mtime.unwrap_or(SystemTime::UNIX_EPOCH));
}

fn decode_setattr(dec: &mut Dec<'_>) -> Result<SetattrArgs, Errno> {
    let valid = dec.get_u32()?;
    let mode = dec.get_u32()?;
    let uid = dec.get_u32()?;
    let gid = dec.get_u32()?;
    let size = dec.get_u64()?;
    let atime = dec.get_time()?;
    let mtime = dec.get_time()?;
    Ok(SetattrArgs {
        mode: (valid & SA_MODE != 0).then_some(mode),
        uid: (valid & SA_UID != 0).then_some(uid),
        gid: (valid & SA_GID != 0).then_some(gid),
        size: (valid & SA_SIZE != 0).then_some(size),
        atime: (valid & SA_ATIME != 0).then_some(atime),
        mtime: (valid & SA_MTIME != 0).then_some(mtime),
    })
}

/// Generic fop reply record, mirror of [`WireReq`].
#[derive(Debug, Default, Clone)]
pub struct WireRep {
    /// Primary attribute (entry attr, read attr, rename attr, ...).
    pub attr: Option<Attr>,
    /// Pre-operation attr or preparent.
    pub pre: Option<Attr>,
    /// Post-operation attr or postparent.
    pub post: Option<Attr>,
    pub fd: i64,
    pub count: u64,
    pub data: Vec<u8>,
    pub target: String,
    pub entries: Vec<DirEntry>,
    pub statvfs: Option<Statvfs>,
    pub lock: Option<Flock>,
    pub pairs: Vec<(String, Vec<u8>)>,
    pub xdata: Xdata,
}

impl WireRep {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.put_opt_attr(self.attr.as_ref());
        enc.put_opt_attr(self.pre.as_ref());
        enc.put_opt_attr(self.post.as_ref());
        enc.put_i64(self.fd);
        enc.put_u64(self.count);
        enc.put_bytes(&self.data);
        enc.put_str(&self.target);
        enc.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            enc.put_bytes(entry.name.as_encoded_bytes());
            enc.put_u64(entry.ino);
            enc.put_u8(file_type_tag(entry.kind));
            enc.put_u64(entry.offset);
        }
        match &self.statvfs {
            Some(vfs) => {
                enc.put_u8(1);
                enc.put_u64(vfs.bsize);
                enc.put_u64(vfs.frsize);
                enc.put_u64(vfs.blocks);
                enc.put_u64(vfs.bfree);
                enc.put_u64(vfs.bavail);
                enc.put_u64(vfs.files);
                enc.put_u64(vfs.ffree);
                enc.put_u64(vfs.namemax);
            }
            None => enc.put_u8(0),
        }
        match &self.lock {
            Some(lock) => {
                enc.put_u8(1);
                enc.put_flock(lock);
            }
            None => enc.put_u8(0),
        }
        enc.put_u32(self.pairs.len() as u32);
        for (name, value) in &self.pairs {
            enc.put_str(name);
            enc.put_bytes(value);
        }
        enc.put_xdata(&self.xdata);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<WireRep, Errno> {
        let mut dec = Dec::new(buf);
        let attr = dec.get_opt_attr()?;
        let pre = dec.get_opt_attr()?;
        let post = dec.get_opt_attr()?;
        let fd = dec.get_i64()?;
        let count = dec.get_u64()?;
        let data = dec.get_bytes()?;
        let target = dec.get_str()?;
        let entry_count = dec.get_u32()?;
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let name_bytes = dec.get_bytes()?;
            // Entry names came from an OsString on the far side.
            let name = unsafe { OsString::from_encoded_bytes_unchecked(name_bytes) };
            let ino = dec.get_u64()?;
            let kind = file_type_from_tag(dec.get_u8()?)?;
            let offset = dec.get_u64()?;
            entries.push(DirEntry { name, ino, kind, offset });
        }
        let statvfs = match dec.get_u8()? {
            0 => None,
            _ => Some(Statvfs {
                bsize: dec.get_u64()?,
                frsize: dec.get_u64()?,
                blocks: dec.get_u64()?,
                bfree: dec.get_u64()?,
                bavail: dec.get_u64()?,
                files: dec.get_u64()?,
                ffree: dec.get_u64()?,
                namemax: dec.get_u64()?,
            }),
        };
        let lock = match dec.get_u8()? {
            0 => None,
            _ => Some(dec.get_flock()?),
        };
        let pair_count = dec.get_u32()?;
        let mut pairs = Vec::with_capacity(pair_count as usize);
        for _ in 0..pair_count {
            let name = dec.get_str()?;
            let value = dec.get_bytes()?;
            pairs.push((name, value));
        }
        let xdata = dec.get_xdata()?;
        Ok(WireRep {
            attr,
            pre,
            post,
            fd,
            count,
            data,
            target,
            entries,
            statvfs,
            lock,
            pairs,
            xdata,
        })
    }
}

/// Numeric tags shared by both sides for sub-commands.
pub fn lk_cmd_tag(cmd: LkCmd) -> u32 {
    match cmd {
        LkCmd::Get => 0,
        LkCmd::Set => 1,
        LkCmd::SetWait => 2,
    }
}

pub fn lk_cmd_from_tag(tag: u32) -> Result<LkCmd, Errno> {
    Ok(match tag {
        0 => LkCmd::Get,
        1 => LkCmd::Set,
        2 => LkCmd::SetWait,
        _ => return Err(Errno::EPROTO),
    })
}

pub fn entrylk_cmd_tag(cmd: EntrylkCmd) -> u32 {
    match cmd {
        EntrylkCmd::Lock => 0,
        EntrylkCmd::LockNonblock => 1,
        EntrylkCmd::Unlock => 2,
    }
}

pub fn entrylk_cmd_from_tag(tag: u32) -> Result<EntrylkCmd, Errno> {
    Ok(match tag {
        0 => EntrylkCmd::Lock,
        1 => EntrylkCmd::LockNonblock,
        2 => EntrylkCmd::Unlock,
        _ => return Err(Errno::EPROTO),
    })
}

pub fn xattrop_tag(op: XattropOp) -> u32 {
    match op {
        XattropOp::AddArray64 => 0,
        XattropOp::GetAndSet => 1,
    }
}

pub fn xattrop_from_tag(tag: u32) -> Result<XattropOp, Errno> {
    Ok(match tag {
        0 => XattropOp::AddArray64,
        1 => XattropOp::GetAndSet,
        _ => return Err(Errno::EPROTO),
    })
}

pub fn seek_tag(whence: SeekWhence) -> u32 {
    match whence {
        SeekWhence::Data => 0,
        SeekWhence::Hole => 1,
    }
}

pub fn seek_from_tag(tag: u32) -> Result<SeekWhence, Errno> {
    Ok(match tag {
        0 => SeekWhence::Data,
        1 => SeekWhence::Hole,
        _ => return Err(Errno::EPROTO),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_attr() -> Attr {
        Attr {
            gfid: Gfid::from_parts(1, 2),
            ino: 99,
            kind: FileType::RegularFile,
            perm: 0o640,
            nlink: 2,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size: 12345,
            blksize: 4096,
            blocks: 25,
            atime: SystemTime::UNIX_EPOCH + Duration::new(100, 7),
            mtime: SystemTime::UNIX_EPOCH + Duration::new(200, 8),
            ctime: SystemTime::UNIX_EPOCH + Duration::new(300, 9),
        }
    }

    #[test]
    fn request_round_trip() {
        let mut xdata = Xdata::new();
        xdata.set_u64(XKey::LeaderTerm, 5);
        let req = WireReq {
            gfid: Gfid::from_parts(3, 4),
            pargfid: Gfid::ROOT,
            path: "/a/b".into(),
            name: "b".into(),
            name2: "target".into(),
            fd: -2,
            offset: 4096,
            size: 128,
            mode: 0o644,
            flags: libc::O_RDWR as u32,
            cmd: 1,
            data: vec![1, 2, 3],
            pairs: vec![("user.k".into(), vec![9])],
            lock: Some(Flock {
                typ: LkType::Write,
                start: 0,
                end: 1023,
                pid: 7,
                owner: LockOwner::from_kernel(0xbeef),
            }),
            setattr: Some(SetattrArgs { mode: Some(0o600), size: Some(10), ..Default::default() }),
            xdata,
            ..Default::default()
        };
        let decoded = WireReq::decode(&req.encode()).unwrap();
        assert_eq!(decoded.path, "/a/b");
        assert_eq!(decoded.fd, -2);
        assert_eq!(decoded.lock.unwrap().owner, LockOwner::from_kernel(0xbeef));
        let sa = decoded.setattr.unwrap();
        assert_eq!(sa.mode, Some(0o600));
        assert_eq!(sa.uid, None);
        assert_eq!(sa.size, Some(10));
        assert_eq!(decoded.xdata.get_u64(XKey::LeaderTerm), Some(5));
        assert_eq!(decoded.pairs, vec![("user.k".to_string(), vec![9])]);
    }

    #[test]
    fn reply_round_trip() {
        let rep = WireRep {
            attr: Some(sample_attr()),
            pre: None,
            post: Some(sample_attr()),
            fd: 17,
            count: 777,
            data: b"payload".to_vec(),
            target: "../elsewhere".into(),
            entries: vec![DirEntry {
                name: "entry".into(),
                ino: 5,
                kind: FileType::Directory,
                offset: 1,
            }],
            statvfs: Some(Statvfs { bsize: 4096, blocks: 10, ..Default::default() }),
            lock: None,
            pairs: vec![],
            xdata: Xdata::new(),
        };
        let decoded = WireRep::decode(&rep.encode()).unwrap();
        assert_eq!(decoded.attr.unwrap(), sample_attr());
        assert!(decoded.pre.is_none());
        assert_eq!(decoded.fd, 17);
        assert_eq!(decoded.count, 777);
        assert_eq!(decoded.data, b"payload");
        assert_eq!(decoded.entries.len(), 1);
        assert_eq!(decoded.entries[0].name, OsString::from("entry"));
        assert_eq!(decoded.statvfs.unwrap().bsize, 4096);
    }

    #[test]
    fn truncated_input_is_eproto() {
        let req = WireReq { path: "/x".into(), ..Default::default() };
        let bytes = req.encode();
        for cut in [0, 10, bytes.len() - 1] {
            assert_eq!(WireReq::decode(&bytes[..cut]).unwrap_err(), Errno::EPROTO);
        }
    }

    #[test]
    fn unknown_xdata_keys_are_dropped() {
        let mut enc = Enc::new();
        enc.put_u32(1);
        enc.put_str("vendor.something.unknown");
        enc.put_u8(0);
        enc.put_u64(1);
        let bytes = enc.finish();
        let xdata = Dec::new(&bytes).get_xdata().unwrap();
        assert!(xdata.is_empty());
    }
}
