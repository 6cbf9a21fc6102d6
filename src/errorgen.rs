//! Failure-injection translator.
//!
//! Fails a configured fraction of matching fops with a configured errno
//! before they reach the children. Used to exercise partial-failure handling
//! in fan-out and replication without real faults.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::errno::Errno;
use crate::fdtable::Fd;
use crate::fop::{
    Attr, EntryReply, Flock, FopKind, LkCmd, Loc, OpenFlags, ParentReply, Payload, PrePostReply,
    ReadReply, SetattrArgs, WriteReply,
};
use crate::options::{OptSpec, OptType, Options};
use crate::stack::{Frame, Unwinder};
use crate::xdata::Xdata;
use crate::xlator::{XlCore, Xlator};

const OPTIONS: &[OptSpec] = &[
    OptSpec {
        key: "failure",
        typ: OptType::Str,
        default: "all",
        desc: "fop name to fail, or \"all\"",
    },
    OptSpec { key: "error", typ: OptType::Str, default: "EIO", desc: "errno injected on failure" },
    OptSpec {
        key: "chance",
        typ: OptType::Percent,
        default: "100",
        desc: "probability of failing a matching fop",
    },
];

fn errno_by_name(name: &str) -> Errno {
    match name {
        "ENOENT" => Errno::ENOENT,
        "EACCES" => Errno::EACCES,
        "EAGAIN" => Errno::EAGAIN,
        "EBADF" => Errno::EBADF,
        "ENOSPC" => Errno::ENOSPC,
        "ENOTCONN" => Errno::ENOTCONN,
        "EROFS" => Errno::EROFS,
        "ETIMEDOUT" => Errno::ETIMEDOUT,
        _ => Errno::EIO,
    }
}

/// Injects errors into matching fops at a configured rate.
pub struct ErrorGen {
    core: XlCore,
    target: Option<FopKind>,
    errno: Errno,
    chance: u32,
    // Deterministic generator; test runs must be reproducible.
    rng: AtomicU64,
}

impl ErrorGen {
    pub fn new(name: &str, options: &Options, child: Arc<dyn Xlator>) -> Arc<ErrorGen> {
        let failure = options.get_str("failure");
        Arc::new(ErrorGen {
            core: XlCore::new(name, vec![child]),
            target: failure.parse().ok(),
            errno: errno_by_name(options.get_str("error")),
            chance: options.get_percent("chance") as u32,
            rng: AtomicU64::new(0x9e37_79b9_7f4a_7c15),
        })
    }

    pub fn option_table() -> &'static [OptSpec] {
        OPTIONS
    }

    fn roll(&self) -> u32 {
        let mut state = self.rng.load(Ordering::Relaxed);
        loop {
            let next = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            match self.rng.compare_exchange_weak(state, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return ((next >> 33) % 100) as u32,
                Err(seen) => state = seen,
            }
        }
    }

    fn should_fail(&self, kind: FopKind) -> Option<Errno> {
        if let Some(target) = self.target {
            if target != kind {
                return None;
            }
        }
        if self.roll() < self.chance {
            debug!("{}: injecting {} into {kind}", self.core.name(), self.errno);
            Some(self.errno)
        } else {
            None
        }
    }
}

macro_rules! maybe_fail {
    ($self:ident, $kind:expr, $unw:ident) => {
        if let Some(errno) = $self.should_fail($kind) {
            $unw.errno(errno);
            return;
        }
    };
}

impl Xlator for ErrorGen {
    fn core(&self) -> &XlCore {
        &self.core
    }

    fn option_specs(&self) -> &'static [OptSpec] {
        OPTIONS
    }

    fn lookup(&self, frame: Frame, loc: Loc, xdata: Xdata, unw: Unwinder<EntryReply>) {
        maybe_fail!(self, FopKind::Lookup, unw);
        self.core.first_child().expect("has child").lookup(frame, loc, xdata, unw);
    }

    fn stat(&self, frame: Frame, loc: Loc, unw: Unwinder<Attr>) {
        maybe_fail!(self, FopKind::Stat, unw);
        self.core.first_child().expect("has child").stat(frame, loc, unw);
    }

    fn setattr(&self, frame: Frame, loc: Loc, args: SetattrArgs, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        maybe_fail!(self, FopKind::Setattr, unw);
        self.core.first_child().expect("has child").setattr(frame, loc, args, xdata, unw);
    }

    fn mkdir(&self, frame: Frame, loc: Loc, mode: u32, umask: u32, xdata: Xdata, unw: Unwinder<EntryReply>) {
        maybe_fail!(self, FopKind::Mkdir, unw);
        self.core.first_child().expect("has child").mkdir(frame, loc, mode, umask, xdata, unw);
    }

    fn unlink(&self, frame: Frame, loc: Loc, xdata: Xdata, unw: Unwinder<ParentReply>) {
        maybe_fail!(self, FopKind::Unlink, unw);
        self.core.first_child().expect("has child").unlink(frame, loc, xdata, unw);
    }

    fn open(&self, frame: Frame, loc: Loc, flags: OpenFlags, fd: Arc<Fd>, unw: Unwinder<()>) {
        maybe_fail!(self, FopKind::Open, unw);
        self.core.first_child().expect("has child").open(frame, loc, flags, fd, unw);
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
        maybe_fail!(self, FopKind::Create, unw);
        self.core.first_child().expect("has child").create(frame, loc, flags, mode, umask, fd, xdata, unw);
    }

    fn readv(&self, frame: Frame, fd: Arc<Fd>, size: usize, offset: u64, flags: u32, xdata: Xdata, unw: Unwinder<ReadReply>) {
        maybe_fail!(self, FopKind::Readv, unw);
        self.core.first_child().expect("has child").readv(frame, fd, size, offset, flags, xdata, unw);
    }

    fn writev(&self, frame: Frame, fd: Arc<Fd>, payload: Payload, offset: u64, flags: u32, xdata: Xdata, unw: Unwinder<WriteReply>) {
        maybe_fail!(self, FopKind::Writev, unw);
        self.core.first_child().expect("has child").writev(frame, fd, payload, offset, flags, xdata, unw);
    }

    fn truncate(&self, frame: Frame, loc: Loc, offset: u64, xdata: Xdata, unw: Unwinder<PrePostReply>) {
        maybe_fail!(self, FopKind::Truncate, unw);
        self.core.first_child().expect("has child").truncate(frame, loc, offset, xdata, unw);
    }

    fn fsync(&self, frame: Frame, fd: Arc<Fd>, datasync: bool, unw: Unwinder<PrePostReply>) {
        maybe_fail!(self, FopKind::Fsync, unw);
        self.core.first_child().expect("has child").fsync(frame, fd, datasync, unw);
    }

    fn lk(&self, frame: Frame, fd: Arc<Fd>, cmd: LkCmd, lock: Flock, xdata: Xdata, unw: Unwinder<Flock>) {
        maybe_fail!(self, FopKind::Lk, unw);
        self.core.first_child().expect("has child").lk(frame, fd, cmd, lock, xdata, unw);
    }
}

impl std::fmt::Debug for ErrorGen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorGen")
            .field("target", &self.target)
            .field("errno", &self.errno)
            .field("chance", &self.chance)
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

    struct AlwaysOk {
        core: XlCore,
    }

    impl Xlator for AlwaysOk {
        fn core(&self) -> &XlCore {
            &self.core
        }

        fn flush(&self, _frame: Frame, _fd: Arc<Fd>, unw: Unwinder<()>) {
            unw.okay(());
        }

        fn fsync(&self, _frame: Frame, _fd: Arc<Fd>, _datasync: bool, unw: Unwinder<PrePostReply>) {
            let attr = Attr::synthetic_dir(crate::gfid::Gfid::ROOT);
            unw.okay(PrePostReply { pre: attr, post: attr });
        }
    }

    fn build(failure: &str, chance: &str) -> Graph {
        let mut raw = HashMap::new();
        raw.insert("failure".to_string(), failure.to_string());
        raw.insert("error".to_string(), "ENOTCONN".to_string());
        raw.insert("chance".to_string(), chance.to_string());
        let opts = Options::validate(ErrorGen::option_table(), &raw).unwrap();
        let bottom = Arc::new(AlwaysOk { core: XlCore::new("ok", vec![]) });
        Graph::assemble(ErrorGen::new("errorgen", &opts, bottom)).unwrap()
    }

    #[test]
    fn matching_fop_fails_with_configured_errno() {
        let graph = build("fsync", "100");
        let table = InodeTable::new();
        let fd = Fd::new(table.root(), OpenFlags::empty(), 1);

        let call = SyncCall::<PrePostReply>::new();
        graph.root().fsync(
            Frame::internal(),
            fd.clone(),
            false,
            call.unwinder(Frame::internal(), FopKind::Fsync),
        );
        assert_eq!(call.wait().unwrap_err(), Errno::ENOTCONN);

        // A different fop is untouched.
        let call = SyncCall::<()>::new();
        graph.root().flush(Frame::internal(), fd, call.unwinder(Frame::internal(), FopKind::Flush));
        assert_eq!(call.wait(), Ok(()));
    }

    #[test]
    fn zero_chance_never_fails() {
        let graph = build("all", "0");
        let table = InodeTable::new();
        let fd = Fd::new(table.root(), OpenFlags::empty(), 1);
        for _ in 0..32 {
            let call = SyncCall::<PrePostReply>::new();
            graph.root().fsync(
                Frame::internal(),
                fd.clone(),
                false,
                call.unwinder(Frame::internal(), FopKind::Fsync),
            );
            assert!(call.wait().is_ok());
        }
    }
}
