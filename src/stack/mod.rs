//! Call-stack runtime: frames, wind/unwind discipline, fan-out and stubs.
//!
//! A fop descends the translator tree as a chain of frames. Winding to a
//! child is a method call carrying a child [`Frame`] and an [`Unwinder`];
//! unwinding consumes the unwinder, firing the recorded callback exactly
//! once. An unwinder dropped without being consumed delivers `EIO` upward
//! and logs the leak, so a missing unwind is loud instead of a hang.
//!
//! Per-translator call state lives in the callback closures; state shared by
//! fan-out siblings goes through [`fanout::FanOut`], which owns the lock the
//! original frame-lock discipline requires.

mod fanout;
mod stub;
mod syncop;

pub use fanout::FanOut;
pub use stub::Stub;
pub use syncop::SyncCall;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use smallvec::SmallVec;

use crate::errno::Errno;
use crate::fop::FopKind;

/// Result of one fop: a typed reply, or a positive errno.
pub type FopResult<R> = Result<R, Errno>;

/// Opaque 16-byte lock-owner token. Equality is byte equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LockOwner(pub [u8; 16]);

impl LockOwner {
    /// Lock owner derived from a kernel-supplied 64-bit owner word.
    pub fn from_kernel(owner: u64) -> LockOwner {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&owner.to_le_bytes());
        LockOwner(bytes)
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Debug for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.0[..8]);
        write!(f, "LockOwner({:#x})", u64::from_le_bytes(word))
    }
}

/// Credentials of the caller that originated a fop.
#[derive(Clone, Debug, Default)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub groups: SmallVec<[u32; 8]>,
}

struct FrameRoot {
    unique: u64,
    caller: Caller,
    lock_owner: LockOwner,
}

struct FrameInner {
    root: Arc<FrameRoot>,
    parent: Option<Frame>,
    depth: u32,
}

static NEXT_UNIQUE: AtomicU64 = AtomicU64::new(1);

/// A node in the call stack. Cheap to clone; clones share identity.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

impl Frame {
    /// Start a fresh call stack for an externally originated operation.
    pub fn root(caller: Caller, lock_owner: LockOwner) -> Frame {
        Frame {
            inner: Arc::new(FrameInner {
                root: Arc::new(FrameRoot {
                    unique: NEXT_UNIQUE.fetch_add(1, Ordering::Relaxed),
                    caller,
                    lock_owner,
                }),
                parent: None,
                depth: 0,
            }),
        }
    }

    /// A root frame with empty credentials, for internally originated work
    /// (background flushers, prefetchers, reconciliation).
    pub fn internal() -> Frame {
        Frame::root(Caller::default(), LockOwner::default())
    }

    /// Create a child frame for winding one level down.
    pub fn child(&self) -> Frame {
        Frame {
            inner: Arc::new(FrameInner {
                root: self.inner.root.clone(),
                parent: Some(self.clone()),
                depth: self.inner.depth + 1,
            }),
        }
    }

    /// A new root that inherits credentials and request id but has
    /// independent state: used for auxiliary background operations whose
    /// completion does not unwind the caller.
    pub fn detach(&self) -> Frame {
        Frame {
            inner: Arc::new(FrameInner {
                root: self.inner.root.clone(),
                parent: None,
                depth: 0,
            }),
        }
    }

    pub fn unique(&self) -> u64 {
        self.inner.root.unique
    }

    pub fn caller(&self) -> &Caller {
        &self.inner.root.caller
    }

    pub fn uid(&self) -> u32 {
        self.inner.root.caller.uid
    }

    pub fn gid(&self) -> u32 {
        self.inner.root.caller.gid
    }

    pub fn pid(&self) -> u32 {
        self.inner.root.caller.pid
    }

    pub fn lock_owner(&self) -> LockOwner {
        self.inner.root.lock_owner
    }

    pub fn parent(&self) -> Option<&Frame> {
        self.inner.parent.as_ref()
    }

    /// Distance from the stack root. Strictly increases toward leaves, which
    /// is what keeps the frame graph acyclic.
    pub fn depth(&self) -> u32 {
        self.inner.depth
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("unique", &self.unique())
            .field("depth", &self.inner.depth)
            .field("pid", &self.pid())
            .finish()
    }
}

type Cbk<R> = Box<dyn FnOnce(FopResult<R>) + Send>;

/// The reply half of one wind. Consuming it is the unwind.
///
/// Exactly-once delivery: the callback can only be fired by consuming the
/// unwinder; dropping an unfired unwinder fires it with `EIO` and logs.
pub struct Unwinder<R> {
    frame: Frame,
    op: FopKind,
    cbk: Option<Cbk<R>>,
}

impl<R> Unwinder<R> {
    pub fn new(frame: Frame, op: FopKind, cbk: impl FnOnce(FopResult<R>) + Send + 'static) -> Unwinder<R> {
        Unwinder { frame, op, cbk: Some(Box::new(cbk)) }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn op(&self) -> FopKind {
        self.op
    }

    /// Deliver the reply upward, consuming the unwinder. The parent's
    /// callback runs synchronously on the current thread.
    pub fn unwind(mut self, result: FopResult<R>) {
        let cbk = self.cbk.take().expect("unwinder fired twice");
        cbk(result);
    }

    pub fn okay(self, reply: R) {
        self.unwind(Ok(reply));
    }

    pub fn errno(self, errno: Errno) {
        self.unwind(Err(errno));
    }

    /// Rewrap with a result transformation applied at unwind time; the
    /// frame travels along unchanged.
    pub fn map<T: Send + 'static>(
        self,
        f: impl FnOnce(FopResult<T>) -> FopResult<R> + Send + 'static,
    ) -> Unwinder<T>
    where
        R: Send + 'static,
    {
        let op = self.op;
        let frame = self.frame.clone();
        Unwinder::new(frame, op, move |res| self.unwind(f(res)))
    }
}

impl<R> Drop for Unwinder<R> {
    fn drop(&mut self) {
        if let Some(cbk) = self.cbk.take() {
            warn!(
                "fop {} (unique {}) dropped without unwind, delivering EIO",
                self.op,
                self.frame.unique()
            );
            cbk(Err(Errno::EIO));
        }
    }
}

impl<R> fmt::Debug for Unwinder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unwinder")
            .field("op", &self.op)
            .field("frame", &self.frame)
            .field("armed", &self.cbk.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn child_frames_share_root_identity() {
        let root = Frame::root(
            Caller { uid: 7, gid: 8, pid: 9, groups: SmallVec::new() },
            LockOwner::from_kernel(0x1234),
        );
        let child = root.child();
        let grandchild = child.child();
        assert_eq!(child.unique(), root.unique());
        assert_eq!(grandchild.uid(), 7);
        assert_eq!(grandchild.depth(), 2);
        assert_eq!(grandchild.parent().unwrap().depth(), 1);
    }

    #[test]
    fn detach_keeps_identity_but_drops_parent() {
        let root = Frame::root(Caller::default(), LockOwner::default());
        let child = root.child();
        let side = child.detach();
        assert_eq!(side.unique(), root.unique());
        assert!(side.parent().is_none());
        assert_eq!(side.depth(), 0);
    }

    #[test]
    fn unwinder_fires_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let unw = Unwinder::new(Frame::internal(), FopKind::Flush, move |res: FopResult<()>| {
            assert!(res.is_ok());
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        unw.okay(());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_unwinder_delivers_eio() {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let unw = Unwinder::new(Frame::internal(), FopKind::Readv, move |res: FopResult<u32>| {
            *seen2.lock().unwrap() = Some(res);
        });
        drop(unw);
        assert_eq!(*seen.lock().unwrap(), Some(Err(Errno::EIO)));
    }

    #[test]
    fn map_transforms_reply() {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let unw = Unwinder::new(Frame::internal(), FopKind::Readv, move |res: FopResult<String>| {
            *seen2.lock().unwrap() = Some(res);
        });
        let mapped: Unwinder<u32> = unw.map(|res| res.map(|n| format!("got {n}")));
        mapped.okay(5);
        assert_eq!(seen.lock().unwrap().clone(), Some(Ok("got 5".to_string())));
    }
}
