//! Blocking wait on an asynchronous fop.
//!
//! What looks synchronous in background threads (flush loops, reconciliation,
//! teardown) is an asynchronous issue followed by a condition-variable wait
//! on the reply. Never use this from a dispatcher thread.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::errno::Errno;
use crate::fop::FopKind;
use crate::stack::{FopResult, Frame, Unwinder};

struct Shared<R> {
    slot: Mutex<Option<FopResult<R>>>,
    cond: Condvar,
}

/// One synchronous call: hand out the unwinder, wind, then wait.
pub struct SyncCall<R> {
    shared: Arc<Shared<R>>,
}

impl<R: Send + 'static> SyncCall<R> {
    pub fn new() -> SyncCall<R> {
        SyncCall {
            shared: Arc::new(Shared { slot: Mutex::new(None), cond: Condvar::new() }),
        }
    }

    /// The unwinder to pass down; its firing wakes the waiter.
    pub fn unwinder(&self, frame: Frame, op: FopKind) -> Unwinder<R> {
        let shared = self.shared.clone();
        Unwinder::new(frame, op, move |res| {
            *shared.slot.lock() = Some(res);
            shared.cond.notify_one();
        })
    }

    /// Block until the reply arrives.
    pub fn wait(self) -> FopResult<R> {
        let mut slot = self.shared.slot.lock();
        while slot.is_none() {
            self.shared.cond.wait(&mut slot);
        }
        slot.take().expect("reply present")
    }

    /// Block with a timeout; ETIMEDOUT if the reply never arrives.
    pub fn wait_timeout(self, timeout: Duration) -> FopResult<R> {
        let mut slot = self.shared.slot.lock();
        while slot.is_none() {
            if self.shared.cond.wait_for(&mut slot, timeout).timed_out() {
                return slot.take().unwrap_or(Err(Errno::ETIMEDOUT));
            }
        }
        slot.take().expect("reply present")
    }
}

impl<R: Send + 'static> Default for SyncCall<R> {
    fn default() -> Self {
        SyncCall::new()
    }
}

impl<R> std::fmt::Debug for SyncCall<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SyncCall")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_sees_reply_from_other_thread() {
        let call = SyncCall::<u64>::new();
        let unw = call.unwinder(Frame::internal(), FopKind::Fsync);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            unw.okay(99);
        });
        assert_eq!(call.wait(), Ok(99));
    }

    #[test]
    fn timeout_reports_etimedout() {
        let call = SyncCall::<()>::new();
        let unw = call.unwinder(Frame::internal(), FopKind::Fsync);
        let res = call.wait_timeout(Duration::from_millis(20));
        assert_eq!(res, Err(Errno::ETIMEDOUT));
        drop(unw);
    }
}
