//! Resumable fop stubs.
//!
//! A translator that must defer an operation captures the arguments and the
//! unwinder into a stub and parks it; `resume` replays the captured call
//! later, typically on a different thread. Queueing, post-reconnect replay
//! and run-after-prerequisite all go through this.

use log::warn;

use crate::fop::FopKind;

/// A parked fop, ready to be resumed exactly once.
pub struct Stub {
    op: FopKind,
    run: Option<Box<dyn FnOnce() + Send>>,
}

impl Stub {
    pub fn new(op: FopKind, run: impl FnOnce() + Send + 'static) -> Stub {
        Stub { op, run: Some(Box::new(run)) }
    }

    pub fn op(&self) -> FopKind {
        self.op
    }

    /// Replay the captured call.
    pub fn resume(mut self) {
        let run = self.run.take().expect("stub resumed twice");
        run();
    }
}

impl Drop for Stub {
    fn drop(&mut self) {
        // The captured unwinder's own drop handler reports EIO upward, so a
        // leaked stub fails the fop rather than hanging it; still worth a log
        // line because a leak here means a queueing bug.
        if self.run.is_some() {
            warn!("stub for {} dropped without resume", self.op);
        }
    }
}

impl std::fmt::Debug for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stub({}, armed: {})", self.op, self.run.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn resume_runs_captured_call() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let stub = Stub::new(FopKind::Writev, move || ran2.store(true, Ordering::SeqCst));
        assert_eq!(stub.op(), FopKind::Writev);
        stub.resume();
        assert!(ran.load(Ordering::SeqCst));
    }
}
