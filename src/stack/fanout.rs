//! Fan-out bookkeeping: one call to each of N children, one unwind upward.
//!
//! The counter and result slots live behind a single lock (the frame lock of
//! the classic discipline); the callback that brings the outstanding count to
//! zero takes the aggregate out and runs the completion outside the lock.

use parking_lot::Mutex;

use crate::stack::FopResult;

struct Inner<R> {
    remaining: usize,
    results: Vec<Option<FopResult<R>>>,
    done: Option<Box<dyn FnOnce(Vec<FopResult<R>>) + Send>>,
}

/// Aggregates N sibling replies into one completion.
pub struct FanOut<R> {
    inner: Mutex<Inner<R>>,
}

impl<R> FanOut<R> {
    /// `done` runs exactly once, on the thread that delivers the last reply,
    /// after the lock is released.
    pub fn new(count: usize, done: impl FnOnce(Vec<FopResult<R>>) + Send + 'static) -> FanOut<R> {
        assert!(count > 0, "fan-out of zero children");
        FanOut {
            inner: Mutex::new(Inner {
                remaining: count,
                results: (0..count).map(|_| None).collect(),
                done: Some(Box::new(done)),
            }),
        }
    }

    /// Record child `index`'s reply. The last reply triggers completion.
    pub fn complete(&self, index: usize, result: FopResult<R>) {
        let fire = {
            let mut inner = self.inner.lock();
            assert!(inner.results[index].is_none(), "duplicate fan-out reply for child {index}");
            inner.results[index] = Some(result);
            inner.remaining -= 1;
            if inner.remaining == 0 {
                let results = inner.results.drain(..).map(|r| r.expect("slot filled")).collect();
                let done = inner.done.take().expect("completion fired twice");
                Some((done, results))
            } else {
                None
            }
        };
        if let Some((done, results)) = fire {
            done(results);
        }
    }
}

impl<R> std::fmt::Debug for FanOut<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FanOut(remaining {})", self.inner.lock().remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno::Errno;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn last_reply_completes_with_all_results() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let fan = FanOut::new(3, move |results: Vec<FopResult<u32>>| {
            assert_eq!(results.len(), 3);
            assert_eq!(results[0], Ok(10));
            assert_eq!(results[1], Err(Errno::ENOSPC));
            assert_eq!(results[2], Ok(30));
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        fan.complete(2, Ok(30));
        fan.complete(0, Ok(10));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        fan.complete(1, Err(Errno::ENOSPC));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_completion_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let fan = Arc::new(FanOut::new(8, move |_: Vec<FopResult<()>>| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let fan = fan.clone();
                thread::spawn(move || fan.complete(i, Ok(())))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
