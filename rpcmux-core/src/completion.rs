//! Lazily allocated "signal once" completion.
//!
//! A [`LazyCompletion`] is one atomic cell in one of four states:
//!
//! ```text
//! null            -> nobody has asked to wait, not yet completed
//! COMPLETED       -> completed before a waiter was installed (no allocation)
//! INSTALLING      -> one caller has claimed the cell and is allocating
//! *const Waiter   -> a waiter was installed; it is resolved in place
//! ```
//!
//! Only the caller that moves the cell from null to `INSTALLING` allocates,
//! so at most one waiter is ever created per handle. Once the cell holds
//! `COMPLETED` it never changes again.

use rpcmux_protocol::ResetReason;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

/// Outcome recorded by [`LazyCompletion::complete`].
pub type Outcome = Result<(), ResetReason>;

struct Waiter {
    outcome: OnceLock<Outcome>,
    notify: Notify,
}

impl Waiter {
    fn new() -> Self {
        Self {
            outcome: OnceLock::new(),
            notify: Notify::new(),
        }
    }

    fn resolve(&self, outcome: Outcome) {
        if self.outcome.set(outcome).is_ok() {
            self.notify.notify_waiters();
        }
    }
}

// Marker addresses. Never dereferenced; a static cannot share an address
// with a heap-allocated waiter.
static COMPLETED_MARK: u8 = 0;
static INSTALLING_MARK: u8 = 0;

fn completed() -> *mut Waiter {
    ptr::addr_of!(COMPLETED_MARK).cast_mut().cast()
}

fn installing() -> *mut Waiter {
    ptr::addr_of!(INSTALLING_MARK).cast_mut().cast()
}

fn is_waiter(current: *mut Waiter) -> bool {
    !current.is_null() && current != completed() && current != installing()
}

pub struct LazyCompletion {
    state: AtomicPtr<Waiter>,
    outcome: OnceLock<Outcome>,
    #[cfg(test)]
    allocations: std::sync::atomic::AtomicUsize,
}

impl LazyCompletion {
    pub const fn new() -> Self {
        Self {
            state: AtomicPtr::new(ptr::null_mut()),
            outcome: OnceLock::new(),
            #[cfg(test)]
            allocations: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Returns an awaitable for the completion, installing a waiter only if
    /// the outcome is not known yet.
    pub fn get_or_create_task(&self) -> Completion {
        loop {
            let current = self.state.load(Ordering::Acquire);

            if current == completed() {
                return Completion::ready(self.recorded_outcome());
            }

            if current == installing() {
                // Another caller is allocating the waiter.
                std::hint::spin_loop();
                continue;
            }

            if !current.is_null() {
                // SAFETY: a waiter pointer was produced by `Arc::into_raw`
                // below and the cell keeps one strong count alive until
                // `drop`, which needs `&mut self`.
                let waiter = unsafe {
                    Arc::increment_strong_count(current);
                    Arc::from_raw(current)
                };
                return Completion::pending(waiter);
            }

            if self
                .state
                .compare_exchange(
                    ptr::null_mut(),
                    installing(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            #[cfg(test)]
            self.allocations.fetch_add(1, Ordering::Relaxed);
            let waiter = Arc::new(Waiter::new());
            let raw = Arc::into_raw(waiter.clone()).cast_mut();
            return match self.state.compare_exchange(
                installing(),
                raw,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => Completion::pending(waiter),
                Err(_) => {
                    // Completed while allocating; the cell now holds COMPLETED.
                    // SAFETY: `raw` was never published.
                    drop(unsafe { Arc::from_raw(raw) });
                    Completion::ready(self.recorded_outcome())
                }
            };
        }
    }

    /// Records the outcome and wakes every waiter. Returns `false` if the
    /// completion had already been marked; later calls change nothing.
    pub fn complete(&self, outcome: Outcome) -> bool {
        if self.outcome.set(outcome).is_err() {
            return false;
        }

        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if is_waiter(current) {
                // SAFETY: see `get_or_create_task`; the cell holds a strong count.
                let waiter = unsafe { &*current };
                waiter.resolve(self.recorded_outcome());
                return true;
            }
            if current == completed() {
                return true;
            }
            match self.state.compare_exchange(
                current,
                completed(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn mark_complete(&self) -> bool {
        self.complete(Ok(()))
    }

    pub fn is_completed(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Returns whether a waiter object was ever allocated for this handle.
    pub fn has_waiter(&self) -> bool {
        is_waiter(self.state.load(Ordering::Acquire))
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.get().cloned()
    }

    fn recorded_outcome(&self) -> Outcome {
        self.outcome.get().cloned().unwrap_or(Ok(()))
    }
}

impl Default for LazyCompletion {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LazyCompletion {
    fn drop(&mut self) {
        let current = *self.state.get_mut();
        if is_waiter(current) {
            // SAFETY: releases the strong count owned by the cell.
            drop(unsafe { Arc::from_raw(current) });
        }
    }
}

impl std::fmt::Debug for LazyCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyCompletion")
            .field("completed", &self.is_completed())
            .field("has_waiter", &self.has_waiter())
            .finish()
    }
}

/// Awaitable returned by [`LazyCompletion::get_or_create_task`].
pub struct Completion {
    inner: CompletionInner,
}

enum CompletionInner {
    Ready(Outcome),
    Pending(Arc<Waiter>),
}

impl Completion {
    fn ready(outcome: Outcome) -> Self {
        Self {
            inner: CompletionInner::Ready(outcome),
        }
    }

    fn pending(waiter: Arc<Waiter>) -> Self {
        Self {
            inner: CompletionInner::Pending(waiter),
        }
    }

    /// Returns the outcome without waiting, if it is already known.
    pub fn try_outcome(&self) -> Option<Outcome> {
        match &self.inner {
            CompletionInner::Ready(outcome) => Some(outcome.clone()),
            CompletionInner::Pending(waiter) => waiter.outcome.get().cloned(),
        }
    }

    /// Waits until the completion resolves.
    pub async fn wait(self) -> Outcome {
        match self.inner {
            CompletionInner::Ready(outcome) => outcome,
            CompletionInner::Pending(waiter) => loop {
                let notified = waiter.notify.notified();
                tokio::pin!(notified);
                // Register before checking so a resolve in between is not lost.
                notified.as_mut().enable();
                if let Some(outcome) = waiter.outcome.get() {
                    return outcome.clone();
                }
                notified.await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcmux_protocol::ErrorCode;
    use std::time::Duration;

    #[test]
    fn test_complete_before_wait_never_allocates() {
        let completion = LazyCompletion::new();
        assert!(completion.mark_complete());
        assert!(!completion.has_waiter());

        let task = completion.get_or_create_task();
        assert_eq!(task.try_outcome(), Some(Ok(())));
        assert!(!completion.has_waiter());
        assert_eq!(completion.allocations.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_complete_is_once() {
        let completion = LazyCompletion::new();
        let reason = ResetReason::new(ErrorCode::Cancelled, "stop");
        assert!(completion.complete(Err(reason.clone())));
        assert!(!completion.mark_complete());
        assert_eq!(completion.outcome(), Some(Err(reason)));
    }

    #[test]
    fn test_single_waiter_per_handle() {
        let completion = LazyCompletion::new();
        let a = completion.get_or_create_task();
        let b = completion.get_or_create_task();
        assert!(completion.has_waiter());
        match (&a.inner, &b.inner) {
            (CompletionInner::Pending(x), CompletionInner::Pending(y)) => {
                assert!(Arc::ptr_eq(x, y))
            }
            _ => panic!("expected pending completions"),
        }
    }

    #[tokio::test]
    async fn test_ready_after_completion() {
        let completion = LazyCompletion::new();
        completion.complete(Err(ResetReason::transport("gone")));
        let outcome = completion.get_or_create_task().wait().await;
        assert_eq!(outcome.unwrap_err().code, ErrorCode::TransportError);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_waiters_resolve_together() {
        let completion = Arc::new(LazyCompletion::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let completion = completion.clone();
            handles.push(tokio::spawn(async move {
                completion.get_or_create_task().wait().await
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        for handle in &handles {
            assert!(!handle.is_finished());
        }

        assert!(completion.mark_complete());
        for handle in handles {
            let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(outcome, Ok(()));
        }
        assert!(completion.has_waiter());
    }

    #[test]
    fn test_racing_creators_install_one_waiter() {
        let completion = Arc::new(LazyCompletion::new());
        let start = Arc::new(std::sync::Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let completion = completion.clone();
                let start = start.clone();
                std::thread::spawn(move || {
                    start.wait();
                    completion.get_or_create_task()
                })
            })
            .collect();
        let tasks: Vec<Completion> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        let first = match &tasks[0].inner {
            CompletionInner::Pending(w) => w.clone(),
            CompletionInner::Ready(_) => panic!("not completed yet"),
        };
        for task in &tasks {
            match &task.inner {
                CompletionInner::Pending(w) => assert!(Arc::ptr_eq(w, &first)),
                CompletionInner::Ready(_) => panic!("not completed yet"),
            }
        }

        assert_eq!(completion.allocations.load(Ordering::Relaxed), 1);

        completion.mark_complete();
        for task in &tasks {
            assert_eq!(task.try_outcome(), Some(Ok(())));
        }
    }

    #[test]
    fn test_creators_racing_completion_allocate_at_most_once() {
        for _ in 0..200 {
            let completion = Arc::new(LazyCompletion::new());
            let start = Arc::new(std::sync::Barrier::new(5));
            let creators: Vec<_> = (0..4)
                .map(|_| {
                    let completion = completion.clone();
                    let start = start.clone();
                    std::thread::spawn(move || {
                        start.wait();
                        completion.get_or_create_task()
                    })
                })
                .collect();
            start.wait();
            assert!(completion.mark_complete());

            for creator in creators {
                let task = creator.join().unwrap();
                assert_eq!(task.try_outcome(), Some(Ok(())));
            }
            assert!(completion.allocations.load(Ordering::Relaxed) <= 1);
        }
    }
}
