//! Async counting semaphore with cancellable acquisition
//!
//! Provides a semaphore primitive compatible with compio's async runtime to
//! bound how many tasks may hold a logical resource at once. Acquisition has
//! a blocking (suspending) form, a cancellable form driven by a caller-built
//! cancellation token, and a non-blocking form.
//!
//! # Example
//!
//! ```rust,no_run
//! use compio_semaphore::Semaphore;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! // Create semaphore with 64 slots
//! let semaphore = Arc::new(Semaphore::new(64));
//!
//! // Claim a slot before starting work
//! let permit = semaphore.acquire().await;
//!
//! // Do work while holding the slot
//! // ...
//!
//! // Slot automatically returned when dropped
//! drop(permit);
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use futures::future::{self, Either};
use futures::pin_mut;
use tracing::trace;

/// A compio-compatible async semaphore for bounding concurrency
///
/// The semaphore maintains a fixed number of slots that must be claimed
/// before performing an operation. When every slot is in use, `acquire()`
/// waits asynchronously until one becomes available; `acquire_or_cancel()`
/// additionally gives up when a caller-supplied cancellation token fires.
///
/// # Design
///
/// - **Lock-free fast path**: claiming and returning slots is a single atomic
///   operation when a slot is free
/// - **Cancel-safe waiting**: a waiter that gives up deregisters itself and
///   hands any wakeup it absorbed to the next waiter, so a freed slot is
///   never silently lost
/// - **RAII permits**: [`SemaphorePermit`] returns its slot on drop, making
///   an unmatched release unrepresentable
/// - **Cloneable**: handles share one slot pool and are cheap to clone
///
/// No ordering is guaranteed among waiters: when a slot frees up, any
/// suspended `acquire()` may be the one that claims it.
///
/// # Example
///
/// ```rust,no_run
/// use compio_semaphore::Semaphore;
/// use std::sync::Arc;
///
/// # async fn example() {
/// let sem = Arc::new(Semaphore::new(100));
///
/// // Spawn multiple concurrent tasks
/// for i in 0..1000 {
///     let sem = sem.clone();
///     compio::runtime::spawn(async move {
///         let _permit = sem.acquire().await;
///         // Only 100 tasks run concurrently
///         println!("Processing {}", i);
///     });
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct Semaphore {
    /// Shared state between all clones of this semaphore
    inner: Arc<SemaphoreInner>,
}

/// Internal shared state for the semaphore
struct SemaphoreInner {
    /// Available slots (atomic for lock-free claim/return)
    permits: AtomicUsize,
    /// Fixed capacity chosen at construction
    max_permits: usize,
    /// Suspended acquires waiting for a slot
    waiters: Mutex<WaitQueue>,
}

/// Queue of suspended acquires, keyed so a waiter can deregister itself
///
/// Keys are handed out monotonically; an entry is removed either when its
/// waiter is woken by a release or when the waiter's future is dropped.
struct WaitQueue {
    entries: VecDeque<(u64, Waker)>,
    next_key: u64,
}

impl WaitQueue {
    /// Register a new waiter, or refresh the waker of an existing one
    ///
    /// Returns the key under which the waiter is queued. A waiter whose entry
    /// was already popped by a release gets re-queued under a fresh key.
    fn register(&mut self, key: Option<u64>, waker: &Waker) -> u64 {
        if let Some(key) = key {
            if let Some((_, registered)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
                if !registered.will_wake(waker) {
                    *registered = waker.clone();
                }
                return key;
            }
        }
        let key = self.next_key;
        self.next_key += 1;
        self.entries.push_back((key, waker.clone()));
        key
    }

    /// Remove the entry queued under `key`, if it is still queued
    fn remove(&mut self, key: u64) {
        if let Some(index) = self.entries.iter().position(|(k, _)| *k == key) {
            self.entries.remove(index);
        }
    }

    /// Take the waker of the longest-queued waiter
    fn pop_front(&mut self) -> Option<Waker> {
        self.entries.pop_front().map(|(_, waker)| waker)
    }
}

impl Semaphore {
    /// Create a new semaphore with the given number of slots
    ///
    /// # Arguments
    ///
    /// * `permits` - The fixed capacity (maximum concurrency)
    ///
    /// # Panics
    ///
    /// Panics if `permits` is 0. A zero-capacity semaphore could never be
    /// acquired, so this is treated as a programming error rather than a
    /// runtime condition; the capacity is never clamped or defaulted.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_semaphore::Semaphore;
    ///
    /// let sem = Semaphore::new(64);
    /// assert_eq!(sem.available_permits(), 64);
    /// ```
    #[must_use]
    pub fn new(permits: usize) -> Self {
        assert!(permits > 0, "Semaphore must have at least one permit");
        trace!("created semaphore with {} permits", permits);
        Self {
            inner: Arc::new(SemaphoreInner {
                permits: AtomicUsize::new(permits),
                max_permits: permits,
                waiters: Mutex::new(WaitQueue {
                    entries: VecDeque::new(),
                    next_key: 0,
                }),
            }),
        }
    }

    /// Claim a slot, waiting asynchronously until one is available
    ///
    /// Returns a [`SemaphorePermit`] that returns the slot when dropped.
    /// If a slot is free the call completes without suspending; otherwise the
    /// task suspends until a holder drops its permit.
    ///
    /// The returned future is cancel-safe: dropping it before completion
    /// leaves the semaphore unchanged, and a wakeup that had already been
    /// directed at the dropped waiter is passed on to the next one.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use compio_semaphore::Semaphore;
    ///
    /// # async fn example() {
    /// let sem = Semaphore::new(10);
    ///
    /// let permit = sem.acquire().await;
    /// // Do work...
    /// drop(permit); // Return the slot
    /// # }
    /// ```
    pub async fn acquire(&self) -> SemaphorePermit {
        AcquireFuture {
            semaphore: self.clone(),
            key: None,
        }
        .await
    }

    /// Claim a slot, waiting until one is available or `token` fires
    ///
    /// `token` is a caller-built cancellation future carrying the reason to
    /// report on cancellation, typically [`AcquireError`]: a deadline token
    /// is a timer mapped to [`AcquireError::DeadlineExceeded`], an explicit
    /// one a channel mapped to [`AcquireError::Cancelled`]. The two outcomes
    /// are committed as a single choice: either a slot is claimed and the
    /// token is ignored from then on, or the token's output is returned and
    /// the semaphore is left completely unchanged (the caller holds nothing
    /// and must not release anything).
    ///
    /// The slot side is checked first, so a token that is already fired at
    /// call time still yields a permit when a slot is free.
    ///
    /// [`AcquireError`]: crate::AcquireError
    /// [`AcquireError::DeadlineExceeded`]: crate::AcquireError::DeadlineExceeded
    /// [`AcquireError::Cancelled`]: crate::AcquireError::Cancelled
    ///
    /// # Errors
    ///
    /// Returns the cancellation token's output when it fires before a slot
    /// could be claimed.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use compio_semaphore::{AcquireError, Semaphore};
    /// use futures::FutureExt;
    /// use std::time::Duration;
    ///
    /// # async fn example() {
    /// let sem = Semaphore::new(8);
    ///
    /// let deadline = compio::time::sleep(Duration::from_millis(50))
    ///     .map(|()| AcquireError::DeadlineExceeded);
    ///
    /// match sem.acquire_or_cancel(deadline).await {
    ///     Ok(permit) => {
    ///         // Slot held until `permit` is dropped
    ///         drop(permit);
    ///     }
    ///     Err(AcquireError::DeadlineExceeded) => {
    ///         // Contended for 50ms; back off
    ///     }
    ///     Err(AcquireError::Cancelled) => {}
    /// }
    /// # }
    /// ```
    pub async fn acquire_or_cancel<C>(&self, token: C) -> Result<SemaphorePermit, C::Output>
    where
        C: Future,
    {
        let acquire = self.acquire();
        pin_mut!(acquire);
        pin_mut!(token);

        match future::select(acquire, token).await {
            Either::Left((permit, _)) => Ok(permit),
            Either::Right((reason, _)) => Err(reason),
        }
    }

    /// Try to claim a slot without waiting
    ///
    /// Returns `Some(SemaphorePermit)` if a slot was immediately available,
    /// or `None` if the full capacity is currently claimed. Never suspends
    /// the caller; the attempt is a single atomic check-and-claim.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_semaphore::Semaphore;
    ///
    /// let sem = Semaphore::new(1);
    ///
    /// let permit1 = sem.try_acquire();
    /// assert!(permit1.is_some());
    ///
    /// let permit2 = sem.try_acquire();
    /// assert!(permit2.is_none()); // Capacity exhausted
    /// ```
    #[must_use]
    pub fn try_acquire(&self) -> Option<SemaphorePermit> {
        // Fast path: atomic decrement if a slot is free
        let mut current = self.inner.permits.load(Ordering::Acquire);

        loop {
            if current == 0 {
                return None;
            }

            match self.inner.permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(SemaphorePermit {
                        semaphore: self.clone(),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Get the number of currently available slots
    ///
    /// Useful for monitoring and debugging but not for making decisions:
    /// the value may change immediately after being read.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_semaphore::Semaphore;
    ///
    /// let sem = Semaphore::new(100);
    /// assert_eq!(sem.available_permits(), 100);
    ///
    /// let _permit = sem.try_acquire();
    /// assert_eq!(sem.available_permits(), 99);
    /// ```
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.inner.permits.load(Ordering::Acquire)
    }

    /// Get the fixed capacity chosen at construction
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_semaphore::Semaphore;
    ///
    /// let sem = Semaphore::new(64);
    /// assert_eq!(sem.max_permits(), 64);
    /// ```
    #[must_use]
    pub fn max_permits(&self) -> usize {
        self.inner.max_permits
    }

    /// Get the number of slots currently claimed (capacity - available)
    ///
    /// Like [`available_permits`](Self::available_permits), monitoring only.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_semaphore::Semaphore;
    ///
    /// let sem = Semaphore::new(100);
    /// let _permit = sem.try_acquire();
    /// assert_eq!(sem.in_use(), 1);
    /// ```
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.max_permits - self.available_permits()
    }

    /// Return a slot to the pool (called by `SemaphorePermit::drop`)
    fn release(&self) {
        self.inner.permits.fetch_add(1, Ordering::Release);

        // Wake one waiter if any are queued. The waker is invoked after the
        // queue lock is dropped so no foreign code runs under it.
        let woken = self.lock_waiters().pop_front();
        if let Some(waker) = woken {
            trace!("slot returned; waking one waiter");
            waker.wake();
        }
    }

    /// Deregister a waiter whose acquire future was dropped before completing
    ///
    /// If a release already popped this waiter, the wakeup it consumed never
    /// produced a claim; while a slot remains free the wakeup is handed to
    /// the next queued waiter so the slot is not lost.
    fn cancel_waiter(&self, key: u64) {
        let woken = {
            let mut waiters = self.lock_waiters();
            waiters.remove(key);
            if self.inner.permits.load(Ordering::Acquire) > 0 {
                waiters.pop_front()
            } else {
                None
            }
        };
        if let Some(waker) = woken {
            trace!("cancelled waiter {} handed its wakeup on", key);
            waker.wake();
        }
    }

    /// Lock the waiter queue, folding a poisoned lock back to its guard
    ///
    /// Skipping the queue on poison (rather than recovering the guard) could
    /// swallow a wakeup, so the guard is always taken.
    fn lock_waiters(&self) -> MutexGuard<'_, WaitQueue> {
        self.inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// RAII guard that returns a semaphore slot on drop
///
/// Returned by [`Semaphore::acquire`], [`Semaphore::acquire_or_cancel`] and
/// [`Semaphore::try_acquire`]. Dropping the permit returns the slot to the
/// pool and wakes one waiting task (if any), so every successful acquisition
/// is released exactly once.
///
/// # Example
///
/// ```rust,no_run
/// use compio_semaphore::Semaphore;
///
/// # async fn example() {
/// let sem = Semaphore::new(10);
///
/// {
///     let permit = sem.acquire().await;
///     // Slot is held here
/// } // Slot returned when scope ends
///
/// assert_eq!(sem.available_permits(), 10);
/// # }
/// ```
pub struct SemaphorePermit {
    /// The semaphore that issued this permit
    semaphore: Semaphore,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Future that resolves once a slot has been claimed
///
/// The poll protocol:
/// 1. Try the lock-free fast path
/// 2. Register the task's waker in the wait queue
/// 3. Re-check the fast path, closing the window against a release that ran
///    between steps 1 and 2
/// 4. Pend until a release pops this waiter and wakes it
///
/// Dropping the future deregisters the waiter (see
/// [`Semaphore::cancel_waiter`]).
struct AcquireFuture {
    /// The semaphore from which to claim a slot
    semaphore: Semaphore,
    /// Wait-queue key once the waiter has registered
    key: Option<u64>,
}

impl Future for AcquireFuture {
    type Output = SemaphorePermit;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(permit) = this.semaphore.try_acquire() {
            if let Some(key) = this.key.take() {
                this.semaphore.lock_waiters().remove(key);
            }
            return Poll::Ready(permit);
        }

        this.key = Some(
            this.semaphore
                .lock_waiters()
                .register(this.key, cx.waker()),
        );

        // A slot returned while the waker was being registered would not
        // have found this waiter in the queue; re-check before pending.
        if let Some(permit) = this.semaphore.try_acquire() {
            if let Some(key) = this.key.take() {
                this.semaphore.lock_waiters().remove(key);
            }
            return Poll::Ready(permit);
        }

        Poll::Pending
    }
}

impl Drop for AcquireFuture {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.semaphore.cancel_waiter(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_new() {
        let sem = Semaphore::new(64);
        assert_eq!(sem.available_permits(), 64);
        assert_eq!(sem.max_permits(), 64);
        assert_eq!(sem.in_use(), 0);
    }

    #[test]
    fn test_semaphore_try_acquire() {
        let sem = Semaphore::new(2);

        let permit1 = sem.try_acquire();
        assert!(permit1.is_some());
        assert_eq!(sem.available_permits(), 1);
        assert_eq!(sem.in_use(), 1);

        let permit2 = sem.try_acquire();
        assert!(permit2.is_some());
        assert_eq!(sem.available_permits(), 0);
        assert_eq!(sem.in_use(), 2);

        // Third attempt fails and changes nothing
        let permit3 = sem.try_acquire();
        assert!(permit3.is_none());
        assert_eq!(sem.available_permits(), 0);

        drop(permit1);
        assert_eq!(sem.available_permits(), 1);
        assert_eq!(sem.in_use(), 1);

        let permit4 = sem.try_acquire();
        assert!(permit4.is_some());
        assert_eq!(sem.available_permits(), 0);
    }

    #[test]
    fn test_semaphore_permit_drop() {
        let sem = Semaphore::new(1);

        {
            let permit = sem.try_acquire();
            assert!(permit.is_some());
            assert_eq!(sem.available_permits(), 0);
        } // Permit dropped here

        assert_eq!(sem.available_permits(), 1);
    }

    #[compio::test]
    async fn test_semaphore_acquire_basic() {
        let sem = Semaphore::new(2);

        let permit1 = sem.acquire().await;
        assert_eq!(sem.available_permits(), 1);

        let permit2 = sem.acquire().await;
        assert_eq!(sem.available_permits(), 0);

        drop(permit1);
        assert_eq!(sem.available_permits(), 1);

        drop(permit2);
        assert_eq!(sem.available_permits(), 2);
    }

    #[compio::test]
    async fn test_semaphore_blocking_and_wakeup() {
        let sem = Arc::new(Semaphore::new(1));

        let permit1 = sem.acquire().await;
        assert_eq!(sem.available_permits(), 0);

        // Spawn a task that blocks waiting for the slot
        let sem2 = sem.clone();
        let handle = compio::runtime::spawn(async move {
            let _permit = sem2.acquire().await;
            42
        });

        // Release the slot - the blocked task claims it and completes
        drop(permit1);

        let result = handle.await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(sem.available_permits(), 1);
    }

    #[compio::test]
    async fn test_semaphore_multiple_waiters() {
        let sem = Arc::new(Semaphore::new(1));

        let permit = sem.acquire().await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let sem = sem.clone();
            let handle = compio::runtime::spawn(async move {
                let _permit = sem.acquire().await;
                i
            });
            handles.push(handle);
        }

        // Release the slot - waiters complete one after another as each
        // drops its permit on task exit
        drop(permit);

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(results.len(), 5);
        assert_eq!(sem.available_permits(), 1);
    }

    #[compio::test]
    async fn test_semaphore_high_concurrency() {
        let sem = Arc::new(Semaphore::new(100));
        let mut handles = Vec::new();

        // Spawn 1000 tasks, but only 100 may hold a slot at once
        for i in 0..1000 {
            let sem = sem.clone();
            let handle = compio::runtime::spawn(async move {
                let _permit = sem.acquire().await;
                i
            });
            handles.push(handle);
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(results.len(), 1000);
        assert_eq!(sem.available_permits(), 100);
    }

    #[compio::test]
    async fn test_semaphore_clone_shares_pool() {
        let sem = Semaphore::new(10);
        let sem2 = sem.clone();

        let permit1 = sem.acquire().await;
        assert_eq!(sem2.available_permits(), 9);

        let permit2 = sem2.acquire().await;
        assert_eq!(sem.available_permits(), 8);

        drop(permit1);
        drop(permit2);
        assert_eq!(sem.available_permits(), 10);
    }

    #[test]
    #[should_panic(expected = "Semaphore must have at least one permit")]
    fn test_semaphore_zero_permits_panics() {
        let _sem = Semaphore::new(0);
    }
}
