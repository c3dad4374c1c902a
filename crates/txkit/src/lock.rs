//! Reentrant exclusive lock keyed by permit.
//!
//! Ownership belongs to a [`Permit`], not to a thread, because one logical
//! operation may fan its work out over a thread pool. State `count == 0`
//! means free; otherwise `holder` owns the lock `count` times over.

use crate::error::{LockError, Result};
use log::debug;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Longest single wait between cancellation checks.
const WAIT_SLICE: Duration = Duration::from_millis(50);

static NEXT_PERMIT: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Permit(u64);

impl Permit {
    /// Allocate a process-unique permit.
    pub fn next() -> Self {
        Self(NEXT_PERMIT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Notified when a permit takes or fully releases the lock.
///
/// Reentrant acquisitions do not trigger notifications.
pub trait LockObserver: Send + Sync {
    fn acquired(&self, permit: Permit);
    fn released(&self, permit: Permit);
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<Permit>,
    count: usize,
}

/// Exclusive lock that the holding permit may re-enter.
#[derive(Default)]
pub struct ReentrantPermitLock {
    state: Mutex<LockState>,
    released: Condvar,
    observer: Option<Arc<dyn LockObserver>>,
}

impl ReentrantPermitLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a lock that reports hold intervals to `observer`.
    pub fn with_observer(observer: Arc<dyn LockObserver>) -> Self {
        Self {
            observer: Some(observer),
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Take the lock if free or already held by `permit`.
    fn acquire(&self, state: &mut LockState, permit: Permit) -> bool {
        match state.holder {
            None => {
                state.holder = Some(permit);
                state.count = 1;
                debug!("Lock acquired by permit {permit}");
                if let Some(observer) = &self.observer {
                    observer.acquired(permit);
                }
                true
            }
            Some(holder) if holder == permit => {
                state.count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Block until `permit` holds the lock.
    pub fn lock(&self, permit: Permit) {
        let mut state = self.state();
        while !self.acquire(&mut state, permit) {
            state = match self.released.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Acquire without blocking.
    pub fn try_lock(&self, permit: Permit) -> bool {
        let mut state = self.state();
        self.acquire(&mut state, permit)
    }

    /// Block up to `timeout`, giving up early when `cancel` is raised.
    pub fn lock_timeout(&self, permit: Permit, timeout: Duration, cancel: &AtomicBool) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if self.acquire(&mut state, permit) {
                return Ok(());
            }
            if cancel.load(Ordering::SeqCst) {
                return Err(LockError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!("Permit {permit} timed out waiting for lock");
                return Err(LockError::Timeout { timeout });
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            state = match self.released.wait_timeout(state, slice) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Release one level of hold; frees the lock when the count reaches zero.
    pub fn unlock(&self, permit: Permit) -> Result<()> {
        let mut state = self.state();
        if state.holder != Some(permit) {
            return Err(LockError::NotHolder { permit });
        }
        state.count -= 1;
        if state.count == 0 {
            state.holder = None;
            debug!("Lock released by permit {permit}");
            if let Some(observer) = &self.observer {
                observer.released(permit);
            }
            self.released.notify_all();
        }
        Ok(())
    }

    pub fn holder(&self) -> Option<Permit> {
        self.state().holder
    }

    pub fn is_locked(&self) -> bool {
        self.state().holder.is_some()
    }

    /// Reentrancy depth held by `permit` (0 if it is not the holder).
    pub fn hold_count(&self, permit: Permit) -> usize {
        let state = self.state();
        if state.holder == Some(permit) {
            state.count
        } else {
            0
        }
    }
}

impl fmt::Debug for ReentrantPermitLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("ReentrantPermitLock")
            .field("holder", &state.holder)
            .field("count", &state.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<(&'static str, Permit)>>,
    }

    impl LockObserver for RecordingObserver {
        fn acquired(&self, permit: Permit) {
            self.events.lock().unwrap().push(("acquired", permit));
        }

        fn released(&self, permit: Permit) {
            self.events.lock().unwrap().push(("released", permit));
        }
    }

    #[test]
    fn test_reentrant_acquisition() {
        let lock = ReentrantPermitLock::new();
        let permit = Permit::next();

        lock.lock(permit);
        lock.lock(permit);
        assert!(lock.try_lock(permit));
        assert_eq!(lock.hold_count(permit), 3);

        lock.unlock(permit).unwrap();
        lock.unlock(permit).unwrap();
        assert!(lock.is_locked());
        lock.unlock(permit).unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_other_permit_blocked_until_free() {
        let lock = ReentrantPermitLock::new();
        let first = Permit::next();
        let second = Permit::next();

        lock.lock(first);
        lock.lock(first);
        assert!(!lock.try_lock(second));
        lock.unlock(first).unwrap();
        assert!(!lock.try_lock(second));
        lock.unlock(first).unwrap();
        assert!(lock.try_lock(second));
        assert_eq!(lock.holder(), Some(second));
    }

    #[test]
    fn test_unlock_without_lock_fails() {
        let lock = ReentrantPermitLock::new();
        let permit = Permit::next();
        assert_eq!(lock.unlock(permit), Err(LockError::NotHolder { permit }));

        let other = Permit::next();
        lock.lock(other);
        assert!(lock.unlock(permit).is_err());
    }

    #[test]
    fn test_lock_timeout() {
        let lock = ReentrantPermitLock::new();
        let holder = Permit::next();
        let waiter = Permit::next();
        let cancel = AtomicBool::new(false);

        lock.lock(holder);
        let err = lock
            .lock_timeout(waiter, Duration::from_millis(20), &cancel)
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(lock.lock_timeout(holder, Duration::from_millis(20), &cancel).is_ok());
    }

    #[test]
    fn test_lock_cancelled() {
        let lock = ReentrantPermitLock::new();
        lock.lock(Permit::next());
        let cancel = AtomicBool::new(true);
        let err = lock
            .lock_timeout(Permit::next(), Duration::from_secs(10), &cancel)
            .unwrap_err();
        assert_eq!(err, LockError::Cancelled);
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let lock = Arc::new(ReentrantPermitLock::new());
        let holder = Permit::next();
        lock.lock(holder);

        let waiter_lock = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            let waiter = Permit::next();
            let cancel = AtomicBool::new(false);
            waiter_lock
                .lock_timeout(waiter, Duration::from_secs(5), &cancel)
                .map(|()| waiter)
        });

        thread::sleep(Duration::from_millis(30));
        lock.unlock(holder).unwrap();
        let waiter = handle.join().unwrap().unwrap();
        assert_eq!(lock.holder(), Some(waiter));
    }

    #[test]
    fn test_observer_sees_outer_transitions_only() {
        let observer = Arc::new(RecordingObserver::default());
        let lock = ReentrantPermitLock::with_observer(observer.clone());
        let permit = Permit::next();

        lock.lock(permit);
        lock.lock(permit);
        lock.unlock(permit).unwrap();
        lock.unlock(permit).unwrap();

        let events = observer.events.lock().unwrap();
        assert_eq!(*events, vec![("acquired", permit), ("released", permit)]);
    }
}
