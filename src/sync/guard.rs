//! The one lock around all mutable engine state.
//!
//! Callbacks are delivered on arbitrary host threads, and a callback can in
//! principle re-enter the engine from the same thread (a plugin call made
//! while a finding is being written, say). With a plain [`Mutex`] that is a
//! silent deadlock. [`Guard`] remembers which thread holds it, and turns a
//! same-thread re-acquire into an [`internal_failure`] instead.

use std::{
    cell::Cell,
    ops::{Deref, DerefMut},
    process,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use log::error;

/// `0` means "not held"
const UNOWNED: u64 = 0;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: Cell<u64> = const { Cell::new(UNOWNED) };
}

fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| {
        if token.get() == UNOWNED {
            token.set(NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed));
        }
        token.get()
    })
}

/// Log, print and abort. For states the engine cannot continue from: a
/// corrupted ledger, a re-entered or poisoned guard.
#[cold]
pub fn internal_failure(what: &str) -> ! {
    error!("internal failure: {what}");
    eprintln!("[piverify] internal failure: {what}");
    process::abort()
}

#[derive(Debug)]
pub struct Guard<T> {
    inner: Mutex<T>,
    owner: AtomicU64,
}

impl<T> Guard<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            owner: AtomicU64::new(UNOWNED),
        }
    }

    /// Lock, or abort if this thread already holds the guard
    pub fn lock(&self) -> GuardRef<'_, T> {
        match self.try_lock_reentrant() {
            Ok(guard) => guard,
            Err(reason) => internal_failure(reason),
        }
    }

    fn try_lock_reentrant(&self) -> Result<GuardRef<'_, T>, &'static str> {
        let me = thread_token();
        // Only this thread ever stores its own token, so seeing it here means
        // we hold the lock already.
        if self.owner.load(Ordering::Acquire) == me {
            return Err("engine state locked twice on one thread");
        }
        let inner = self
            .inner
            .lock()
            .map_err(|_| "engine state lock poisoned")?;
        self.owner.store(me, Ordering::Release);
        Ok(GuardRef { guard: self, inner })
    }

    pub fn into_inner(self) -> T {
        self.inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A held [`Guard`]. The owner mark is cleared on drop, before the mutex is
/// released.
pub struct GuardRef<'a, T> {
    guard: &'a Guard<T>,
    inner: MutexGuard<'a, T>,
}

impl<T> Drop for GuardRef<'_, T> {
    fn drop(&mut self) {
        self.guard.owner.store(UNOWNED, Ordering::Release);
    }
}

impl<T> Deref for GuardRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for GuardRef<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
