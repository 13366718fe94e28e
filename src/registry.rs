//! Per-thread bookkeeping of the running fiber.
//!
//! Every OS thread that wants to switch fibers first has to turn its own stack
//! into a context with [adopt_thread]. From then on the registry knows which
//! context is `current` and which one ran right before it.

use std::cell::Cell;
use std::ptr;

use crate::context::{FiberContext, FiberRef};
use crate::error::fatal;

struct ThreadFibers {
    current: Cell<*mut FiberContext>,
    previous: Cell<*mut FiberContext>,
    /// The adopted context of the thread's own stack, owned by the registry.
    native: Cell<*mut FiberContext>,
}

impl ThreadFibers {
    const fn new() -> Self {
        ThreadFibers {
            current: Cell::new(ptr::null_mut()),
            previous: Cell::new(ptr::null_mut()),
            native: Cell::new(ptr::null_mut()),
        }
    }
}

impl Drop for ThreadFibers {
    fn drop(&mut self) {
        self.current.set(ptr::null_mut());
        self.previous.set(ptr::null_mut());
        let native = self.native.replace(ptr::null_mut());
        if !native.is_null() {
            tracing::debug!(context = ?native, "releasing the native context of an exiting thread");
            drop(unsafe { Box::from_raw(native) });
        }
    }
}

thread_local! {
    static THREAD: ThreadFibers = const { ThreadFibers::new() };
}

/// Turns the calling thread's own stack into a fiber context.
///
/// Must be called once per thread before any switch. Calling it again logs a
/// warning and returns the context created by the first call. The context lives
/// until the thread exits.
pub fn adopt_thread() -> FiberRef {
    THREAD.with(|thread| {
        if let Some(native) = FiberRef::from_raw(thread.native.get()) {
            tracing::warn!("adopt_thread() called more than once on the same thread");
            return native;
        }
        let native = Box::into_raw(FiberContext::native());
        thread.native.set(native);
        thread.current.set(native);
        tracing::debug!(context = ?native, "adopted thread as a fiber");
        match FiberRef::from_raw(native) {
            Some(native) => native,
            None => unreachable!("Box::into_raw returned null"),
        }
    })
}

/// True once [adopt_thread] ran on the calling thread.
pub fn is_adopted() -> bool {
    THREAD
        .try_with(|thread| !thread.native.get().is_null())
        .unwrap_or(false)
}

/// Returns the running context.
///
/// Aborts if the thread was never adopted or the stored context fails validation.
pub fn current() -> FiberRef {
    let current = THREAD
        .try_with(|thread| thread.current.get())
        .unwrap_or(ptr::null_mut());
    match FiberRef::from_raw(current) {
        None => fatal!("call adopt_thread() before using fibers on this thread"),
        Some(current) if unsafe { !current.is_valid() } => {
            fatal!("the current context {:?} failed integrity validation", current)
        }
        Some(current) => current,
    }
}

/// Returns the running context without any checks.
///
/// # Safety
///
/// The thread must have been adopted.
#[inline(always)]
pub unsafe fn current_unchecked() -> FiberRef {
    let current = THREAD.with(|thread| thread.current.get());
    FiberRef::from_raw(current).unwrap_unchecked()
}

/// Returns the context that was running before the last switch, or `None`
/// if the thread never switched.
///
/// Aborts if the thread was never adopted or the stored context fails validation.
pub fn previous() -> Option<FiberRef> {
    if !is_adopted() {
        fatal!("call adopt_thread() before using fibers on this thread");
    }
    let previous = FiberRef::from_raw(THREAD.with(|thread| thread.previous.get()))?;
    if unsafe { !previous.is_valid() } {
        fatal!("the previous context {:?} failed integrity validation", previous);
    }
    Some(previous)
}

/// Returns the previously running context without any checks.
///
/// # Safety
///
/// The thread must have been adopted.
#[inline(always)]
pub unsafe fn previous_unchecked() -> Option<FiberRef> {
    FiberRef::from_raw(THREAD.with(|thread| thread.previous.get()))
}

/// Marks `target` as running and returns the context that is being suspended.
#[inline(always)]
pub(crate) unsafe fn enter(target: *mut FiberContext) -> *mut FiberContext {
    THREAD.with(|thread| {
        let from = thread.current.replace(target);
        thread.previous.set(from);
        from
    })
}

pub(crate) fn is_current(context: *mut FiberContext) -> bool {
    THREAD
        .try_with(|thread| thread.current.get() == context)
        .unwrap_or(false)
}
