use std::ptr;

use stackswap::arch;

use crate::context::FiberRef;
use crate::error::fatal;
use crate::registry;

/// Suspends the running context and resumes `target`.
///
/// Returns once some later switch names the suspended context as its target
/// again. Switching to the context that is already running does nothing.
///
/// Aborts the process if the thread was never adopted, or if either the
/// running context or `target` fails integrity validation.
///
/// # Safety
///
/// The box behind `target` must still be allocated, and `target` must belong to
/// the calling thread.
pub unsafe fn switch_to(target: FiberRef) {
    let from = registry::current();
    if !target.is_valid() {
        fatal!("switch_to: {:?} is not a live fiber context", target);
    }
    if from == target {
        return;
    }
    switch_to_unchecked(target)
}

/// [switch_to] without any validation, for hot paths that already know the
/// thread is adopted and `target` is live.
///
/// # Safety
///
/// The thread must be adopted, `target` must be a live context of the calling
/// thread with a mapped stack, and it must not be the running context.
#[inline(always)]
pub unsafe fn switch_to_unchecked(target: FiberRef) {
    let to = target.as_ptr();
    let from = registry::enter(to);
    arch::swap(ptr::addr_of_mut!((*from).stack_pointer), (*to).stack_pointer);
}
