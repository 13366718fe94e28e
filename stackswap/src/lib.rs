//! Stackswap provides the low-level pieces of a stackful fiber runtime.
//!
//! It consists of two parts:
//! 1. Stack allocators: a [guarded stack](stack/struct.GuardedStack.html) with an inaccessible
//!    page below it, and a size-aligned [profiled stack](stack/struct.AlignedStack.html) whose
//!    pages are committed on demand.
//! 2. A per-architecture [context switch](arch/fn.swap.html) and the trampoline that turns the
//!    first activation of a fresh stack into a call of its entry function.
//!
//! Nothing here tracks which context is running. That bookkeeping lives one layer up.
//! ## Example
//! ```
//! use std::ffi::c_void;
//! use std::ptr;
//!
//! use stackswap::arch;
//! use stackswap::stack::{GuardedStack, Stack};
//!
//! static mut MAIN_SP: *mut u8 = ptr::null_mut();
//! static mut FIBER_SP: *mut u8 = ptr::null_mut();
//!
//! unsafe extern "C" fn entry(arg: *mut c_void) {
//!     *(arg as *mut u32) += 1;
//!     arch::swap(ptr::addr_of_mut!(FIBER_SP), MAIN_SP);
//! }
//!
//! fn main() {
//!     let stack = GuardedStack::new(0, false).unwrap();
//!     let mut counter = 0u32;
//!     unsafe {
//!         FIBER_SP = arch::init(stack.floor(), entry, &mut counter as *mut u32 as *mut c_void);
//!         arch::swap(ptr::addr_of_mut!(MAIN_SP), FIBER_SP);
//!     }
//!     assert_eq!(counter, 1);
//! }
//! ```

#[cfg(not(unix))]
compile_error!("stackswap requires a Unix target");

pub mod arch;
pub mod stack;
