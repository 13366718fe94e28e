//! Cooperative, stackful fibers for Unix threads.
//!
//! A fiber is a [FiberContext]: a stack of its own plus the stack pointer it was
//! suspended at. Fibers never run in parallel on one thread; control only moves
//! when the running code calls [switch_to]. Nothing is scheduled behind your back.
//!
//! ```
//! use std::ffi::c_void;
//! use std::ptr;
//!
//! use fiberglass::{adopt_thread, new_fiber, switch_to, Attributes, FiberRef};
//!
//! static mut MAIN: Option<FiberRef> = None;
//! static mut STEPS: Vec<u32> = Vec::new();
//!
//! extern "C" fn ping(_arg: *mut c_void) {
//!     unsafe {
//!         let main = (*ptr::addr_of!(MAIN)).unwrap();
//!         (*ptr::addr_of_mut!(STEPS)).push(1);
//!         switch_to(main);
//!         (*ptr::addr_of_mut!(STEPS)).push(3);
//!         switch_to(main);
//!     }
//! }
//!
//! let main = adopt_thread();
//! unsafe { MAIN = Some(main) };
//! let mut fiber = new_fiber(ping, ptr::null_mut(), Attributes::new()).unwrap();
//!
//! unsafe {
//!     switch_to(fiber.handle());
//!     (*ptr::addr_of_mut!(STEPS)).push(2);
//!     switch_to(fiber.handle());
//!     assert_eq!(*ptr::addr_of!(STEPS), [1, 2, 3]);
//! }
//!
//! // The fiber is suspended for good, only its stack is left to free.
//! fiber.release_stack();
//! ```
//!
//! Every thread has to be [adopted](adopt_thread) before its first switch. A
//! fiber belongs to the thread it was created on and must never be switched
//! into from another one.
//!
//! If a fiber's entry function returns, there is nothing to return to: the OS
//! thread running it exits.
//!
//! Fibers created with a [profiler tag](profiler::ProfilerTag) or
//! [Flags::PROFILE] measure how deep their stack actually grows, see [profiler].

mod context;
mod error;
pub mod profiler;
mod registry;
mod switch;

pub use context::{new_fiber, release_stack, Attributes, FiberContext, FiberRef, Flags};
pub use error::{Error, Result};
pub use registry::{
    adopt_thread, current, current_unchecked, is_adopted, previous, previous_unchecked,
};
pub use stackswap::arch::Entry;
pub use stackswap::stack::{StackError, DEFAULT_STACK_SIZE};
pub use switch::{switch_to, switch_to_unchecked};
