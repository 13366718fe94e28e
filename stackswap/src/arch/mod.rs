// Both architectures expose the same api. Here I just want to take some time explaining the general
// idea behind them.
//
// At the core of the implementation there are 2 functions:
// * `init(floor: *mut u8, entry: Entry, arg: *mut c_void) -> *mut u8`
// * `swap(out_sp: *mut *mut u8, in_sp: *mut u8)`
//
// ### swap
// `swap` is a naked function that follows the regular C calling convention. Everything the caller
// is allowed to clobber has already been spilled by the compiler at the call site, so `swap` only
// needs to take care of the callee-saved registers:
// 1. Push all callee-saved registers of the current context to the current stack.
// 2. Store the resulting stack pointer into `*out_sp`.
// 3. Load `in_sp` into the stack pointer.
// 4. Pop the callee-saved registers of the incoming context.
// 5. Return. The return address on top of the incoming stack is the instruction following the
//    `swap` call that suspended that context, so execution continues as if that call returned.
//
// ### init
// A fresh stack has never executed `swap`, so `init` forges the frame `swap` would have left
// behind. Instead of a caller's return address the frame points into `trampoline`, and two of the
// callee-saved register slots carry the entry function and its argument:
// ```
//      +------------------+ <- floor
//      |Alignment         |
//      +------------------+
//      |0 (end of frames) |
//      +------------------+
//      |Trampoline        |  <- "return address" consumed by the first swap
//      +------------------+
//      |Callee-saved regs |  entry and arg live in two of these slots
//      |      .....       |
//      +------------------+ <- initial stack pointer
// ```
// The trampoline moves the argument into the first argument register and calls the entry. If
// the entry returns there is no caller to go back to, so the trampoline calls `fiber_exit`,
// which terminates the hosting OS thread.

use std::ffi::c_void;
use std::ptr;

/// Signature of a fiber entry point. It receives the opaque argument given at creation.
pub type Entry = unsafe extern "C" fn(arg: *mut c_void);

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::*;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::*;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("stackswap only supports x86_64 and aarch64");

/// Reached from the trampoline after a fiber entry returned.
///
/// `pthread_exit` unwinds the calling frames, so this frame must not carry any
/// landing pad. Everything that could need one lives in `note_exit`.
extern "C" fn fiber_exit() -> ! {
    note_exit();
    unsafe { libc::pthread_exit(ptr::null_mut()) }
}

#[inline(never)]
extern "C" fn note_exit() {
    tracing::debug!("fiber entry returned, terminating the hosting thread");
}
