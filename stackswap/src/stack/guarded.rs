use std::io::Error;
use std::ptr;

use libc::{c_int, c_void, mmap, munmap};
use libc::{MAP_ANON, MAP_FAILED, MAP_FIXED, MAP_PRIVATE, PROT_NONE};

use super::{
    page_size, round_to_page, usable_protection, Stack, StackError, DEFAULT_STACK_SIZE,
};

#[cfg(target_os = "linux")]
const STACK_FLAGS: c_int = MAP_PRIVATE | MAP_ANON | libc::MAP_STACK;
// MAP_STACK is broken on FreeBSD and DragonFly, and missing on Apple targets.
#[cfg(not(target_os = "linux"))]
const STACK_FLAGS: c_int = MAP_PRIVATE | MAP_ANON;

#[cfg(target_os = "linux")]
const GUARD_FLAGS: c_int = MAP_PRIVATE | MAP_ANON | MAP_FIXED | libc::MAP_NORESERVE;
#[cfg(not(target_os = "linux"))]
const GUARD_FLAGS: c_int = MAP_PRIVATE | MAP_ANON | MAP_FIXED;

/// A fixed size stack with one inaccessible guard page below it.
///
/// ```text
///  base           ceiling                       floor
///   +---------------+-----------------------------+
///   |  guard page   |        usable window        |
///   |  PROT_NONE    |   PROT_READ | PROT_WRITE    |
///   +---------------+-----------------------------+
///                        <- grows down
/// ```
///
/// Touching the guard page raises `SIGSEGV` (`SIGBUS` on Apple targets), so a
/// fiber overflowing its stack crashes instead of silently corrupting the
/// neighbouring mapping.
#[derive(Debug)]
pub struct GuardedStack {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for GuardedStack {}

impl GuardedStack {
    /// Maps a new stack with a usable window of at least `size` bytes.
    ///
    /// A `size` of 0 selects [DEFAULT_STACK_SIZE](super::DEFAULT_STACK_SIZE).
    pub fn new(size: usize, executable: bool) -> Result<Self, StackError> {
        let requested = match size {
            0 => DEFAULT_STACK_SIZE,
            size => size,
        };
        let usable = round_to_page(requested);
        let total = usable.and_then(|usable| usable.checked_add(page_size()));
        let (usable, total) = match (usable, total) {
            (Some(usable), Some(total)) => (usable, total),
            _ => {
                return Err(StackError::TooLarge {
                    requested,
                    capacity: max_usable(),
                })
            }
        };

        unsafe {
            let base = mmap(
                ptr::null_mut(),
                total,
                usable_protection(executable),
                STACK_FLAGS,
                -1,
                0,
            );
            if base == MAP_FAILED {
                return Err(StackError::Map {
                    size: total,
                    source: Error::last_os_error(),
                });
            }

            // The guard is a second mapping placed over the lowest page. If it can't
            // be put in place the whole reservation goes back to the OS.
            let guard = mmap(base, page_size(), PROT_NONE, GUARD_FLAGS, -1, 0);
            if guard == MAP_FAILED || guard != base {
                let err = Error::last_os_error();
                munmap(base, total);
                return Err(StackError::Guard(err));
            }

            tracing::trace!(base = ?base, usable, "mapped guarded stack");
            Ok(Self {
                base: base as *mut u8,
                len: total,
            })
        }
    }

    /// Returns the first byte of the guard page.
    pub fn guard(&self) -> *mut u8 {
        self.base
    }
}

// Largest page multiple that still leaves room for the guard page.
fn max_usable() -> usize {
    (usize::MAX & !(page_size() - 1)) - page_size()
}

impl Stack for GuardedStack {
    fn floor(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }

    fn ceiling(&self) -> *mut u8 {
        unsafe { self.base.add(page_size()) }
    }
}

impl Drop for GuardedStack {
    fn drop(&mut self) {
        let result = unsafe { munmap(self.base as *mut c_void, self.len) };
        debug_assert_eq!(result, 0);
    }
}
