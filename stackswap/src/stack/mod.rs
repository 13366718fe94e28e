mod aligned;
mod guarded;

pub use aligned::{commit, AlignedStack, PROFILED_REGION_SIZE};
pub use guarded::GuardedStack;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

/// Stack size used when a fiber is created with a requested size of 0.
pub const DEFAULT_STACK_SIZE: usize = 1 << 16;

/// A mapped memory region that can back a fiber.
///
/// Stacks grow downwards: execution starts at [floor](Stack::floor) and may
/// grow down to, but not below, [ceiling](Stack::ceiling).
pub trait Stack {
    /// Returns the highest address of the usable window, the initial stack pointer.
    fn floor(&self) -> *mut u8;

    /// Returns the lowest usable address. The byte below it belongs to a guard page.
    fn ceiling(&self) -> *mut u8;

    /// Size of the usable window in bytes.
    fn len(&self) -> usize {
        self.floor() as usize - self.ceiling() as usize
    }
}

#[derive(Debug, Error)]
pub enum StackError {
    #[error("failed to map {size} bytes for a fiber stack: {source}")]
    Map { size: usize, source: io::Error },
    #[error("failed to install the guard page below the stack: {0}")]
    Guard(io::Error),
    #[error("failed to change protection of stack pages: {0}")]
    Protect(io::Error),
    #[error("requested stack of {requested} bytes exceeds the capacity of {capacity} bytes")]
    TooLarge { requested: usize, capacity: usize },
}

/// Returns page size in bytes
pub fn page_size() -> usize {
    #[cold]
    fn sys_page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    static PAGE_SIZE_CACHE: AtomicUsize = AtomicUsize::new(0);
    match PAGE_SIZE_CACHE.load(Ordering::Relaxed) {
        0 => {
            let page_size = sys_page_size();
            assert!(page_size.is_power_of_two());

            PAGE_SIZE_CACHE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

/// Rounds `size` up to the next multiple of the page size, or `None` if that
/// is not representable.
pub fn round_to_page(size: usize) -> Option<usize> {
    let page_size = page_size();
    Some(size.checked_add(page_size - 1)? & !(page_size - 1))
}

/// Rounds `addr` down to the start of the page containing it.
pub fn page_floor(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

fn usable_protection(executable: bool) -> libc::c_int {
    if executable {
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
    } else {
        libc::PROT_READ | libc::PROT_WRITE
    }
}
