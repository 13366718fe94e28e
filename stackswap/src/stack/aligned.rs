use std::io::Error;
use std::ptr;

use libc::{c_void, mmap, mprotect, munmap};
use libc::{MAP_ANON, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_NONE};

use super::{page_size, round_to_page, usable_protection, Stack, StackError};

/// Size and alignment of every profiled stack region.
pub const PROFILED_REGION_SIZE: usize = 1 << 20;

/// A stack occupying a whole, naturally aligned [PROFILED_REGION_SIZE] region.
///
/// Because every region is aligned to its own size, any address inside it can
/// be mapped back to the region base by masking the low bits. The lowest page
/// is a permanent guard. Of the usable window only the topmost page starts out
/// accessible. Whoever tracks the fiber commits the rest downwards with
/// [commit], the stack itself does not follow how far it has grown.
///
/// ```text
///  base        ceiling              top_page        floor
///   +-----------+--------------------+---------------+
///   |   guard   |  PROT_NONE (lazy)  |  read/write   |
///   +-----------+--------------------+---------------+
/// ```
#[derive(Debug)]
pub struct AlignedStack {
    base: *mut u8,
}

unsafe impl Send for AlignedStack {}

impl AlignedStack {
    /// Reserves a new region. `size` only needs to fit inside the usable window.
    pub fn new(size: usize, executable: bool) -> Result<Self, StackError> {
        let capacity = PROFILED_REGION_SIZE - page_size();
        if round_to_page(size).map_or(true, |size| size > capacity) {
            return Err(StackError::TooLarge {
                requested: size,
                capacity,
            });
        }

        unsafe {
            let base = Self::alloc_aligned()?;
            let floor = base.add(PROFILED_REGION_SIZE);
            let top_page = floor.sub(page_size());
            if mprotect(
                top_page as *mut c_void,
                page_size(),
                usable_protection(executable),
            ) != 0
            {
                let err = Error::last_os_error();
                munmap(base as *mut c_void, PROFILED_REGION_SIZE);
                return Err(StackError::Protect(err));
            }

            tracing::trace!(base = ?base, "mapped profiled stack region");
            Ok(Self { base })
        }
    }

    /// Over-reserve twice the region and trim it down to an aligned one.
    unsafe fn alloc_aligned() -> Result<*mut u8, StackError> {
        let reserve = 2 * PROFILED_REGION_SIZE;
        let ptr = mmap(
            ptr::null_mut(),
            reserve,
            PROT_NONE,
            MAP_PRIVATE | MAP_ANON | MAP_NORESERVE,
            -1,
            0,
        );
        if ptr == MAP_FAILED {
            return Err(StackError::Map {
                size: reserve,
                source: Error::last_os_error(),
            });
        }

        let start = ptr as usize;
        let aligned = (start + PROFILED_REGION_SIZE - 1) & !(PROFILED_REGION_SIZE - 1);
        let head = aligned - start;
        let tail = reserve - head - PROFILED_REGION_SIZE;
        if head > 0 {
            munmap(ptr, head);
        }
        if tail > 0 {
            munmap((aligned + PROFILED_REGION_SIZE) as *mut c_void, tail);
        }
        Ok(aligned as *mut u8)
    }

    /// Returns the aligned start of the region, which is also the guard page.
    pub fn region_base(&self) -> *mut u8 {
        self.base
    }

    /// The one page that is accessible right after allocation.
    pub fn top_page(&self) -> *mut u8 {
        unsafe { self.floor().sub(page_size()) }
    }

    /// Returns true if `addr` lies on the permanent guard page.
    pub fn is_guard(&self, addr: usize) -> bool {
        let base = self.base as usize;
        base <= addr && addr < base + page_size()
    }

}

/// Makes `[page, committed_low)` of an [AlignedStack] accessible.
///
/// Uses only `mprotect`, so it may be called from a signal handler.
///
/// # Safety
///
/// `page` must be page aligned and `[page, committed_low)` must be part of a
/// live [AlignedStack] usable window.
pub unsafe fn commit(page: *mut u8, committed_low: *mut u8, executable: bool) -> Result<(), Error> {
    if page >= committed_low {
        return Ok(());
    }
    let len = committed_low as usize - page as usize;
    if mprotect(page as *mut c_void, len, usable_protection(executable)) == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

impl Stack for AlignedStack {
    fn floor(&self) -> *mut u8 {
        unsafe { self.base.add(PROFILED_REGION_SIZE) }
    }

    fn ceiling(&self) -> *mut u8 {
        unsafe { self.base.add(page_size()) }
    }
}

impl Drop for AlignedStack {
    fn drop(&mut self) {
        let result = unsafe { munmap(self.base as *mut c_void, PROFILED_REGION_SIZE) };
        debug_assert_eq!(result, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_aligned_to_its_size() {
        let stack = AlignedStack::new(0, false).unwrap();
        assert_eq!(stack.region_base() as usize % PROFILED_REGION_SIZE, 0);
        assert_eq!(stack.floor() as usize - stack.region_base() as usize, PROFILED_REGION_SIZE);
        assert_eq!(stack.len(), PROFILED_REGION_SIZE - page_size());
    }

    #[test]
    fn only_top_page_is_committed() {
        let stack = AlignedStack::new(0, false).unwrap();
        assert_eq!(stack.top_page() as usize, stack.floor() as usize - page_size());
        unsafe { *stack.top_page() = 7 };
        unsafe { *stack.floor().sub(1) = 7 };
        assert!(stack.is_guard(stack.region_base() as usize));
        assert!(!stack.is_guard(stack.ceiling() as usize));
    }

    #[test]
    fn commit_extends_window() {
        let stack = AlignedStack::new(0, false).unwrap();
        let target = unsafe { stack.floor().sub(4 * page_size()) };
        unsafe { commit(target, stack.top_page(), false).unwrap() };
        // Nothing to do once the page is accessible.
        unsafe { commit(target, target, false).unwrap() };
        unsafe {
            *target = 3;
            assert_eq!(*target, 3);
        }
    }

    #[test]
    fn oversized_request_fails() {
        for size in [PROFILED_REGION_SIZE, usize::MAX - 10] {
            match AlignedStack::new(size, false) {
                Err(StackError::TooLarge { requested, capacity }) => {
                    assert_eq!(requested, size);
                    assert_eq!(capacity, PROFILED_REGION_SIZE - page_size())
                }
                other => panic!("unexpected result: {:?}", other),
            }
        }
    }
}
