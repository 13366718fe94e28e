use std::cell::{RefCell, UnsafeCell};
use std::io;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::OnceLock;

use libc::{c_int, c_void, siginfo_t};
use stackswap::stack::page_size;

use crate::error::{Error, Result};

/// Size of the per-thread alternate signal stack, guard page not included.
pub const SIGNAL_STACK_SIZE: usize = 64 * 1024;

struct PreviousAction(UnsafeCell<MaybeUninit<libc::sigaction>>);

// Written once inside the installation `OnceLock`, read-only afterwards.
unsafe impl Sync for PreviousAction {}

impl PreviousAction {
    const fn new() -> Self {
        PreviousAction(UnsafeCell::new(MaybeUninit::uninit()))
    }
}

static PREV_SIGSEGV: PreviousAction = PreviousAction::new();
static PREV_SIGBUS: PreviousAction = PreviousAction::new();

static INSTALLED: OnceLock<Result<(), i32>> = OnceLock::new();

/// Prepares the calling thread to run profiled fibers.
///
/// Installs the process-wide fault handler on first use and gives the calling
/// thread an alternate signal stack, since a fault may hit while the fiber's own
/// stack has no room left. Called by [new_fiber](crate::new_fiber) for every
/// profiled fiber, so calling it directly is only needed to control when the
/// setup happens.
pub fn init_thread() -> Result<()> {
    let installed = INSTALLED.get_or_init(|| unsafe { install_handlers() });
    if let Err(code) = installed {
        return Err(Error::SignalHandler(io::Error::from_raw_os_error(*code)));
    }
    setup_sigaltstack()
}

unsafe fn install_handlers() -> Result<(), i32> {
    let register = |slot: &PreviousAction, signal: c_int| -> Result<(), i32> {
        let mut handler: libc::sigaction = mem::zeroed();
        // SA_SIGINFO gives us the faulting address.
        //
        // SA_ONSTACK runs the handler on the alternate stack, the faulting fiber
        // may have no stack left.
        //
        // SA_NODEFER lets a fault inside a forwarded handler reach the default
        // disposition instead of hanging with the signal blocked.
        handler.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
        handler.sa_sigaction = handle_fault as usize;
        libc::sigemptyset(&mut handler.sa_mask);
        let previous = (*slot.0.get()).as_mut_ptr();
        if libc::sigaction(signal, &handler, previous) != 0 {
            return Err(io::Error::last_os_error().raw_os_error().unwrap_or(0));
        }
        Ok(())
    };

    register(&PREV_SIGSEGV, libc::SIGSEGV)?;
    // On Darwin and FreeBSD, guard page accesses are raised as SIGBUS.
    if cfg!(any(target_vendor = "apple", target_os = "freebsd")) {
        register(&PREV_SIGBUS, libc::SIGBUS)?;
    }
    tracing::debug!("installed profiling fault handler");
    Ok(())
}

unsafe extern "C" fn handle_fault(signum: c_int, siginfo: *mut siginfo_t, context: *mut c_void) {
    let previous = match signum {
        libc::SIGSEGV => &PREV_SIGSEGV,
        libc::SIGBUS => &PREV_SIGBUS,
        _ => abort_from_handler("fiberglass: fault handler received an unexpected signal\n"),
    };

    let addr = (*siginfo).si_addr() as usize;
    if super::resolve_fault(addr) {
        return;
    }

    // Not a stack growth fault. Hand the fault to whoever was installed before us. If
    // that is the default disposition, restore it and return: the faulting
    // instruction runs again and the process dies the normal way.
    let previous = &*(*previous.0.get()).as_ptr();
    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        mem::transmute::<usize, extern "C" fn(c_int, *mut siginfo_t, *mut c_void)>(
            previous.sa_sigaction,
        )(signum, siginfo, context)
    } else if previous.sa_sigaction == libc::SIG_DFL || previous.sa_sigaction == libc::SIG_IGN {
        libc::sigaction(signum, previous, ptr::null_mut());
    } else {
        mem::transmute::<usize, extern "C" fn(c_int)>(previous.sa_sigaction)(signum)
    }
}

/// Writes `message` to stderr and aborts, using only async-signal-safe calls.
pub(crate) fn abort_from_handler(message: &str) -> ! {
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr() as *const c_void, message.len());
        libc::abort()
    }
}

enum AltStack {
    None,
    Allocated {
        mmap_ptr: *mut c_void,
        mmap_size: usize,
    },
    BigEnough,
}

thread_local! {
    static ALT_STACK: RefCell<AltStack> = const { RefCell::new(AltStack::None) };
}

fn setup_sigaltstack() -> Result<()> {
    ALT_STACK.with(|slot| unsafe {
        let mut slot = slot.borrow_mut();
        match *slot {
            AltStack::None => {}
            // already checked
            _ => return Ok(()),
        }

        // An existing alternate stack that is big enough is kept.
        let mut old_stack: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut old_stack) != 0 {
            return Err(Error::SignalStack(io::Error::last_os_error()));
        }
        if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= SIGNAL_STACK_SIZE {
            *slot = AltStack::BigEnough;
            return Ok(());
        }

        let guard_size = page_size();
        let alloc_size = guard_size + SIGNAL_STACK_SIZE;
        let ptr = libc::mmap(
            ptr::null_mut(),
            alloc_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(Error::SignalStack(io::Error::last_os_error()));
        }

        let stack_ptr = (ptr as usize + guard_size) as *mut c_void;
        if libc::mprotect(stack_ptr, SIGNAL_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE) != 0 {
            let err = io::Error::last_os_error();
            libc::munmap(ptr, alloc_size);
            return Err(Error::SignalStack(err));
        }
        let new_stack = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: SIGNAL_STACK_SIZE,
        };
        if libc::sigaltstack(&new_stack, ptr::null_mut()) != 0 {
            let err = io::Error::last_os_error();
            libc::munmap(ptr, alloc_size);
            return Err(Error::SignalStack(err));
        }

        tracing::debug!(stack = ?stack_ptr, "installed alternate signal stack");
        *slot = AltStack::Allocated {
            mmap_ptr: ptr,
            mmap_size: alloc_size,
        };
        Ok(())
    })
}

impl Drop for AltStack {
    fn drop(&mut self) {
        let (ptr, size) = match self {
            AltStack::Allocated {
                mmap_ptr,
                mmap_size,
            } => (*mmap_ptr, *mmap_size),
            _ => return,
        };
        unsafe {
            // Detach before unmapping so a late signal can't land on freed memory.
            let disable = libc::stack_t {
                ss_sp: ptr::null_mut(),
                ss_flags: libc::SS_DISABLE,
                ss_size: 0,
            };
            libc::sigaltstack(&disable, ptr::null_mut());
            let r = libc::munmap(ptr, size);
            debug_assert_eq!(r, 0, "munmap failed during thread shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_thread_is_repeatable() {
        std::thread::spawn(|| {
            init_thread().unwrap();
            init_thread().unwrap();
            let mut current: libc::stack_t = unsafe { mem::zeroed() };
            assert_eq!(unsafe { libc::sigaltstack(ptr::null(), &mut current) }, 0);
            assert_eq!(current.ss_flags & libc::SS_DISABLE, 0);
            assert!(current.ss_size >= SIGNAL_STACK_SIZE);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn handler_abort_raises_sigabrt() {
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            abort_from_handler("fiberglass: aborting from a forked child\n");
        }
        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(libc::WIFSIGNALED(status));
        assert_eq!(libc::WTERMSIG(status), libc::SIGABRT);
    }
}
