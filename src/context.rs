use std::ffi::c_void;
use std::fmt;
use std::ops::BitOr;
use std::ptr::{self, NonNull};

use stackswap::arch::{self, Entry};
use stackswap::stack::{AlignedStack, GuardedStack, Stack};

use crate::error::{fatal, Result};
use crate::profiler::{self, ProfileRecord, ProfilerTag};
use crate::registry;

const INTEGRITY_SALT: u64 = 0x5f1b_e3c9_a7d2_4e81;

/// Expected integrity tag of a context living at `addr`.
pub(crate) fn integrity_of(addr: usize) -> usize {
    addr.rotate_left(23) ^ INTEGRITY_SALT as usize
}

/// Bit flags accepted by [Attributes].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Allocate a profiled stack and attribute its depth to the fiber's tag
    /// (or [DEFAULT_TAG](crate::profiler::DEFAULT_TAG) if none is given).
    pub const PROFILE: Flags = Flags(1 << 0);
    /// Map the usable stack window with execute permission.
    pub const EXECUTABLE: Flags = Flags(1 << 1);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Optional knobs for [new_fiber].
///
/// ```
/// use fiberglass::{Attributes, Flags};
///
/// let attributes = Attributes::new().stack_size(256 * 1024).flags(Flags::EXECUTABLE);
/// assert_eq!(attributes.stack_size, 256 * 1024);
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Attributes {
    /// Requested usable stack size. 0 selects [DEFAULT_STACK_SIZE](crate::DEFAULT_STACK_SIZE).
    pub stack_size: usize,
    pub flags: Flags,
    /// Profiling bucket. Setting a tag implies [Flags::PROFILE].
    pub tag: Option<&'static ProfilerTag>,
}

impl Attributes {
    pub const fn new() -> Self {
        Attributes {
            stack_size: 0,
            flags: Flags::NONE,
            tag: None,
        }
    }

    pub const fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub const fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub const fn tag(mut self, tag: &'static ProfilerTag) -> Self {
        self.tag = Some(tag);
        self
    }

    fn profiled_tag(&self) -> Option<&'static ProfilerTag> {
        match self.tag {
            Some(tag) => Some(tag),
            None if self.flags.contains(Flags::PROFILE) => Some(&profiler::DEFAULT_TAG),
            None => None,
        }
    }
}

#[derive(Debug)]
enum FiberStack {
    Guarded(GuardedStack),
    Profiled(AlignedStack),
}

impl FiberStack {
    fn as_stack(&self) -> &dyn Stack {
        match self {
            FiberStack::Guarded(stack) => stack,
            FiberStack::Profiled(stack) => stack,
        }
    }
}

/// The fiber itself: a saved stack pointer plus the stack it points into.
///
/// Contexts are always handed out boxed. The box is owned by the caller and is
/// never freed by the runtime, while the stack inside it is released by
/// [release_stack](FiberContext::release_stack) (or when the box is dropped).
/// The integrity tag is derived from the box address, so a context only
/// validates at the address it was created at.
#[repr(C)]
pub struct FiberContext {
    /// Saved stack pointer. Meaningless while the context is running.
    pub(crate) stack_pointer: *mut u8,
    stack_ceiling: *mut u8,
    stack_floor: *mut u8,
    integrity_tag: usize,
    stack: Option<FiberStack>,
    profile: Option<&'static ProfileRecord>,
}

impl FiberContext {
    fn sealed(context: FiberContext) -> Box<FiberContext> {
        let mut context = Box::new(context);
        context.integrity_tag = integrity_of(&*context as *const FiberContext as usize);
        context
    }

    /// A context standing for a thread's own stack. It has no stack window; its
    /// stack pointer is filled in by the first switch away from the thread.
    pub(crate) fn native() -> Box<FiberContext> {
        FiberContext::sealed(FiberContext {
            stack_pointer: ptr::null_mut(),
            stack_ceiling: ptr::null_mut(),
            stack_floor: ptr::null_mut(),
            integrity_tag: 0,
            stack: None,
            profile: None,
        })
    }

    /// Prepares `stack` so that the first switch into the context calls `entry(arg)`.
    fn initialize_trampoline(
        stack: FiberStack,
        entry: Entry,
        arg: *mut c_void,
    ) -> Box<FiberContext> {
        let (stack_ceiling, stack_floor) = {
            let stack = stack.as_stack();
            (stack.ceiling(), stack.floor())
        };
        // The top page of every stack kind is writable at this point.
        let stack_pointer = unsafe { arch::init(stack_floor, entry, arg) };
        FiberContext::sealed(FiberContext {
            stack_pointer,
            stack_ceiling,
            stack_floor,
            integrity_tag: 0,
            stack: Some(stack),
            profile: None,
        })
    }

    /// Returns true if the integrity tag matches this context's address.
    pub fn is_valid(&self) -> bool {
        self.integrity_tag != 0
            && self.integrity_tag == integrity_of(self as *const FiberContext as usize)
    }

    /// Lowest usable address of the stack window. Null for native and released contexts.
    pub fn stack_ceiling(&self) -> *mut u8 {
        self.stack_ceiling
    }

    /// Highest address of the stack window, where the first frame was pushed.
    pub fn stack_floor(&self) -> *mut u8 {
        self.stack_floor
    }

    /// Size of the usable stack window in bytes.
    pub fn stack_size(&self) -> usize {
        self.stack_floor as usize - self.stack_ceiling as usize
    }

    /// True for the context that represents a thread's own stack.
    pub fn is_native(&self) -> bool {
        self.is_valid() && self.stack.is_none()
    }

    pub fn is_released(&self) -> bool {
        self.integrity_tag == 0
    }

    /// Profiling data, present only for fibers created with a tag or [Flags::PROFILE].
    pub fn profile(&self) -> Option<&'static ProfileRecord> {
        self.profile
    }

    /// A non-owning handle to pass to [switch_to](crate::switch_to).
    pub fn handle(&self) -> FiberRef {
        FiberRef(NonNull::from(self))
    }

    /// Unmaps the stack and zeroes the context. Only the stack is released, the
    /// box stays with the caller. Releasing twice is a no-op.
    ///
    /// Any frames still suspended on the stack are discarded without running
    /// their destructors. Releasing the context that is currently running
    /// aborts the process.
    pub fn release_stack(&mut self) {
        if registry::is_current(self as *mut FiberContext) {
            fatal!("release_stack called on the running context {:p}", self);
        }
        let stack = self.stack.take();
        if let Some(record) = self.profile.take() {
            profiler::retire(record);
        }
        if let Some(stack) = stack {
            tracing::debug!(
                context = ?(self as *const FiberContext),
                size = stack.as_stack().len(),
                "releasing fiber stack"
            );
        }
        self.stack_pointer = ptr::null_mut();
        self.stack_ceiling = ptr::null_mut();
        self.stack_floor = ptr::null_mut();
        self.integrity_tag = 0;
    }
}

impl Drop for FiberContext {
    fn drop(&mut self) {
        if self.stack.is_some() || self.profile.is_some() {
            self.release_stack();
        }
    }
}

impl fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberContext")
            .field("address", &(self as *const FiberContext))
            .field("stack_pointer", &self.stack_pointer)
            .field("stack_ceiling", &self.stack_ceiling)
            .field("stack_floor", &self.stack_floor)
            .field("valid", &self.is_valid())
            .field("profiled", &self.profile.is_some())
            .finish()
    }
}

/// Non-owning pointer to a [FiberContext].
///
/// This is what the registry stores and what [switch_to](crate::switch_to) takes.
/// It does not keep the context alive and must never be used on a thread other
/// than the one the context belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberRef(NonNull<FiberContext>);

impl FiberRef {
    pub(crate) fn from_raw(ptr: *mut FiberContext) -> Option<FiberRef> {
        NonNull::new(ptr).map(FiberRef)
    }

    pub fn as_ptr(self) -> *mut FiberContext {
        self.0.as_ptr()
    }

    /// Checks the integrity tag of the context behind the handle.
    ///
    /// # Safety
    ///
    /// The memory of the context (not its stack) must still be allocated.
    pub unsafe fn is_valid(self) -> bool {
        (*self.as_ptr()).is_valid()
    }

    /// Borrows the context behind the handle.
    ///
    /// # Safety
    ///
    /// The context box must outlive `'a`.
    pub unsafe fn get<'a>(self) -> &'a FiberContext {
        &*self.as_ptr()
    }
}

impl fmt::Debug for FiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberRef({:p})", self.0)
    }
}

/// Allocates a stack and prepares a fiber that will run `entry(arg)` the first
/// time it is switched into.
///
/// If `entry` returns, the OS thread running the fiber exits.
///
/// ```
/// use std::ffi::c_void;
///
/// use fiberglass::{new_fiber, Attributes, DEFAULT_STACK_SIZE};
///
/// extern "C" fn entry(_arg: *mut c_void) {}
///
/// let fiber = new_fiber(entry, std::ptr::null_mut(), Attributes::new()).unwrap();
/// assert!(fiber.stack_size() >= DEFAULT_STACK_SIZE);
/// ```
pub fn new_fiber(
    entry: Entry,
    arg: *mut c_void,
    attributes: Attributes,
) -> Result<Box<FiberContext>> {
    let executable = attributes.flags.contains(Flags::EXECUTABLE);

    let context = match attributes.profiled_tag() {
        None => {
            let stack = GuardedStack::new(attributes.stack_size, executable)?;
            FiberContext::initialize_trampoline(FiberStack::Guarded(stack), entry, arg)
        }
        Some(tag) => {
            profiler::init_thread()?;
            let stack = AlignedStack::new(attributes.stack_size, executable)?;
            let record = profiler::register(&stack, tag, executable)?;
            let mut context =
                FiberContext::initialize_trampoline(FiberStack::Profiled(stack), entry, arg);
            context.profile = Some(record);
            context
        }
    };

    tracing::debug!(
        context = ?(&*context as *const FiberContext),
        size = context.stack_size(),
        profiled = context.profile.is_some(),
        "created fiber"
    );
    Ok(context)
}

/// Free function form of [FiberContext::release_stack].
pub fn release_stack(context: &mut FiberContext) {
    context.release_stack()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackswap::stack::{page_size, round_to_page, DEFAULT_STACK_SIZE};

    extern "C" fn never_runs(_arg: *mut c_void) {
        unreachable!()
    }

    #[test]
    fn default_stack_size() {
        let fiber = new_fiber(never_runs, ptr::null_mut(), Attributes::new()).unwrap();
        assert_eq!(fiber.stack_size(), round_to_page(DEFAULT_STACK_SIZE).unwrap());
        assert!(fiber.is_valid());
        assert!(!fiber.is_native());
    }

    #[test]
    fn requested_sizes_are_page_rounded() {
        for size in [1, 4000, 4097, 100_000, 3 * page_size()] {
            let attributes = Attributes::new().stack_size(size);
            let fiber = new_fiber(never_runs, ptr::null_mut(), attributes).unwrap();
            assert!(fiber.stack_size() >= size);
            assert_eq!(fiber.stack_size() % page_size(), 0);
        }
    }

    #[test]
    fn unrepresentable_sizes_fail() {
        use stackswap::stack::StackError;

        for flags in [Flags::NONE, Flags::PROFILE] {
            let attributes = Attributes::new().stack_size(usize::MAX - 10).flags(flags);
            match new_fiber(never_runs, ptr::null_mut(), attributes) {
                Err(crate::Error::Stack(StackError::TooLarge { requested, .. })) => {
                    assert_eq!(requested, usize::MAX - 10)
                }
                other => panic!("unexpected result: {:?}", other.map(|_| ())),
            }
        }
    }

    #[test]
    fn saved_stack_pointer_inside_window() {
        let fiber = new_fiber(never_runs, ptr::null_mut(), Attributes::new()).unwrap();
        assert!(fiber.stack_ceiling() < fiber.stack_pointer);
        assert!(fiber.stack_pointer <= fiber.stack_floor());
    }

    #[test]
    fn release_zeroes_context() {
        let mut fiber = new_fiber(never_runs, ptr::null_mut(), Attributes::new()).unwrap();
        release_stack(&mut fiber);
        assert!(fiber.is_released());
        assert!(!fiber.is_valid());
        assert!(fiber.stack_floor().is_null());
        assert!(fiber.stack_ceiling().is_null());
        // Second release does nothing.
        fiber.release_stack();
        assert!(fiber.is_released());
    }

    #[test]
    fn moved_context_fails_validation() {
        let fiber = new_fiber(never_runs, ptr::null_mut(), Attributes::new()).unwrap();
        let forged = FiberContext {
            stack_pointer: fiber.stack_pointer,
            stack_ceiling: fiber.stack_ceiling,
            stack_floor: fiber.stack_floor,
            integrity_tag: fiber.integrity_tag,
            stack: None,
            profile: None,
        };
        assert!(fiber.is_valid());
        assert!(!forged.is_valid());
    }

    #[test]
    fn flags_compose() {
        let flags = Flags::PROFILE | Flags::EXECUTABLE;
        assert!(flags.contains(Flags::PROFILE));
        assert!(flags.contains(Flags::EXECUTABLE));
        assert!(!Flags::NONE.contains(Flags::PROFILE));
        assert_eq!(flags.bits(), 0b11);
    }

    #[test]
    fn profile_flag_selects_default_tag() {
        let attributes = Attributes::new().flags(Flags::PROFILE);
        let tag = attributes.profiled_tag().unwrap();
        assert!(ptr::eq(tag, &profiler::DEFAULT_TAG));
        assert!(Attributes::new().profiled_tag().is_none());
    }
}
