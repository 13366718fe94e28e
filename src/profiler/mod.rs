//! Stack depth profiling through guard page faults.
//!
//! A profiled fiber gets an [AlignedStack] whose pages below the first one are
//! inaccessible. Each time the fiber grows its stack into a new page the fault
//! handler attributes the fault to the fiber, makes the page accessible and lets
//! execution continue. The lowest page touched so far is the fiber's stack
//! depth, aggregated per [ProfilerTag].
//!
//! ```
//! use std::ffi::c_void;
//!
//! use fiberglass::{new_fiber, profiler, profiler_tag, Attributes};
//!
//! profiler_tag!(Workers);
//!
//! extern "C" fn work(_arg: *mut c_void) {}
//!
//! let fiber = new_fiber(work, std::ptr::null_mut(), Attributes::new().tag(&Workers)).unwrap();
//! assert!(fiber.profile().is_some());
//! assert_eq!(Workers.name(), "Workers");
//! assert!(profiler::tags().iter().any(|tag| tag.name() == "Workers"));
//! ```

mod index;
mod signal;

pub use signal::init_thread;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use stackswap::stack::{self, page_floor, page_size, AlignedStack, Stack};

use index::INDEX;

use crate::error::{Error, Result};

/// A named bucket aggregating stack usage of every fiber created with it.
#[derive(Debug)]
pub struct ProfilerTag {
    name: &'static str,
    max_depth: AtomicUsize,
    faults: AtomicUsize,
    registered: AtomicBool,
}

impl ProfilerTag {
    pub const fn new(name: &'static str) -> Self {
        ProfilerTag {
            name,
            max_depth: AtomicUsize::new(0),
            faults: AtomicUsize::new(0),
            registered: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Deepest stack usage, in bytes, observed on any fiber with this tag.
    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::Relaxed)
    }

    /// Number of depth probing faults handled for fibers with this tag.
    pub fn faults(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }

    fn register(&'static self) {
        if !self.registered.swap(true, Ordering::AcqRel) {
            TAGS.lock().unwrap_or_else(PoisonError::into_inner).push(self);
        }
    }

    fn record(&self, depth: usize) {
        self.max_depth.fetch_max(depth, Ordering::Relaxed);
        self.faults.fetch_add(1, Ordering::Relaxed);
    }
}

/// Defines a static [ProfilerTag] named after the identifier.
///
/// ```
/// fiberglass::profiler_tag!(pub StackHogs);
///
/// assert_eq!(StackHogs.name(), "StackHogs");
/// ```
#[macro_export]
macro_rules! profiler_tag {
    ($(#[$attr:meta])* $vis:vis $name:ident) => {
        $(#[$attr])*
        #[allow(non_upper_case_globals)]
        $vis static $name: $crate::profiler::ProfilerTag =
            $crate::profiler::ProfilerTag::new(stringify!($name));
    };
}

/// Tag of profiled fibers created without one.
pub static DEFAULT_TAG: ProfilerTag = ProfilerTag::new("default");

static TAGS: Mutex<Vec<&'static ProfilerTag>> = Mutex::new(Vec::new());

/// Every tag that was used by at least one profiled fiber, in order of first use.
pub fn tags() -> Vec<&'static ProfilerTag> {
    TAGS.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Logs the statistics of every used tag at `info` level.
pub fn report() {
    for tag in tags() {
        tracing::info!(
            tag = tag.name(),
            max_depth = tag.max_depth(),
            faults = tag.faults(),
            "fiber stack profile"
        );
    }
}

/// Profiling state of one fiber.
///
/// Records are leaked on purpose: the fault handler may still hold one while
/// another thread releases the fiber it belongs to.
#[derive(Debug)]
pub struct ProfileRecord {
    region: usize,
    floor: usize,
    executable: bool,
    committed_low: AtomicUsize,
    max_depth: AtomicUsize,
    tag: &'static ProfilerTag,
}

impl ProfileRecord {
    pub fn tag(&self) -> &'static ProfilerTag {
        self.tag
    }

    /// Deepest stack usage of this fiber in bytes, 0 until the first fault.
    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::Relaxed)
    }

    /// Lowest address of the stack that is currently accessible.
    pub fn committed_low(&self) -> usize {
        self.committed_low.load(Ordering::Acquire)
    }

    /// Runs inside the signal handler, so it sticks to atomics and `mprotect`.
    unsafe fn handle_fault(&self, addr: usize) -> bool {
        let page = page_floor(addr);
        // Touching the permanent guard means the fiber ran out of its whole region.
        if page < self.region + page_size() || page >= self.floor {
            return false;
        }
        let low = self.committed_low.load(Ordering::Acquire);
        if page >= low {
            return false;
        }
        if stack::commit(page as *mut u8, low as *mut u8, self.executable).is_err() {
            return false;
        }
        self.committed_low.store(page, Ordering::Release);

        let depth = self.floor - page;
        self.max_depth.fetch_max(depth, Ordering::Relaxed);
        self.tag.record(depth);
        true
    }
}

/// Makes faults inside `stack` attributable to a new record of `tag`.
///
/// Fails if the stack was mapped above the addresses the index covers.
pub(crate) fn register(
    stack: &AlignedStack,
    tag: &'static ProfilerTag,
    executable: bool,
) -> Result<&'static ProfileRecord> {
    let region = stack.region_base() as usize;
    let record: &'static ProfileRecord = Box::leak(Box::new(ProfileRecord {
        region,
        floor: stack.floor() as usize,
        executable,
        committed_low: AtomicUsize::new(stack.top_page() as usize),
        max_depth: AtomicUsize::new(0),
        tag,
    }));
    if !INDEX.insert(region, record) {
        // Never published, so nothing else can hold it.
        drop(unsafe { Box::from_raw(record as *const ProfileRecord as *mut ProfileRecord) });
        return Err(Error::Unindexed(region));
    }
    tag.register();
    Ok(record)
}

/// Detaches the record from its region before the region is unmapped.
pub(crate) fn retire(record: &'static ProfileRecord) {
    INDEX.remove(record.region, record);
}

/// Returns true if the fault at `addr` was stack growth of a profiled fiber
/// and has been resolved.
pub(crate) unsafe fn resolve_fault(addr: usize) -> bool {
    match INDEX.lookup(addr) {
        Some(record) => record.handle_fault(addr),
        None => false,
    }
}
