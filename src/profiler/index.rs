// Reverse map from profiled stack regions to their records.
//
// Regions are PROFILED_REGION_SIZE aligned, so `addr >> REGION_SHIFT` is a
// region number. Its top LEVEL_BITS select a root slot, the bottom LEVEL_BITS a
// slot in a leaf table that is allocated the first time a region under that
// root is registered:
//
//   47            34 33            20 19              0
//  +----------------+----------------+----------------+
//  |   root slot    |   leaf slot    | offset in region|
//  +----------------+----------------+----------------+
//
// Writers serialize on a spinlock. The fault handler only performs atomic loads,
// which is sound because leaf tables are never freed and records are leaked.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crossbeam::utils::Backoff;
use stackswap::stack::PROFILED_REGION_SIZE;

use super::signal::abort_from_handler;
use super::ProfileRecord;

const REGION_SHIFT: u32 = PROFILED_REGION_SIZE.trailing_zeros();
const LEVEL_BITS: u32 = 14;
const LEVEL_LEN: usize = 1 << LEVEL_BITS;

type Slot = AtomicPtr<ProfileRecord>;

pub(crate) struct AddressIndex {
    roots: [AtomicPtr<Slot>; LEVEL_LEN],
    lock: SpinLock,
}

pub(crate) static INDEX: AddressIndex = AddressIndex::new();

impl AddressIndex {
    const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: AtomicPtr<Slot> = AtomicPtr::new(ptr::null_mut());
        AddressIndex {
            roots: [EMPTY; LEVEL_LEN],
            lock: SpinLock::new(),
        }
    }

    /// Splits an address into (root slot, leaf slot), or `None` if it lies above
    /// the range the index covers.
    fn split(addr: usize) -> Option<(usize, usize)> {
        let region = addr >> REGION_SHIFT;
        if region >> (2 * LEVEL_BITS) != 0 {
            return None;
        }
        Some((region >> LEVEL_BITS, region & (LEVEL_LEN - 1)))
    }

    /// Returns false, leaving the index untouched, if `region` lies outside the
    /// range the index covers.
    pub(crate) fn insert(&self, region: usize, record: &'static ProfileRecord) -> bool {
        let (root, leaf) = match Self::split(region) {
            Some(slots) => slots,
            None => return false,
        };

        let _guard = self.lock.lock();
        let mut table = self.roots[root].load(Ordering::Acquire);
        if table.is_null() {
            table = new_leaf_table();
            self.roots[root].store(table, Ordering::Release);
        }
        let slot = unsafe { &*table.add(leaf) };
        slot.store(record as *const ProfileRecord as *mut ProfileRecord, Ordering::Release);
        true
    }

    /// Clears the slot of `region` if it still points at `record`.
    pub(crate) fn remove(&self, region: usize, record: &'static ProfileRecord) {
        let (root, leaf) = match Self::split(region) {
            Some(slots) => slots,
            None => return,
        };

        let _guard = self.lock.lock();
        let table = self.roots[root].load(Ordering::Acquire);
        if table.is_null() {
            return;
        }
        let slot = unsafe { &*table.add(leaf) };
        let _ = slot.compare_exchange(
            record as *const ProfileRecord as *mut ProfileRecord,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Lock free, callable from the fault handler.
    pub(crate) fn lookup(&self, addr: usize) -> Option<&'static ProfileRecord> {
        let (root, leaf) = Self::split(addr)?;
        let table = self.roots[root].load(Ordering::Acquire);
        if table.is_null() {
            return None;
        }
        let record = unsafe { &*table.add(leaf) }.load(Ordering::Acquire);
        if record.is_null() {
            return None;
        }
        let record: &'static ProfileRecord = unsafe { &*record };
        if record.region != addr & !(PROFILED_REGION_SIZE - 1) {
            abort_from_handler("fiberglass: profiler index corrupted\n");
        }
        Some(record)
    }
}

// Allocated on the heap directly, the table is too large for a fiber stack.
fn new_leaf_table() -> *mut Slot {
    let table: Box<[Slot]> = (0..LEVEL_LEN).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
    Box::leak(table).as_mut_ptr()
}

/// Test-and-set lock guarding index mutation.
struct SpinLock {
    locked: AtomicBool,
}

struct SpinGuard<'a>(&'a SpinLock);

impl SpinLock {
    const fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> SpinGuard<'_> {
        let backoff = Backoff::new();
        while self.locked.swap(true, Ordering::Acquire) {
            backoff.snooze();
        }
        SpinGuard(self)
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.0.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::ProfilerTag;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    static TAG: ProfilerTag = ProfilerTag::new("index");

    fn record_at(region: usize) -> &'static ProfileRecord {
        Box::leak(Box::new(ProfileRecord {
            region,
            floor: region + PROFILED_REGION_SIZE,
            executable: false,
            committed_low: AtomicUsize::new(region + PROFILED_REGION_SIZE),
            max_depth: AtomicUsize::new(0),
            tag: &TAG,
        }))
    }

    #[test]
    fn split_covers_48_bit_addresses() {
        assert_eq!(AddressIndex::split(0), Some((0, 0)));
        assert_eq!(AddressIndex::split(PROFILED_REGION_SIZE), Some((0, 1)));
        assert_eq!(
            AddressIndex::split((1 << 48) - 1),
            Some((LEVEL_LEN - 1, LEVEL_LEN - 1))
        );
        assert_eq!(AddressIndex::split(1 << 48), None);
    }

    #[test]
    fn insert_outside_range_is_refused() {
        let index = AddressIndex::new();
        let region = 1 << 48;
        assert!(!index.insert(region, record_at(region)));
        assert!(index.lookup(region).is_none());
        assert!(index.roots.iter().all(|root| root.load(Ordering::Relaxed).is_null()));
    }

    #[test]
    fn insert_lookup_remove() {
        let index = AddressIndex::new();
        let region = 0x5a5 * PROFILED_REGION_SIZE;
        let record = record_at(region);

        assert!(index.lookup(region + 10).is_none());
        assert!(index.insert(region, record));
        let found = index.lookup(region + PROFILED_REGION_SIZE - 1).unwrap();
        assert!(ptr::eq(found, record));
        assert!(index.lookup(region + PROFILED_REGION_SIZE).is_none());

        // A stale record does not evict the current one.
        index.remove(region, record_at(region));
        assert!(index.lookup(region).is_some());
        index.remove(region, record);
        assert!(index.lookup(region).is_none());
    }

    #[test]
    fn concurrent_inserts() {
        let index: &'static AddressIndex = Box::leak(Box::new(AddressIndex::new()));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                thread::spawn(move || {
                    for i in 0..64 {
                        // Spread regions over several root slots.
                        let region = ((t * 64 + i) << (LEVEL_BITS - 3)) * PROFILED_REGION_SIZE;
                        assert!(index.insert(region, record_at(region)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for n in 0..8 * 64usize {
            let region = (n << (LEVEL_BITS - 3)) * PROFILED_REGION_SIZE;
            assert_eq!(index.lookup(region).unwrap().region, region);
        }
    }
}
