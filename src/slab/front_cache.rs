//! Per-core front caches.
//!
//! Each core owns one stash of recently freed object addresses. The stash sits
//! behind its own lock, which only the owning core takes on the hot path, so
//! it never spins there; a drain from another core may briefly contend.
//!
//! All stashes of a cache share one storage block laid out as
//! `[SpinNoIrq<FrontStash>; cores]` followed by `cores * limit` slot words.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use kspin::SpinNoIrq;

/// Outcome of stashing a freed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stash {
    Stashed,
    /// The stash is full, or the core has none.
    Full,
    /// The address is already stashed.
    Duplicate,
}

pub(crate) struct FrontStash {
    available: usize,
    limit: usize,
    slots: NonNull<usize>,
}

// SAFETY: the slot array belongs to this stash alone and is only touched
// through the stash's lock.
unsafe impl Send for FrontStash {}

impl FrontStash {
    fn pop(&mut self) -> Option<usize> {
        if self.available == 0 {
            return None;
        }
        self.available -= 1;
        // SAFETY: available < limit, and slots has limit entries.
        Some(unsafe { self.slots.as_ptr().add(self.available).read() })
    }

    fn stashed(&self) -> &[usize] {
        // SAFETY: the first `available` slots were written by `push`.
        unsafe { core::slice::from_raw_parts(self.slots.as_ptr(), self.available) }
    }

    fn push(&mut self, address: usize) -> Stash {
        if self.stashed().contains(&address) {
            return Stash::Duplicate;
        }
        if self.available == self.limit {
            return Stash::Full;
        }
        // SAFETY: see `pop`.
        unsafe { self.slots.as_ptr().add(self.available).write(address) };
        self.available += 1;
        Stash::Stashed
    }
}

pub(crate) struct FrontCaches {
    stashes: NonNull<SpinNoIrq<FrontStash>>,
    cores: usize,
    storage: NonNull<u8>,
}

// SAFETY: every stash is guarded by its own lock.
unsafe impl Send for FrontCaches {}
unsafe impl Sync for FrontCaches {}

impl FrontCaches {
    /// Bytes of storage needed for `cores` stashes of `limit` objects each.
    pub(crate) const fn storage_size(cores: usize, limit: usize) -> usize {
        cores * size_of::<SpinNoIrq<FrontStash>>() + cores * limit * size_of::<usize>()
    }

    /// Lay out empty stashes in `storage`.
    ///
    /// # Safety
    ///
    /// `storage` must point at [`storage_size`](Self::storage_size) writable
    /// bytes, aligned for a pointer, that outlive the returned value.
    pub(crate) unsafe fn init(storage: NonNull<u8>, cores: usize, limit: usize) -> Self {
        debug_assert_eq!(storage.as_ptr() as usize % align_of::<SpinNoIrq<FrontStash>>(), 0);
        let stashes = storage.cast::<SpinNoIrq<FrontStash>>();
        let first_slot = stashes.as_ptr().add(cores).cast::<usize>();
        for core in 0..cores {
            let slots = NonNull::new_unchecked(first_slot.add(core * limit));
            stashes.as_ptr().add(core).write(SpinNoIrq::new(FrontStash {
                available: 0,
                limit,
                slots,
            }));
        }
        Self {
            stashes,
            cores,
            storage,
        }
    }

    fn stash(&self, core: usize) -> Option<&SpinNoIrq<FrontStash>> {
        if core >= self.cores {
            return None;
        }
        // SAFETY: `init` wrote `cores` stashes.
        Some(unsafe { &*self.stashes.as_ptr().add(core) })
    }

    /// Take the most recently stashed object of `core`.
    pub(crate) fn pop(&self, core: usize) -> Option<usize> {
        self.stash(core)?.lock().pop()
    }

    /// Stash `address` for `core`.
    pub(crate) fn push(&self, core: usize, address: usize) -> Stash {
        self.stash(core).map_or(Stash::Full, |stash| stash.lock().push(address))
    }

    pub(crate) fn available(&self, core: usize) -> usize {
        self.stash(core).map_or(0, |stash| stash.lock().available)
    }

    pub(crate) fn total_available(&self) -> usize {
        (0..self.cores).map(|core| self.available(core)).sum()
    }

    pub(crate) fn storage(&self) -> NonNull<u8> {
        self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::alloc::{alloc, dealloc, Layout};

    fn with_caches(cores: usize, limit: usize, f: impl FnOnce(&FrontCaches)) {
        let layout = Layout::from_size_align(FrontCaches::storage_size(cores, limit), 64).unwrap();
        let storage = NonNull::new(unsafe { alloc(layout) }).unwrap();
        let caches = unsafe { FrontCaches::init(storage, cores, limit) };
        f(&caches);
        unsafe { dealloc(storage.as_ptr(), layout) };
    }

    #[test]
    fn test_stash_is_lifo_and_bounded() {
        with_caches(2, 3, |caches| {
            assert_eq!(caches.pop(0), None);
            assert_eq!(caches.push(0, 0x1000), Stash::Stashed);
            assert_eq!(caches.push(0, 0x2000), Stash::Stashed);
            assert_eq!(caches.push(0, 0x3000), Stash::Stashed);
            assert_eq!(caches.push(0, 0x4000), Stash::Full);
            assert_eq!(caches.available(0), 3);

            assert_eq!(caches.pop(0), Some(0x3000));
            assert_eq!(caches.pop(0), Some(0x2000));
            assert_eq!(caches.available(0), 1);
        });
    }

    #[test]
    fn test_cores_are_independent() {
        with_caches(3, 2, |caches| {
            assert_eq!(caches.push(1, 0x10), Stash::Stashed);
            assert_eq!(caches.push(2, 0x20), Stash::Stashed);
            assert_eq!(caches.pop(0), None);
            assert_eq!(caches.available(1), 1);
            assert_eq!(caches.total_available(), 2);
            assert_eq!(caches.pop(2), Some(0x20));
            assert_eq!(caches.pop(1), Some(0x10));
        });
    }

    #[test]
    fn test_duplicate_address_is_refused() {
        with_caches(2, 2, |caches| {
            assert_eq!(caches.push(0, 0x40), Stash::Stashed);
            assert_eq!(caches.push(0, 0x40), Stash::Duplicate);
            assert_eq!(caches.available(0), 1);
            // Another core's stash is separate.
            assert_eq!(caches.push(1, 0x40), Stash::Stashed);
            assert_eq!(caches.pop(0), Some(0x40));
            assert_eq!(caches.push(0, 0x40), Stash::Stashed);
        });
    }

    #[test]
    fn test_unknown_core_bypasses() {
        with_caches(2, 4, |caches| {
            assert_eq!(caches.push(2, 0x10), Stash::Full);
            assert_eq!(caches.pop(7), None);
            assert_eq!(caches.available(5), 0);
        });
    }
}
