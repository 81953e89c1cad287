//! Slab cache implementation for a single object size.
//!
//! A SlabCache keeps its slabs on three lists (free, partial, full) behind one
//! lock, and optionally fronts them with per-core stashes.

use core::fmt;
use core::ptr::NonNull;

use kspin::SpinNoIrq;
use spin::Once;

#[cfg(feature = "log")]
use log::{debug, error, trace, warn};

use super::front_cache::{FrontCaches, Stash};
use super::slab_node::{SlabId, SlabState};
use super::CacheEnv;
use crate::debug as heap_debug;
use crate::geometry::{compute_slab_geometry, Geometry};
use crate::size_class::SizeClass;
use crate::{AllocError, AllocResult, CacheFlags, ObjectHooks};

/// Doubly linked list of slabs threaded through their headers.
pub(crate) struct SlabList {
    head: Option<SlabId>,
    tail: Option<SlabId>,
    len: usize,
    state: SlabState,
}

impl SlabList {
    pub const fn new(state: SlabState) -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            state,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn front(&self) -> Option<SlabId> {
        self.head
    }

    pub fn push_back(&mut self, slab: SlabId) {
        debug_assert_eq!(slab.state(), SlabState::Detached);
        slab.set_state(self.state);
        slab.set_prev(self.tail);
        slab.set_next(None);

        if let Some(tail) = self.tail {
            tail.set_next(Some(slab));
        } else {
            self.head = Some(slab);
        }

        self.tail = Some(slab);
        self.len += 1;
    }

    pub fn pop_front(&mut self) -> Option<SlabId> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }

    pub fn remove(&mut self, slab: SlabId) {
        debug_assert_eq!(slab.state(), self.state);
        let prev = slab.prev();
        let next = slab.next();

        if let Some(prev) = prev {
            prev.set_next(next);
        } else {
            self.head = next;
        }

        if let Some(next) = next {
            next.set_prev(prev);
        } else {
            self.tail = prev;
        }

        slab.set_prev(None);
        slab.set_next(None);
        slab.set_state(SlabState::Detached);
        self.len -= 1;
    }

    /// Walk the list from the head, returning the first `Some` produced by `f`.
    pub fn find_map<T>(&self, mut f: impl FnMut(SlabId) -> Option<T>) -> Option<T> {
        let mut cursor = self.head;
        while let Some(slab) = cursor {
            if let Some(found) = f(slab) {
                return Some(found);
            }
            cursor = slab.next();
        }
        None
    }
}

/// Where an address falls inside a cache, as seen under the list lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObjectSlot {
    slab: SlabId,
    index: usize,
    /// The slot is handed out, or sits in a front cache.
    in_use: bool,
}

struct CacheLists {
    free: SlabList,
    partial: SlabList,
    full: SlabList,
    /// Free objects across the free and partial lists.
    free_count: usize,
}

impl CacheLists {
    const fn new() -> Self {
        Self {
            free: SlabList::new(SlabState::Free),
            partial: SlabList::new(SlabState::Partial),
            full: SlabList::new(SlabState::Full),
            free_count: 0,
        }
    }
}

/// Point-in-time counters of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub object_size: usize,
    pub objects_per_slab: usize,
    pub pages_per_slab: usize,
    /// Free objects held by slabs, excluding front-cache stashes.
    pub free_objects: usize,
    pub free_slabs: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    /// Objects parked in per-core front caches.
    pub front_cached: usize,
}

/// Object cache for one object size.
pub struct SlabCache {
    name: &'static str,
    object_size: usize,
    alignment: usize,
    padding: usize,
    flags: CacheFlags,
    geometry: Geometry,
    hooks: Option<&'static dyn ObjectHooks>,
    lists: SpinNoIrq<CacheLists>,
    front: Once<Option<FrontCaches>>,
}

impl SlabCache {
    /// Describe a cache of `object_size` objects; no memory is reserved yet.
    ///
    /// `alignment` of 0 means no requirement, otherwise it must be a power of
    /// two. Objects are aligned to at most `page_size`.
    pub(crate) fn new(
        name: &'static str,
        object_size: usize,
        alignment: usize,
        flags: CacheFlags,
        hooks: Option<&'static dyn ObjectHooks>,
        page_size: usize,
    ) -> AllocResult<Self> {
        if object_size == 0 || (alignment != 0 && !alignment.is_power_of_two()) {
            warn!(
                "{}: invalid object size {} or alignment {}",
                name, object_size, alignment
            );
            return Err(AllocError::InvalidParam);
        }

        let mut padding = 0;
        if flags.contains(CacheFlags::DEBUG_OVERRUN) {
            padding += heap_debug::OVERRUN_PADDING;
        }
        let effective_alignment = alignment.min(page_size);
        if effective_alignment != 0 {
            let rem = (object_size + padding) % effective_alignment;
            if rem != 0 {
                padding += effective_alignment - rem;
            }
        }

        let geometry = compute_slab_geometry(object_size, effective_alignment, padding, page_size);
        debug!(
            "{}: object size {}, padding {}, {} objects per {} pages",
            name, object_size, padding, geometry.objects_per_slab, geometry.page_count
        );

        Ok(Self {
            name,
            object_size,
            alignment,
            padding,
            flags,
            geometry,
            hooks,
            lists: SpinNoIrq::new(CacheLists::new()),
            front: Once::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    /// Distance between consecutive objects of a slab.
    pub fn stride(&self) -> usize {
        self.object_size + self.padding
    }

    pub fn flags(&self) -> CacheFlags {
        self.flags
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn objects_per_slab(&self) -> usize {
        self.geometry.objects_per_slab
    }

    pub(crate) fn hooks(&self) -> Option<&'static dyn ObjectHooks> {
        self.hooks
    }

    /// Free objects held by slabs.
    pub fn free_count(&self) -> usize {
        self.lists.lock().free_count
    }

    fn front_caches(&self) -> Option<&FrontCaches> {
        self.front.get().and_then(Option::as_ref)
    }

    /// Build the per-core front caches, once.
    ///
    /// Skipped on single-core systems, for `NO_FRONT_CACHE` caches, and when
    /// the stash storage would exceed the largest size class.
    pub(crate) fn init_front_caches<E: CacheEnv + ?Sized>(&self, env: &E) {
        self.front.call_once(|| {
            let cores = env.core_count();
            if cores <= 1 || self.flags.contains(CacheFlags::NO_FRONT_CACHE) {
                return None;
            }
            let limit = self.objects_per_slab();
            let size = FrontCaches::storage_size(cores, limit);
            if size > SizeClass::MAX_OBJ_SIZE {
                debug!("{}: front caches need {} bytes, skipped", self.name, size);
                return None;
            }
            match env.alloc_metadata(size) {
                // SAFETY: the block is `size` bytes from a size class aligned
                // to at least 32 bytes, and lives until `destroy`.
                Ok(storage) => Some(unsafe { FrontCaches::init(storage, cores, limit) }),
                Err(_) => {
                    warn!("{}: no memory for front caches", self.name);
                    None
                }
            }
        });
    }

    /// Objects stashed in `core`'s front cache.
    pub fn front_available(&self, core: usize) -> usize {
        self.front_caches().map_or(0, |front| front.available(core))
    }

    fn object_ptr(&self, slab: SlabId, index: usize) -> NonNull<u8> {
        let address = slab.object_addr(self, index);
        trace!("{}: allocated {:#x}", self.name, address);
        // SAFETY: object addresses are inside a reserved region, never zero.
        unsafe { NonNull::new_unchecked(address as *mut u8) }
    }

    /// Allocate one object.
    ///
    /// Tries the calling core's front cache, then the partial and free slabs,
    /// and only then builds a new slab.
    pub(crate) fn allocate<E: CacheEnv + ?Sized>(&self, env: &E) -> AllocResult<NonNull<u8>> {
        if let Some(front) = self.front_caches() {
            if let Some(address) = front.pop(env.current_core_id()) {
                trace!("{}: front cache hit {:#x}", self.name, address);
                // SAFETY: only object addresses are stashed.
                return Ok(unsafe { NonNull::new_unchecked(address as *mut u8) });
            }
        }

        {
            let mut lists = self.lists.lock();
            if lists.free_count > 0 {
                let slab = match lists.partial.front() {
                    Some(slab) => slab,
                    None => {
                        let Some(slab) = lists.free.pop_front() else {
                            error!("{}: free count {} with no free slab", self.name, lists.free_count);
                            panic!("{}: free object count does not match slab lists", self.name);
                        };
                        lists.partial.push_back(slab);
                        slab
                    }
                };

                let Some(index) = slab.allocate_index(self) else {
                    error!("{}: partial slab {:#x} has no free slot", self.name, slab.base());
                    panic!("{}: slab bitmap inconsistent with its free count", self.name);
                };
                if slab.free_count() == 0 {
                    lists.partial.remove(slab);
                    lists.full.push_back(slab);
                }
                lists.free_count -= 1;
                return Ok(self.object_ptr(slab, index));
            }
        }

        // The backing allocator is called without the lock held.
        let slab = SlabId::create(self, env)?;
        let Some(index) = slab.allocate_index(self) else {
            error!("{}: new slab {:#x} has no free slot", self.name, slab.base());
            panic!("{}: freshly created slab is full", self.name);
        };

        let mut lists = self.lists.lock();
        if slab.free_count() == 0 {
            lists.full.push_back(slab);
        } else {
            lists.free_count += slab.free_count();
            lists.partial.push_back(slab);
        }
        drop(lists);
        Ok(self.object_ptr(slab, index))
    }

    /// Return `object` to the cache.
    ///
    /// # Panics
    ///
    /// Panics if the object does not belong to this cache, was already freed,
    /// is not the start of an object, or had its overrun sentinel clobbered.
    pub(crate) fn free<E: CacheEnv + ?Sized>(&self, env: &E, object: NonNull<u8>) {
        let address = object.as_ptr() as usize;
        let Some(slot) = self.locate(address) else {
            error!("{}: {:#x} is not an allocated object", self.name, address);
            panic!("{}: free of unknown address {:#x}", self.name, address);
        };
        self.free_slot(env, address, slot);
    }

    /// Return the object at `address`, already found at `slot` by
    /// [`locate`](Self::locate).
    pub(crate) fn free_slot<E: CacheEnv + ?Sized>(
        &self,
        env: &E,
        address: usize,
        slot: ObjectSlot,
    ) {
        trace!("{}: free {:#x}", self.name, address);

        if slot.slab.object_addr(self, slot.index) != address {
            error!("{}: {:#x} points inside an object", self.name, address);
            panic!("{}: free of interior pointer {:#x}", self.name, address);
        }
        if !slot.in_use {
            error!("{}: object {:#x} is not allocated", self.name, address);
            panic!("double free of {:#x} in {}", address, self.name);
        }

        if self.flags.contains(CacheFlags::DEBUG_OVERRUN) {
            // SAFETY: every slot of an overrun-checked cache carries a sentinel.
            if !unsafe { heap_debug::sentinel_intact(address + self.object_size) } {
                error!("{}: overrun past object {:#x}", self.name, address);
                panic!("{}: buffer overrun detected at {:#x}", self.name, address);
            }
        }

        if self.flags.contains(CacheFlags::DEBUG_USE_AFTER_FREE) {
            // SAFETY: the address is the start of an object slot the caller
            // owns until this call returns.
            unsafe { heap_debug::poison(address, self.object_size) };
        }

        if let Some(front) = self.front_caches() {
            match front.push(env.current_core_id(), address) {
                Stash::Stashed => return,
                Stash::Duplicate => {
                    error!("{}: object {:#x} is already stashed", self.name, address);
                    panic!("double free of {:#x} in {}", address, self.name);
                }
                Stash::Full => {}
            }
        }
        self.release_to_slab(address);
    }

    fn release_to_slab(&self, address: usize) {
        let mut lists = self.lists.lock();

        let located = lists
            .partial
            .find_map(|slab| slab.contains_address(self, address).map(|index| (slab, index)))
            .or_else(|| {
                lists
                    .full
                    .find_map(|slab| slab.contains_address(self, address).map(|index| (slab, index)))
            });

        let Some((slab, index)) = located else {
            drop(lists);
            error!("{}: {:#x} is not an allocated object", self.name, address);
            panic!("{}: free of unknown address {:#x}", self.name, address);
        };

        if slab.object_addr(self, index) != address {
            drop(lists);
            error!("{}: {:#x} points inside an object", self.name, address);
            panic!("{}: free of interior pointer {:#x}", self.name, address);
        }

        let was_full = slab.state() == SlabState::Full;
        slab.free_index(self, index);
        if was_full {
            lists.full.remove(slab);
            if self.objects_per_slab() == 1 {
                lists.free.push_back(slab);
            } else {
                lists.partial.push_back(slab);
            }
        } else if slab.free_count() == self.objects_per_slab() {
            lists.partial.remove(slab);
            lists.free.push_back(slab);
        }
        lists.free_count += 1;
    }

    /// Find the slot of a partial or full slab that `address` falls in.
    pub(crate) fn locate(&self, address: usize) -> Option<ObjectSlot> {
        let lists = self.lists.lock();
        let hit = |slab: SlabId| slab.contains_address(self, address).map(|index| (slab, index));
        let (slab, index) = lists.partial.find_map(hit).or_else(|| lists.full.find_map(hit))?;
        Some(ObjectSlot {
            slab,
            index,
            in_use: slab.is_allocated(self, index),
        })
    }

    /// Whether `object` lies in an allocated slot range of this cache.
    pub fn contains(&self, object: *const u8) -> bool {
        self.locate(object as usize).is_some()
    }

    /// Return every object stashed by `core` to its slab.
    ///
    /// Returns the number of objects moved.
    pub(crate) fn drain(&self, core: usize) -> usize {
        let Some(front) = self.front_caches() else {
            return 0;
        };
        let mut drained = 0;
        while let Some(address) = front.pop(core) {
            self.release_to_slab(address);
            drained += 1;
        }
        if drained > 0 {
            debug!("{}: drained {} objects of core {}", self.name, drained, core);
        }
        drained
    }

    /// Drain the calling core, then release every free slab.
    ///
    /// Returns the number of pages handed back.
    pub(crate) fn shrink<E: CacheEnv + ?Sized>(&self, env: &E) -> usize {
        self.drain(env.current_core_id());

        let mut released = 0;
        loop {
            let slab = {
                let mut lists = self.lists.lock();
                let Some(slab) = lists.free.pop_front() else {
                    break;
                };
                lists.free_count -= self.objects_per_slab();
                slab
            };
            slab.destroy(self, env);
            released += self.geometry.page_count;
        }
        if released > 0 {
            debug!("{}: shrink released {} pages", self.name, released);
        }
        released
    }

    /// Release every slab and the front-cache storage.
    ///
    /// Objects still outstanding become dangling.
    pub(crate) fn destroy<E: CacheEnv + ?Sized>(&self, env: &E) {
        debug!("{}: destroying cache", self.name);
        if let Some(front) = self.front_caches() {
            env.free_metadata(front.storage());
        }

        loop {
            let slab = {
                let mut lists = self.lists.lock();
                let CacheLists {
                    free,
                    partial,
                    full,
                    free_count,
                } = &mut *lists;
                let Some(slab) = free
                    .pop_front()
                    .or_else(|| partial.pop_front())
                    .or_else(|| full.pop_front())
                else {
                    *free_count = 0;
                    break;
                };
                slab
            };
            slab.destroy(self, env);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let front_cached = self.front_caches().map_or(0, FrontCaches::total_available);
        let lists = self.lists.lock();
        CacheStats {
            object_size: self.object_size,
            objects_per_slab: self.objects_per_slab(),
            pages_per_slab: self.geometry.page_count,
            free_objects: lists.free_count,
            free_slabs: lists.free.len(),
            partial_slabs: lists.partial.len(),
            full_slabs: lists.full.len(),
            front_cached,
        }
    }

    /// Write the cache geometry and a per-list slab summary to `out`.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let lists = self.lists.lock();
        writeln!(
            out,
            "{}: Object Size {}, Alignment {}, Padding {}, Count {}, FreeObjects {}",
            self.name,
            self.object_size,
            self.alignment,
            self.padding,
            self.objects_per_slab(),
            lists.free_count
        )?;
        for (title, list) in [
            ("full", &lists.full),
            ("partial", &lists.partial),
            ("free", &lists.free),
        ] {
            writeln!(out, "* {} slabs", title)?;
            let mut result = Ok(());
            list.find_map(|slab| {
                result = writeln!(
                    out,
                    " -- slab: {:#x} => {:#x}, FreeObjects {}",
                    slab.base(),
                    slab.end(self),
                    slab.free_count()
                );
                result.err()
            });
            result?;
        }
        writeln!(out)
    }

    /// Check the list bookkeeping: per-slab bitmaps agree with their counts,
    /// every slab sits on the list matching its fill level, and the cache's
    /// free count is the sum over the free and partial lists.
    pub fn is_consistent(&self) -> bool {
        let lists = self.lists.lock();
        let per_slab = self.objects_per_slab();
        let mut ok = true;
        let mut free_sum = 0;

        for (list, state) in [
            (&lists.free, SlabState::Free),
            (&lists.partial, SlabState::Partial),
            (&lists.full, SlabState::Full),
        ] {
            let mut len = 0;
            list.find_map(|slab| {
                len += 1;
                let fill_ok = match state {
                    SlabState::Free => slab.free_count() == per_slab,
                    SlabState::Partial => slab.free_count() > 0 && slab.free_count() < per_slab,
                    SlabState::Full => slab.free_count() == 0,
                    SlabState::Detached => false,
                };
                ok &= fill_ok && slab.state() == state && slab.is_consistent(self);
                if state != SlabState::Full {
                    free_sum += slab.free_count();
                }
                None::<()>
            });
            ok &= len == list.len();
        }
        ok && free_sum == lists.free_count
    }
}
