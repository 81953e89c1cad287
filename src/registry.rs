//! Size-class registry and generic allocation entry points.
//!
//! The registry owns the collaborators, the bootstrap cache that stores
//! `SlabCache` descriptors, and one lazily built default cache per size
//! class. It can live in a `static` and serve as the global allocator.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[cfg(feature = "tracking")]
use kspin::SpinNoIrq;
use spin::Once;

#[cfg(feature = "log")]
use log::{debug, error, info, warn};

use crate::geometry::Geometry;
use crate::size_class::SizeClass;
use crate::slab::{CacheEnv, SlabCache};
use crate::{
    AllocError, AllocResult, BackingAllocator, CacheFlags, ObjectHooks, Platform, ReserveFlags,
};

const CLASS_EMPTY: usize = 0;
const CLASS_READY: usize = 1;
/// `CLASS_INITIALIZING + core` while `core` builds the class cache.
const CLASS_INITIALIZING: usize = 2;

const BOOTSTRAP_CACHE_NAME: &str = "cache_cache";

struct ClassEntry {
    cache: AtomicPtr<SlabCache>,
    state: AtomicUsize,
}

impl ClassEntry {
    const fn new() -> Self {
        Self {
            cache: AtomicPtr::new(ptr::null_mut()),
            state: AtomicUsize::new(CLASS_EMPTY),
        }
    }

    fn ready(&self) -> Option<&SlabCache> {
        if self.state.load(Ordering::Acquire) != CLASS_READY {
            return None;
        }
        // SAFETY: a ready entry points at a cache that is never destroyed.
        unsafe { self.cache.load(Ordering::Acquire).as_ref() }
    }
}

/// Memory usage statistics
#[cfg(feature = "tracking")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageStats {
    /// Pages currently backing slabs.
    pub slab_pages: usize,
    pub slabs_created: usize,
    pub slabs_destroyed: usize,
    /// Objects handed out by `allocate` and not yet freed.
    pub live_allocations: usize,
}

/// Owner of a cache created with [`Registry::create_cache`].
///
/// Dereferences to the cache for inspection; allocation goes through the
/// registry.
pub struct CacheHandle {
    cache: NonNull<SlabCache>,
}

// SAFETY: the cache is internally synchronized and outlives the handle.
unsafe impl Send for CacheHandle {}
unsafe impl Sync for CacheHandle {}

impl Deref for CacheHandle {
    type Target = SlabCache;

    fn deref(&self) -> &SlabCache {
        // SAFETY: the cache stays alive until `destroy_cache` consumes the handle.
        unsafe { self.cache.as_ref() }
    }
}

/// The kernel heap: size-class caches over a backing page allocator.
///
/// [`init`](Self::init) must run once before any allocation.
pub struct Registry<B, P> {
    backing: B,
    platform: P,
    bootstrap: Once<SlabCache>,
    classes: [ClassEntry; SizeClass::COUNT],
    #[cfg(feature = "tracking")]
    stats: SpinNoIrq<UsageStats>,
}

impl<B, P> Registry<B, P> {
    pub const fn new(backing: B, platform: P) -> Self {
        const EMPTY_ENTRY: ClassEntry = ClassEntry::new();
        Self {
            backing,
            platform,
            bootstrap: Once::new(),
            classes: [EMPTY_ENTRY; SizeClass::COUNT],
            #[cfg(feature = "tracking")]
            stats: SpinNoIrq::new(UsageStats {
                slab_pages: 0,
                slabs_created: 0,
                slabs_destroyed: 0,
                live_allocations: 0,
            }),
        }
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }
}

impl<B: BackingAllocator, P: Platform> Registry<B, P> {
    /// Build the bootstrap cache. Later calls are no-ops.
    pub fn init(&self) -> AllocResult {
        self.bootstrap
            .try_call_once(|| {
                let page_size = self.backing.page_size();
                if !page_size.is_power_of_two() {
                    error!("heap: page size {:#x} is not a power of two", page_size);
                    return Err(AllocError::InvalidParam);
                }
                let cache = SlabCache::new(
                    BOOTSTRAP_CACHE_NAME,
                    core::mem::size_of::<SlabCache>(),
                    core::mem::align_of::<SlabCache>(),
                    CacheFlags::NO_FRONT_CACHE,
                    None,
                    page_size,
                )?;
                info!(
                    "heap: initialized, page size {:#x}, {} cores",
                    page_size,
                    self.platform.core_count()
                );
                Ok(cache)
            })
            .map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.bootstrap.is_completed()
    }

    fn bootstrap(&self) -> AllocResult<&SlabCache> {
        self.bootstrap.get().ok_or(AllocError::NotInitialized)
    }

    /// Place `cache` in an object of the bootstrap cache.
    fn store_cache(&self, cache: SlabCache) -> AllocResult<NonNull<SlabCache>> {
        let slot = self.bootstrap()?.allocate(self)?.cast::<SlabCache>();
        // SAFETY: bootstrap objects are sized and aligned for a SlabCache.
        unsafe { slot.as_ptr().write(cache) };
        Ok(slot)
    }

    fn build_class(&self, class: SizeClass) -> AllocResult<NonNull<SlabCache>> {
        let cache = SlabCache::new(
            class.name(),
            class.size(),
            class.size(),
            CacheFlags::DEFAULT,
            None,
            self.backing.page_size(),
        )?;
        check_recursion(class, cache.geometry());
        debug!("heap: building {}", class.name());
        self.store_cache(cache)
    }

    /// The default cache of `class`, built on first use.
    fn class_cache(&self, class: SizeClass) -> AllocResult<&SlabCache> {
        let entry = &self.classes[class.to_index()];
        loop {
            if let Some(cache) = entry.ready() {
                return Ok(cache);
            }

            let core = self.platform.current_core_id();
            match entry.state.compare_exchange(
                CLASS_EMPTY,
                CLASS_INITIALIZING + core,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let cache = match self.build_class(class) {
                        Ok(cache) => cache,
                        Err(e) => {
                            entry.state.store(CLASS_EMPTY, Ordering::Release);
                            return Err(e);
                        }
                    };
                    entry.cache.store(cache.as_ptr(), Ordering::Release);
                    entry.state.store(CLASS_READY, Ordering::Release);

                    // SAFETY: just published, never destroyed.
                    let cache = unsafe { cache.as_ref() };
                    // Published first so the stash storage may come from this class.
                    cache.init_front_caches(self);
                    return Ok(cache);
                }
                Err(CLASS_READY) | Err(CLASS_EMPTY) => continue,
                Err(state) => {
                    if state - CLASS_INITIALIZING == core {
                        error!("heap: {} needed while core {} builds it", class.name(), core);
                        panic!("recursive bootstrap of {}", class.name());
                    }
                    core::hint::spin_loop();
                }
            }
        }
    }

    fn allocate_untracked(&self, size: usize) -> AllocResult<NonNull<u8>> {
        let class = SizeClass::from_size(size).ok_or(AllocError::NoSuitableClass)?;
        self.class_cache(class)?.allocate(self)
    }

    fn free_untracked(&self, object: NonNull<u8>) {
        for entry in &self.classes {
            if let Some(cache) = entry.ready() {
                let address = object.as_ptr() as usize;
                if let Some(slot) = cache.locate(address) {
                    cache.free_slot(self, address, slot);
                    return;
                }
            }
        }
        error!("heap: no cache owns {:p}", object);
        panic!("free of {:p}, which no heap cache owns", object);
    }

    /// Allocate `size` bytes from the smallest size class that fits.
    ///
    /// The result is aligned to the class size, capped at one page.
    pub fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        let object = self.allocate_untracked(size)?;
        #[cfg(feature = "tracking")]
        {
            self.stats.lock().live_allocations += 1;
        }
        Ok(object)
    }

    /// Like [`allocate`](Self::allocate), also returning the physical address
    /// behind the object for DMA.
    pub fn allocate_physically_addressable(&self, size: usize) -> AllocResult<(NonNull<u8>, usize)> {
        let object = self.allocate(size)?;
        let physical = self.backing.physical_address_of(object.as_ptr() as usize);
        Ok((object, physical))
    }

    /// Return an object obtained from [`allocate`](Self::allocate).
    ///
    /// # Panics
    ///
    /// Panics if no size class owns `object`.
    pub fn free(&self, object: NonNull<u8>) {
        self.free_untracked(object);
        #[cfg(feature = "tracking")]
        {
            let mut stats = self.stats.lock();
            stats.live_allocations = stats.live_allocations.saturating_sub(1);
        }
    }

    /// The size class whose cache owns `object`.
    pub fn cache_of(&self, object: *const u8) -> Option<SizeClass> {
        SizeClass::ALL.iter().copied().find(|class| {
            self.classes[class.to_index()]
                .ready()
                .is_some_and(|cache| cache.contains(object))
        })
    }

    /// The default cache of `class`, if it has been built.
    pub fn class(&self, class: SizeClass) -> Option<&SlabCache> {
        self.classes[class.to_index()].ready()
    }

    /// Create a dedicated cache of `object_size` objects.
    ///
    /// `alignment` of 0 means no requirement, otherwise it must be a power
    /// of two. `hooks` run once per object slot when slabs are built and
    /// torn down.
    pub fn create_cache(
        &self,
        name: &'static str,
        object_size: usize,
        alignment: usize,
        flags: CacheFlags,
        hooks: Option<&'static dyn ObjectHooks>,
    ) -> AllocResult<CacheHandle> {
        let flags = flags - CacheFlags::DEFAULT;
        let cache = SlabCache::new(
            name,
            object_size,
            alignment,
            flags,
            hooks,
            self.backing.page_size(),
        )?;
        let cache = self.store_cache(cache)?;
        // SAFETY: stored above, owned by the new handle.
        unsafe { cache.as_ref() }.init_front_caches(self);
        Ok(CacheHandle { cache })
    }

    /// Destroy a cache and every slab it holds.
    ///
    /// Objects still allocated from it must not be used afterwards.
    pub fn destroy_cache(&self, handle: CacheHandle) {
        let cache = handle.cache;
        let Ok(bootstrap) = self.bootstrap() else {
            error!("heap: destroy of {} before init", handle.name());
            return;
        };
        // SAFETY: the handle was the only owner of the cache.
        unsafe {
            cache.as_ref().destroy(self);
            ptr::drop_in_place(cache.as_ptr());
        }
        bootstrap.free(self, cache.cast());
    }

    pub fn cache_allocate(&self, handle: &CacheHandle) -> AllocResult<NonNull<u8>> {
        handle.allocate(self)
    }

    /// # Panics
    ///
    /// Panics if `object` is not an allocated object of the cache.
    pub fn cache_free(&self, handle: &CacheHandle, object: NonNull<u8>) {
        handle.free(self, object)
    }

    /// Return the front-cache stash of `core` in one cache to its slabs.
    pub fn cache_drain(&self, handle: &CacheHandle, core: usize) -> usize {
        handle.drain(core)
    }

    /// Return every default cache's stash of `core` to the slabs.
    ///
    /// Returns the number of objects moved. Nothing calls this on its own;
    /// it is meant for a memory-pressure handler.
    pub fn drain(&self, core: usize) -> usize {
        self.classes
            .iter()
            .filter_map(ClassEntry::ready)
            .map(|cache| cache.drain(core))
            .sum()
    }

    pub fn drain_local(&self) -> usize {
        self.drain(self.platform.current_core_id())
    }

    /// Release the free slabs of every default cache and the bootstrap cache.
    ///
    /// Returns the number of pages handed back.
    pub fn shrink(&self) -> usize {
        let mut released: usize = self
            .classes
            .iter()
            .filter_map(ClassEntry::ready)
            .map(|cache| cache.shrink(self))
            .sum();
        if let Ok(bootstrap) = self.bootstrap() {
            released += bootstrap.shrink(self);
        }
        released
    }

    /// Write a report of one cache, or of every built default cache.
    pub fn dump(&self, cache: Option<&CacheHandle>, out: &mut dyn fmt::Write) -> fmt::Result {
        if let Some(handle) = cache {
            return handle.dump(out);
        }
        info!("heap: dumping default caches");
        for cache in self.classes.iter().filter_map(ClassEntry::ready) {
            cache.dump(out)?;
        }
        #[cfg(feature = "tracking")]
        {
            let stats = self.usage();
            writeln!(
                out,
                "Memory Stats: {} pages in {} slabs, {} live allocations",
                stats.slab_pages,
                stats.slabs_created - stats.slabs_destroyed,
                stats.live_allocations
            )?;
        }
        Ok(())
    }

    /// Get memory statistics
    #[cfg(feature = "tracking")]
    pub fn usage(&self) -> UsageStats {
        *self.stats.lock()
    }
}

/// A default cache whose off-site slab header would be served by that same
/// cache can never be built.
fn check_recursion(class: SizeClass, geometry: &Geometry) {
    if geometry.metadata_on_site {
        return;
    }
    if SizeClass::from_size(geometry.metadata_size) == Some(class) {
        error!(
            "heap: {} slab header ({} bytes) maps to itself",
            class.name(),
            geometry.metadata_size
        );
        panic!(
            "recursive bootstrap: {} would allocate its own slab headers",
            class.name()
        );
    }
}

impl<B: BackingAllocator, P: Platform> CacheEnv for Registry<B, P> {
    fn page_size(&self) -> usize {
        self.backing.page_size()
    }

    fn reserve_pages(&self, flags: ReserveFlags, page_count: usize) -> AllocResult<usize> {
        let address = self.backing.reserve_pages(flags, page_count).inspect_err(|_e| {
            warn!("heap: backing allocator refused {} pages: {}", page_count, _e);
        })?;
        #[cfg(feature = "tracking")]
        {
            let mut stats = self.stats.lock();
            stats.slab_pages += page_count;
            stats.slabs_created += 1;
        }
        Ok(address)
    }

    fn release_pages(&self, address: usize, page_count: usize) {
        self.backing.release_pages(address, page_count);
        #[cfg(feature = "tracking")]
        {
            let mut stats = self.stats.lock();
            stats.slab_pages = stats.slab_pages.saturating_sub(page_count);
            stats.slabs_destroyed += 1;
        }
    }

    fn alloc_metadata(&self, size: usize) -> AllocResult<NonNull<u8>> {
        self.allocate_untracked(size)
    }

    fn free_metadata(&self, ptr: NonNull<u8>) {
        self.free_untracked(ptr)
    }

    fn core_count(&self) -> usize {
        self.platform.core_count()
    }

    fn current_core_id(&self) -> usize {
        self.platform.current_core_id()
    }
}

unsafe impl<B: BackingAllocator, P: Platform> GlobalAlloc for Registry<B, P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > self.backing.page_size() {
            warn!("heap: alignment {:#x} exceeds a page", layout.align());
            return ptr::null_mut();
        }
        match self.allocate(layout.size().max(layout.align())) {
            Ok(object) => object.as_ptr(),
            Err(_e) => {
                warn!("heap: allocation of {:?} failed: {}", layout, _e);
                ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(object) = NonNull::new(ptr) {
            self.free(object);
        }
    }
}
