//! Slab node implementation.
//!
//! A slab is one run of backing pages cut into equal object slots. Its header
//! (followed directly by the free bitmap) sits either at the start of those
//! pages or in a separate allocation from the registry.

use core::mem::size_of;
use core::ptr::{self, NonNull};

#[cfg(feature = "log")]
use log::{debug, error, warn};

use super::bitmap::SlabBitmap;
use super::slab_cache::SlabCache;
use super::CacheEnv;
use crate::{debug as heap_debug, AllocError, AllocResult, CacheFlags};

const SLAB_HEADER_MAGIC: u32 = 0x534c_4142;

/// Which of its cache's lists a slab is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlabState {
    /// Not on any list (being created, destroyed, or in flight).
    Detached,
    Free,
    Partial,
    Full,
}

#[repr(C)]
pub(crate) struct SlabHeader {
    magic: u32,
    state: SlabState,
    /// Base of the backing pages.
    region: usize,
    /// Address of object 0.
    objects: usize,
    free_count: usize,
    prev: Option<SlabId>,
    next: Option<SlabId>,
}

/// Bytes of header preceding the free bitmap words.
pub(crate) const SLAB_HEADER_SIZE: usize = size_of::<SlabHeader>();

/// Handle to a live slab header.
///
/// Headers are only read or written while the owning cache's lock is held,
/// or while the slab is detached and reachable from a single core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlabId(NonNull<SlabHeader>);

// SAFETY: a SlabId is moved between cores only inside its cache's lock.
unsafe impl Send for SlabId {}

impl SlabId {
    fn header(&self) -> &SlabHeader {
        // SAFETY: the header stays allocated until `destroy`, and access is
        // serialized as documented on the type.
        unsafe { self.0.as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut SlabHeader {
        // SAFETY: see `header`.
        unsafe { &mut *self.0.as_ptr() }
    }

    fn bitmap(&self, objects_per_slab: usize) -> SlabBitmap<'_> {
        let words = SlabBitmap::words_for(objects_per_slab);
        // SAFETY: metadata_size() reserved `words` u64s right after the header.
        let slice = unsafe {
            let first = self.0.as_ptr().add(1).cast::<u64>();
            core::slice::from_raw_parts_mut(first, words)
        };
        SlabBitmap::new(slice, objects_per_slab)
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.header().magic == SLAB_HEADER_MAGIC
    }

    pub(crate) fn state(&self) -> SlabState {
        self.header().state
    }

    pub(crate) fn set_state(&self, state: SlabState) {
        self.header_mut().state = state;
    }

    pub(crate) fn prev(&self) -> Option<SlabId> {
        self.header().prev
    }

    pub(crate) fn next(&self) -> Option<SlabId> {
        self.header().next
    }

    pub(crate) fn set_prev(&self, prev: Option<SlabId>) {
        self.header_mut().prev = prev;
    }

    pub(crate) fn set_next(&self, next: Option<SlabId>) {
        self.header_mut().next = next;
    }

    pub(crate) fn free_count(&self) -> usize {
        self.header().free_count
    }

    /// Address of object 0.
    pub(crate) fn base(&self) -> usize {
        self.header().objects
    }

    /// One past the last object byte.
    pub(crate) fn end(&self, cache: &SlabCache) -> usize {
        self.base() + cache.objects_per_slab() * cache.stride()
    }

    pub(crate) fn object_addr(&self, cache: &SlabCache, index: usize) -> usize {
        self.base() + index * cache.stride()
    }

    /// Build a slab for `cache`: reserve pages, place and zero the metadata,
    /// then run the constructor over every slot.
    pub(crate) fn create<E: CacheEnv + ?Sized>(cache: &SlabCache, env: &E) -> AllocResult<Self> {
        let geometry = cache.geometry();
        let region = env.reserve_pages(cache.flags().into(), geometry.page_count)?;

        if cache.flags().contains(CacheFlags::DEBUG_USE_AFTER_FREE) {
            // SAFETY: the whole region was just reserved for this slab.
            unsafe { heap_debug::poison(region, geometry.page_count * env.page_size()) };
        }

        let (header_addr, objects) = if geometry.metadata_on_site {
            (region, region + geometry.object_offset)
        } else {
            match env.alloc_metadata(geometry.metadata_size) {
                Ok(ptr) => (ptr.as_ptr() as usize, region),
                Err(e) => {
                    warn!(
                        "{}: no memory for off-site slab header ({} bytes)",
                        cache.name(),
                        geometry.metadata_size
                    );
                    env.release_pages(region, geometry.page_count);
                    return Err(e);
                }
            }
        };

        let Some(header) = NonNull::new(header_addr as *mut SlabHeader) else {
            env.release_pages(region, geometry.page_count);
            return Err(AllocError::NoMemory);
        };

        // SAFETY: `header` points at `metadata_size` writable bytes owned by
        // this slab (start of the region, or a fresh metadata allocation).
        unsafe {
            ptr::write_bytes(header.as_ptr().cast::<u8>(), 0, geometry.metadata_size);
            header.as_ptr().write(SlabHeader {
                magic: SLAB_HEADER_MAGIC,
                state: SlabState::Detached,
                region,
                objects,
                free_count: geometry.objects_per_slab,
                prev: None,
                next: None,
            });
        }

        let slab = SlabId(header);
        slab.initialize_objects(cache);

        debug!(
            "{}: new slab {:#x} ({} pages, {} objects at {:#x})",
            cache.name(),
            region,
            geometry.page_count,
            geometry.objects_per_slab,
            objects
        );
        Ok(slab)
    }

    fn initialize_objects(&self, cache: &SlabCache) {
        let overrun = cache.flags().contains(CacheFlags::DEBUG_OVERRUN);
        for index in 0..cache.objects_per_slab() {
            let address = self.object_addr(cache, index);
            if let Some(hooks) = cache.hooks() {
                // SAFETY: object addresses lie inside the slab's region.
                hooks.construct(cache, unsafe { NonNull::new_unchecked(address as *mut u8) });
            }
            if overrun {
                // SAFETY: DEBUG_OVERRUN reserves the padding word after each object.
                unsafe { heap_debug::write_sentinel(address + cache.object_size()) };
            }
        }
    }

    /// Run the destructor over every slot and hand the memory back.
    pub(crate) fn destroy<E: CacheEnv + ?Sized>(self, cache: &SlabCache, env: &E) {
        if let Some(hooks) = cache.hooks() {
            for index in 0..cache.objects_per_slab() {
                let address = self.object_addr(cache, index);
                // SAFETY: object addresses lie inside the slab's region.
                hooks.destruct(cache, unsafe { NonNull::new_unchecked(address as *mut u8) });
            }
        }

        let geometry = cache.geometry();
        let region = self.header().region;
        debug!("{}: releasing slab {:#x}", cache.name(), region);

        env.release_pages(region, geometry.page_count);
        if !geometry.metadata_on_site {
            env.free_metadata(self.0.cast());
        }
    }

    /// Claim the lowest free slot.
    pub(crate) fn allocate_index(&self, cache: &SlabCache) -> Option<usize> {
        let objects_per_slab = cache.objects_per_slab();
        debug_assert!(self.free_count() <= objects_per_slab);
        if self.free_count() == 0 {
            return None;
        }

        let mut bitmap = self.bitmap(objects_per_slab);
        let index = bitmap.first_unset()?;
        bitmap.set(index);
        self.header_mut().free_count -= 1;
        Some(index)
    }

    /// Release slot `index`.
    ///
    /// # Panics
    ///
    /// Panics on a double free: the slab is already entirely free, or the
    /// slot is not in use.
    pub(crate) fn free_index(&self, cache: &SlabCache, index: usize) {
        let objects_per_slab = cache.objects_per_slab();
        if self.free_count() >= objects_per_slab {
            error!(
                "{}: free into fully free slab {:#x}",
                cache.name(),
                self.base()
            );
            panic!("double free: slab {:#x} of {} is already free", self.base(), cache.name());
        }

        let mut bitmap = self.bitmap(objects_per_slab);
        if !bitmap.test(index) {
            let address = self.object_addr(cache, index);
            error!("{}: object {:#x} is not allocated", cache.name(), address);
            panic!("double free of {:#x} in {}", address, cache.name());
        }
        bitmap.clear(index);
        self.header_mut().free_count += 1;
    }

    /// Whether slot `index` is handed out.
    pub(crate) fn is_allocated(&self, cache: &SlabCache, index: usize) -> bool {
        self.bitmap(cache.objects_per_slab()).test(index)
    }

    /// Slot index holding `address`, if the address lies in this slab.
    pub(crate) fn contains_address(&self, cache: &SlabCache, address: usize) -> Option<usize> {
        let base = self.base();
        if address >= base && address < self.end(cache) {
            Some((address - base) / cache.stride())
        } else {
            None
        }
    }

    /// Whether the header's free count agrees with its bitmap.
    pub(crate) fn is_consistent(&self, cache: &SlabCache) -> bool {
        let objects_per_slab = cache.objects_per_slab();
        let in_use = self.bitmap(objects_per_slab).count_set();
        self.is_valid() && in_use + self.free_count() == objects_per_slab
    }
}
