//! Host-memory collaborators for unit tests.

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use kspin::SpinNoIrq;

use crate::slab::CacheEnv;
use crate::{AllocError, AllocResult, BackingAllocator, Platform, ReserveFlags};

pub const PAGE_SIZE: usize = 4096;

/// Page-aligned regions from the host allocator, with an optional page budget.
pub struct MockBacking {
    regions: SpinNoIrq<Vec<(usize, usize)>>,
    budget: Option<usize>,
    reserve_calls: AtomicUsize,
}

impl MockBacking {
    pub fn new() -> Self {
        Self {
            regions: SpinNoIrq::new(Vec::new()),
            budget: None,
            reserve_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_page_budget(pages: usize) -> Self {
        let mut backing = Self::new();
        backing.budget = Some(pages);
        backing
    }

    /// Pages currently handed out.
    pub fn reserved_pages(&self) -> usize {
        self.regions.lock().iter().map(|&(_, pages)| pages).sum()
    }

    pub fn reserve_calls(&self) -> usize {
        self.reserve_calls.load(Ordering::Relaxed)
    }
}

impl BackingAllocator for MockBacking {
    fn reserve_pages(&self, _flags: ReserveFlags, page_count: usize) -> AllocResult<usize> {
        self.reserve_calls.fetch_add(1, Ordering::Relaxed);
        let mut regions = self.regions.lock();
        if let Some(budget) = self.budget {
            let used: usize = regions.iter().map(|&(_, pages)| pages).sum();
            if used + page_count > budget {
                return Err(AllocError::NoMemory);
            }
        }
        let layout = Layout::from_size_align(page_count * PAGE_SIZE, PAGE_SIZE)
            .map_err(|_| AllocError::InvalidParam)?;
        let address = unsafe { alloc(layout) } as usize;
        if address == 0 {
            return Err(AllocError::NoMemory);
        }
        regions.push((address, page_count));
        Ok(address)
    }

    fn release_pages(&self, address: usize, page_count: usize) {
        let mut regions = self.regions.lock();
        let index = regions
            .iter()
            .position(|&region| region == (address, page_count))
            .expect("release of unknown region");
        regions.swap_remove(index);
        let layout = Layout::from_size_align(page_count * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { dealloc(address as *mut u8, layout) };
    }

    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn physical_address_of(&self, address: usize) -> usize {
        address
    }
}

impl Drop for MockBacking {
    fn drop(&mut self) {
        for (address, pages) in self.regions.lock().drain(..) {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            unsafe { dealloc(address as *mut u8, layout) };
        }
    }
}

/// A platform whose current core is settable from the test.
pub struct SwitchableCores {
    cores: usize,
    current: AtomicUsize,
}

impl SwitchableCores {
    pub const fn new(cores: usize) -> Self {
        Self {
            cores,
            current: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, core: usize) {
        assert!(core < self.cores);
        self.current.store(core, Ordering::Relaxed);
    }
}

impl Platform for SwitchableCores {
    fn core_count(&self) -> usize {
        self.cores
    }

    fn current_core_id(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }
}

/// Stand-alone cache environment: metadata comes straight from the host.
pub struct MockEnv {
    pub backing: MockBacking,
    platform: SwitchableCores,
    metadata: SpinNoIrq<Vec<(usize, Layout)>>,
    fail_metadata: AtomicBool,
}

impl MockEnv {
    pub fn new() -> Self {
        Self::build(MockBacking::new(), 1)
    }

    pub fn with_cores(cores: usize) -> Self {
        Self::build(MockBacking::new(), cores)
    }

    pub fn with_page_budget(pages: usize) -> Self {
        Self::build(MockBacking::with_page_budget(pages), 1)
    }

    fn build(backing: MockBacking, cores: usize) -> Self {
        Self {
            backing,
            platform: SwitchableCores::new(cores),
            metadata: SpinNoIrq::new(Vec::new()),
            fail_metadata: AtomicBool::new(false),
        }
    }

    pub fn set_core(&self, core: usize) {
        self.platform.set(core);
    }

    pub fn fail_metadata(&self, fail: bool) {
        self.fail_metadata.store(fail, Ordering::Relaxed);
    }

    /// Metadata blocks currently outstanding.
    pub fn metadata_allocations(&self) -> usize {
        self.metadata.lock().len()
    }
}

impl CacheEnv for MockEnv {
    fn page_size(&self) -> usize {
        self.backing.page_size()
    }

    fn reserve_pages(&self, flags: ReserveFlags, page_count: usize) -> AllocResult<usize> {
        self.backing.reserve_pages(flags, page_count)
    }

    fn release_pages(&self, address: usize, page_count: usize) {
        self.backing.release_pages(address, page_count)
    }

    fn alloc_metadata(&self, size: usize) -> AllocResult<NonNull<u8>> {
        if self.fail_metadata.load(Ordering::Relaxed) {
            return Err(AllocError::NoMemory);
        }
        let layout = Layout::from_size_align(size, 64).map_err(|_| AllocError::InvalidParam)?;
        let ptr = NonNull::new(unsafe { alloc(layout) }).ok_or(AllocError::NoMemory)?;
        self.metadata.lock().push((ptr.as_ptr() as usize, layout));
        Ok(ptr)
    }

    fn free_metadata(&self, ptr: NonNull<u8>) {
        let mut metadata = self.metadata.lock();
        let index = metadata
            .iter()
            .position(|&(address, _)| address == ptr.as_ptr() as usize)
            .expect("free of unknown metadata");
        let (_, layout) = metadata.swap_remove(index);
        unsafe { dealloc(ptr.as_ptr(), layout) };
    }

    fn core_count(&self) -> usize {
        self.platform.core_count()
    }

    fn current_core_id(&self) -> usize {
        self.platform.current_core_id()
    }
}

impl Drop for MockEnv {
    fn drop(&mut self) {
        for (address, layout) in self.metadata.lock().drain(..) {
            unsafe { dealloc(address as *mut u8, layout) };
        }
    }
}
