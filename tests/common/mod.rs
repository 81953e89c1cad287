//! Shared collaborators for the integration tests.

#![allow(dead_code)]

use std::alloc::{alloc, dealloc, Layout};
use std::cell::Cell;

use kmem_slab::{AllocError, AllocResult, BackingAllocator, Platform, ReserveFlags};
use kspin::SpinNoIrq;

pub const PAGE_SIZE: usize = 0x1000;

/// Pretend physical base of the test heap.
pub const PHYS_BASE: usize = 0x8000_0000;

/// Page allocator over one block of host memory.
pub struct HeapBacking {
    base: usize,
    layout: Layout,
    used: SpinNoIrq<Vec<bool>>,
}

impl HeapBacking {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc(layout) } as usize;
        assert_ne!(base, 0, "Failed to allocate test heap");
        Self {
            base,
            layout,
            used: SpinNoIrq::new(vec![false; pages]),
        }
    }

    pub fn used_pages(&self) -> usize {
        self.used.lock().iter().filter(|&&used| used).count()
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.base + self.layout.size()
    }
}

impl BackingAllocator for HeapBacking {
    fn reserve_pages(&self, _flags: ReserveFlags, page_count: usize) -> AllocResult<usize> {
        let mut used = self.used.lock();
        let mut run = 0;
        for page in 0..used.len() {
            run = if used[page] { 0 } else { run + 1 };
            if run == page_count {
                let first = page + 1 - page_count;
                used[first..=page].iter_mut().for_each(|slot| *slot = true);
                return Ok(self.base + first * PAGE_SIZE);
            }
        }
        Err(AllocError::NoMemory)
    }

    fn release_pages(&self, address: usize, page_count: usize) {
        assert_eq!((address - self.base) % PAGE_SIZE, 0);
        let first = (address - self.base) / PAGE_SIZE;
        let mut used = self.used.lock();
        for slot in &mut used[first..first + page_count] {
            assert!(*slot, "release of free page");
            *slot = false;
        }
    }

    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn physical_address_of(&self, address: usize) -> usize {
        address - self.base + PHYS_BASE
    }
}

impl Drop for HeapBacking {
    fn drop(&mut self) {
        unsafe { dealloc(self.base as *mut u8, self.layout) };
    }
}

thread_local! {
    static CORE_ID: Cell<usize> = const { Cell::new(0) };
}

/// Each test thread plays one core; the id is set per thread.
pub struct ThreadCores {
    cores: usize,
}

impl ThreadCores {
    pub const fn new(cores: usize) -> Self {
        Self { cores }
    }

    pub fn enter(&self, core: usize) {
        assert!(core < self.cores);
        CORE_ID.with(|id| id.set(core));
    }
}

impl Platform for ThreadCores {
    fn core_count(&self) -> usize {
        self.cores
    }

    fn current_core_id(&self) -> usize {
        CORE_ID.with(Cell::get)
    }
}

pub type TestRegistry = kmem_slab::Registry<HeapBacking, ThreadCores>;

pub fn registry(pages: usize, cores: usize) -> TestRegistry {
    let registry = TestRegistry::new(HeapBacking::new(pages), ThreadCores::new(cores));
    registry.init().unwrap();
    registry
}
