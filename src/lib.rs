//! Kernel SLAB heap
//!
//! This crate implements the general-purpose dynamic memory allocator of a
//! kernel, featuring:
//! - Size-classed object caches backed by physically contiguous slabs
//! - Slab geometry tuned to keep wastage under 1/16 of a page
//! - On-site or off-site slab metadata, chosen per object size
//! - Per-core front caches that keep the hot path off the shared lock
//! - A registry of lazily built default caches behind `allocate`/`free`
//!
//! The virtual-memory subsystem and the platform layer are collaborators,
//! reached only through [`BackingAllocator`] and [`Platform`].

#![no_std]

#[cfg(test)]
extern crate alloc;

use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The requested size exceeds the largest configured size class.
    NoSuitableClass,
    /// The backing allocator could not supply pages for a new slab.
    NoMemory,
    /// Invalid object size or alignment.
    InvalidParam,
    /// The registry was used before [`Registry::init`].
    NotInitialized,
}

impl AllocError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSuitableClass => "no size class is large enough",
            Self::NoMemory => "backing allocator is out of memory",
            Self::InvalidParam => "invalid object size or alignment",
            Self::NotInitialized => "heap registry is not initialized",
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::error::Error for AllocError {}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

bitflags! {
    /// Per-cache behaviour switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// The cache is one of the registry's size classes.
        const DEFAULT = 1 << 0;
        /// Never build per-core front caches.
        const NO_FRONT_CACHE = 1 << 1;
        /// Append a sentinel word to each object and verify it on free.
        const DEBUG_OVERRUN = 1 << 2;
        /// Poison fresh slabs and freed objects.
        const DEBUG_USE_AFTER_FREE = 1 << 3;
        /// Ask for physically contiguous backing pages.
        const CONTIGUOUS = 1 << 4;
    }
}

bitflags! {
    /// Flags forwarded to [`BackingAllocator::reserve_pages`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReserveFlags: u32 {
        const CONTIGUOUS = 1 << 0;
    }
}

impl From<CacheFlags> for ReserveFlags {
    fn from(flags: CacheFlags) -> Self {
        if flags.contains(CacheFlags::CONTIGUOUS) {
            ReserveFlags::CONTIGUOUS
        } else {
            ReserveFlags::empty()
        }
    }
}

/// Supplier of physically backed virtual page ranges.
///
/// Implementations must be internally synchronized: the heap calls them from
/// any core, and never while holding one of its own locks.
pub trait BackingAllocator: Sync {
    /// Reserve `page_count` contiguous virtual pages; returns the page-aligned base.
    fn reserve_pages(&self, flags: ReserveFlags, page_count: usize) -> AllocResult<usize>;

    /// Return pages obtained from [`reserve_pages`](Self::reserve_pages).
    fn release_pages(&self, address: usize, page_count: usize);

    /// The size of a memory page. Must be a power of two.
    fn page_size(&self) -> usize;

    /// Resolve the physical address backing `address`.
    fn physical_address_of(&self, address: usize) -> usize;
}

/// Processor topology as seen by the front caches.
pub trait Platform: Sync {
    /// Number of logical cores.
    fn core_count(&self) -> usize;

    /// Id of the calling core, in `0..core_count()`.
    ///
    /// The caller must not migrate to another core while it uses the id.
    fn current_core_id(&self) -> usize;
}

/// Object constructor/destructor pair attached to a cache.
///
/// `construct` runs once per object slot when its slab is created, `destruct`
/// once per slot when the slab is released.
pub trait ObjectHooks: Sync {
    fn construct(&self, _cache: &SlabCache, _object: NonNull<u8>) {}

    fn destruct(&self, _cache: &SlabCache, _object: NonNull<u8>) {}
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

pub mod debug;
pub mod geometry;
pub use geometry::{compute_slab_geometry, Geometry};

pub mod size_class;
pub use size_class::SizeClass;

pub mod slab;
pub use slab::{CacheStats, SlabCache, SlabState};

pub mod registry;
pub use registry::{CacheHandle, Registry};
#[cfg(feature = "tracking")]
pub use registry::UsageStats;

#[cfg(test)]
mod mock;
