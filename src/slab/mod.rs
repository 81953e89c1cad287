//! Slab allocator implementation.
//!
//! This module implements the object caches: slabs with free bitmaps, the
//! Free/Partial/Full list state machine, and per-core front caches.

use core::ptr::NonNull;

use crate::{AllocResult, ReserveFlags};

pub(crate) mod bitmap;
pub mod front_cache;
pub mod slab_cache;
pub mod slab_node;

// Re-export public types
pub use slab_cache::{CacheStats, SlabCache};
pub use slab_node::SlabState;

/// Everything a cache needs from its surroundings.
///
/// The registry implements this for every cache it owns: pages come from the
/// backing allocator, off-site metadata and front-cache storage come from the
/// registry's own size classes.
pub(crate) trait CacheEnv {
    fn page_size(&self) -> usize;

    fn reserve_pages(&self, flags: ReserveFlags, page_count: usize) -> AllocResult<usize>;

    fn release_pages(&self, address: usize, page_count: usize);

    fn alloc_metadata(&self, size: usize) -> AllocResult<NonNull<u8>>;

    fn free_metadata(&self, ptr: NonNull<u8>);

    fn core_count(&self) -> usize;

    fn current_core_id(&self) -> usize;
}
