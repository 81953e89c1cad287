//! Slab geometry calculation.
//!
//! For one object size this decides how many pages back a slab, how many
//! objects it holds, and whether the slab header lives inside those pages.

#[cfg(feature = "log")]
use log::{error, trace};

use crate::slab::slab_node::SLAB_HEADER_SIZE;

/// Objects smaller than this keep their slab header on-site.
pub const ONSITE_THRESHOLD: usize = 512;

/// Accepted wastage is `page_size >> WASTAGE_SHIFT`.
pub const WASTAGE_SHIFT: u32 = 4;

/// Largest slab is `1 << MAX_PAGE_ORDER` pages.
pub const MAX_PAGE_ORDER: u32 = 9;

/// Layout of every slab of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub objects_per_slab: usize,
    pub page_count: usize,
    pub metadata_on_site: bool,
    /// Bytes of slab header plus bitmap.
    pub metadata_size: usize,
    /// Offset of the first object from the region base.
    pub object_offset: usize,
    /// Bytes of the slab covered neither by objects nor by on-site metadata.
    pub wastage: usize,
}

/// Bytes of header and bitmap needed to describe `objects` slots.
pub const fn metadata_size(objects: usize) -> usize {
    SLAB_HEADER_SIZE + objects.div_ceil(u64::BITS as usize) * core::mem::size_of::<u64>()
}

/// Fit objects of `unit` bytes into `slab_bytes`, returning (objects, wastage).
fn fit(slab_bytes: usize, unit: usize, alignment: usize, on_site: bool) -> (usize, usize) {
    let reserved = if on_site {
        (metadata_size(slab_bytes / unit) + alignment).min(slab_bytes)
    } else {
        0
    };
    let objects = (slab_bytes - reserved) / unit;
    (objects, slab_bytes - reserved - objects * unit)
}

/// Compute the slab layout for objects of `object_size + padding` bytes.
///
/// Starting from one page the slab doubles until at least one object fits
/// and no more than `page_size / 16` bytes go unused. Objects of exactly one
/// or two pages get a fixed 16-page layout.
///
/// # Panics
///
/// Panics if no slab of up to `1 << MAX_PAGE_ORDER` pages meets the budget.
pub fn compute_slab_geometry(
    object_size: usize,
    alignment: usize,
    padding: usize,
    page_size: usize,
) -> Geometry {
    let unit = object_size + padding;
    debug_assert!(unit > 0, "zero-sized slab object");
    debug_assert!(page_size.is_power_of_two());

    let accepted_wastage = page_size >> WASTAGE_SHIFT;
    let mut on_site = unit < ONSITE_THRESHOLD;
    let mut order = 0;
    let mut page_count = 1;
    let (mut objects, mut wastage) = fit(page_size, unit, alignment, on_site);

    while objects == 0 || wastage > accepted_wastage {
        if order == MAX_PAGE_ORDER {
            error!(
                "no slab geometry for object size {} (align {}, padding {})",
                object_size, alignment, padding
            );
            panic!(
                "slab geometry: object size {} exceeds {} pages within wastage budget",
                object_size,
                1usize << MAX_PAGE_ORDER
            );
        }
        order += 1;
        page_count = 1 << order;
        (objects, wastage) = fit(page_size * page_count, unit, alignment, on_site);
    }

    // Leftover space may be able to host the header after all.
    if !on_site && wastage >= metadata_size(objects) + alignment {
        on_site = true;
    }

    if padding == 0 && object_size == page_size {
        objects = 16;
        page_count = 16;
        on_site = false;
    } else if padding == 0 && object_size == 2 * page_size {
        objects = 8;
        page_count = 16;
        on_site = false;
    }

    let metadata_size = metadata_size(objects);
    let object_offset = if on_site {
        crate::align_up(metadata_size, alignment.max(1))
    } else {
        0
    };
    let wastage = page_count * page_size - object_offset - objects * unit;

    trace!(
        "geometry({}, {}, {}): {} objects on {} pages, on-site {}, {} bytes wasted",
        object_size,
        alignment,
        padding,
        objects,
        page_count,
        on_site,
        wastage
    );

    Geometry {
        objects_per_slab: objects,
        page_count,
        metadata_on_site: on_site,
        metadata_size,
        object_offset,
        wastage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 4096;

    #[test]
    fn test_default_classes_within_budget() {
        let mut size = 32;
        while size <= 262144 {
            let geometry = compute_slab_geometry(size, size, 0, PAGE_SIZE);
            assert!(geometry.objects_per_slab > 0, "size {}", size);
            if size != 4096 && size != 8192 {
                assert!(
                    geometry.wastage <= PAGE_SIZE / 16,
                    "size {} wastes {}",
                    size,
                    geometry.wastage
                );
            }
            let used = geometry.object_offset + geometry.objects_per_slab * size;
            assert!(used <= geometry.page_count * PAGE_SIZE);
            size *= 2;
        }
    }

    #[test]
    fn test_page_sized_overrides() {
        let one_page = compute_slab_geometry(4096, 4096, 0, PAGE_SIZE);
        assert_eq!(one_page.objects_per_slab, 16);
        assert_eq!(one_page.page_count, 16);
        assert!(!one_page.metadata_on_site);
        assert_eq!(one_page.metadata_size, metadata_size(16));

        let two_pages = compute_slab_geometry(8192, 8192, 0, PAGE_SIZE);
        assert_eq!(two_pages.objects_per_slab, 8);
        assert_eq!(two_pages.page_count, 16);
        assert!(!two_pages.metadata_on_site);
    }

    #[test]
    fn test_small_objects_on_site() {
        let geometry = compute_slab_geometry(64, 64, 0, PAGE_SIZE);
        assert!(geometry.metadata_on_site);
        assert_eq!(geometry.page_count, 1);
        assert_eq!(geometry.object_offset % 64, 0);
        assert!(geometry.object_offset >= geometry.metadata_size);
        assert!(geometry.object_offset + geometry.objects_per_slab * 64 <= PAGE_SIZE);
        assert!(geometry.wastage < 2 * 64);
    }

    #[test]
    fn test_large_objects_off_site() {
        let geometry = compute_slab_geometry(1024, 1024, 0, PAGE_SIZE);
        assert!(!geometry.metadata_on_site);
        assert_eq!(geometry.object_offset, 0);
        assert_eq!(geometry.objects_per_slab, 4);
        assert_eq!(geometry.wastage, 0);

        let huge = compute_slab_geometry(262144, 262144, 0, PAGE_SIZE);
        assert_eq!(huge.page_count, 64);
        assert_eq!(huge.objects_per_slab, 1);
    }

    #[test]
    fn test_leftover_space_hosts_header() {
        // 600-byte objects need 4 pages, whose slack can host the header.
        let geometry = compute_slab_geometry(600, 8, 0, PAGE_SIZE);
        assert_eq!(geometry.page_count, 4);
        assert_eq!(geometry.objects_per_slab, 27);
        assert!(geometry.metadata_on_site);
        assert!(geometry.object_offset >= geometry.metadata_size);
        assert!(geometry.wastage <= PAGE_SIZE / 16);
    }

    #[test]
    fn test_padding_counts_towards_object_stride() {
        let geometry = compute_slab_geometry(60, 64, 4, PAGE_SIZE);
        let plain = compute_slab_geometry(64, 64, 0, PAGE_SIZE);
        assert!(geometry.metadata_on_site);
        assert_eq!(geometry.objects_per_slab, plain.objects_per_slab);
        assert_eq!(geometry.object_offset, plain.object_offset);
    }

    #[test]
    #[should_panic]
    fn test_unsatisfiable_geometry() {
        // One object per 513 pages can never fit in 512 pages.
        compute_slab_geometry(PAGE_SIZE * 513, 0, 0, PAGE_SIZE);
    }
}
