//! Debug instrumentation for caches created with the `DEBUG_*` flags.
//!
//! Overrun detection appends a 4-byte sentinel after every object and checks
//! it on free. Use-after-free detection fills fresh slabs and freed objects
//! with a poison byte.

/// Sentinel stored right after an object under `DEBUG_OVERRUN`.
pub const OVERRUN_PATTERN: u32 = 0xA5A5_A5A5;

/// Bytes of padding `DEBUG_OVERRUN` adds to each object.
pub const OVERRUN_PADDING: usize = core::mem::size_of::<u32>();

/// Fill byte for poisoned memory.
pub const POISON_BYTE: u8 = 0xA5;

/// Fill `len` bytes at `address` with [`POISON_BYTE`].
///
/// # Safety
///
/// The range must be writable and owned by the caller.
pub(crate) unsafe fn poison(address: usize, len: usize) {
    core::ptr::write_bytes(address as *mut u8, POISON_BYTE, len);
}

/// # Safety
///
/// `address` must point at [`OVERRUN_PADDING`] writable bytes.
pub(crate) unsafe fn write_sentinel(address: usize) {
    (address as *mut u32).write_unaligned(OVERRUN_PATTERN);
}

/// # Safety
///
/// `address` must point at [`OVERRUN_PADDING`] readable bytes.
pub(crate) unsafe fn sentinel_intact(address: usize) -> bool {
    (address as *const u32).read_unaligned() == OVERRUN_PATTERN
}

/// Whether every byte of `bytes` still holds the poison value.
///
/// Returns `true` for an empty slice.
pub fn is_poisoned(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == POISON_BYTE)
}
