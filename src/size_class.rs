//! Size classes served by the registry's default caches.

#[cfg(feature = "log")]
use log::warn;

/// Size classes for generic allocation, ascending by threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum SizeClass {
    Bytes32 = 32,
    Bytes64 = 64,
    Bytes128 = 128,
    Bytes256 = 256,
    Bytes512 = 512,
    Bytes1024 = 1024,
    Bytes2048 = 2048,
    Bytes4096 = 4096,
    Bytes8192 = 8192,
    Bytes16384 = 16384,
    Bytes32768 = 32768,
    Bytes65536 = 65536,
    Bytes131072 = 131072,
    Bytes262144 = 262144,
}

impl SizeClass {
    pub const COUNT: usize = 14;
    pub const MAX_OBJ_SIZE: usize = 262144;

    pub const ALL: [SizeClass; Self::COUNT] = [
        SizeClass::Bytes32,
        SizeClass::Bytes64,
        SizeClass::Bytes128,
        SizeClass::Bytes256,
        SizeClass::Bytes512,
        SizeClass::Bytes1024,
        SizeClass::Bytes2048,
        SizeClass::Bytes4096,
        SizeClass::Bytes8192,
        SizeClass::Bytes16384,
        SizeClass::Bytes32768,
        SizeClass::Bytes65536,
        SizeClass::Bytes131072,
        SizeClass::Bytes262144,
    ];

    /// Smallest class whose threshold is at least `size`.
    pub fn from_size(size: usize) -> Option<Self> {
        if size > Self::MAX_OBJ_SIZE {
            warn!("no size class for {} bytes", size);
            return None;
        }
        Self::ALL.iter().copied().find(|class| class.size() >= size)
    }

    pub const fn size(&self) -> usize {
        *self as usize
    }

    pub const fn to_index(&self) -> usize {
        // Thresholds are consecutive powers of two starting at 32.
        (self.size().trailing_zeros() - SizeClass::Bytes32.size().trailing_zeros()) as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub const fn name(&self) -> &'static str {
        match self {
            SizeClass::Bytes32 => "size32_cache",
            SizeClass::Bytes64 => "size64_cache",
            SizeClass::Bytes128 => "size128_cache",
            SizeClass::Bytes256 => "size256_cache",
            SizeClass::Bytes512 => "size512_cache",
            SizeClass::Bytes1024 => "size1024_cache",
            SizeClass::Bytes2048 => "size2048_cache",
            SizeClass::Bytes4096 => "size4096_cache",
            SizeClass::Bytes8192 => "size8192_cache",
            SizeClass::Bytes16384 => "size16384_cache",
            SizeClass::Bytes32768 => "size32768_cache",
            SizeClass::Bytes65536 => "size65536_cache",
            SizeClass::Bytes131072 => "size131072_cache",
            SizeClass::Bytes262144 => "size262144_cache",
        }
    }
}
