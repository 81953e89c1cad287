//! Fixed-length bitset over the words stored in slab metadata.
//!
//! A set bit marks an object slot in use.

const WORD_BITS: usize = u64::BITS as usize;

pub struct SlabBitmap<'a> {
    words: &'a mut [u64],
    len: usize,
}

impl<'a> SlabBitmap<'a> {
    /// Wrap `words` as a bitset of `len` bits.
    pub fn new(words: &'a mut [u64], len: usize) -> Self {
        debug_assert!(words.len() * WORD_BITS >= len);
        Self { words, len }
    }

    pub const fn words_for(len: usize) -> usize {
        len.div_ceil(WORD_BITS)
    }

    pub fn test(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        self.words[index / WORD_BITS] & (1u64 << (index % WORD_BITS)) != 0
    }

    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.words[index / WORD_BITS] |= 1u64 << (index % WORD_BITS);
    }

    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.words[index / WORD_BITS] &= !(1u64 << (index % WORD_BITS));
    }

    /// Lowest index whose bit is clear.
    pub fn first_unset(&self) -> Option<usize> {
        for (word_idx, &word) in self.words.iter().enumerate() {
            if word != u64::MAX {
                let index = word_idx * WORD_BITS + (!word).trailing_zeros() as usize;
                return (index < self.len).then_some(index);
            }
        }
        None
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}
