//! Fixed-capacity bitset tracking which TX blocks are in use.

/// Control messages address blocks with one byte, so a link never has more
/// than 256 blocks per direction.
pub const MAX_BITS: usize = 256;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = MAX_BITS / WORD_BITS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitset {
    words: [u64; WORDS],
    bits: usize,
}

impl Bitset {
    /// Creates an all-clear bitset of `bits` bits.
    ///
    /// # Panics
    /// Panics if `bits` exceeds [`MAX_BITS`].
    pub fn new(bits: usize) -> Self {
        assert!(bits <= MAX_BITS, "bitset capacity must be at most {MAX_BITS}");
        Self {
            words: [0; WORDS],
            bits,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.bits
    }

    #[inline]
    pub fn is_set(&self, bit: usize) -> bool {
        bit < self.bits && self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_clear(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Start of the lowest run of `n` consecutive clear bits (first fit).
    pub fn find_run_of_zeros(&self, n: usize) -> Option<usize> {
        if n == 0 || n > self.bits {
            return None;
        }
        let mut run = 0;
        for bit in 0..self.bits {
            if self.is_set(bit) {
                run = 0;
                continue;
            }
            run += 1;
            if run == n {
                return Some(bit + 1 - n);
            }
        }
        None
    }

    /// Sets `start..start + n`. Bits past the capacity are ignored.
    pub fn set_range(&mut self, start: usize, n: usize) {
        for bit in start..start.saturating_add(n).min(self.bits) {
            self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        }
    }

    /// Clears `start..start + n`. Bits past the capacity are ignored.
    pub fn clear_range(&mut self, start: usize, n: usize) {
        for bit in start..start.saturating_add(n).min(self.bits) {
            self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
        }
    }
}
