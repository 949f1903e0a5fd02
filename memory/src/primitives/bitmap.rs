//! Word-at-a-time bitmap run finder, used by the buddy allocator's
//! per-bin free bitmaps.

const BITS_PER_WORD: usize = usize::BITS as usize;

/// A bitmap over externally-owned storage. Bit `i` set means "free".
pub struct Bitmap<'a> {
    words: &'a mut [usize],
    bits: usize,
}

impl<'a> Bitmap<'a> {
    /// Wrap `words`, tracking only the first `bits` bits as meaningful.
    pub fn new(words: &'a mut [usize], bits: usize) -> Self {
        debug_assert!(bits <= words.len() * BITS_PER_WORD);
        Self { words, bits }
    }

    /// Total number of tracked bits.
    pub fn len(&self) -> usize {
        self.bits
    }

    /// True if no bits are tracked.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Read bit `i`.
    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.bits);
        self.words[i / BITS_PER_WORD] & (1 << (i % BITS_PER_WORD)) != 0
    }

    /// Set bit `i`.
    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.bits);
        self.words[i / BITS_PER_WORD] |= 1 << (i % BITS_PER_WORD);
    }

    /// Clear bit `i`.
    pub fn clear(&mut self, i: usize) {
        debug_assert!(i < self.bits);
        self.words[i / BITS_PER_WORD] &= !(1 << (i % BITS_PER_WORD));
    }

    /// Find the first run of `n` consecutive set bits whose start index is a
    /// multiple of `align`, scanning whole words first and only falling back
    /// to bit-by-bit testing at word boundaries.
    pub fn find_first_run(&self, n: usize, align: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }

        let mut run_start: Option<usize> = None;
        let mut run_len = 0usize;

        let mut i = 0usize;
        while i < self.bits {
            // Whole-word fast path: an all-zero word (all bits "taken") or an
            // all-ones word (all bits "free") can be skipped/accepted 64 bits
            // at a time instead of bit-by-bit.
            if i % BITS_PER_WORD == 0 && i + BITS_PER_WORD <= self.bits {
                let word = self.words[i / BITS_PER_WORD];
                if word == 0 {
                    run_start = None;
                    run_len = 0;
                    i += BITS_PER_WORD;
                    continue;
                }
                if word == usize::MAX {
                    if run_start.is_none() {
                        if i % align != 0 {
                            // can't start here; let bit-by-bit below find the
                            // first aligned bit inside this word
                        } else {
                            run_start = Some(i);
                            run_len = 0;
                        }
                    }
                    if run_start.is_some() {
                        run_len += BITS_PER_WORD;
                        if run_len >= n {
                            return run_start;
                        }
                        i += BITS_PER_WORD;
                        continue;
                    }
                }
            }

            if self.get(i) {
                if run_start.is_none() && i % align == 0 {
                    run_start = Some(i);
                    run_len = 0;
                }
                if run_start.is_some() {
                    run_len += 1;
                    if run_len >= n {
                        return run_start;
                    }
                }
            } else {
                run_start = None;
                run_len = 0;
            }
            i += 1;
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_run_spanning_words() {
        let mut words = [0usize; 2];
        let mut bm = Bitmap::new(&mut words, 128);
        for i in 60..70 {
            bm.set(i);
        }
        assert_eq!(bm.find_first_run(8, 1), Some(60));
    }

    #[test]
    fn respects_alignment() {
        let mut words = [usize::MAX; 1];
        let mut bm = Bitmap::new(&mut words, 64);
        assert_eq!(bm.find_first_run(4, 8), Some(0));
        bm.clear(0);
        assert_eq!(bm.find_first_run(4, 8), Some(8));
    }

    #[test]
    fn no_run_when_exhausted() {
        let mut words = [0usize; 1];
        let bm = Bitmap::new(&mut words, 64);
        assert_eq!(bm.find_first_run(1, 1), None);
    }

    #[test]
    fn whole_free_word_is_fast_pathed() {
        let mut words = [usize::MAX; 3];
        let bm = Bitmap::new(&mut words, 3 * BITS_PER_WORD);
        assert_eq!(bm.find_first_run(BITS_PER_WORD * 2, 1), Some(0));
    }
}
