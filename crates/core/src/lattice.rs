//! Lossy bitmap digest of a [`Numbers`](crate::numbers::Numbers) set.
//!
//! Identifiers are grouped into windows of [`WINDOW`] consecutive numbers,
//! one bit per window. A clear bit is authoritative: no identifier of that
//! window is in the set. A set bit only means "maybe", so every positive
//! hint must be confirmed against the real data.
//!
//! The bit vector is a power of two in size and grows on demand. Once it
//! reaches [`MAX_BITS`] it stops growing and becomes coarser instead: each
//! bit of the next tier covers two bits of the previous one. Both growth
//! and coarsening only ever set bits, so the digest never produces a false
//! negative.

use std::fmt;

/// Number of identifiers covered by one bit at the finest tier.
pub const WINDOW: u64 = 64;

const MIN_BITS: usize = 64;

/// Upper bound on the bit vector size (128 KiB of words).
pub const MAX_BITS: usize = 1 << 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lattice {
    words: Vec<u64>,
    bits: usize,
    /// Tier: one bit covers `WINDOW << shift` identifiers.
    shift: u32,
    /// Every window is a "maybe".
    full: bool,
}

impl Lattice {
    /// An empty lattice sized for identifiers `1..=capacity`.
    pub fn new(capacity: u64) -> Self {
        let windows = capacity.div_ceil(WINDOW).max(1);
        let mut shift = 0;
        let mut needed = windows;
        while needed > MAX_BITS as u64 {
            needed = needed.div_ceil(2);
            shift += 1;
        }
        let bits = (needed as usize).next_power_of_two().max(MIN_BITS);
        Self {
            words: vec![0; bits / 64],
            bits,
            shift,
            full: false,
        }
    }

    /// A lattice that skips nothing.
    pub fn always() -> Self {
        let mut lattice = Self::new(0);
        lattice.full = true;
        lattice
    }

    /// A lattice that skips everything.
    pub fn never() -> Self {
        Self::new(0)
    }

    /// Size of the bit vector.
    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    fn bit_of(&self, id: u64) -> u64 {
        ((id.max(1) - 1) / WINDOW) >> self.shift
    }

    /// Makes room for `bit` (expressed in the current tier).
    fn reserve(&mut self, mut bit: u64) -> u64 {
        while bit >= self.bits as u64 {
            if self.bits < MAX_BITS {
                self.bits *= 2;
                self.words.resize(self.bits / 64, 0);
            } else {
                self.coarsen();
                bit >>= 1;
            }
        }
        bit
    }

    /// Moves to the next tier: bit `i` becomes bits `2i` and `2i + 1` of
    /// the previous tier.
    fn coarsen(&mut self) {
        let mut words = vec![0u64; self.words.len()];
        for old in 0..self.bits {
            if self.words[old / 64] >> (old % 64) & 1 == 1 {
                let new = old / 2;
                words[new / 64] |= 1 << (new % 64);
            }
        }
        self.words = words;
        self.shift += 1;
    }

    fn align(&mut self, shift: u32) {
        while self.shift < shift {
            self.coarsen();
        }
    }

    fn set_bit(&mut self, bit: u64) {
        let bit = bit as usize;
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    fn get_bit(&self, bit: u64) -> bool {
        let bit = bit as usize;
        bit < self.bits && self.words[bit / 64] >> (bit % 64) & 1 == 1
    }

    /// Marks the window holding `id` as "maybe".
    pub fn set(&mut self, id: u64) {
        let bit = self.bit_of(id);
        let bit = self.reserve(bit);
        self.set_bit(bit);
    }

    /// Marks every window touching `low..=high`.
    pub fn set_range(&mut self, low: u64, high: u64) {
        if low > high {
            return;
        }
        let last = self.bit_of(high);
        self.reserve(last);
        let (first, last) = (self.bit_of(low), self.bit_of(high));
        for bit in first..=last {
            self.set_bit(bit);
        }
    }

    /// `false` is authoritative: `id` is definitely absent.
    pub fn maybe(&self, id: u64) -> bool {
        self.full || self.get_bit(self.bit_of(id))
    }

    /// Merges `other` into this lattice (union of both "maybe" sets).
    pub fn or(&mut self, other: &Lattice) {
        if self.full || other.full {
            *self = Self::always();
            return;
        }
        let mut other = other.clone();
        let shift = self.shift.max(other.shift);
        self.align(shift);
        other.align(shift);
        if other.bits > self.bits {
            self.bits = other.bits;
            self.words.resize(self.bits / 64, 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(other.words.iter()) {
            *mine |= *theirs;
        }
    }

    /// Keeps only windows that are "maybe" in both lattices.
    pub fn and(&mut self, other: &Lattice) {
        if other.full {
            return;
        }
        if self.full {
            *self = other.clone();
            return;
        }
        let mut other = other.clone();
        let shift = self.shift.max(other.shift);
        self.align(shift);
        other.align(shift);
        for (idx, mine) in self.words.iter_mut().enumerate() {
            *mine &= other.words.get(idx).copied().unwrap_or(0);
        }
    }

    /// Highest set bit at or below `bit`.
    fn highest_at_or_below(&self, bit: u64) -> Option<u64> {
        let bit = bit.min(self.bits as u64 - 1) as usize;
        let mut word = bit / 64;
        let offset = bit % 64;
        let mut masked = if offset == 63 {
            self.words[word]
        } else {
            self.words[word] & ((1u64 << (offset + 1)) - 1)
        };
        loop {
            if masked != 0 {
                return Some((word * 64 + 63 - masked.leading_zeros() as usize) as u64);
            }
            if word == 0 {
                return None;
            }
            word -= 1;
            masked = self.words[word];
        }
    }

    /// Skips `cursor` past windows that cannot hold a match.
    ///
    /// `cursor` is an exclusive ceiling: the caller is looking for the
    /// greatest identifier strictly below it. The shifter receives the
    /// cursor and the number of identifiers that are safe to skip, and its
    /// return value is passed through. A skip of `cursor - 1` means nothing
    /// below the cursor can match.
    pub fn correct<R>(&self, cursor: u64, shifter: impl FnOnce(u64, u64) -> R) -> R {
        if self.full || cursor <= 1 {
            return shifter(cursor, 0);
        }
        let top = self.bit_of(cursor - 1);
        let skip = match self.highest_at_or_below(top) {
            None => cursor - 1,
            Some(bit) => {
                let covered = (bit + 1)
                    .checked_shl(self.shift)
                    .and_then(|windows| windows.checked_mul(WINDOW));
                match covered {
                    Some(last) if last < cursor - 1 => cursor - 1 - last,
                    _ => 0,
                }
            }
        };
        shifter(cursor, skip)
    }
}

impl fmt::Display for Lattice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.full {
            return write!(f, "Lattice({} bits, full)", self.bits);
        }
        let set: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        write!(
            f,
            "Lattice({} bits, tier {}, {} set)",
            self.bits, self.shift, set
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ceiling_after(lattice: &Lattice, cursor: u64) -> u64 {
        lattice.correct(cursor, |cursor, skip| cursor - skip)
    }

    #[test]
    fn empty_lattice_skips_everything() {
        let lattice = Lattice::never();
        assert_eq!(ceiling_after(&lattice, 1_000), 1);
        assert!(!lattice.maybe(5));
    }

    #[test]
    fn full_lattice_skips_nothing() {
        let lattice = Lattice::always();
        assert_eq!(ceiling_after(&lattice, 1_000), 1_000);
        assert!(lattice.maybe(123_456_789));
    }

    #[test]
    fn skips_to_the_end_of_the_nearest_window() {
        let mut lattice = Lattice::new(1_000);
        lattice.set(70);
        // window 1 covers 65..=128
        assert_eq!(ceiling_after(&lattice, 900), 129);
        assert_eq!(ceiling_after(&lattice, 100), 100, "inside the window");
        assert_eq!(ceiling_after(&lattice, 64), 1, "nothing below window 1");
    }

    #[test]
    fn display_exposes_size_and_or_grows_to_power_of_two() {
        let mut small = Lattice::new(100);
        assert!(small.to_string().contains("64 bits"), "{small}");
        let big = Lattice::new(WINDOW * 100);
        assert!(big.to_string().contains("128 bits"), "{big}");
        small.or(&big);
        assert_eq!(small.bits(), 128, "or must grow to the larger size");
    }

    #[test]
    fn set_grows_instead_of_losing_bits() {
        let mut lattice = Lattice::new(10);
        lattice.set(WINDOW * 500 + 1);
        assert!(lattice.bits() >= 512);
        assert!(lattice.maybe(WINDOW * 500 + 1));
    }

    #[test]
    fn huge_ids_coarsen_but_stay_sound() {
        let mut lattice = Lattice::new(10);
        lattice.set(3);
        lattice.set(u64::MAX - 1);
        assert!(lattice.bits() <= MAX_BITS);
        assert!(lattice.maybe(3));
        assert!(lattice.maybe(u64::MAX - 1));
    }

    #[test]
    fn and_keeps_common_windows() {
        let mut left = Lattice::new(1_000);
        left.set(10);
        left.set(300);
        let mut right = Lattice::new(1_000);
        right.set(310);
        left.and(&right);
        assert!(!left.maybe(10));
        assert!(left.maybe(300));
        left.and(&Lattice::always());
        assert!(left.maybe(300), "always is the identity of and");
    }

    proptest! {
        #[test]
        fn never_signals_absent_for_present_ids(
            ids in proptest::collection::vec(1u64..5_000_000, 1..200),
            extra in 1u64..5_000_000,
        ) {
            let mut lattice = Lattice::new(extra);
            for id in &ids {
                lattice.set(*id);
            }
            for id in &ids {
                prop_assert!(lattice.maybe(*id));
                // the corrected ceiling never jumps below a present id
                prop_assert!(ceiling_after(&lattice, *id + 1) > *id);
            }
        }
    }
}
