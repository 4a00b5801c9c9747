use smallvec::SmallVec;

type Block = u64;

const BITS: usize = Block::BITS as usize;

/// Computes how many blocks are needed to store that many bits.
fn blocks_for_bits(bits: usize) -> usize {
    bits.div_ceil(BITS)
}

/// A bit set that, once created, has a fixed size over time.
///
/// Used to describe which columns of a row are present,
/// e.g. the valid columns of a sparse row passed to a partial replace.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct FixedBitSet {
    len: usize,
    blocks: SmallVec<[Block; 1]>,
}

impl FixedBitSet {
    /// Returns a new set that can hold `len` bits, all unset.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            blocks: SmallVec::from_elem(0, blocks_for_bits(len)),
        }
    }

    /// Returns a new set of `len` bits where `bits` are set.
    pub fn from_bits(len: usize, bits: impl IntoIterator<Item = usize>) -> Self {
        let mut set = Self::new(len);
        for bit in bits {
            set.set(bit, true);
        }
        set
    }

    /// The number of bits the set can hold.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns whether `idx` is set. Out of range bits are never set.
    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        self.blocks[idx / BITS] & (1 << (idx % BITS)) != 0
    }

    /// Sets `idx` to `val`.
    ///
    /// Panics if `idx` is out of range.
    pub fn set(&mut self, idx: usize, val: bool) {
        assert!(idx < self.len, "bit {idx} out of range for set of length {}", self.len);
        let mask = 1 << (idx % BITS);
        let block = &mut self.blocks[idx / BITS];
        if val {
            *block |= mask;
        } else {
            *block &= !mask;
        }
    }

    /// The number of set bits.
    pub fn count_ones(&self) -> usize {
        self.blocks.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Iterates the indices of all set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&idx| self.get(idx))
    }
}

impl core::fmt::Debug for FixedBitSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter_set()).finish()
    }
}
