//! Sparse membership set over instruction addresses.
//!
//! The address space is partitioned into aligned 8192-byte blocks; each block
//! present in the map carries a fixed bitmap with one bit per byte address.
//! Traced code clusters tightly, so a handful of bitmaps covers a whole
//! binary.

const BLOCK_BITS: u32 = 13;
const BLOCK_WORDS: usize = 1 << (BLOCK_BITS - 6);
const OFFSET_MASK: u64 = (1u64 << BLOCK_BITS) - 1;

#[derive(Debug, Default)]
pub(crate) struct AddressSet {
    blocks: hashbrown::HashMap<u64, Box<[u64; BLOCK_WORDS]>>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `addr`, returning true if it was not already present.
    pub fn insert(&mut self, addr: u64) -> bool {
        let block = self
            .blocks
            .entry(addr >> BLOCK_BITS)
            .or_insert_with(|| Box::new([0u64; BLOCK_WORDS]));
        let bit = (addr & OFFSET_MASK) as usize;
        let mask = 1u64 << (bit & 63);
        let newly = block[bit >> 6] & mask == 0;
        block[bit >> 6] |= mask;
        newly
    }

    pub fn remove(&mut self, addr: u64) {
        if let Some(block) = self.blocks.get_mut(&(addr >> BLOCK_BITS)) {
            let bit = (addr & OFFSET_MASK) as usize;
            block[bit >> 6] &= !(1u64 << (bit & 63));
        }
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}
