//! The hash directory mapping addresses to the blocks that may contain them.
//!
//! Only `deallocate` uses it. It is rebuilt lazily: allocation bursts mark it
//! dirty instead of paying for incremental maintenance, and the next lookup
//! pays for one full rebuild.

use alloc::vec::Vec;

use crate::block::{BlockId, Blocks, MemBlock};

/// The smallest number of buckets the directory is built with.
pub(crate) const MIN_HASH_SIZE: usize = 1024;

/// The largest number of buckets the directory is built with.
pub(crate) const MAX_HASH_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub(crate) struct BlockIndex {
    buckets: Vec<Vec<BlockId>>,

    /// `log2` of the zone's block size.
    log2: u32,

    /// Set when the buckets no longer reflect the chain. The directory starts
    /// out dirty: it has never been built.
    dirty: bool,
}

impl BlockIndex {
    pub(crate) const fn new(log2: u32) -> Self {
        BlockIndex {
            buckets: Vec::new(),
            log2,
            dirty: true,
        }
    }

    /// Has the directory been built at least once?
    #[inline]
    pub(crate) fn is_built(&self) -> bool {
        !self.buckets.is_empty()
    }

    #[inline]
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Is the directory built and current, so that incremental edits are
    /// worth doing?
    #[inline]
    pub(crate) fn is_clean(&self) -> bool {
        self.is_built() && !self.dirty
    }

    #[inline]
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[inline]
    pub(crate) fn hash_size(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn key(&self, addr: usize) -> usize {
        debug_assert!(self.hash_size().is_power_of_two());
        (addr >> self.log2) & (self.hash_size() - 1)
    }

    /// The keys of every block-size-aligned address that `block` overlaps.
    ///
    /// Blocks are not aligned to the block size, so a block straddles two
    /// aligned ranges unless it happens to start on a boundary.
    fn keys(&self, block: &MemBlock) -> impl Iterator<Item = usize> {
        let block_size = 1usize << self.log2;
        let first = block.begin() & !(block_size - 1);
        let second = (first != block.begin()).then(|| self.key(first.wrapping_add(block_size)));
        [Some(self.key(first)), second].into_iter().flatten()
    }

    pub(crate) fn insert(&mut self, id: BlockId, block: &MemBlock) {
        debug_assert!(self.is_clean());
        for key in self.keys(block) {
            self.buckets[key].push(id);
        }
    }

    pub(crate) fn remove(&mut self, id: BlockId, block: &MemBlock) {
        debug_assert!(self.is_clean());
        for key in self.keys(block) {
            let bucket = &mut self.buckets[key];
            if let Some(i) = bucket.iter().position(|b| *b == id) {
                bucket.swap_remove(i);
            }
        }
    }

    /// Rebuild the directory from scratch so that it exactly reflects
    /// `blocks`.
    pub(crate) fn rebuild(&mut self, blocks: &Blocks) {
        let hash_size = hash_size_for(blocks.len() as usize);
        log::debug!(
            "rebuilding block index: {} blocks, {hash_size} buckets",
            blocks.len()
        );

        self.buckets.clear();
        self.buckets.resize_with(hash_size, Vec::new);
        self.dirty = false;

        for (id, block) in blocks.iter() {
            self.insert(id, block);
        }
    }

    /// Find the block containing `addr`, if any.
    ///
    /// The directory must be clean.
    pub(crate) fn find(&self, blocks: &Blocks, addr: usize) -> Option<BlockId> {
        debug_assert!(self.is_clean());
        self.buckets[self.key(addr)]
            .iter()
            .copied()
            .find(|id| blocks.get(*id).contains(addr))
    }
}

/// The number of buckets to build the directory with for `num_blocks` blocks.
pub(crate) fn hash_size_for(num_blocks: usize) -> usize {
    num_blocks
        .max(1)
        .checked_next_power_of_two()
        .unwrap_or(MAX_HASH_SIZE)
        .clamp(MIN_HASH_SIZE, MAX_HASH_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::NonNull;

    fn fake_storage(addr: usize) -> NonNull<u8> {
        NonNull::new(addr as *mut u8).unwrap()
    }

    #[test]
    fn hash_size_is_clamped() {
        assert_eq!(hash_size_for(0), MIN_HASH_SIZE);
        assert_eq!(hash_size_for(3), MIN_HASH_SIZE);
        assert_eq!(hash_size_for(1024), 1024);
        assert_eq!(hash_size_for(1025), 2048);
        assert_eq!(hash_size_for(40_000), 64 * 1024);
        assert_eq!(hash_size_for(1 << 20), MAX_HASH_SIZE);
    }

    #[test]
    fn unaligned_block_is_registered_under_two_keys() {
        let mut blocks = Blocks::new();
        let id = blocks.push_newest(fake_storage(0x1_0010), 64);
        let mut index = BlockIndex::new(6);
        index.rebuild(&blocks);

        let keys: Vec<usize> = index.keys(blocks.get(id)).collect();
        assert_eq!(keys, [0x1_0000 >> 6 & 1023, 0x1_0040 >> 6 & 1023]);

        assert_eq!(index.find(&blocks, 0x1_0010), Some(id));
        assert_eq!(index.find(&blocks, 0x1_004f), Some(id));
        assert_eq!(index.find(&blocks, 0x1_0050), None);
        assert_eq!(index.find(&blocks, 0x1_000f), None);
    }

    #[test]
    fn aligned_block_is_registered_under_one_key() {
        let mut blocks = Blocks::new();
        let id = blocks.push_newest(fake_storage(0x2_0000), 64);
        let mut index = BlockIndex::new(6);
        index.rebuild(&blocks);

        assert_eq!(index.keys(blocks.get(id)).count(), 1);
        assert_eq!(index.find(&blocks, 0x2_003f), Some(id));
    }

    #[test]
    fn remove_clears_every_bucket() {
        let mut blocks = Blocks::new();
        let a = blocks.push_newest(fake_storage(0x1_0010), 64);
        let b = blocks.push_newest(fake_storage(0x1_0050), 64);
        let mut index = BlockIndex::new(6);
        index.rebuild(&blocks);

        assert_eq!(index.find(&blocks, 0x1_0060), Some(b));
        index.remove(a, blocks.get(a));
        assert_eq!(index.find(&blocks, 0x1_0020), None);
        assert_eq!(index.find(&blocks, 0x1_0060), Some(b));
    }

    #[test]
    fn starts_dirty_and_unbuilt() {
        let mut index = BlockIndex::new(13);
        assert!(index.is_dirty());
        assert!(!index.is_built());
        assert!(!index.is_clean());

        index.rebuild(&Blocks::new());
        assert!(index.is_clean());
        assert_eq!(index.hash_size(), MIN_HASH_SIZE);

        index.mark_dirty();
        assert!(!index.is_clean());
    }
}
