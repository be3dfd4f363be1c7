//! Memory blocks and the arena that holds the zone's chronological chain.
//!
//! Blocks live in slots of a `Vec`, addressed by [`BlockId`]. The chain links
//! (`older`/`newer`) are slot ids rather than pointers, so unlinking and
//! retiring a block in the same step can never leave a dangling link behind:
//! a retired slot is `None` until it is recycled for a new block.

use alloc::vec::Vec;
use core::ptr::NonNull;

/// The id of a block's slot in [`Blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockId(u32);

impl BlockId {
    #[inline]
    fn slot(self) -> usize {
        self.0 as usize
    }
}

/// One fixed-capacity buffer that objects are bump-allocated out of.
#[derive(Debug)]
pub(crate) struct MemBlock {
    storage: NonNull<u8>,
    capacity: usize,

    /// The number of objects carved from this block that have not been
    /// individually deallocated yet.
    pub(crate) live: u32,

    pub(crate) older: Option<BlockId>,
    pub(crate) newer: Option<BlockId>,
}

impl MemBlock {
    #[inline]
    pub(crate) fn storage(&self) -> NonNull<u8> {
        self.storage
    }

    #[inline]
    pub(crate) fn begin(&self) -> usize {
        self.storage.as_ptr() as usize
    }

    /// Does `addr` fall inside `[begin, begin + capacity)`?
    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        let begin = self.begin();
        begin <= addr && addr - begin < self.capacity
    }
}

/// The slot arena owning every block's metadata, plus the chronological chain
/// through it.
///
/// The arena does not own the blocks' storage: that belongs to the zone's
/// inner allocator and is returned by the zone when a block is retired.
#[derive(Debug, Default)]
pub(crate) struct Blocks {
    slots: Vec<Option<MemBlock>>,
    free_slots: Vec<BlockId>,
    newest: Option<BlockId>,
    len: u32,
}

impl Blocks {
    pub(crate) const fn new() -> Self {
        Blocks {
            slots: Vec::new(),
            free_slots: Vec::new(),
            newest: None,
            len: 0,
        }
    }

    /// The number of blocks in the chain.
    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub(crate) fn newest(&self) -> Option<BlockId> {
        self.newest
    }

    #[inline]
    pub(crate) fn get(&self, id: BlockId) -> &MemBlock {
        self.slots[id.slot()]
            .as_ref()
            .expect("block ids in the chain always refer to occupied slots")
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: BlockId) -> &mut MemBlock {
        self.slots[id.slot()]
            .as_mut()
            .expect("block ids in the chain always refer to occupied slots")
    }

    /// Link a block around `storage` into the chain as the newest block.
    pub(crate) fn push_newest(&mut self, storage: NonNull<u8>, capacity: usize) -> BlockId {
        let block = MemBlock {
            storage,
            capacity,
            live: 0,
            older: self.newest,
            newer: None,
        };

        let id = match self.free_slots.pop() {
            Some(id) => {
                debug_assert!(self.slots[id.slot()].is_none());
                self.slots[id.slot()] = Some(block);
                id
            }
            None => {
                let id = BlockId(
                    u32::try_from(self.slots.len()).expect("more than u32::MAX blocks in a zone"),
                );
                self.slots.push(Some(block));
                id
            }
        };

        if let Some(older) = self.newest {
            self.get_mut(older).newer = Some(id);
        }
        self.newest = Some(id);
        self.len += 1;
        id
    }

    /// Unlink the block from the chain and free its slot, returning the
    /// block so that the caller can release its storage.
    pub(crate) fn unlink(&mut self, id: BlockId) -> MemBlock {
        let block = self.slots[id.slot()]
            .take()
            .expect("cannot unlink a block that is not in the chain");

        if let Some(older) = block.older {
            self.get_mut(older).newer = block.newer;
        }
        match block.newer {
            Some(newer) => self.get_mut(newer).older = block.older,
            None => self.newest = block.older,
        }

        self.free_slots.push(id);
        self.len -= 1;
        block
    }

    /// Iterate over the chain from the newest block to the oldest.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (BlockId, &MemBlock)> + '_ {
        let mut next = self.newest;
        core::iter::from_fn(move || {
            let id = next?;
            let block = self.get(id);
            next = block.older;
            Some((id, block))
        })
    }

    /// Drain every block out of the arena, in no particular order.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = MemBlock> + '_ {
        self.newest = None;
        self.len = 0;
        self.free_slots.clear();
        self.slots.drain(..).flatten()
    }
}
