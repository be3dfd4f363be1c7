//! The zone allocator.
//!
//! A zone carves fixed-size blocks out of an underlying allocator and hands
//! out objects from the newest ("current") block by bumping an offset. Objects
//! can be released two ways:
//!
//! * Individually, with [`ZoneAllocator::deallocate`]. Each block counts its
//!   live objects; when the count of a block other than the current one drops
//!   to zero, the whole block goes back to the underlying allocator. When the
//!   current block empties, its offset is simply rewound so the block gets
//!   reused, which keeps stack-like push/pop patterns from churning blocks.
//!
//! * In bulk, with [`ZoneAllocator::free_since`], which pops an object and
//!   everything allocated after it, like an obstack.
//!
//! Nothing is ever moved or compacted. Finding the block that owns a pointer
//! passed to `deallocate` goes through a hash directory keyed on
//! `address >> log2(block_size)`, which is only rebuilt when a lookup finds it
//! stale.

use core::{alloc::Layout, fmt, mem, ptr::NonNull};

use super::*;
use crate::block::{BlockId, Blocks};
use crate::index::{BlockIndex, MAX_HASH_SIZE};

/// The alignment of every pointer a zone returns: the size of a pointer.
pub const ZONE_ALIGN: usize = mem::size_of::<*const ()>();

/// The block size historically used by zones that don't care.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Requested block sizes are clamped to this so that a block's layout is
/// always valid.
const MAX_BLOCK_SIZE: usize = 1 << (usize::BITS - 2);

/// Round `size` up to a multiple of [`ZONE_ALIGN`], or `None` on overflow.
#[inline]
fn align_up(size: usize) -> Option<usize> {
    Some(size.checked_add(ZONE_ALIGN - 1)? & !(ZONE_ALIGN - 1))
}

/// A zone allocator.
///
/// Blocks are obtained from the inner allocator `A`, which is the global
/// allocator by default, and are all exactly [`block_size`][Self::block_size]
/// bytes.
///
/// A zone is single-threaded. To share one between collections, wrap it in a
/// `SharedZone`, which the `shared_zone` cargo feature provides.
///
/// # Example
///
/// ```
/// use zone_alloc::ZoneAllocator;
///
/// let mut zone = ZoneAllocator::new(4096);
///
/// let mark = zone.allocate(0).unwrap();
/// for _ in 0..1000 {
///     zone.allocate(24).unwrap();
/// }
/// assert!(zone.block_count() > 1);
///
/// // Pop everything since `mark`.
/// zone.free_since(mark);
/// assert_eq!(zone.block_count(), 1);
/// assert_eq!(zone.allocate(24).unwrap(), mark);
/// ```
pub struct ZoneAllocator<A = Global>
where
    A: Allocator,
{
    /// The underlying allocator that blocks come from.
    inner: A,

    /// The size of every block; always a power of two.
    block_size: usize,

    /// The layout every block is allocated from `inner` with.
    block_layout: Layout,

    /// Every block, chained from newest to oldest. The newest block is the
    /// current block that allocations are served from.
    blocks: Blocks,

    /// The bump offset into the current block. Starts out past the end of a
    /// block so that the very first allocation creates one.
    offset: usize,

    /// Address-to-block directory, used by `deallocate`.
    index: BlockIndex,
}

impl ZoneAllocator<Global> {
    /// Create a zone whose blocks are `block_size` bytes, rounded up to the
    /// next power of two, allocated from the global allocator.
    ///
    /// No block is allocated until the first [`allocate`][Self::allocate].
    #[inline]
    pub fn new(block_size: usize) -> Self {
        Self::new_in(block_size, Global)
    }
}

impl Default for ZoneAllocator<Global> {
    /// A zone with [`DEFAULT_BLOCK_SIZE`] blocks.
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl<A> ZoneAllocator<A>
where
    A: Allocator,
{
    /// Create a zone whose blocks are `block_size` bytes, rounded up to the
    /// next power of two, allocated from `inner`.
    pub fn new_in(block_size: usize, inner: A) -> Self {
        let block_size = block_size.clamp(1, MAX_BLOCK_SIZE).next_power_of_two();

        // Safety: `ZONE_ALIGN` is a power of two, and `block_size` is at most
        // `MAX_BLOCK_SIZE`, so it cannot overflow `isize` when rounded up to
        // `ZONE_ALIGN`.
        let block_layout = unsafe { Layout::from_size_align_unchecked(block_size, ZONE_ALIGN) };

        ZoneAllocator {
            inner,
            block_size,
            block_layout,
            blocks: Blocks::new(),
            offset: block_size + 1,
            index: BlockIndex::new(block_size.trailing_zeros()),
        }
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// The size of every block in this zone.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The number of blocks this zone currently holds.
    #[inline]
    pub fn block_count(&self) -> u32 {
        self.blocks.len()
    }

    /// How many bytes can still be allocated from the current block before a
    /// new one is needed. Zero before the first allocation.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.block_size.saturating_sub(self.offset)
    }

    /// Does `ptr` point into one of this zone's blocks?
    ///
    /// This walks the whole chain.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        self.blocks.iter().any(|(_, block)| block.contains(addr))
    }

    /// Allocate `size` bytes.
    ///
    /// The size is rounded up to a multiple of [`ZONE_ALIGN`] and the returned
    /// pointer is aligned to `ZONE_ALIGN`. The memory is uninitialized.
    ///
    /// Fails with [`ZoneError::Oversized`] when the rounded size does not fit
    /// in one block, and with [`ZoneError::OutOfMemory`] when the inner
    /// allocator cannot provide a new block. The zone is unchanged on failure.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, ZoneError> {
        let size = match align_up(size) {
            Some(size) if size <= self.block_size => size,
            _ => {
                log::warn!(
                    "zone allocator: allocating more than {} bytes ({size} requested)",
                    self.block_size
                );
                return Err(ZoneError::Oversized {
                    requested: align_up(size).unwrap_or(size),
                    block_size: self.block_size,
                });
            }
        };

        // Even a zero-sized object must start strictly inside its block, so
        // that it can be found again by `deallocate` and `free_since`.
        if self.offset + size.max(1) > self.block_size {
            self.push_block()?;
        }

        let offset = self.offset;
        let current = self
            .blocks
            .newest()
            .expect("a block was just pushed if there was none");
        let block = self.blocks.get_mut(current);
        block.live += 1;
        self.offset += size;

        // Safety: `offset < block_size`, so the result stays inside the
        // block's storage and cannot be null.
        Ok(unsafe { NonNull::new_unchecked(block.storage().as_ptr().add(offset)) })
    }

    /// Allocate space for a `T` and move `value` into it.
    ///
    /// The zone never drops the value: releasing the memory with
    /// [`deallocate`][Self::deallocate] or [`free_since`][Self::free_since]
    /// just forgets it.
    pub fn alloc_value<T>(&mut self, value: T) -> Result<NonNull<T>, ZoneError> {
        let align = mem::align_of::<T>();
        if align > ZONE_ALIGN {
            return Err(ZoneError::Misaligned { align });
        }

        let ptr = self.allocate(mem::size_of::<T>())?.cast::<T>();

        // Safety: the pointer is valid for `size_of::<T>()` bytes of writes
        // and aligned to `ZONE_ALIGN`, which is at least `align_of::<T>()`.
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Release one object previously returned by
    /// [`allocate`][Self::allocate].
    ///
    /// When this was the last live object of a block, that block is returned
    /// to the inner allocator, unless it is the current block, which is
    /// instead rewound and reused.
    ///
    /// Pointers that do not belong to any of this zone's blocks are ignored.
    /// Only the address of `ptr` is inspected, never the memory behind it.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        if self.index.is_dirty() {
            self.index.rebuild(&self.blocks);
        }

        let addr = ptr.as_ptr() as usize;
        let Some(id) = self.index.find(&self.blocks, addr) else {
            // Can happen when `free_since` already released this pointer.
            log::debug!("zone allocator: deallocating unknown pointer {ptr:p}");
            return;
        };

        let block = self.blocks.get_mut(id);
        if block.live == 0 {
            log::debug!("zone allocator: deallocating {ptr:p} from a block with no live objects");
            return;
        }

        block.live -= 1;
        if block.live == 0 {
            if Some(id) == self.blocks.newest() {
                self.offset = 0;
            } else {
                self.retire(id);
            }
        }
    }

    /// Release the object at `ptr` and everything allocated after it.
    ///
    /// Every block newer than the one containing `ptr` goes back to the inner
    /// allocator, and the next allocation resumes exactly at `ptr`.
    ///
    /// `ptr` must have been returned by [`allocate`][Self::allocate] on this
    /// zone and not released since; otherwise the zone may hand out memory
    /// that is still in use. A pointer outside every block is ignored.
    pub fn free_since(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;

        let mut removed = 0;
        let mut target = None;
        for (id, block) in self.blocks.iter() {
            if block.contains(addr) {
                target = Some((id, block.begin()));
                break;
            }
            removed += 1;
        }

        let Some((target, begin)) = target else {
            log::debug!("zone allocator: free_since on unknown pointer {ptr:p}");
            return;
        };

        // Rather than editing the directory once per removed block, let the
        // next `deallocate` rebuild it when it would end up mostly empty.
        let remaining = self.blocks.len() as usize - removed;
        if self.index.is_clean() && self.index.hash_size() >= 4 * remaining {
            self.index.mark_dirty();
        }

        while let Some(newest) = self.blocks.newest().filter(|id| *id != target) {
            self.retire(newest);
        }

        self.offset = addr - begin;
    }

    /// Allocate a new block from the inner allocator and make it current.
    fn push_block(&mut self) -> Result<(), ZoneError> {
        let storage = self.inner.allocate(self.block_layout)?.cast::<u8>();
        let id = self.blocks.push_newest(storage, self.block_size);
        log::trace!(
            "zone allocator: new block #{} at {storage:p}",
            self.blocks.len()
        );

        // When blocks pile up much faster than the directory grows, stop
        // maintaining it and rebuild it at a better size on the next lookup.
        let hash_size = self.index.hash_size();
        if self.index.is_built()
            && self.blocks.len() as usize / 4 > hash_size
            && hash_size < MAX_HASH_SIZE
        {
            self.index.mark_dirty();
        }
        if self.index.is_clean() {
            self.index.insert(id, self.blocks.get(id));
        }

        self.offset = 0;
        Ok(())
    }

    /// Unlink a block from the chain and the directory, and return its
    /// storage to the inner allocator.
    fn retire(&mut self, id: BlockId) {
        if self.index.is_clean() {
            self.index.remove(id, self.blocks.get(id));
        }
        let block = self.blocks.unlink(id);
        log::trace!("zone allocator: retiring block at {:p}", block.storage());

        // Safety: the block's storage was allocated from `self.inner` with
        // `self.block_layout`, and nothing references the block anymore now
        // that it is out of the chain and the directory.
        unsafe { self.inner.deallocate(block.storage(), self.block_layout) };
    }
}

impl<A> Drop for ZoneAllocator<A>
where
    A: Allocator,
{
    fn drop(&mut self) {
        let count = self.blocks.len();
        if count > 1 {
            log::debug!("zone allocator: dropping zone that still contains {count} blocks");
        }

        for block in self.blocks.drain() {
            // Safety: every block's storage was allocated from `self.inner`
            // with `self.block_layout`, and the zone is going away.
            unsafe { self.inner.deallocate(block.storage(), self.block_layout) };
        }
    }
}

impl<A> fmt::Debug for ZoneAllocator<A>
where
    A: Allocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneAllocator")
            .field("block_size", &self.block_size)
            .field("block_count", &self.blocks.len())
            .field("offset", &self.offset)
            .field("index_hash_size", &self.index.hash_size())
            .field("index_dirty", &self.index.is_dirty())
            .finish()
    }
}
