//! An [`Allocator`] implementation on top of a zone.
//!
//! `Allocator` methods take `&self`, while every zone operation mutates the
//! zone, so the zone sits in a `RefCell`. Zones are single-threaded, and so is
//! a `SharedZone`. Bulk release via `free_since` takes `&mut self`: the borrow
//! checker then guarantees that no collection is still allocated in the zone.

use core::{alloc::Layout, cell::RefCell, fmt, ptr::NonNull};

use super::*;

/// A zone that implements the [`Allocator`] trait, so that collections can
/// allocate out of it.
///
/// Allocations whose alignment is larger than [`ZONE_ALIGN`] fail, as do
/// allocations larger than one block.
///
/// # Example
///
/// ```
/// use zone_alloc::SharedZone;
/// use allocator_api2::vec::Vec;
///
/// let zone = SharedZone::new(1024);
///
/// let mut nodes = Vec::new_in(&zone);
/// nodes.extend([1u32, 2, 3]);
/// assert_eq!(nodes.iter().sum::<u32>(), 6);
/// assert_eq!(zone.block_count(), 1);
/// ```
pub struct SharedZone<A = Global>
where
    A: Allocator,
{
    zone: RefCell<ZoneAllocator<A>>,
}

impl SharedZone<Global> {
    /// Create a shared zone with blocks of `block_size` bytes from the global
    /// allocator.
    #[inline]
    pub fn new(block_size: usize) -> Self {
        Self::from_zone(ZoneAllocator::new(block_size))
    }
}

impl<A> SharedZone<A>
where
    A: Allocator,
{
    /// Wrap an existing zone.
    #[inline]
    pub fn from_zone(zone: ZoneAllocator<A>) -> Self {
        SharedZone {
            zone: RefCell::new(zone),
        }
    }

    /// Get exclusive access to the underlying zone.
    #[inline]
    pub fn get_mut(&mut self) -> &mut ZoneAllocator<A> {
        self.zone.get_mut()
    }

    /// Unwrap the underlying zone.
    #[inline]
    pub fn into_inner(self) -> ZoneAllocator<A> {
        self.zone.into_inner()
    }

    /// The number of blocks the underlying zone currently holds.
    #[inline]
    pub fn block_count(&self) -> u32 {
        self.zone.borrow().block_count()
    }

    /// Release the object at `ptr` and everything allocated after it. See
    /// [`ZoneAllocator::free_since`].
    #[inline]
    pub fn free_since(&mut self, ptr: NonNull<u8>) {
        self.zone.get_mut().free_since(ptr);
    }
}

unsafe impl<A> Allocator for SharedZone<A>
where
    A: Allocator,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > ZONE_ALIGN {
            log::debug!("shared zone: cannot satisfy {layout:?}");
            return Err(AllocError);
        }

        let ptr = self
            .zone
            .borrow_mut()
            .allocate(layout.size())
            .map_err(|_| AllocError)?;

        // The zone reserved the size rounded up to `ZONE_ALIGN`; it did not
        // overflow or the allocation would have failed.
        let len = (layout.size() + ZONE_ALIGN - 1) & !(ZONE_ALIGN - 1);
        Ok(NonNull::slice_from_raw_parts(ptr, len))
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        self.zone.borrow_mut().deallocate(ptr);
    }
}

impl<A> fmt::Debug for SharedZone<A>
where
    A: Allocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let zone = self.zone.borrow();
        f.debug_struct("SharedZone").field("zone", &*zone).finish()
    }
}
