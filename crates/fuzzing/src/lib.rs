//! Shared fuzzing and testing infrastructure for `zone_alloc`.

use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::{cell::Cell, collections::BTreeMap, ptr::NonNull};
use zone_alloc::{AllocError, Allocator, Global, ZoneAllocator, ZoneError, ZONE_ALIGN};

/// The size of a test allocation.
//
// Note: a newtype rather than a bare integer so that we can give it a default
// mutator that keeps sizes in the neighborhood of typical block sizes.
#[derive(Clone, Copy, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Size(pub u32);

impl Size {
    fn get(self) -> usize {
        self.0 as usize
    }
}

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s with a configurable maximum.
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: u32,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self { max_size: 1024 }
    }
}

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        // Pick any size up to the maximum.
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() { size.0 } else { self.max_size };
            size.0 = ctx.rng().gen_index(max_size as usize + 1).unwrap() as u32;
            Ok(())
        })?;

        // Land exactly on, or just past, a multiple of the zone alignment,
        // which is where the rounding logic has its edge cases.
        c.mutation(|ctx| {
            let align = ZONE_ALIGN as u32;
            let rounded = size.0 / align * align;
            size.0 = if ctx.shrink() || ctx.rng().gen_bool() {
                rounded
            } else {
                rounded + 1
            };
            Ok(())
        })?;

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Size> {
        let size = m::range(0..=self.max_size).generate(context)?;
        Ok(Size(size))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: Size },
    Dealloc { id: u32 },
    FreeSince { id: u32 },
    AllocValue { id: u32, value: u64 },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Dealloc {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::FreeSince {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::AllocValue {
                    id: ctx.rng().gen_u32(),
                    value: u64::from(ctx.rng().gen_u32()) << 32
                        | u64::from(ctx.rng().gen_u32()),
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } | Op::AllocValue { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. }
                    | Op::Dealloc { id }
                    | Op::FreeSince { id }
                    | Op::AllocValue { id, .. } => {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Release an existing allocation, either on its own or along with
        // everything allocated after it.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let release_op = if ctx.rng().gen_bool() {
                        Op::Dealloc { id }
                    } else {
                        Op::FreeSince { id }
                    };
                    let release_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(release_index, release_op);
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against a fresh zone with the given block
    /// size, and check that the zone returned every block it took.
    pub fn run(&self, block_size: usize) -> Result<(), String> {
        let blocks = CountingAllocator::new();
        self.run_with_zone(ZoneAllocator::new_in(block_size, &blocks))?;
        ensure!(
            blocks.live() == 0,
            "zone leaked {} of its {} blocks",
            blocks.live(),
            blocks.total(),
        );
        Ok(())
    }

    /// Run these test operations with the given zone, consuming it.
    pub fn run_with_zone<A>(&self, mut zone: ZoneAllocator<A>) -> Result<(), String>
    where
        A: Allocator,
    {
        log::debug!("========== Running test operations ==========");

        let block_size = zone.block_size();
        let mut live = LiveMap::default();

        // Where the next allocation must land, if it fits in the current
        // block. Unknown after a `deallocate`, which may rewind the block.
        let mut expected_next: Option<NonNull<u8>> = None;

        // Fill an allocation with the given byte pattern.
        let fill = |ptr: NonNull<u8>, len: usize, byte: u8| unsafe {
            ptr.as_ptr().write_bytes(byte, len);
        };

        // Check that an allocation still holds what we last wrote to it.
        let check_contents = |id: u32, alloc: &LiveAlloc| -> Result<(), String> {
            match alloc.contents {
                Contents::Pattern(byte) => {
                    let slice =
                        unsafe { std::slice::from_raw_parts(alloc.ptr.as_ptr(), alloc.size) };
                    ensure!(
                        slice.iter().all(|b| *b == byte),
                        "id{id}'s bytes were clobbered while it was live",
                    );
                }
                Contents::Value(value) => {
                    let actual = unsafe { alloc.ptr.cast::<u64>().as_ptr().read() };
                    ensure!(
                        actual == value,
                        "id{id}'s value changed from {value:#x} to {actual:#x} while it was live",
                    );
                }
            }
            Ok(())
        };

        // Check the properties every freshly allocated pointer must have.
        let check_new = |zone: &ZoneAllocator<A>,
                         live: &LiveMap,
                         expected_next: Option<NonNull<u8>>,
                         remaining_before: usize,
                         blocks_before: u32,
                         ptr: NonNull<u8>,
                         size: usize|
         -> Result<(), String> {
            ensure!(
                ptr.as_ptr() as usize % ZONE_ALIGN == 0,
                "{ptr:p} is not aligned to {ZONE_ALIGN}",
            );
            ensure!(zone.contains(ptr), "{ptr:p} is outside every block");

            let fits = size.max(1) <= remaining_before;
            if fits {
                ensure!(
                    zone.block_count() == blocks_before,
                    "allocation that fit the current block created a new block",
                );
                if let Some(expected) = expected_next {
                    ensure!(
                        ptr == expected,
                        "allocation should have landed at {expected:p} but got {ptr:p}",
                    );
                }
            } else {
                ensure!(
                    zone.block_count() == blocks_before + 1,
                    "allocation that did not fit the current block did not create exactly one block",
                );
                ensure!(
                    zone.remaining() == block_size - size,
                    "new block should only be used by the new allocation",
                );
            }

            let start = ptr.as_ptr() as usize;
            let end = start + size;
            for (other_id, other) in &live.map {
                let other_start = other.ptr.as_ptr() as usize;
                let other_end = other_start + other.size;
                ensure!(
                    end <= other_start || other_end <= start || size == 0 || other.size == 0,
                    "{ptr:p} (+{size}) overlaps live id{other_id}",
                );
            }
            Ok(())
        };

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match op {
                Op::Alloc { id, size } => {
                    if let Some(old) = live.remove(*id) {
                        check_contents(*id, &old)?;
                        zone.deallocate(old.ptr);
                        expected_next = None;
                    }

                    let rounded = round_up(size.get());
                    let remaining_before = zone.remaining();
                    let blocks_before = zone.block_count();

                    match zone.allocate(size.get()) {
                        Ok(ptr) => {
                            ensure!(rounded <= block_size, "allocated more than a block");
                            check_new(
                                &zone,
                                &live,
                                expected_next,
                                remaining_before,
                                blocks_before,
                                ptr,
                                rounded,
                            )?;
                            log::debug!("new allocation: id{id} -> {ptr:p} (+{rounded})");

                            let pattern = (*id as u8) | 1;
                            fill(ptr, rounded, pattern);
                            live.insert(*id, ptr, rounded, Contents::Pattern(pattern));
                            expected_next = Some(unsafe { ptr.add(rounded) });
                        }
                        Err(ZoneError::Oversized { requested, .. }) => {
                            ensure!(
                                requested > block_size,
                                "rejected {requested} bytes as oversized with {block_size}-byte blocks",
                            );
                            ensure!(
                                zone.block_count() == blocks_before
                                    && zone.remaining() == remaining_before,
                                "rejected allocation changed the zone",
                            );
                        }
                        Err(e) => return Err(format!("unexpected allocation failure: {e}")),
                    }
                }

                Op::AllocValue { id, value } => {
                    if let Some(old) = live.remove(*id) {
                        check_contents(*id, &old)?;
                        zone.deallocate(old.ptr);
                        expected_next = None;
                    }

                    let size = std::mem::size_of::<u64>();
                    if size > block_size || std::mem::align_of::<u64>() > ZONE_ALIGN {
                        ensure!(
                            zone.alloc_value(*value).is_err(),
                            "allocated a value that does not fit the zone",
                        );
                        continue;
                    }

                    let remaining_before = zone.remaining();
                    let blocks_before = zone.block_count();
                    let ptr = zone
                        .alloc_value(*value)
                        .map_err(|e| format!("unexpected allocation failure: {e}"))?
                        .cast::<u8>();
                    check_new(
                        &zone,
                        &live,
                        expected_next,
                        remaining_before,
                        blocks_before,
                        ptr,
                        size,
                    )?;
                    log::debug!("new value: id{id} -> {ptr:p}");

                    live.insert(*id, ptr, size, Contents::Value(*value));
                    expected_next = Some(unsafe { ptr.add(size) });
                }

                Op::Dealloc { id } => {
                    if let Some(alloc) = live.remove(*id) {
                        check_contents(*id, &alloc)?;
                        fill(alloc.ptr, alloc.size, FREE_POISON_PATTERN);

                        let blocks_before = zone.block_count();
                        zone.deallocate(alloc.ptr);
                        ensure!(
                            zone.block_count() + 1 >= blocks_before,
                            "deallocating one object released more than one block",
                        );
                        expected_next = None;
                    }
                }

                Op::FreeSince { id } => {
                    let Some(mark) = live.get(*id) else {
                        continue;
                    };
                    let (mark_ptr, mark_seq) = (mark.ptr, mark.seq);

                    for (id, alloc) in live.split_off(mark_seq) {
                        check_contents(id, &alloc)?;
                    }

                    zone.free_since(mark_ptr);
                    ensure!(
                        zone.contains(mark_ptr),
                        "free_since released the block containing its mark",
                    );
                    expected_next = Some(mark_ptr);
                }
            }
        }

        // Finally, deallocate any remaining live allocations.
        for (id, alloc) in std::mem::take(&mut live.map) {
            check_contents(id, &alloc)?;
            zone.deallocate(alloc.ptr);
        }

        Ok(())
    }
}

fn round_up(size: usize) -> usize {
    (size + ZONE_ALIGN - 1) & !(ZONE_ALIGN - 1)
}

// Deallocated memory is filled with a poison pattern, so that handing it out
// again while something else still uses it gets caught by `check_contents`.
const FREE_POISON_PATTERN: u8 = 0xFE;

/// What a live allocation should contain.
#[derive(Clone, Copy, Debug)]
enum Contents {
    /// Every byte is this (odd, so never the free poison) pattern.
    Pattern(u8),
    /// A `u64` written with `alloc_value`.
    Value(u64),
}

/// A currently-live allocation.
struct LiveAlloc {
    ptr: NonNull<u8>,
    /// Size after rounding up to the zone alignment.
    size: usize,
    /// Allocation order, used to know what `free_since` releases.
    seq: u64,
    contents: Contents,
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc {
            ptr,
            size,
            seq,
            contents,
        } = self;
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{ptr:p}"))
            .field("size", &size)
            .field("seq", &seq)
            .field("contents", &contents)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
#[derive(Default)]
struct LiveMap {
    map: BTreeMap<u32, LiveAlloc>,
    next_seq: u64,
}

impl LiveMap {
    fn insert(&mut self, id: u32, ptr: NonNull<u8>, size: usize, contents: Contents) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let old = self.map.insert(
            id,
            LiveAlloc {
                ptr,
                size,
                seq,
                contents,
            },
        );
        assert!(
            old.is_none(),
            "should remove and deallocate old entries before adding new ones"
        );
    }

    fn get(&self, id: u32) -> Option<&LiveAlloc> {
        self.map.get(&id)
    }

    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        self.map.remove(&id)
    }

    /// Remove every allocation made at or after `seq`.
    fn split_off(&mut self, seq: u64) -> Vec<(u32, LiveAlloc)> {
        let ids: Vec<u32> = self
            .map
            .iter()
            .filter(|(_, alloc)| alloc.seq >= seq)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .map(|id| (id, self.map.remove(&id).unwrap()))
            .collect()
    }
}

/// An allocator that forwards to the global allocator and counts the blocks
/// it hands out, optionally failing after a fixed number of them.
#[derive(Debug, Default)]
pub struct CountingAllocator {
    live: Cell<usize>,
    total: Cell<usize>,
    limit: Option<usize>,
}

impl CountingAllocator {
    /// A counting allocator without a limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// A counting allocator that fails every allocation after the first
    /// `limit`.
    pub fn with_limit(limit: usize) -> Self {
        CountingAllocator {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// The number of allocations not yet deallocated.
    pub fn live(&self) -> usize {
        self.live.get()
    }

    /// The number of allocations ever made.
    pub fn total(&self) -> usize {
        self.total.get()
    }
}

unsafe impl Allocator for CountingAllocator {
    fn allocate(&self, layout: std::alloc::Layout) -> Result<NonNull<[u8]>, AllocError> {
        if self.limit.is_some_and(|limit| self.total.get() >= limit) {
            return Err(AllocError);
        }
        let ptr = Global.allocate(layout)?;
        self.live.set(self.live.get() + 1);
        self.total.set(self.total.get() + 1);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: std::alloc::Layout) {
        assert!(self.live.get() > 0, "deallocating more than was allocated");
        self.live.set(self.live.get() - 1);
        Global.deallocate(ptr, layout);
    }
}

#[cfg(test)]
mod tests;
