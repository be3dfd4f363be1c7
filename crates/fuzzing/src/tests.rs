use super::*;
use mutatis::check::{Check, CheckError, CheckFailure};
use zone_alloc::{SharedZone, DEFAULT_BLOCK_SIZE};

fn addr(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize
}

#[test]
fn run_ops() {
    let _ = env_logger::try_init();

    let seed_corpus = [
        // Empty.
        Ops::default(),
        // Simple alloc/dealloc pair.
        Ops::new([
            Op::Alloc { id: 0, size: Size(8) },
            Op::Dealloc { id: 0 },
        ]),
        // Oversized allocation between two normal ones.
        Ops::new([
            Op::Alloc { id: 0, size: Size(8) },
            Op::Alloc {
                id: 1,
                size: Size(1024),
            },
            Op::Alloc { id: 2, size: Size(8) },
        ]),
        // Mark, fill a few blocks, pop back to the mark.
        Ops::new([
            Op::Alloc { id: 0, size: Size(0) },
            Op::Alloc {
                id: 1,
                size: Size(200),
            },
            Op::Alloc {
                id: 2,
                size: Size(200),
            },
            Op::Alloc {
                id: 3,
                size: Size(200),
            },
            Op::FreeSince { id: 0 },
            Op::Alloc { id: 4, size: Size(8) },
        ]),
        // Free an old block individually, then pop.
        Ops::new([
            Op::Alloc {
                id: 0,
                size: Size(256),
            },
            Op::Alloc { id: 1, size: Size(8) },
            Op::AllocValue {
                id: 2,
                value: 0xdead_beef,
            },
            Op::Dealloc { id: 0 },
            Op::FreeSince { id: 2 },
            Op::Dealloc { id: 1 },
        ]),
    ];

    match Check::new().iters(20_000).shrink_iters(1).run_with(
        m::default::<Ops>(),
        seed_corpus,
        |ops| ops.run(256),
    ) {
        Ok(()) => {}
        Err(CheckError::Failed(CheckFailure { value, message, .. })) => {
            panic!("test failure: {message}: {value:#?}")
        }
        Err(e) => panic!("check error: {e}"),
    }
}

#[test]
fn run_ops_with_tiny_blocks() {
    let _ = env_logger::try_init();

    let ops = Ops::new([
        Op::Alloc { id: 0, size: Size(0) },
        Op::Alloc { id: 1, size: Size(1) },
        Op::Alloc { id: 2, size: Size(0) },
        Op::AllocValue { id: 3, value: 7 },
        Op::FreeSince { id: 1 },
        Op::Dealloc { id: 0 },
        Op::Alloc { id: 4, size: Size(0) },
    ]);
    for block_size in [1, 2, 4, 8, 16] {
        ops.run(block_size)
            .unwrap_or_else(|e| panic!("block size {block_size}: {e}"));
    }
}

#[test]
fn bump_allocation_within_a_block_is_monotonic_and_aligned() {
    let _ = env_logger::try_init();
    let mut zone = ZoneAllocator::new(1024);

    let sizes = [1, 8, 13, 0, 24, 7, 100];
    let mut prev_end = None;
    for size in sizes {
        let ptr = zone.allocate(size).unwrap();
        assert_eq!(addr(ptr) % ZONE_ALIGN, 0);
        if let Some(prev_end) = prev_end {
            assert_eq!(addr(ptr), prev_end);
        }
        prev_end = Some(addr(ptr) + round_up(size));
    }
    assert_eq!(zone.block_count(), 1);
}

#[test]
fn overflowing_a_block_starts_a_new_one() {
    let _ = env_logger::try_init();
    let mut zone = ZoneAllocator::new(64);

    let ptrs: Vec<NonNull<u8>> = (0..3).map(|_| zone.allocate(24).unwrap()).collect();
    assert_eq!(zone.block_count(), 2);

    // The first two share a block; the third did not fit in the 16 bytes left.
    assert_eq!(addr(ptrs[1]), addr(ptrs[0]) + 24);
    assert_ne!(addr(ptrs[2]), addr(ptrs[1]) + 24);
    assert_eq!(zone.remaining(), 64 - 24);

    for ptr in &ptrs {
        assert!(zone.contains(*ptr));
        // The whole object lies in one block.
        let last = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(23)) };
        assert!(zone.contains(last));
    }
}

#[test]
fn free_since_resumes_at_the_mark() {
    let _ = env_logger::try_init();

    for k in [0, 1, 8, 100, 4096 - 8] {
        let mut zone = ZoneAllocator::new(4096);
        zone.allocate(8).unwrap();
        let mark = zone.allocate(0).unwrap();

        for i in 0..200usize {
            let ptr = zone.allocate(i % 97).unwrap();
            unsafe { ptr.as_ptr().write_bytes(i as u8, i % 97) };
        }
        assert!(zone.block_count() > 1);

        zone.free_since(mark);
        assert_eq!(zone.block_count(), 1);
        assert_eq!(zone.allocate(k).unwrap(), mark, "k = {k}");
    }
}

#[test]
fn free_since_on_an_unknown_pointer_is_ignored() {
    let _ = env_logger::try_init();
    let mut zone = ZoneAllocator::new(64);
    let a = zone.allocate(64).unwrap();
    zone.allocate(64).unwrap();

    let mut outside = 0u64;
    zone.free_since(NonNull::from(&mut outside).cast());
    assert_eq!(zone.block_count(), 2);
    assert!(zone.contains(a));
}

#[test]
fn deallocate_reclaims_the_oldest_block() {
    let _ = env_logger::try_init();
    let blocks = CountingAllocator::new();
    let mut zone = ZoneAllocator::new_in(64, &blocks);

    let ptrs: Vec<NonNull<u8>> = (0..6).map(|_| zone.allocate(32).unwrap()).collect();
    assert_eq!(zone.block_count(), 3);
    assert_eq!(blocks.live(), 3);

    zone.deallocate(ptrs[0]);
    assert_eq!(zone.block_count(), 3);
    zone.deallocate(ptrs[1]);
    assert_eq!(zone.block_count(), 2);
    assert_eq!(blocks.live(), 2);
    assert!(!zone.contains(ptrs[0]));
    assert!(zone.contains(ptrs[2]));
}

#[test]
fn deallocating_the_whole_current_block_keeps_it() {
    let _ = env_logger::try_init();
    let blocks = CountingAllocator::new();
    let mut zone = ZoneAllocator::new_in(64, &blocks);

    let a = zone.allocate(32).unwrap();
    let b = zone.allocate(32).unwrap();
    zone.deallocate(a);
    zone.deallocate(b);
    assert_eq!(zone.block_count(), 1);
    assert_eq!(zone.remaining(), 64);

    // Push/pop reuses the same memory without touching the inner allocator.
    for _ in 0..10 {
        let c = zone.allocate(48).unwrap();
        assert_eq!(c, a);
        zone.deallocate(c);
    }
    assert_eq!(blocks.total(), 1);
}

#[test]
fn blocks_freed_in_the_middle_of_the_chain_are_unlinked() {
    let _ = env_logger::try_init();
    let blocks = CountingAllocator::new();
    let mut zone = ZoneAllocator::new_in(64, &blocks);

    let first = zone.allocate(64).unwrap();
    let middle = zone.allocate(64).unwrap();
    let last = zone.allocate(64).unwrap();
    zone.deallocate(middle);
    assert_eq!(zone.block_count(), 2);

    // Popping to the first block walks over the remaining newer one.
    zone.free_since(first);
    assert_eq!(zone.block_count(), 1);
    assert!(!zone.contains(last));
    assert_eq!(blocks.live(), 1);

    // The directory is rebuilt before the next lookup.
    zone.deallocate(first);
    assert_eq!(zone.block_count(), 1);
    assert_eq!(zone.remaining(), 64);
}

#[test]
fn many_blocks_outgrow_the_index() {
    let _ = env_logger::try_init();
    let blocks = CountingAllocator::new();
    let mut zone = ZoneAllocator::new_in(16, &blocks);

    let first = zone.allocate(16).unwrap();
    zone.deallocate(first);

    // Enough blocks that the directory has to be rebuilt at a larger size.
    let ptrs: Vec<NonNull<u8>> = (0..5000).map(|_| zone.allocate(16).unwrap()).collect();
    assert_eq!(zone.block_count(), 5000);

    for ptr in &ptrs[..4999] {
        zone.deallocate(*ptr);
    }
    assert_eq!(zone.block_count(), 1);
    assert_eq!(blocks.live(), 1);
}

#[test]
fn dropping_the_zone_releases_every_block() {
    let _ = env_logger::try_init();
    let blocks = CountingAllocator::new();
    {
        let mut zone = ZoneAllocator::new_in(128, &blocks);
        for _ in 0..50 {
            zone.allocate(40).unwrap();
        }
        assert!(blocks.live() > 1);
    }
    assert_eq!(blocks.live(), 0);
    assert!(blocks.total() > 1);
}

#[test]
fn oversized_requests_are_rejected() {
    let _ = env_logger::try_init();
    let mut zone = ZoneAllocator::new(128);

    assert_eq!(
        zone.allocate(256),
        Err(ZoneError::Oversized {
            requested: 256,
            block_size: 128
        })
    );
    assert_eq!(zone.block_count(), 0);

    let a = zone.allocate(32).unwrap();
    assert!(zone.allocate(129).is_err());
    assert!(zone.allocate(usize::MAX).is_err());
    let b = zone.allocate(32).unwrap();
    assert_eq!(addr(b), addr(a) + 32);
    assert_eq!(zone.block_count(), 1);

    // Exactly one block is fine.
    assert!(zone.allocate(128).is_ok());
}

#[test]
fn failing_inner_allocator_leaves_the_zone_usable() {
    let _ = env_logger::try_init();
    let blocks = CountingAllocator::with_limit(1);
    let mut zone = ZoneAllocator::new_in(64, &blocks);

    let a = zone.allocate(48).unwrap();
    assert_eq!(zone.allocate(48), Err(ZoneError::OutOfMemory));
    assert_eq!(zone.block_count(), 1);

    let b = zone.allocate(16).unwrap();
    assert_eq!(addr(b), addr(a) + 48);
}

#[test]
fn unknown_pointer_deallocate_is_a_no_op() {
    let _ = env_logger::try_init();
    let mut zone = ZoneAllocator::new(64);

    // Before any block exists.
    let mut outside = 0u64;
    let outside = NonNull::from(&mut outside).cast::<u8>();
    zone.deallocate(outside);
    assert_eq!(zone.block_count(), 0);

    let a = zone.allocate(16).unwrap();
    zone.allocate(64).unwrap();
    let remaining = zone.remaining();

    zone.deallocate(outside);
    assert_eq!(zone.block_count(), 2);
    assert_eq!(zone.remaining(), remaining);

    // A double free of an object from a block that is already gone.
    zone.deallocate(a);
    assert_eq!(zone.block_count(), 1);
    zone.deallocate(a);
    assert_eq!(zone.block_count(), 1);
    assert_eq!(zone.remaining(), remaining);
}

#[test]
fn values_live_in_the_zone() {
    let _ = env_logger::try_init();

    #[derive(Debug, PartialEq)]
    struct Node {
        key: u32,
        next: Option<NonNull<Node>>,
    }

    let mut zone = ZoneAllocator::default();
    assert_eq!(zone.block_size(), DEFAULT_BLOCK_SIZE);

    let mut head = None;
    for key in 0..1000 {
        head = Some(zone.alloc_value(Node { key, next: head }).unwrap());
    }

    let mut sum = 0;
    let mut cursor = head;
    while let Some(node) = cursor {
        let node = unsafe { node.as_ref() };
        sum += node.key;
        cursor = node.next;
    }
    assert_eq!(sum, (0..1000).sum::<u32>());
}

#[test]
fn collections_in_a_shared_zone() {
    let _ = env_logger::try_init();
    let blocks = CountingAllocator::new();
    let zone = SharedZone::from_zone(ZoneAllocator::new_in(1024, &blocks));

    {
        let mut v = allocator_api2::vec::Vec::new_in(&zone);
        for i in 0..100u64 {
            v.push(i);
        }
        assert_eq!(v.iter().sum::<u64>(), 4950);

        // Growing past one block is refused rather than silently split.
        let mut big = allocator_api2::vec::Vec::<u8, _>::new_in(&zone);
        assert!(big.try_reserve_exact(2048).is_err());
    }

    let zone = zone.into_inner();
    assert!(zone.block_count() >= 1);
    drop(zone);
    assert_eq!(blocks.live(), 0);
}
