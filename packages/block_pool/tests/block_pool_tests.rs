//! Integration tests for the `block_pool` package.
//!
//! These exercise the public API the way a typed container built on top of the pool would,
//! including address stability across growth and free list reuse across many operations.

use std::alloc::Layout;
use std::collections::HashSet;
use std::num::NonZero;
use std::ptr::NonNull;

use block_pool::{AllocationPolicy, BlockPool};
use proptest::prelude::*;

fn pool_of<T>(growth: usize) -> BlockPool {
    BlockPool::builder()
        .block_layout_of::<T>()
        .growth(NonZero::new(growth).unwrap())
        .build()
        .unwrap()
}

#[test]
fn simple_allocation() {
    let mut pool = pool_of::<[u8; 32]>(4);

    let block = pool.allocate().unwrap();

    assert!(pool.owns(block));
    assert_eq!(pool.len(), 1);
}

#[test]
fn simple_growth() {
    // One more block than a single chunk holds.
    let mut pool = pool_of::<u64>(4);

    let blocks = (0..5).map(|_| pool.allocate()).collect::<Vec<_>>();

    assert!(blocks.iter().all(Result::is_ok));
    assert_eq!(pool.chunk_count(), 2);
}

#[test]
fn addresses_survive_growth() {
    let mut pool = pool_of::<u64>(2);

    let first = pool.allocate().unwrap().cast::<u64>();

    // SAFETY: The block is valid for writes of a u64.
    unsafe { first.write(0xfeed) };

    for _ in 0..100 {
        _ = pool.allocate().unwrap();
    }

    // SAFETY: The block is still handed out, so it still holds what we wrote.
    assert_eq!(unsafe { first.read() }, 0xfeed);
    assert!(pool.chunk_count() > 50);
}

#[test]
fn policies_do_not_affect_successful_allocation() {
    for policy in [
        AllocationPolicy::Abort,
        AllocationPolicy::ReturnNone,
        AllocationPolicy::WarnAndReturnNone,
    ] {
        let mut pool = BlockPool::builder()
            .block_layout(Layout::new::<u32>())
            .growth(NonZero::new(8).unwrap())
            .allocation_policy(policy)
            .build()
            .unwrap();

        assert!(pool.allocate().is_ok());
    }
}

#[test]
#[cfg_attr(miri, ignore)] // Miri does not emulate the operating system refusing huge allocations.
fn failed_growth_is_reported_and_leaves_pool_unchanged() {
    // Far beyond the user address space of any current 64-bit platform.
    let block_layout = Layout::from_size_align(1 << 52, 8).unwrap();

    let mut pool = BlockPool::builder()
        .block_layout(block_layout)
        .growth(NonZero::new(1).unwrap())
        .allocation_policy(AllocationPolicy::ReturnNone)
        .build()
        .unwrap();

    let error = pool.allocate().unwrap_err();

    assert!(error.layout().size() >= 1 << 52);
    assert_eq!(pool.len(), 0);
    assert_eq!(pool.capacity(), 0);
    assert_eq!(pool.chunk_count(), 0);

    // Nothing sticks after a failure, the next attempt fails the same way.
    assert_eq!(pool.allocate().unwrap_err(), error);
}

#[test]
fn dropping_pool_with_outstanding_blocks_is_fine() {
    let mut pool = pool_of::<String>(4);

    let block = pool.allocate().unwrap().cast::<String>();

    // SAFETY: The block is valid for writes of a String.
    unsafe { block.write(String::from("caller-owned value")) };

    // SAFETY: We own the only copy of the value; drop it before the pool goes away.
    unsafe { block.drop_in_place() };

    drop(pool);
}

proptest! {
    #[test]
    fn live_blocks_never_alias(ops in proptest::collection::vec(any::<bool>(), 1..300)) {
        let mut pool = pool_of::<u32>(7);
        let mut live: Vec<NonNull<u8>> = Vec::new();

        for allocate in ops {
            if allocate || live.is_empty() {
                live.push(pool.allocate().unwrap());
            } else {
                let block = live.swap_remove(live.len() / 2);

                // SAFETY: The block came from this pool and is only released once.
                unsafe { pool.release(block) };
            }

            let unique = live.iter().copied().collect::<HashSet<_>>();
            prop_assert_eq!(unique.len(), live.len());
            prop_assert_eq!(pool.len(), live.len());
            prop_assert!(pool.capacity() >= pool.len());
        }
    }
}
