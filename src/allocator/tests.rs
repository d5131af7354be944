extern crate std;

use quickcheck_macros::quickcheck;
use std::{collections::BTreeSet, prelude::v1::*};

use super::*;
use crate::{
    tests::{check_line, FailingSource, ShadowAllocator, TestSource, TEST_LINE_SIZE},
    Abort, Init, Report, BLOCK_HDR_SIZE,
};

type TheAllocator = Allocator<TestSource, Report>;

fn new_allocator(line_size: u32, index_capacity: u32) -> TheAllocator {
    let _ = env_logger::builder().is_test(true).try_init();
    Allocator::new(TestSource::INIT, line_size, index_capacity).unwrap()
}

/// Check that the index holds exactly the free blocks of the line, that no
/// two free blocks are adjacent, and that `busy_blocks` is accurate.
fn check_consistency<S: RawSource, C: Checks>(a: &Allocator<S, C>) {
    let busy = check_line(a.line());
    assert_eq!(a.line().busy_blocks(), busy);
    a.tree().validate();

    let indexed: BTreeSet<(u32, Block)> = a.tree().iter().collect();
    assert_eq!(indexed.len(), a.tree().len() as usize, "duplicate entries");

    let mut free = BTreeSet::new();
    let mut prev_free = false;
    for (block, hdr) in a.line().blocks() {
        if !hdr.is_busy() {
            assert!(!prev_free, "{:?} follows a free block", block);
            free.insert((hdr.size(), block));
        }
        prev_free = !hdr.is_busy();
    }
    assert_eq!(indexed, free);
}

#[test]
fn new_allocator_has_one_free_block() {
    let a = new_allocator(TEST_LINE_SIZE, 16);
    log::trace!("a = {:?}", a);
    assert_eq!(a.tree().len(), 1);
    let node = a.tree().find_min_fit(TEST_LINE_SIZE).unwrap();
    assert_eq!(a.tree().block(node), Ok(a.line().first_block()));
    check_consistency(&a);
}

#[test]
fn new_failure() {
    let result: Result<Allocator<_, Report>, _> = Allocator::new(FailingSource, 64, 4);
    assert_eq!(result.err(), Some(Error::AllocationFailure));

    let result: Result<Allocator<_, Report>, _> = Allocator::new(TestSource::INIT, 64, 0);
    assert_eq!(result.err(), Some(Error::IndexFull));
}

#[test]
fn allocate_release() {
    let mut a = new_allocator(TEST_LINE_SIZE, 16);

    let b1 = a.allocate(100).unwrap();
    let b2 = a.allocate(200).unwrap();
    let b3 = a.allocate(300).unwrap();
    check_consistency(&a);
    assert_eq!(a.line().busy_blocks(), 3);
    assert_eq!(a.payload(b1).unwrap().len(), 100);
    assert_eq!(a.payload(b2).unwrap().len(), 200);
    assert_eq!(a.payload(b3).unwrap().len(), 300);

    // Release the middle one; it can't be coalesced
    a.release(b2).unwrap();
    check_consistency(&a);
    assert_eq!(a.tree().len(), 2);

    // The smallest sufficient block is chosen
    let b4 = a.allocate(150).unwrap();
    assert_eq!(b4, b2);
    check_consistency(&a);

    a.release(b1).unwrap();
    a.release(b3).unwrap();
    a.release(b4).unwrap();
    check_consistency(&a);

    // Everything coalesced back into one block
    assert_eq!(a.line().busy_blocks(), 0);
    assert_eq!(a.line().blocks().count(), 1);
    let entries: Vec<_> = a.tree().iter().collect();
    assert_eq!(entries, [(TEST_LINE_SIZE, a.line().first_block())]);
}

#[test]
fn allocate_zero() {
    let mut a = new_allocator(TEST_LINE_SIZE, 16);
    let b = a.allocate(0).unwrap();
    assert_eq!(a.payload(b).unwrap().len(), 0);
    check_consistency(&a);
    a.release(b).unwrap();
    check_consistency(&a);
}

#[test]
fn out_of_memory() {
    let mut a = new_allocator(1024, 16);
    assert_eq!(a.allocate(1025), Err(Error::OutOfMemory));

    let b = a.allocate(1024).unwrap();
    assert_eq!(a.allocate(0), Err(Error::OutOfMemory));
    assert!(a.tree().is_empty());
    check_consistency(&a);

    a.release(b).unwrap();
    assert!(a.allocate(1).is_ok());
    check_consistency(&a);
}

#[test]
fn small_remainder_is_absorbed() {
    let mut a = new_allocator(1024, 16);
    let size = 1024 - BLOCK_HDR_SIZE as u32;
    let b = a.allocate(size).unwrap();

    // The remainder can't hold a header, so the block keeps it
    assert_eq!(a.payload(b).unwrap().len(), 1024);
    assert!(a.tree().is_empty());
    check_consistency(&a);
}

#[test]
fn release_coalesces_both_sides() {
    let mut a = new_allocator(TEST_LINE_SIZE, 16);
    let blocks: Vec<Block> = (0..4).map(|_| a.allocate(64).unwrap()).collect();

    a.release(blocks[0]).unwrap();
    a.release(blocks[2]).unwrap();
    check_consistency(&a);
    assert_eq!(a.tree().len(), 3);

    // Joins with both [0] and [2]
    a.release(blocks[1]).unwrap();
    check_consistency(&a);
    assert_eq!(a.tree().len(), 2);
    let node = a.tree().find_min_fit(64 * 3 + BLOCK_HDR_SIZE as u32 * 2).unwrap();
    assert_eq!(a.tree().block(node), Ok(blocks[0]));
    assert_eq!(a.tree().key(node), Ok(64 * 3 + BLOCK_HDR_SIZE as u32 * 2));

    a.release(blocks[3]).unwrap();
    check_consistency(&a);
    assert_eq!(a.line().blocks().count(), 1);
}

#[test]
fn release_index_full() {
    // One node: after the first allocation the index holds the remainder
    let mut a = new_allocator(TEST_LINE_SIZE, 1);
    let b1 = a.allocate(100).unwrap();
    let b2 = a.allocate(100).unwrap();
    let b3 = a.allocate(100).unwrap();
    assert!(a.tree().is_full());

    // `b2` has no free neighbour and would need a node of its own
    assert_eq!(a.release(b2), Err(Error::IndexFull));
    assert!(a.line().header(b2).unwrap().is_busy());
    assert_eq!(a.line().busy_blocks(), 3);
    check_consistency(&a);

    // `b3` is adjacent to the free remainder and can be coalesced
    a.release(b3).unwrap();
    check_consistency(&a);

    a.release(b2).unwrap();
    a.release(b1).unwrap();
    check_consistency(&a);
    assert_eq!(a.line().blocks().count(), 1);
}

#[test]
fn release_free_block() {
    let mut a = new_allocator(TEST_LINE_SIZE, 16);
    let b = a.allocate(100).unwrap();
    a.release(b).unwrap();
    assert_eq!(
        a.release(b),
        Err(Error::PreconditionViolation(Violation::NotBusy))
    );
    check_consistency(&a);
}

#[test]
#[should_panic(expected = "memory block is already free")]
fn release_free_block_abort() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut a: Allocator<TestSource, Abort> =
        Allocator::new(TestSource::INIT, TEST_LINE_SIZE, 16).unwrap();
    let first = a.line().first_block();
    let _ = a.release(first);
}

#[test]
fn payload_isolation() {
    let mut a = new_allocator(TEST_LINE_SIZE, 16);
    let b1 = a.allocate(64).unwrap();
    let b2 = a.allocate(64).unwrap();
    a.payload_mut(b1).unwrap().fill(1);
    a.payload_mut(b2).unwrap().fill(2);
    check_consistency(&a);

    a.release(b1).unwrap();
    assert!(a.payload(b2).unwrap().iter().all(|&x| x == 2));
    check_consistency(&a);
}

#[quickcheck]
fn random(line_size: u16, index_capacity: u8, bytecode: Vec<u8>) {
    random_inner(line_size, index_capacity, bytecode);
}

fn random_inner(line_size: u16, index_capacity: u8, bytecode: Vec<u8>) -> Option<()> {
    let line_size = line_size as u32;
    let mut a = new_allocator(line_size, index_capacity as u32 % 32 + 1);

    let mut sa = ShadowAllocator::new();
    sa.insert_line(line_size);

    #[derive(Debug)]
    struct Alloc {
        block: Block,
        size: u32,
        tag: u8,
    }
    let mut allocs: Vec<Alloc> = Vec::new();

    let mut it = bytecode.iter().cloned();
    loop {
        check_consistency(&a);
        assert_eq!(a.line().busy_blocks() as usize, allocs.len());

        match it.next()? % 2 {
            0 => {
                let size = u16::from_le_bytes([it.next()?, it.next()?]) as u32 % (line_size + 1);
                let expected = a.tree().find_min_fit(size);
                log::trace!("allocate({})", size);

                match a.allocate(size) {
                    Ok(block) => {
                        let tag = it.next()?;
                        let payload = a.payload_mut(block).unwrap();
                        assert!(payload.len() as u32 >= size);
                        payload.fill(tag);

                        // Track the whole payload, absorbed remainder included
                        let size = payload.len() as u32;
                        sa.allocate(block, size);
                        allocs.push(Alloc { block, size, tag });
                    }
                    Err(Error::OutOfMemory) => assert_eq!(expected, None),
                    Err(e) => panic!("allocate({}) failed: {:?}", size, e),
                }
            }
            1 => {
                if allocs.is_empty() {
                    continue;
                }
                let i = it.next()? as usize % allocs.len();
                let alloc = &allocs[i];
                log::trace!("release({:?})", alloc);

                // Nothing else touched the payload
                let payload = a.payload(alloc.block).unwrap();
                assert_eq!(payload.len() as u32, alloc.size);
                assert!(payload.iter().all(|&x| x == alloc.tag));

                match a.release(alloc.block) {
                    Ok(()) => {
                        sa.deallocate(alloc.block, alloc.size);
                        allocs.swap_remove(i);
                    }
                    Err(Error::IndexFull) => {
                        assert!(a.tree().is_full());
                        assert!(a.line().header(alloc.block).unwrap().is_busy());
                    }
                    Err(e) => panic!("release({:?}) failed: {:?}", alloc, e),
                }
            }
            _ => unreachable!(),
        }
    }
}

