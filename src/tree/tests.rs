extern crate std;

use quickcheck_macros::quickcheck;
use std::prelude::v1::*;

use super::*;
use crate::{
    tests::{FailingSource, TestSource},
    Init, Report,
};

type TheTree = FreeTree<TestSource, Report>;

fn new_tree(capacity: u32) -> TheTree {
    let _ = env_logger::builder().is_test(true).try_init();
    FreeTree::init(TestSource::INIT, capacity).unwrap()
}

#[test]
fn create_destroy() {
    let tree = new_tree(16);
    log::trace!("tree = {:?}", tree);
    assert!(tree.is_empty());
    assert!(!tree.is_full());
    assert_eq!(tree.len(), 0);
    assert_eq!(tree.capacity(), 16);
    assert_eq!(tree.pool_high_water(), 0);
    assert_eq!(tree.find_min_fit(0), None);
    tree.validate();
    tree.destroy();
}

#[test]
fn zero_capacity() {
    // Nothing is acquired, so a failing source is fine
    let mut tree: FreeTree<_, Report> = FreeTree::init(FailingSource, 0).unwrap();
    assert!(tree.is_empty());
    assert!(tree.is_full());
    assert_eq!(tree.insert(64, Block(4)), Err(Error::IndexFull));
    assert_eq!(tree.find_min_fit(0), None);
    tree.validate();
}

#[test]
fn init_failure() {
    let result: Result<FreeTree<_, Report>, _> = FreeTree::init(FailingSource, 4);
    assert_eq!(result.err(), Some(Error::AllocationFailure));

    let result: Result<FreeTree<_, Report>, _> = FreeTree::init(TestSource::INIT, u32::MAX);
    assert_eq!(result.err(), Some(Error::AllocationFailure));
}

#[test]
fn min_fit() {
    let mut tree = new_tree(8);
    let n64 = tree.insert(64, Block(100)).unwrap();
    let n128 = tree.insert(128, Block(200)).unwrap();
    let n256 = tree.insert(256, Block(300)).unwrap();
    tree.validate();
    log::trace!("tree = {:?}", tree);

    assert_eq!(tree.find_min_fit(100), Some(n128));
    assert_eq!(tree.find_min_fit(64), Some(n64));
    assert_eq!(tree.find_min_fit(0), Some(n64));
    assert_eq!(tree.find_min_fit(129), Some(n256));
    assert_eq!(tree.find_min_fit(256), Some(n256));
    assert_eq!(tree.find_min_fit(300), None);

    assert_eq!(tree.key(n128), Ok(128));
    assert_eq!(tree.block(n128), Ok(Block(200)));

    assert_eq!(tree.remove(n128), Ok(Block(200)));
    tree.validate();
    assert_eq!(tree.find_min_fit(100), Some(n256));
    assert_eq!(tree.len(), 2);

    let entries: Vec<_> = tree.iter().collect();
    assert_eq!(entries, [(64, Block(100)), (256, Block(300))]);
}

#[test]
fn index_full() {
    let mut tree = new_tree(3);
    let nodes: Vec<NodeId> = (0..3)
        .map(|i| tree.insert(10 * (i + 1), Block(i)).unwrap())
        .collect();
    assert!(tree.is_full());
    assert_eq!(tree.insert(5, Block(99)), Err(Error::IndexFull));
    assert_eq!(tree.len(), 3);
    tree.validate();

    // A vacated slot is reused before the pool would grow
    tree.remove(nodes[1]).unwrap();
    assert!(!tree.is_full());
    let node = tree.insert(5, Block(99)).unwrap();
    assert_eq!(node, nodes[1]);
    assert_eq!(tree.pool_high_water(), 3);
    assert_eq!(tree.find_min_fit(0), Some(node));
    tree.validate();
}

/// Among entries of equal size, the most recently inserted one is found
/// first. This is a chosen policy, not a red-black tree property.
#[test]
fn equal_sizes_newest_first() {
    let mut tree = new_tree(8);
    tree.insert(32, Block(1)).unwrap();
    tree.insert(100, Block(10)).unwrap();
    tree.insert(100, Block(20)).unwrap();
    tree.insert(100, Block(30)).unwrap();
    tree.insert(500, Block(2)).unwrap();
    tree.validate();

    for &expected in &[Block(30), Block(20), Block(10)] {
        let node = tree.find_min_fit(50).unwrap();
        assert_eq!(tree.remove(node), Ok(expected));
        tree.validate();
    }

    let node = tree.find_min_fit(50).unwrap();
    assert_eq!(tree.key(node), Ok(500));
}

#[test]
fn remove_block() {
    let mut tree = new_tree(8);
    for i in 0..5 {
        tree.insert(100, Block(i)).unwrap();
    }
    tree.insert(50, Block(50)).unwrap();
    tree.insert(200, Block(200)).unwrap();

    assert!(tree.find_block(100, Block(2)).is_some());
    assert_eq!(tree.find_block(50, Block(2)), None);
    assert_eq!(tree.find_block(100, Block(50)), None);

    tree.remove_block(100, Block(2)).unwrap();
    tree.validate();
    assert_eq!(tree.find_block(100, Block(2)), None);
    assert_eq!(tree.len(), 6);

    assert_eq!(
        tree.remove_block(100, Block(2)),
        Err(Error::PreconditionViolation(Violation::NotIndexed))
    );
    assert_eq!(
        tree.remove_block(300, Block(200)),
        Err(Error::PreconditionViolation(Violation::NotIndexed))
    );
    assert_eq!(tree.len(), 6);
}

#[test]
fn stale_node() {
    let mut tree = new_tree(8);
    let node = tree.insert(100, Block(1)).unwrap();
    tree.remove(node).unwrap();

    let err = Err(Error::PreconditionViolation(Violation::StaleNode));
    assert_eq!(tree.remove(node), err);
    assert_eq!(tree.block(node), err);
    assert_eq!(tree.remove(NodeId(7)), err);
    assert_eq!(tree.remove(NodeId(NIL)), err);
    tree.validate();
}

#[test]
#[should_panic(expected = "index node is not live")]
fn stale_node_abort() {
    let mut tree: FreeTree<TestSource, crate::Abort> =
        FreeTree::init(TestSource::INIT, 4).unwrap();
    let _ = tree.remove(NodeId(0));
}

#[test]
fn ascending_and_descending() {
    let mut tree = new_tree(256);
    let mut entries = Vec::new();
    for i in (0..128).chain((128..256).rev()) {
        entries.push((tree.insert(i, Block(i)).unwrap(), Block(i)));
        tree.validate();
    }
    assert!(tree.is_full());

    // A red-black tree of n nodes has a black height of at most log2(n + 1),
    // plus one for the leaves
    let black_height = tree.validate();
    assert!(black_height <= 9, "black height = {}", black_height);

    for &(node, block) in entries.iter().step_by(2) {
        assert_eq!(tree.remove(node), Ok(block));
        tree.validate();
    }
    for &(node, block) in entries.iter().skip(1).step_by(2) {
        assert_eq!(tree.remove(node), Ok(block));
        tree.validate();
    }
    assert!(tree.is_empty());
}

#[quickcheck]
fn random(capacity: u8, bytecode: Vec<u8>) {
    random_inner(capacity, bytecode);
}

fn random_inner(capacity: u8, bytecode: Vec<u8>) -> Option<()> {
    let capacity = capacity as u32 % 64 + 1;
    let mut tree = new_tree(capacity);

    // Entries in insertion order
    let mut model: Vec<(u32, Block, NodeId)> = Vec::new();
    let mut next_block = 0;

    let mut it = bytecode.iter().cloned();
    loop {
        tree.validate();
        assert_eq!(tree.len() as usize, model.len());

        match it.next()? % 3 {
            0 => {
                // Narrow key range to get many duplicates
                let size = it.next()? as u32 % 32;
                let block = Block(next_block);
                next_block += 1;
                log::trace!("insert({}, {:?})", size, block);

                if model.len() == capacity as usize {
                    assert_eq!(tree.insert(size, block), Err(Error::IndexFull));
                } else {
                    let node = tree.insert(size, block).unwrap();
                    model.push((size, block, node));
                }
            }
            1 => {
                if model.is_empty() {
                    continue;
                }
                let i = it.next()? as usize % model.len();
                let (size, block, node) = model.remove(i);
                log::trace!("remove({:?}) ({}, {:?})", node, size, block);
                assert_eq!(tree.remove(node), Ok(block));
            }
            2 => {
                let key = it.next()? as u32 % 40;
                let found = tree.find_min_fit(key);
                log::trace!("find_min_fit({}) = {:?}", key, found);

                let expected = model
                    .iter()
                    .filter(|e| e.0 >= key)
                    .map(|e| e.0)
                    .min()
                    .map(|size| {
                        // The newest entry among those with the smallest key
                        model.iter().rev().find(|e| e.0 == size).unwrap().2
                    });
                assert_eq!(found, expected);
            }
            _ => unreachable!(),
        }
    }
}
