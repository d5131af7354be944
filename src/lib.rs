//! This crate implements a fixed-capacity arena allocator built from three
//! pieces:
//!
//!  - **A memory line**: one contiguous arena acquired up front and carved
//!    into variable-size blocks. Every block starts with an in-place header
//!    carrying boundary tags (`size`, `size_prev`, `last`), so physical
//!    neighbours are found without any side table.
//!
//!  - **A free-block index**: a red-black tree keyed by block size, backed
//!    by a node pool whose capacity is fixed when the tree is created.
//!    Looking up the smallest sufficient free block takes logarithmic time.
//!
//!  - **An allocator facade** that keeps the two in sync, splitting blocks
//!    on allocation and coalescing them on release.
//!
//! The raw memory for a line and a node pool is obtained exactly once, at
//! construction, through a [`RawSource`]. Allocation and release never call
//! into the hosting environment.
//!
//! This crate supports `#![no_std]`. It does no internal locking; callers
//! serialize access to a line and its index.
//!
//! # Examples
//!
//! ```rust
//! use memline::{Allocator, GlobalAllocSource};
//! use std::alloc::System;
//!
//! let mut a: Allocator<_> = Allocator::new(GlobalAllocSource(System), 2048, 32).unwrap();
//!
//! let b1 = a.allocate(100).unwrap();
//! let b2 = a.allocate(200).unwrap();
//! a.payload_mut(b1).unwrap()[0] = 42;
//! assert_eq!(a.payload(b1).unwrap()[0], 42);
//! assert_eq!(a.line().busy_blocks(), 2);
//!
//! a.release(b1).unwrap();
//! a.release(b2).unwrap();
//! assert_eq!(a.line().busy_blocks(), 0);
//! ```
//!
//! # Precondition checks
//!
//! Misuse such as splitting a block with a size larger than its payload is
//! always detected. What happens next is chosen by the [`Checks`] type
//! parameter: [`Report`] returns [`Error::PreconditionViolation`] and
//! [`Abort`] logs a diagnostic and panics. The `stronger_checks` feature
//! makes [`Abort`] the default.
//!
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

mod allocator;
mod checks;
mod error;
mod line;
mod source;
mod tree;
pub use self::{
    allocator::Allocator,
    checks::{Abort, Checks, DefaultChecks, Report},
    error::{Error, LeakError, Violation},
    line::{Block, BlockHdr, Blocks, Line, BLOCK_HDR_SIZE, LINE_HDR_SIZE},
    source::*,
    tree::{FreeTree, Iter, NodeId},
};

#[cfg(any(test, feature = "std"))]
extern crate std;
