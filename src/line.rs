//! The memory line and its in-place block headers
use core::{
    alloc::Layout,
    fmt,
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
    slice,
};

use crate::{
    checks::{ensure, violation},
    Checks, DefaultChecks, Error, RawSource, Violation,
};

/// The size of a block header in bytes. Every block, free or busy, is
/// prefixed by one.
pub const BLOCK_HDR_SIZE: usize = mem::size_of::<BlockHdr>();

/// The size of the line header in bytes. The line header occupies the start
/// of the arena; the first block header follows it.
pub const LINE_HDR_SIZE: usize = mem::size_of::<LineHdr>();

/// The offset of the first block header.
const FIRST_BLOCK: u32 = LINE_HDR_SIZE as u32;

const HDR: u32 = BLOCK_HDR_SIZE as u32;

/// The alignment of the arena. Payloads get no alignment guarantee beyond
/// this for the first block.
const ARENA_ALIGN: usize = mem::align_of::<usize>();

/// Encodes "no block" in [`BlockHdr::type_prev`] and [`BlockHdr::type_next`].
const NONE: u32 = u32::MAX;

/// The bit of [`BlockHdr::flags`] indicating whether the block holds
/// allocated data.
const FLAG_BUSY: u8 = 1;
/// The bit of [`BlockHdr::flags`] indicating whether the block is the last
/// one of the line.
const FLAG_LAST: u8 = 2;

/// A handle to a block in a [`Line`]: the byte offset of the block's header
/// from the start of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(pub(crate) u32);

impl Block {
    /// Get the byte offset of the block's header within its line's arena.
    #[inline]
    pub fn offset(self) -> usize {
        self.0 as usize
    }

    #[inline]
    fn from_raw(x: u32) -> Option<Self> {
        if x == NONE {
            None
        } else {
            Some(Self(x))
        }
    }

    #[inline]
    fn into_raw(x: Option<Self>) -> u32 {
        x.map_or(NONE, |b| b.0)
    }
}

/// The header of a memory block, as stored at the block's start.
///
/// All fields are plain integers without padding, so any byte pattern is
/// a valid header and a header is fully initialized when it's later
/// absorbed into a neighbour's payload.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlockHdr {
    /// The previous block in the caller-defined category chain.
    type_prev: u32,
    /// The next block in the caller-defined category chain.
    type_next: u32,
    /// The payload size, excluding this header.
    size: u32,
    /// The payload size of the physically preceding block. Zero for the
    /// first block.
    size_prev: u32,
    /// [`FLAG_BUSY`] | [`FLAG_LAST`]
    flags: u8,
    _reserved: [u8; 3],
}

impl BlockHdr {
    #[inline]
    fn new(size: u32, size_prev: u32, flags: u8) -> Self {
        Self {
            type_prev: NONE,
            type_next: NONE,
            size,
            size_prev,
            flags,
            _reserved: [0; 3],
        }
    }

    /// Get the payload size in bytes.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Get the payload size of the physically preceding block.
    #[inline]
    pub fn size_prev(&self) -> u32 {
        self.size_prev
    }

    /// Get a flag indicating whether the block holds allocated data.
    #[inline]
    pub fn is_busy(&self) -> bool {
        (self.flags & FLAG_BUSY) != 0
    }

    /// Get a flag indicating whether the block is the last one of the line.
    #[inline]
    pub fn is_last(&self) -> bool {
        (self.flags & FLAG_LAST) != 0
    }

    /// Get the previous block in the category chain.
    #[inline]
    pub fn type_prev(&self) -> Option<Block> {
        Block::from_raw(self.type_prev)
    }

    /// Get the next block in the category chain.
    #[inline]
    pub fn type_next(&self) -> Option<Block> {
        Block::from_raw(self.type_next)
    }
}

impl fmt::Debug for BlockHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHdr")
            .field("size", &self.size)
            .field("size_prev", &self.size_prev)
            .field("busy", &self.is_busy())
            .field("last", &self.is_last())
            .field("type_prev", &self.type_prev())
            .field("type_next", &self.type_next())
            .finish()
    }
}

/// The header at the start of every arena.
#[repr(C)]
struct LineHdr {
    busy_blocks: u32,
}

#[inline]
fn load(bytes: &[u8], off: u32) -> BlockHdr {
    let hdr = &bytes[off as usize..off as usize + BLOCK_HDR_SIZE];
    // Safety: `hdr` is `BLOCK_HDR_SIZE` bytes long and every byte pattern
    //         is a valid `BlockHdr`
    unsafe { ptr::read_unaligned(hdr.as_ptr() as *const BlockHdr) }
}

#[inline]
fn store(bytes: &mut [u8], off: u32, x: BlockHdr) {
    let hdr = &mut bytes[off as usize..off as usize + BLOCK_HDR_SIZE];
    // Safety: `hdr` is `BLOCK_HDR_SIZE` bytes long
    unsafe { ptr::write_unaligned(hdr.as_mut_ptr() as *mut BlockHdr, x) };
}

#[cfg_attr(feature = "doc_cfg", svgbobdoc::transform)]
/// A memory line: one contiguous arena subdivided into blocks.
///
/// # Layout
///
/// <center>
/// ```svgbob
///   ,---------+----------+-----------------+----------+-----------------------,
///   | LineHdr | BlockHdr |  payload (size) | BlockHdr |  payload (size)       |
///   '---------+----------+-----------------+----------+-----------------------'
///             ^                            ^
///             | Block                      | Block
///             |                            |  size_prev = previous size
///             |                            |  last = true
/// ```
/// </center>
///
/// The sum of `size + BLOCK_HDR_SIZE` over all blocks always equals
/// [`Self::capacity`]` + BLOCK_HDR_SIZE`, exactly one block is last, and
/// each block's `size_prev` matches its physical predecessor's `size`.
///
/// The arena is acquired from `S` once, in [`Self::init`], and released
/// once, when the line is dropped. Blocks are never returned to `S`
/// individually.
pub struct Line<S: RawSource, C: Checks = DefaultChecks> {
    arena: NonNull<u8>,
    layout: Layout,
    source: S,
    _checks: PhantomData<fn() -> C>,
}

// Safety: The arena is exclusively owned by the line
unsafe impl<S: RawSource + Send, C: Checks> Send for Line<S, C> {}

impl<S: RawSource, C: Checks> fmt::Debug for Line<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Line")
            .field("arena", &self.arena)
            .field("capacity", &self.capacity())
            .field("busy_blocks", &self.busy_blocks())
            .finish()
    }
}

impl<S: RawSource, C: Checks> Line<S, C> {
    /// Acquire an arena from `source` and lay out a single free block
    /// spanning `size` bytes.
    ///
    /// Fails with [`Error::AllocationFailure`] if `source` fails, in which
    /// case nothing is left behind.
    pub fn init(mut source: S, size: u32) -> Result<Self, Error> {
        let total = (LINE_HDR_SIZE + BLOCK_HDR_SIZE) as u64 + size as u64;
        if total > u32::MAX as u64 {
            return Err(violation::<C>(Violation::LineTooLarge));
        }

        let layout = Layout::from_size_align(total as usize, ARENA_ALIGN)
            .map_err(|_| Error::AllocationFailure)?;

        // Safety: `layout.size()` is at least `LINE_HDR_SIZE + BLOCK_HDR_SIZE`
        let arena = unsafe { source.acquire(layout) }.ok_or_else(|| {
            log::debug!("line init: acquiring {:?} failed", layout);
            Error::AllocationFailure
        })?;

        // Payload slices are handed out as `&[u8]`, so the whole arena must
        // be initialized
        // Safety: `arena` is valid for writes of `layout.size()` bytes
        unsafe { ptr::write_bytes(arena.as_ptr(), 0, layout.size()) };

        let mut this = Self {
            arena,
            layout,
            source,
            _checks: PhantomData,
        };
        this.set_busy_blocks(0);
        store(
            this.bytes_mut(),
            FIRST_BLOCK,
            BlockHdr::new(size, 0, FLAG_LAST),
        );

        log::trace!("line init: {:?} at {:p}", layout, arena);
        Ok(this)
    }

    /// Release the arena. Equivalent to dropping `self`.
    #[inline]
    pub fn destroy(self) {}

    #[inline]
    fn bytes(&self) -> &[u8] {
        // Safety: The arena is initialized and owned by `self`
        unsafe { slice::from_raw_parts(self.arena.as_ptr(), self.layout.size()) }
    }

    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        // Safety: The arena is initialized and owned by `self`
        unsafe { slice::from_raw_parts_mut(self.arena.as_ptr(), self.layout.size()) }
    }

    /// Get the number of usable bytes, i.e., the size of the single block
    /// the line was created with.
    #[inline]
    pub fn capacity(&self) -> u32 {
        (self.layout.size() - LINE_HDR_SIZE - BLOCK_HDR_SIZE) as u32
    }

    /// Get the number of busy blocks as maintained by the allocator.
    #[inline]
    pub fn busy_blocks(&self) -> u32 {
        let hdr = &self.bytes()[..LINE_HDR_SIZE];
        // Safety: `hdr` is `LINE_HDR_SIZE` bytes long
        unsafe { ptr::read_unaligned(hdr.as_ptr() as *const LineHdr) }.busy_blocks
    }

    #[inline]
    pub(crate) fn set_busy_blocks(&mut self, busy_blocks: u32) {
        let hdr = &mut self.bytes_mut()[..LINE_HDR_SIZE];
        // Safety: `hdr` is `LINE_HDR_SIZE` bytes long
        unsafe { ptr::write_unaligned(hdr.as_mut_ptr() as *mut LineHdr, LineHdr { busy_blocks }) };
    }

    /// Read the header of `block`, making sure the block lies entirely
    /// within the arena.
    fn checked(&self, block: Block) -> Result<BlockHdr, Error> {
        let len = self.layout.size() as u64;
        let off = block.0 as u64;
        ensure::<C>(
            off >= FIRST_BLOCK as u64 && off + BLOCK_HDR_SIZE as u64 <= len,
            Violation::BadBlock,
        )?;
        let hdr = load(self.bytes(), block.0);
        ensure::<C>(
            off + BLOCK_HDR_SIZE as u64 + hdr.size as u64 <= len,
            Violation::BadBlock,
        )?;
        Ok(hdr)
    }

    /// Get the first block of the line.
    #[inline]
    pub fn first_block(&self) -> Block {
        Block(FIRST_BLOCK)
    }

    /// Get a copy of `block`'s header.
    #[inline]
    pub fn header(&self, block: Block) -> Result<BlockHdr, Error> {
        self.checked(block)
    }

    /// Get the block physically following `block`, if any.
    pub fn next_block(&self, block: Block) -> Result<Option<Block>, Error> {
        let hdr = self.checked(block)?;
        Ok(if hdr.is_last() {
            None
        } else {
            Some(Block(block.0 + HDR + hdr.size))
        })
    }

    /// Get the block physically preceding `block`, if any.
    pub fn prev_block(&self, block: Block) -> Result<Option<Block>, Error> {
        let hdr = self.checked(block)?;
        if block.0 == FIRST_BLOCK {
            return Ok(None);
        }
        let prev = (block.0 - HDR)
            .checked_sub(hdr.size_prev)
            .filter(|&x| x >= FIRST_BLOCK)
            .map(Block);
        ensure::<C>(prev.is_some(), Violation::BadBlock)?;
        Ok(prev)
    }

    /// Iterate over all blocks in physical order.
    #[inline]
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            bytes: self.bytes(),
            next: Some(FIRST_BLOCK),
        }
    }

    /// Get the payload of `block`.
    pub fn payload(&self, block: Block) -> Result<&[u8], Error> {
        let hdr = self.checked(block)?;
        let start = (block.0 + HDR) as usize;
        Ok(&self.bytes()[start..start + hdr.size as usize])
    }

    /// Get the payload of `block` mutably.
    pub fn payload_mut(&mut self, block: Block) -> Result<&mut [u8], Error> {
        let hdr = self.checked(block)?;
        let start = (block.0 + HDR) as usize;
        Ok(&mut self.bytes_mut()[start..start + hdr.size as usize])
    }

    /// Truncate `block` to `size` bytes and mark it busy, turning the rest
    /// into a new free block if it can hold a header and at least one byte.
    ///
    /// Returns the new free block. When the rest is too small, it stays part
    /// of `block` (internal fragmentation), `block`'s size is left
    /// unchanged, and `None` is returned.
    ///
    /// `size` must not exceed `block`'s size. `block`'s category links are
    /// left as they are; the new block starts outside any chain.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    pub fn split(&mut self, block: Block, size: u32) -> Result<Option<Block>, Error> {
        let mut hdr = self.checked(block)?;
        ensure::<C>(
            size <= hdr.size,
            Violation::SplitTooLarge {
                requested: size,
                available: hdr.size,
            },
        )?;

        let old_size = hdr.size;
        hdr.flags |= FLAG_BUSY;

        if old_size - size <= HDR {
            // Not enough room for another header and a non-empty payload
            store(self.bytes_mut(), block.0, hdr);
            return Ok(None);
        }

        let remainder = old_size - size - HDR;
        let sibling = block.0 + HDR + size;
        let mut sibling_hdr = BlockHdr::new(remainder, size, 0);

        if hdr.is_last() {
            // The sibling inherits the last-in-line flag
            hdr.flags &= !FLAG_LAST;
            sibling_hdr.flags |= FLAG_LAST;
        } else {
            // The old successor hasn't moved; only its predecessor has
            let next = block.0 + HDR + old_size;
            let bytes = self.bytes_mut();
            let mut next_hdr = load(bytes, next);
            next_hdr.size_prev = remainder;
            store(bytes, next, next_hdr);
        }

        hdr.size = size;
        let bytes = self.bytes_mut();
        store(bytes, block.0, hdr);
        store(bytes, sibling, sibling_hdr);

        Ok(Some(Block(sibling)))
    }

    /// Absorb the free block `right` into its physical predecessor `left`
    /// and mark `left` free. Returns `left`'s new size.
    ///
    /// `right`'s header becomes part of `left`'s payload.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    pub fn merge(&mut self, left: Block, right: Block) -> Result<u32, Error> {
        let mut hdr = self.checked(left)?;
        let right_hdr = self.checked(right)?;
        ensure::<C>(
            !hdr.is_last() && left.0 + HDR + hdr.size == right.0,
            Violation::NotAdjacent,
        )?;
        ensure::<C>(!right_hdr.is_busy(), Violation::NotFree)?;

        hdr.size += right_hdr.size + HDR;
        hdr.flags &= !FLAG_BUSY;

        let bytes = self.bytes_mut();
        if right_hdr.is_last() {
            hdr.flags |= FLAG_LAST;
        } else {
            let next = left.0 + HDR + hdr.size;
            let mut next_hdr = load(bytes, next);
            next_hdr.size_prev = hdr.size;
            store(bytes, next, next_hdr);
        }
        store(bytes, left.0, hdr);

        Ok(hdr.size)
    }

    /// Mark `block` free without touching its neighbours.
    pub(crate) fn mark_free(&mut self, block: Block) -> Result<(), Error> {
        let mut hdr = self.checked(block)?;
        hdr.flags &= !FLAG_BUSY;
        store(self.bytes_mut(), block.0, hdr);
        Ok(())
    }

    /// Get the previous block in `block`'s category chain.
    #[inline]
    pub fn type_prev(&self, block: Block) -> Result<Option<Block>, Error> {
        Ok(self.checked(block)?.type_prev())
    }

    /// Get the next block in `block`'s category chain.
    #[inline]
    pub fn type_next(&self, block: Block) -> Result<Option<Block>, Error> {
        Ok(self.checked(block)?.type_next())
    }

    /// Insert `block` into `anchor`'s category chain, right after `anchor`.
    ///
    /// `block` should not be a member of any chain. Call
    /// [`Self::type_unlink`] first if it is.
    pub fn type_link_after(&mut self, anchor: Block, block: Block) -> Result<(), Error> {
        let mut anchor_hdr = self.checked(anchor)?;
        let mut hdr = self.checked(block)?;
        ensure::<C>(anchor != block, Violation::BadBlock)?;

        let next = anchor_hdr.type_next();
        if let Some(next) = next {
            let mut next_hdr = self.checked(next)?;
            next_hdr.type_prev = block.0;
            store(self.bytes_mut(), next.0, next_hdr);
        }

        hdr.type_prev = anchor.0;
        hdr.type_next = Block::into_raw(next);
        anchor_hdr.type_next = block.0;

        let bytes = self.bytes_mut();
        store(bytes, block.0, hdr);
        store(bytes, anchor.0, anchor_hdr);
        Ok(())
    }

    /// Remove `block` from its category chain, joining its neighbours.
    pub fn type_unlink(&mut self, block: Block) -> Result<(), Error> {
        let mut hdr = self.checked(block)?;
        let (prev, next) = (hdr.type_prev(), hdr.type_next());

        if let Some(prev) = prev {
            let mut prev_hdr = self.checked(prev)?;
            prev_hdr.type_next = Block::into_raw(next);
            store(self.bytes_mut(), prev.0, prev_hdr);
        }
        if let Some(next) = next {
            let mut next_hdr = self.checked(next)?;
            next_hdr.type_prev = Block::into_raw(prev);
            store(self.bytes_mut(), next.0, next_hdr);
        }

        hdr.type_prev = NONE;
        hdr.type_next = NONE;
        store(self.bytes_mut(), block.0, hdr);
        Ok(())
    }
}

impl<S: RawSource, C: Checks> Drop for Line<S, C> {
    fn drop(&mut self) {
        log::trace!("line destroy: {:?} at {:p}", self.layout, self.arena);
        // Safety: `arena` was acquired from `source` with `layout` and is
        //         released exactly once
        unsafe { self.source.release(self.arena, self.layout) };
    }
}

/// An iterator over the blocks of a [`Line`] in physical order, created by
/// [`Line::blocks`].
#[derive(Debug, Clone)]
pub struct Blocks<'a> {
    bytes: &'a [u8],
    next: Option<u32>,
}

impl Iterator for Blocks<'_> {
    type Item = (Block, BlockHdr);

    fn next(&mut self) -> Option<Self::Item> {
        let off = self.next?;
        let hdr = load(self.bytes, off);
        self.next = if hdr.is_last() {
            None
        } else {
            Some(off + HDR + hdr.size)
        };
        Some((Block(off), hdr))
    }
}
