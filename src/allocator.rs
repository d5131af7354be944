//! The allocator facade keeping a line and its free-block index in sync
use crate::{
    checks::violation,
    Block, Checks, DefaultChecks, Error, FreeTree, Line, RawSource, Violation,
};

/// A [`Line`] paired with a [`FreeTree`] that indexes every free block of
/// the line exactly once.
///
/// # Examples
///
/// ```
/// use memline::{Allocator, Error, GlobalAllocSource};
/// use std::alloc::System;
///
/// let mut a: Allocator<_> = Allocator::new(GlobalAllocSource(System), 1024, 16).unwrap();
/// let block = a.allocate(1024).unwrap();
/// assert_eq!(a.allocate(1), Err(Error::OutOfMemory));
/// a.release(block).unwrap();
/// assert!(a.allocate(1).is_ok());
/// ```
#[derive(Debug)]
pub struct Allocator<S: RawSource, C: Checks = DefaultChecks> {
    line: Line<S, C>,
    tree: FreeTree<S, C>,
}

impl<S: RawSource + Clone, C: Checks> Allocator<S, C> {
    /// Create a line of `line_size` usable bytes and an index holding up to
    /// `index_capacity` free blocks, both from `source`.
    pub fn new(source: S, line_size: u32, index_capacity: u32) -> Result<Self, Error> {
        let line = Line::init(source.clone(), line_size)?;
        let mut tree = FreeTree::init(source, index_capacity)?;
        tree.insert(line.capacity(), line.first_block())?;
        Ok(Self { line, tree })
    }
}

impl<S: RawSource, C: Checks> Allocator<S, C> {
    #[inline]
    pub fn line(&self) -> &Line<S, C> {
        &self.line
    }

    #[inline]
    pub fn tree(&self) -> &FreeTree<S, C> {
        &self.tree
    }

    /// Get the payload of a busy block.
    #[inline]
    pub fn payload(&self, block: Block) -> Result<&[u8], Error> {
        self.line.payload(block)
    }

    /// Get the payload of a busy block mutably.
    #[inline]
    pub fn payload_mut(&mut self, block: Block) -> Result<&mut [u8], Error> {
        self.line.payload_mut(block)
    }

    /// Allocate a block whose payload holds at least `size` bytes. The free
    /// block with the smallest sufficient size is chosen.
    ///
    /// Fails with [`Error::OutOfMemory`] if there's no such block.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in logarithmic time.
    pub fn allocate(&mut self, size: u32) -> Result<Block, Error> {
        let node = self.tree.find_min_fit(size).ok_or_else(|| {
            log::debug!("allocate({}): no sufficient free block", size);
            Error::OutOfMemory
        })?;

        let block = self.tree.remove(node)?;
        debug_assert!(!self.line.header(block)?.is_busy());

        // Removing a node first guarantees a slot for the remainder
        if let Some(sibling) = self.line.split(block, size)? {
            let sibling_size = self.line.header(sibling)?.size();
            self.tree.insert(sibling_size, sibling)?;
        }

        let busy_blocks = self.line.busy_blocks();
        self.line.set_busy_blocks(busy_blocks + 1);

        log::trace!("allocate({}) = {:?}", size, block);
        Ok(block)
    }

    /// Release a block returned by [`Self::allocate`], coalescing it with any
    /// free physical neighbours.
    ///
    /// Fails with [`Error::IndexFull`] without changing anything if neither
    /// neighbour is free and the index has no room for another entry.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in logarithmic time (plus the number of
    /// free neighbours of equal size, which share one key).
    pub fn release(&mut self, block: Block) -> Result<(), Error> {
        let hdr = self.line.header(block)?;
        if !hdr.is_busy() {
            return Err(violation::<C>(Violation::NotBusy));
        }

        let next = self
            .line
            .next_block(block)?
            .map(|b| self.line.header(b).map(|h| (b, h)))
            .transpose()?
            .filter(|(_, h)| !h.is_busy());
        let prev = self
            .line
            .prev_block(block)?
            .map(|b| self.line.header(b).map(|h| (b, h)))
            .transpose()?
            .filter(|(_, h)| !h.is_busy());

        if next.is_none() && prev.is_none() && self.tree.is_full() {
            log::debug!("release({:?}): index full", block);
            return Err(Error::IndexFull);
        }

        self.line.mark_free(block)?;

        let mut merged = block;
        let mut size = hdr.size();

        if let Some((next, next_hdr)) = next {
            self.tree.remove_block(next_hdr.size(), next)?;
            size = self.line.merge(merged, next)?;
        }

        if let Some((prev, prev_hdr)) = prev {
            self.tree.remove_block(prev_hdr.size(), prev)?;
            size = self.line.merge(prev, merged)?;
            merged = prev;
        }

        self.tree.insert(size, merged)?;

        let busy_blocks = self.line.busy_blocks();
        debug_assert_ne!(busy_blocks, 0);
        self.line.set_busy_blocks(busy_blocks.saturating_sub(1));

        log::trace!("release({:?}): free block {:?} of {} bytes", block, merged, size);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
