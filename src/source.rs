//! Raw memory sources and leak accounting.
use core::{
    alloc::{GlobalAlloc, Layout},
    cell::Cell,
    ptr::NonNull,
};

use crate::LeakError;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
#[cfg_attr(feature = "doc_cfg", doc(cfg(unix)))]
pub use self::unix::MmapSource;

/// Provides a constant default value.
pub trait Init {
    /// `Self`'s default value.
    const INIT: Self;
}

#[cfg(any(test, feature = "std"))]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl Init for std::alloc::System {
    const INIT: Self = Self;
}

/// The primitive through which a [`Line`] or a [`FreeTree`] obtains its
/// backing memory. It is called only when one of them is created or
/// destroyed.
///
/// [`Line`]: crate::Line
/// [`FreeTree`]: crate::FreeTree
///
/// # Safety
///
/// A memory region returned by `acquire` must be valid for reads and writes
/// of `layout.size()` bytes, aligned to `layout.align()`, and must not be
/// accessed by anyone else until it's passed to `release`. Clones of a source
/// must be able to release each other's regions.
pub unsafe trait RawSource {
    /// Obtain a memory region described by `layout`. Returns `None` on
    /// failure.
    ///
    /// # Safety
    ///
    /// `layout.size()` must not be zero.
    unsafe fn acquire(&mut self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return a memory region to the hosting environment.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a region previously returned by `acquire` on `self`
    /// or a clone of `self` with the same `layout`, and not released since.
    unsafe fn release(&mut self, ptr: NonNull<u8>, layout: Layout);
}

/// Wraps a [`GlobalAlloc`] to make it usable as a [`RawSource`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalAllocSource<A>(pub A);

impl<A: Init> Init for GlobalAllocSource<A> {
    const INIT: Self = Self(A::INIT);
}

unsafe impl<A: GlobalAlloc> RawSource for GlobalAllocSource<A> {
    #[inline]
    unsafe fn acquire(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert_ne!(layout.size(), 0);
        NonNull::new(self.0.alloc(layout))
    }

    #[inline]
    unsafe fn release(&mut self, ptr: NonNull<u8>, layout: Layout) {
        self.0.dealloc(ptr.as_ptr(), layout);
    }
}

/// Counts outstanding raw acquisitions so that leaks can be detected at a
/// chosen checkpoint.
///
/// Every [`Line`] and [`FreeTree`] built on a [`CountingSource`] borrowing
/// this counter must be destroyed before [`Self::check`] can succeed.
///
/// [`Line`]: crate::Line
/// [`FreeTree`]: crate::FreeTree
///
/// # Examples
///
/// ```
/// use memline::{GlobalAllocSource, LeakCounter, Line};
/// use std::alloc::System;
///
/// let counter = LeakCounter::new();
/// let line: Line<_> = Line::init(counter.source(GlobalAllocSource(System)), 256).unwrap();
/// assert_eq!(counter.outstanding(), 1);
/// line.destroy();
/// counter.check().unwrap();
/// ```
#[derive(Debug, Default)]
pub struct LeakCounter {
    outstanding: Cell<isize>,
}

impl Init for LeakCounter {
    const INIT: Self = Self::new();
}

impl LeakCounter {
    /// Construct a balanced counter.
    #[inline]
    pub const fn new() -> Self {
        Self {
            outstanding: Cell::new(0),
        }
    }

    /// Wrap `inner` so that its acquisitions and releases are counted by
    /// `self`.
    #[inline]
    pub fn source<S>(&self, inner: S) -> CountingSource<'_, S> {
        CountingSource {
            counter: self,
            inner,
        }
    }

    /// Get the number of acquisitions not yet matched by a release.
    #[inline]
    pub fn outstanding(&self) -> isize {
        self.outstanding.get()
    }

    /// Succeed if every acquisition has been matched by exactly one release.
    pub fn check(&self) -> Result<(), LeakError> {
        match self.outstanding.get() {
            0 => Ok(()),
            n if n > 0 => {
                log::debug!("leak check: {} outstanding acquisition(s)", n);
                Err(LeakError::Leaked(n))
            }
            n => {
                log::debug!("leak check: {} excess release(s)", -n);
                Err(LeakError::OverReleased(-n))
            }
        }
    }
}

/// A [`RawSource`] that reports every acquisition and release to a
/// [`LeakCounter`].
#[derive(Debug, Clone)]
pub struct CountingSource<'a, S> {
    counter: &'a LeakCounter,
    inner: S,
}

impl<S> CountingSource<'_, S> {
    /// Get a reference to the wrapped source.
    #[inline]
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

unsafe impl<S: RawSource> RawSource for CountingSource<'_, S> {
    #[inline]
    unsafe fn acquire(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = self.inner.acquire(layout)?;
        self.counter.outstanding.set(self.counter.outstanding.get() + 1);
        Some(ptr)
    }

    #[inline]
    unsafe fn release(&mut self, ptr: NonNull<u8>, layout: Layout) {
        self.counter.outstanding.set(self.counter.outstanding.get() - 1);
        self.inner.release(ptr, layout);
    }
}
