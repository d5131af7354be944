use core::fmt;

/// The error type returned by line, index, and allocator operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The caller passed an invalid size or block relationship.
    PreconditionViolation(Violation),
    /// The free-block index's node pool is exhausted.
    IndexFull,
    /// The raw memory source could not supply an arena or a node pool.
    AllocationFailure,
    /// No free block large enough for the request exists.
    OutOfMemory,
}

/// Describes which precondition a call violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Violation {
    /// `split` was asked for more bytes than the block holds.
    SplitTooLarge { requested: u32, available: u32 },
    /// `merge` was given blocks that are not physical neighbours.
    NotAdjacent,
    /// The block was expected to be free but is busy.
    NotFree,
    /// The block was expected to be busy but is free.
    NotBusy,
    /// The block handle does not lie within the line.
    BadBlock,
    /// The node handle does not refer to a live index node.
    StaleNode,
    /// The block has no entry in the free-block index.
    NotIndexed,
    /// The requested line size does not fit the header's 32-bit fields.
    LineTooLarge,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SplitTooLarge {
                requested,
                available,
            } => write!(
                f,
                "could not allocate {} bytes from memory block with size {}",
                requested, available
            ),
            Self::NotAdjacent => f.write_str("blocks are not physically adjacent"),
            Self::NotFree => f.write_str("memory block is busy"),
            Self::NotBusy => f.write_str("memory block is already free"),
            Self::BadBlock => f.write_str("memory block handle is out of the line's bounds"),
            Self::StaleNode => f.write_str("index node is not live"),
            Self::NotIndexed => f.write_str("memory block is not in the free-block index"),
            Self::LineTooLarge => f.write_str("memory line size exceeds 32-bit limits"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreconditionViolation(v) => write!(f, "precondition violated: {}", v),
            Self::IndexFull => f.write_str("free-block index is full"),
            Self::AllocationFailure => f.write_str("raw memory acquisition failed"),
            Self::OutOfMemory => f.write_str("no free block of sufficient size"),
        }
    }
}

impl From<Violation> for Error {
    #[inline]
    fn from(x: Violation) -> Self {
        Self::PreconditionViolation(x)
    }
}

/// The result of an unbalanced [`LeakCounter::check`].
///
/// [`LeakCounter::check`]: crate::LeakCounter::check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakError {
    /// This many acquisitions were never released.
    Leaked(isize),
    /// This many releases had no matching acquisition.
    OverReleased(isize),
}

impl fmt::Display for LeakError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Leaked(n) => write!(
                f,
                "memory leaks detected: {} acquisition(s) without release",
                n
            ),
            Self::OverReleased(n) => write!(
                f,
                "memory leaks detected: {} release(s) of already released memory",
                n
            ),
        }
    }
}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for Error {}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for LeakError {}
