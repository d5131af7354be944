//! Precondition check strategies.
use crate::{Error, Init, Violation};

/// Decides what happens when a caller violates a precondition.
///
/// The precondition itself is evaluated regardless of the strategy, so a
/// violation never reaches the arena's headers.
pub trait Checks {
    /// `true` to log a diagnostic and panic; `false` to return
    /// [`Error::PreconditionViolation`].
    const ABORT_ON_VIOLATION: bool;
}

/// Logs the diagnostic and panics on a precondition violation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Abort;

/// Reports a precondition violation as [`Error::PreconditionViolation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Report;

impl Checks for Abort {
    const ABORT_ON_VIOLATION: bool = true;
}

impl Checks for Report {
    const ABORT_ON_VIOLATION: bool = false;
}

impl Init for Abort {
    const INIT: Self = Self;
}

impl Init for Report {
    const INIT: Self = Self;
}

cfg_if::cfg_if! {
    if #[cfg(feature = "stronger_checks")] {
        /// The strategy used when none is named. [`Abort`] because the
        /// `stronger_checks` feature is enabled.
        pub type DefaultChecks = Abort;
    } else {
        /// The strategy used when none is named. [`Report`] unless the
        /// `stronger_checks` feature is enabled.
        pub type DefaultChecks = Report;
    }
}

/// Turn a violation into an error according to `C`.
#[cold]
#[track_caller]
pub(crate) fn violation<C: Checks>(v: Violation) -> Error {
    if C::ABORT_ON_VIOLATION {
        log::error!("{}", v);
        panic!("{}", v);
    }
    log::debug!("precondition violated: {}", v);
    Error::PreconditionViolation(v)
}

/// `Ok(())` if `cond` holds, the violation otherwise.
#[inline]
#[track_caller]
pub(crate) fn ensure<C: Checks>(cond: bool, v: Violation) -> Result<(), Error> {
    if cond {
        Ok(())
    } else {
        Err(violation::<C>(v))
    }
}
