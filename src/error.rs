use alloc::alloc::Layout;
use core::fmt;

/// Errors returned by hazel's fallible operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Memory for a new hazard slot could not be obtained.
    OutOfMemory { layout: Layout },
    /// The stack had no element to pop.
    Empty,
    /// A [`SetWriter`](crate::SetWriter) for this set is already alive.
    WriterActive,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory { layout } => write!(
                f,
                "failed to allocate a hazard slot ({} bytes, align {})",
                layout.size(),
                layout.align()
            ),
            Error::Empty => write!(f, "stack is empty"),
            Error::WriterActive => write!(f, "sorted set already has an active writer"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
