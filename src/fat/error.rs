//! The crate's error taxonomy (see spec §7).
//!
//! Errors are surfaced as a small tagged enum rather than a string so that
//! callers in no_std contexts can match on them without formatting support.
//! The block device's own error type is threaded through in `Io` instead of
//! being discarded, the same way `storage::{ReadError, WriteError}` keep an
//! `Other(T)` escape hatch into the device's error type.

use core::fmt::{self, Debug};

/// Format-level errors: detected at mount or during traversal. Once one of
/// these is observed the volume is marked unhealthy and further writes are
/// refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    /// The boot sector failed a sanity check (bad signature, sector size
    /// out of {512,1024,2048,4096}, non-power-of-two cluster size, etc).
    CorruptedVolume,
    /// The requested format parameters don't make sense for the device
    /// (e.g. too few sectors for even the reserved region).
    InvalidFormat,
}

/// Logical errors: reported to callers, recoverable (the volume itself is
/// not in a bad state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalError {
    FileNotFound,
    FilenameAlreadyExists,
    InvalidFilename,
    SeekPastEof,
    AccessDenied,
    NotADirectory,
    IsADirectory,
    PathNotAbsolute,
    CrossVolumeRename,
}

/// Capacity errors: the engine rolls back any partial allocation before
/// returning one of these where possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityError {
    InsufficientDiskSpace,
    DirectoryFull,
}

/// Programmer errors — misuse of the API, not something a well-behaved
/// caller should ever observe in normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    FileBufferNotSet,
    InvalidHandle,
    OperationInProgress,
}

/// The crate-wide error type. Generic over `E`, the block device's own
/// associated error type, so I/O failures aren't stringified away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error<E: Debug> {
    /// Propagated unchanged from the block device (`COMMUNICATION_ERROR`,
    /// `TIMEOUT` in spec terms).
    Io(E),
    Format(FormatError),
    Logical(LogicalError),
    Capacity(CapacityError),
    State(StateError),
}

impl<E: Debug> From<FormatError> for Error<E> {
    fn from(e: FormatError) -> Self { Error::Format(e) }
}

impl<E: Debug> From<LogicalError> for Error<E> {
    fn from(e: LogicalError) -> Self { Error::Logical(e) }
}

impl<E: Debug> From<CapacityError> for Error<E> {
    fn from(e: CapacityError) -> Self { Error::Capacity(e) }
}

impl<E: Debug> From<StateError> for Error<E> {
    fn from(e: StateError) -> Self { Error::State(e) }
}

pub type Result<T, E> = core::result::Result<T, Error<E>>;

macro_rules! using_std { ($($i:item)*) => ($(#[cfg(not(feature = "no_std"))]$i)*) }

using_std! {
    impl<E: Debug> fmt::Display for Error<E> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            Debug::fmt(self, f)
        }
    }

    impl<E: Debug> std::error::Error for Error<E> { }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_tag_the_right_variant() {
        let e: Error<()> = LogicalError::FileNotFound.into();
        assert_eq!(e, Error::Logical(LogicalError::FileNotFound));

        let e: Error<()> = CapacityError::DirectoryFull.into();
        assert_eq!(e, Error::Capacity(CapacityError::DirectoryFull));
    }
}
