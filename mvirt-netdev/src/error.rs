//! Error types for the session multiplexer.

use nix::errno::Errno;
use thiserror::Error;

/// Status vocabulary shared by the control surface, sessions and drivers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Referenced port, session or VMO does not exist.
    #[error("not found")]
    NotFound,

    /// Caller supplied an invalid argument or a malformed descriptor.
    #[error("invalid arguments")]
    InvalidArgs,

    /// Device is tearing down or the requested path is not available.
    #[error("unavailable")]
    Unavailable,

    /// A fixed-size table is full.
    #[error("no resources")]
    NoResources,

    /// Requested version or capability is not supported.
    #[error("not supported")]
    NotSupported,

    /// Entry is already present.
    #[error("already exists")]
    AlreadyExists,

    /// Operation is not valid in the current state.
    #[error("bad state")]
    BadState,

    /// Object was closed by its owner.
    #[error("canceled")]
    Canceled,

    /// The other end of a FIFO or channel went away.
    #[error("peer closed")]
    PeerClosed,

    /// Nothing to read or no room to write right now.
    #[error("should wait")]
    ShouldWait,

    /// The tx queue has no free slots.
    #[error("io overrun")]
    IoOverrun,

    /// Access outside the bounds of a memory region.
    #[error("out of range")]
    OutOfRange,

    /// A blocking wait expired.
    #[error("timed out")]
    TimedOut,

    /// Memory mapping failure.
    #[error("system error: {0}")]
    Errno(#[from] Errno),
}

/// Result type for multiplexer operations.
pub type Result<T> = std::result::Result<T, Error>;
