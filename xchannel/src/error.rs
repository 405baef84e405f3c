//! Error types for the channel layer.

use core::fmt;

/// Result type alias for channel operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by control-plane operations.
///
/// Bulk-lane overload is not represented here: a failed bulk send hands the
/// message back through [`SendError`](crate::channel::SendError) so the
/// handle is never lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The control lane rejected a record (queue full).
    ControlFull,

    /// The worker endpoint has not completed the open handshake.
    NotOpen,

    /// The open handshake was already completed on this endpoint.
    AlreadyOpen,
}

impl Error {
    /// Returns a human-readable description of the error.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Error::ControlFull => "control lane full",
            Error::NotOpen => "channel not open",
            Error::AlreadyOpen => "channel already open",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
