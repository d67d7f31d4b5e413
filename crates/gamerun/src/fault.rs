//! # Failure taxonomy at the guest boundary
//!
//! - [`GuestFault`]: the guest reported an unrecoverable error of its own.
//! - [`ProtocolViolation`]: the host broke (or was asked to break) a
//!   boundary invariant. These are programming defects; they are logged at
//!   error level and surfaced, never papered over.
//!
//! Platform failures of asynchronous operations are not errors at all: they
//! reach the guest as completion events (see [`crate::event::Failure`]).

/// Error message produced by the guest module itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFault {
    pub message: String,
}

impl GuestFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Decodes a guest-produced message, replacing invalid UTF-8.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::new(String::from_utf8_lossy(bytes))
    }
}

impl std::fmt::Display for GuestFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "guest fault: {}", self.message)
    }
}

impl std::error::Error for GuestFault {}

/// Host-side invariant breach at the guest boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A buffer handle was released that is not live (already freed or never issued).
    DoubleFree { handle: u32 },
    /// A buffer handle was read that is not live.
    UnknownBuffer { handle: u32 },
    /// The guest handed over a handle the host already owns.
    AliasedBuffer { handle: u32 },
    /// A write did not match the size of the buffer it targets.
    LengthMismatch { expected: usize, actual: usize },
    /// A region lies outside the guest's current linear memory.
    OutOfBounds { offset: usize, len: usize },
    /// A capability was invoked outside of a bridge call.
    NoActiveSystem,
    /// The guest drew a frame in a format other than RGB32.
    UnexpectedPixelFormat(u32),
    /// The guest drew a frame whose stride differs from its width.
    StrideMismatch { width: u32, stride: u32 },
    /// The guest drew a frame whose length is not a whole number of rows.
    PartialRow { width: u32, len: usize },
    /// A query result did not carry its trailing status byte.
    MissingStatusTag,
    /// `initialize` was invoked on an already initialized guest.
    AlreadyInitialized,
    /// An event was delivered before `initialize` succeeded.
    NotInitialized,
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DoubleFree { handle } => write!(f, "buffer {:#x} freed twice or never allocated", handle),
            Self::UnknownBuffer { handle } => write!(f, "buffer {:#x} is not live", handle),
            Self::AliasedBuffer { handle } => write!(f, "buffer {:#x} is already owned by the host", handle),
            Self::LengthMismatch { expected, actual } => {
                write!(f, "write of {} bytes into a {} byte buffer", actual, expected)
            }
            Self::OutOfBounds { offset, len } => {
                write!(f, "region at {} (+{} bytes) is outside guest memory", offset, len)
            }
            Self::NoActiveSystem => write!(f, "capability invoked with no active platform adapter"),
            Self::UnexpectedPixelFormat(format) => {
                write!(f, "expected RGB32 pixel format (1), got {}", format)
            }
            Self::StrideMismatch { width, stride } => {
                write!(f, "frame width {} differs from stride {}", width, stride)
            }
            Self::PartialRow { width, len } => {
                write!(f, "frame of {} bytes is not a whole number of {}-pixel rows", len, width)
            }
            Self::MissingStatusTag => write!(f, "query result is missing its status tag"),
            Self::AlreadyInitialized => write!(f, "guest initialized twice"),
            Self::NotInitialized => write!(f, "event delivered before the guest was initialized"),
        }
    }
}

impl std::error::Error for ProtocolViolation {}
