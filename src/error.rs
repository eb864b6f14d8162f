//! Typed error taxonomy for the runtime boundary, with an `errno` mapping
//! for callers that expect POSIX-style error reporting.

use thiserror::Error;

/// Errors that can cross the public API boundary of the runtime.
#[derive(Debug, Error)]
pub enum GrachtError {
    /// Null/invalid configuration passed to `initialize`.
    #[error("invalid argument")]
    InvalidArgument,

    /// `initialize` called on a server that is already initialized.
    #[error("server already initialized")]
    AlreadyInitialized,

    /// Requested capability (e.g. a link listen kind) is not supported.
    #[error("operation not supported")]
    NotSupported,

    /// A message exceeds `max_message_size`, either inbound or outbound.
    /// Carries the request id so a control-protocol error response can
    /// reference the message it rejected.
    #[error("message too large")]
    TooLarge { id: u32 },

    /// A drained socket had nothing left to read; not a failure.
    #[error("no data available")]
    NoData,

    /// Short write, short read, or length mismatch on a stream link.
    #[error("broken pipe")]
    Pipe,

    /// Lookup miss on the client or protocol registry.
    #[error("not found")]
    NotFound,

    /// Arena or worker queue exhaustion.
    #[error("out of memory")]
    OutOfMemory,

    /// Low-level I/O failure that doesn't map onto the taxonomy above.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GrachtError {
    /// The POSIX `errno` value corresponding to this condition, for
    /// callers that expect C-style error reporting.
    pub fn errno(&self) -> i32 {
        match self {
            GrachtError::InvalidArgument => libc::EINVAL,
            GrachtError::AlreadyInitialized => libc::EALREADY,
            GrachtError::NotSupported => libc::ENOTSUP,
            GrachtError::TooLarge { .. } => libc::E2BIG,
            GrachtError::NoData => libc::ENODATA,
            GrachtError::Pipe => libc::EPIPE,
            GrachtError::NotFound => libc::ENOENT,
            GrachtError::OutOfMemory => libc::ENOMEM,
            GrachtError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, GrachtError>;
