use crate::kernel::KernelError;
use core::fmt;

/// Session-level error, generic over the kernel's error payload.
///
/// Transport-level faults (bad checksums, malformed frames) never reach
/// this type; they are handled by the NAK/retransmit layer.
#[derive(Debug)]
pub enum Error<E> {
    /// The client connection failed.
    Connection(std::io::Error),
    /// A kernel primitive failed in a way the session cannot survive.
    Kernel(KernelError<E>),
    /// Server initialization failed (listener bind, event creation).
    ServerInit(std::io::Error),
}

impl<E> From<std::io::Error> for Error<E> {
    fn from(e: std::io::Error) -> Self {
        Error::Connection(e)
    }
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "connection error: {}", e),
            Error::Kernel(e) => write!(f, "kernel error: {}", e),
            Error::ServerInit(e) => write!(f, "server init error: {}", e),
        }
    }
}

impl<E: fmt::Debug> std::error::Error for Error<E> {}

/// Non-fatal, per-packet handler error that maps to an `E<nn>` reply.
///
/// Fatal errors short-circuit through [`HandlerError::Fatal`] and tear the
/// session down instead of producing a reply.
#[derive(Debug)]
pub(crate) enum HandlerError<E> {
    Errno(u8),
    Fatal(Error<E>),
}

/// Error codes used in `E<nn>` replies.
pub(crate) mod errno {
    /// Generic failure / out of resources.
    pub const GENERIC: u8 = 0x01;
    /// Bad address.
    pub const BAD_ADDRESS: u8 = 0x02;
    /// Invalid argument.
    pub const INVALID_ARG: u8 = 0x22;
}

impl<E> From<std::io::Error> for HandlerError<E> {
    fn from(e: std::io::Error) -> Self {
        HandlerError::Fatal(Error::Connection(e))
    }
}

pub(crate) type HandlerResult<T, E> = Result<T, HandlerError<E>>;

/// Extension trait collapsing kernel / parse failures into `E<nn>`
/// replies inside packet handlers.
pub(crate) trait ErrnoExt<T, E> {
    fn or_errno(self, errno: u8) -> HandlerResult<T, E>;
}

impl<T, E, E2> ErrnoExt<T, E> for Result<T, E2> {
    fn or_errno(self, errno: u8) -> HandlerResult<T, E> {
        self.map_err(|_| HandlerError::Errno(errno))
    }
}
