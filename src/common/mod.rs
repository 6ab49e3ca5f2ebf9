//! Common types and definitions used across `gdbserv`.

mod signal;

pub use self::signal::Signal;

/// Kernel thread ID.
///
/// `0` is never a valid thread and is used as the "no / any thread"
/// sentinel in the RSP `H` packet and in per-context thread selections.
pub type Tid = u32;

/// Kernel process ID.
pub type Pid = u32;

/// Sentinel [`Pid`] meaning "the next application to launch".
///
/// A reserved context carrying this PID cannot be attached by PID; it must
/// be handed a debug handle by the host before a client connects.
pub const PID_NEXT_APPLICATION: Pid = 0xFFFF_FFFF;
