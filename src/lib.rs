//! An embedded GDB Remote Serial Protocol server for kernel-assisted
//! process debugging.
//!
//! `gdbserv` drives a small pool of debugger sessions on a constrained
//! device: each *context* pairs one RSP-speaking client (connected over
//! TCP) with one debuggee process, mediated through a kernel-level debug
//! facility that delivers process/thread events and allows memory,
//! register and execution control while the debuggee is stopped.
//!
//! The crate deliberately owns no platform code. Two seams connect it to
//! the host system:
//!
//! - [`kernel::Kernel`] — the kernel debug facility (attach, event
//!   queue, continue/break/terminate, memory, thread contexts, event
//!   objects). The test suite drives the server against an in-memory
//!   implementation; the device wires it to the real syscalls.
//! - [`conn::Connection`] / [`conn::ConnectionExt`] — byte-level client
//!   I/O, implemented for [`std::net::TcpStream`] out of the box.
//!
//! A [`GdbServer`] binds [`MAX_DEBUG`] consecutive TCP ports (the last
//! one reserved for the "debug next application" workflow) and runs two
//! cooperating workers: the *socket worker* services client packets, the
//! *monitor worker* blocks on kernel debug events and translates them
//! into asynchronous stop replies.
//!
//! ## Features
//!
//! - `trace-pkt`: log all inbound/outbound RSP frames via `trace!`.

pub mod arch;
pub mod common;
pub mod conn;
pub mod kernel;

mod breakpoints;
mod context;
mod error;
mod events;
mod handlers;
mod protocol;
mod server;
mod watchpoints;

pub use context::Breakpoint;
pub use context::ContextFlags;
pub use context::ContextState;
pub use context::MAX_BREAKPOINTS;
pub use context::MAX_THREADS;
pub use error::Error;
pub use protocol::GDB_BUF_LEN;
pub use server::AllContexts;
pub use server::ContextSnapshot;
pub use server::GdbServer;
pub use server::ServerThreads;
pub use server::GDB_PORT_BASE;
pub use server::MAX_DEBUG;
pub use watchpoints::MAX_WATCHPOINTS;
