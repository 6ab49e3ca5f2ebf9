//! The kernel debug facility consumed by the server.
//!
//! The host system supplies an implementation of [`Kernel`]; the server
//! never talks to a debuggee (or to another worker) except through it.
//! The surface mirrors a small kernel API: attach to a process, drain its
//! debug-event queue, continue/break/terminate it, poke its memory and
//! thread contexts, and block on a mixed set of event objects and debug
//! handles.

use crate::arch::ArmCoreRegs;
use crate::common::Pid;
use crate::common::Tid;
use bitflags::bitflags;
use core::fmt;
use std::time::Duration;

/// Handle to an attached debuggee process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DebugHandle(pub u32);

/// Handle to a one-shot kernel event object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u32);

/// An object a worker can block on via [`Kernel::wait_any`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitObject {
    /// A one-shot event. A successful wait consumes the signal.
    Event(EventHandle),
    /// A debug handle. Signaled (level-triggered) while its event queue
    /// is non-empty; a wait does not consume anything.
    Debug(DebugHandle),
}

/// Error returned by kernel primitives.
#[derive(Debug, PartialEq, Eq)]
pub enum KernelError<E> {
    /// The debug event queue is empty (or there is no event to continue).
    WouldBlock,
    /// A bounded wait elapsed.
    TimedOut,
    /// The handle does not (or no longer) refer to a live object.
    InvalidHandle,
    /// Host-specific failure.
    Other(E),
}

impl<E: fmt::Debug> fmt::Display for KernelError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::WouldBlock => write!(f, "operation would block"),
            KernelError::TimedOut => write!(f, "wait timed out"),
            KernelError::InvalidHandle => write!(f, "invalid kernel handle"),
            KernelError::Other(e) => write!(f, "kernel error: {:?}", e),
        }
    }
}

pub type KernelResult<T, E> = Result<T, KernelError<E>>;

bitflags! {
    /// Continue bitmask passed to [`Kernel::continue_debug_event`].
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ContinueFlags: u32 {
        /// Report faults (aborts, undefined instructions) as debug events.
        const SIGNAL_FAULT_EVENTS = 1 << 0;
        /// Do not run user-mode exception handlers for faults.
        const INHIBIT_USER_HANDLERS = 1 << 1;
        /// Stop again after a single instruction.
        const SINGLE_STEP = 1 << 2;
    }
}

impl ContinueFlags {
    /// The server's default continue mask.
    pub fn default_mask() -> ContinueFlags {
        ContinueFlags::SIGNAL_FAULT_EVENTS | ContinueFlags::INHIBIT_USER_HANDLERS
    }
}

bitflags! {
    /// Page permissions reported by [`Kernel::query_memory`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemPerm: u32 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
    }
}

/// One region of the debuggee address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub base: u32,
    pub size: u32,
    pub perm: MemPerm,
    /// `false` for unmapped holes.
    pub mapped: bool,
}

impl MemRegion {
    /// Exclusive end address (as a `u64`, so the top of the address
    /// space does not wrap).
    pub fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }
}

/// A process visible to [`Kernel::list_processes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: String,
}

/// Kind of memory access that triggered (or arms) a watchpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    /// Fire when the location is written.
    Write,
    /// Fire when the location is read.
    Read,
    /// Fire on any access.
    ReadWrite,
}

/// Why a debuggee process is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal exit with a status code.
    Exited(u8),
    /// Killed by the kernel or the debugger.
    Terminated,
}

/// Exception-class debug events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionEvent {
    /// Undefined instruction (including patched breakpoint traps).
    UndefinedInstruction { addr: u32 },
    /// Instruction fetch abort.
    PrefetchAbort { addr: u32 },
    /// Data access abort.
    DataAbort { addr: u32, fault_addr: u32 },
    /// Queued by the kernel right after an attach completes.
    AttachBreak,
    /// Queued when a process is launched in a debugger-attached state.
    DebuggerBreak,
    /// The debuggee executed an explicit break request.
    UserBreak,
    /// A hardware watchpoint fired.
    Watchpoint { kind: WatchKind, fault_addr: u32 },
}

/// A single event drained from a debug handle's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEvent {
    /// Thread the event pertains to; `0` for process-wide events.
    pub tid: Tid,
    pub kind: DebugEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEventKind {
    /// First event after an attach.
    AttachProcess { pid: Pid },
    /// A thread came under debugger control (either it existed at attach
    /// time, or it was just created).
    AttachThread { creator_tid: Tid },
    ExitThread,
    ExitProcess { reason: ExitReason },
    Exception(ExceptionEvent),
    /// The debuggee entered a syscall. Only reported while a syscall mask
    /// is armed via [`Kernel::set_syscall_mask`].
    SyscallIn { number: u32 },
    /// The debuggee returned from a syscall.
    SyscallOut { number: u32 },
    /// The debuggee wrote to the debug output channel; the payload lives
    /// in its address space.
    OutputString { addr: u32, len: u32 },
}

/// The kernel-level debug facility.
///
/// Implementations must be callable from both workers concurrently.
///
/// Event-object semantics: events are one-shot; [`Kernel::wait_any`]
/// consumes the signal of the event it returns. Signaling an already
/// signaled event is a no-op (the signal is latched, not counted).
pub trait Kernel: Send + Sync {
    /// Host-specific error payload carried by [`KernelError::Other`].
    type Error: fmt::Debug + Send;

    // ------------------ process debug control ------------------

    /// Attach to a running process.
    fn debug_active_process(&self, pid: Pid) -> KernelResult<DebugHandle, Self::Error>;

    /// Non-blocking dequeue of the oldest unretrieved debug event.
    fn get_process_debug_event(&self, debug: DebugHandle)
        -> KernelResult<DebugEvent, Self::Error>;

    /// Resume the debuggee after a retrieved event.
    /// Returns [`KernelError::WouldBlock`] when no event is pending.
    fn continue_debug_event(
        &self,
        debug: DebugHandle,
        flags: ContinueFlags,
    ) -> KernelResult<(), Self::Error>;

    /// Ask the kernel to stop the debuggee asynchronously; completion is
    /// reported as a break exception event.
    fn break_debug_process(&self, debug: DebugHandle) -> KernelResult<(), Self::Error>;

    /// Kill the debuggee.
    fn terminate_debug_process(&self, debug: DebugHandle) -> KernelResult<(), Self::Error>;

    /// Release the debug handle. Detaches if the process is still alive.
    fn close_debug(&self, debug: DebugHandle);

    // ------------------ memory & registers ------------------

    fn read_process_memory(
        &self,
        debug: DebugHandle,
        addr: u32,
        buf: &mut [u8],
    ) -> KernelResult<(), Self::Error>;

    fn write_process_memory(
        &self,
        debug: DebugHandle,
        addr: u32,
        data: &[u8],
    ) -> KernelResult<(), Self::Error>;

    fn get_thread_context(
        &self,
        debug: DebugHandle,
        tid: Tid,
    ) -> KernelResult<ArmCoreRegs, Self::Error>;

    fn set_thread_context(
        &self,
        debug: DebugHandle,
        tid: Tid,
        regs: &ArmCoreRegs,
    ) -> KernelResult<(), Self::Error>;

    /// Describe the region containing `addr` (mapped or hole).
    fn query_memory(&self, debug: DebugHandle, addr: u32)
        -> KernelResult<MemRegion, Self::Error>;

    // ------------------ enumeration & traps ------------------

    fn list_processes(&self) -> KernelResult<Vec<ProcessInfo>, Self::Error>;

    /// Arm (`Some`) or disarm (`None`) syscall interception. The mask is
    /// a 256-bit set indexed by syscall number.
    fn set_syscall_mask(
        &self,
        debug: DebugHandle,
        mask: Option<&[u8; 32]>,
    ) -> KernelResult<(), Self::Error>;

    /// Program a hardware watchpoint slot.
    fn add_watchpoint(
        &self,
        debug: DebugHandle,
        addr: u32,
        size: u32,
        kind: WatchKind,
    ) -> KernelResult<(), Self::Error>;

    /// Free a previously programmed watchpoint slot.
    fn remove_watchpoint(
        &self,
        debug: DebugHandle,
        addr: u32,
        size: u32,
        kind: WatchKind,
    ) -> KernelResult<(), Self::Error>;

    // ------------------ event objects ------------------

    fn create_event(&self) -> KernelResult<EventHandle, Self::Error>;

    fn signal_event(&self, event: EventHandle) -> KernelResult<(), Self::Error>;

    fn clear_event(&self, event: EventHandle) -> KernelResult<(), Self::Error>;

    fn close_event(&self, event: EventHandle);

    /// Block until one of `objs` is signaled; returns its index. A
    /// returned one-shot event has been consumed. `None` waits forever;
    /// `Some(Duration::ZERO)` polls.
    fn wait_any(
        &self,
        objs: &[WaitObject],
        timeout: Option<Duration>,
    ) -> KernelResult<usize, Self::Error>;
}
