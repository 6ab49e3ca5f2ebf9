//! Per-connection debugger context: one (client ↔ debuggee) pair and its
//! entire lifecycle from reserved slot to teardown.

use crate::arch::ArmBreakpointKind;
use crate::common::Pid;
use crate::common::Tid;
use crate::conn::Connection;
use crate::kernel::ContinueFlags;
use crate::kernel::DebugEvent;
use crate::kernel::DebugHandle;
use crate::kernel::EventHandle;
use crate::kernel::Kernel;
use crate::kernel::WaitObject;
use crate::protocol::ResponseWriter;
use crate::protocol::GDB_BUF_LEN;
use bitflags::bitflags;
use log::warn;
use std::io;
use std::sync::Mutex;

/// Maximum number of threads tracked per debuggee.
pub const MAX_THREADS: usize = 32;

/// Maximum number of software breakpoints per context.
pub const MAX_BREAKPOINTS: usize = 64;

bitflags! {
    /// Orthogonal per-context capabilities and transient conditions.
    ///
    /// Lifecycle proper lives in [`ContextState`]; these bits qualify it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        /// The slot is reserved: it owns a port and cannot be handed out
        /// again until released.
        const SELECTED = 1 << 0;
        /// A client socket is attached to the slot.
        const USED = 1 << 1;
        /// The debug handle was supplied externally before the client
        /// connected ("debug next application").
        const ATTACHED_AT_START = 1 << 2;
        /// The kernel is currently running the debuggee.
        const PROCESS_CONTINUING = 1 << 3;
        /// Kill the debuggee when the client goes away.
        const TERMINATE_PROCESS = 1 << 4;
        /// The client negotiated `!` (extended-remote) mode.
        const EXTENDED_REMOTE = 1 << 5;
    }
}

/// Connection lifecycle of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Disconnected,
    Connected,
    Closing,
}

/// Which object the monitor worker sleeps on for this context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitTarget {
    /// Waiting for the socket worker to finish the accept prelude.
    ClientAccepted,
    /// Waiting for the command dispatcher to resume the debuggee.
    Continued,
    /// Waiting for the kernel to queue debug events.
    DebugEvents,
}

/// A software breakpoint: the original instruction bytes behind a patched
/// undefined-instruction trap.
#[derive(Debug, Clone, Copy)]
pub struct Breakpoint {
    pub addr: u32,
    pub original: [u8; 4],
    pub kind: ArmBreakpointKind,
    /// Persistent breakpoints outlive the client connection (the trap is
    /// left in place on disconnect).
    pub persistent: bool,
}

/// Cached `qXfer` blobs, regenerated whenever a read starts at offset 0.
#[derive(Default)]
pub(crate) struct XferCaches {
    pub memory_map: Vec<u8>,
    pub processes: Vec<u8>,
    pub threads: Vec<u8>,
}

impl XferCaches {
    pub fn clear(&mut self) {
        self.memory_map.clear();
        self.processes.clear();
        self.threads.clear();
    }
}

/// One slot of the server's context pool.
///
/// All mutable state lives behind the mutex; the slot itself is created
/// exactly once at server init and never reallocated.
pub struct GdbContext {
    pub(crate) inner: Mutex<ContextInner>,
}

pub(crate) struct ContextInner {
    // identity & lifecycle
    pub state: ContextState,
    pub flags: ContextFlags,
    pub local_port: u16,
    pub pid: Pid,
    pub debug: Option<DebugHandle>,

    // event plumbing
    pub client_accepted: EventHandle,
    pub continued: EventHandle,
    pub wait_target: WaitTarget,
    pub continue_flags: ContinueFlags,
    pub latest_debug_event: Option<DebugEvent>,

    // run state
    pub process_exited: bool,
    pub process_ended: bool,
    pub catch_thread_events: bool,
    pub enable_external_memory_access: bool,

    // threads
    pub threads: Vec<Tid>,
    pub total_created_threads: u32,
    pub current_tid: Tid,
    pub selected_tid: Tid,
    pub selected_continue_tid: Tid,

    // stop points
    pub breakpoints: Vec<Breakpoint>,
    pub watchpoints: Vec<u32>,

    // transport & buffers
    pub no_ack: bool,
    pub send_buf: Vec<u8>,
    pub conn: Option<Box<dyn Connection<Error = io::Error>>>,
    pub svc_mask: [u8; 32],
    pub xfer: XferCaches,
}

impl GdbContext {
    pub(crate) fn new(client_accepted: EventHandle, continued: EventHandle) -> GdbContext {
        GdbContext {
            inner: Mutex::new(ContextInner {
                state: ContextState::Disconnected,
                flags: ContextFlags::empty(),
                local_port: 0,
                pid: 0,
                debug: None,
                client_accepted,
                continued,
                wait_target: WaitTarget::ClientAccepted,
                continue_flags: ContinueFlags::default_mask(),
                latest_debug_event: None,
                process_exited: false,
                process_ended: false,
                catch_thread_events: false,
                enable_external_memory_access: false,
                threads: Vec::with_capacity(MAX_THREADS),
                total_created_threads: 0,
                current_tid: 0,
                selected_tid: 0,
                selected_continue_tid: 0,
                breakpoints: Vec::with_capacity(MAX_BREAKPOINTS),
                watchpoints: Vec::new(),
                no_ack: false,
                send_buf: Vec::with_capacity(GDB_BUF_LEN + 4),
                conn: None,
                svc_mask: [0; 32],
                xfer: XferCaches::default(),
            }),
        }
    }
}

impl ContextInner {
    /// The wait object the monitor should currently block on.
    pub fn wait_object(&self) -> WaitObject {
        match (self.wait_target, self.debug) {
            (WaitTarget::ClientAccepted, _) | (WaitTarget::DebugEvents, None) => {
                WaitObject::Event(self.client_accepted)
            }
            (WaitTarget::Continued, _) => WaitObject::Event(self.continued),
            (WaitTarget::DebugEvents, Some(debug)) => WaitObject::Debug(debug),
        }
    }

    // ------------------ transport ------------------

    /// Send a raw transport byte (`+` / `-`), outside any frame.
    pub fn send_byte(&mut self, byte: u8) -> io::Result<()> {
        if let Some(conn) = self.conn.as_mut() {
            conn.write(byte)?;
            conn.flush()?;
        }
        Ok(())
    }

    /// Build a reply frame in the send buffer and transmit it. The frame
    /// is retained for one retransmit round.
    pub fn send_reply(
        &mut self,
        build: impl FnOnce(&mut ResponseWriter<'_>),
    ) -> io::Result<()> {
        let mut buf = std::mem::take(&mut self.send_buf);
        let writer = ResponseWriter::new(&mut buf);
        // build cannot fail: it writes into memory
        build_into(writer, build);
        let res = self.send_raw(&buf);
        self.send_buf = buf;
        res
    }

    /// Transmit a frame built outside of [`ContextInner::send_reply`]
    /// (used when the builder needs to read context state), retaining it
    /// for one retransmit round.
    pub fn send_frame(&mut self, frame: Vec<u8>) -> io::Result<()> {
        let res = self.send_raw(&frame);
        self.send_buf = frame;
        res
    }

    /// Retransmit the retained frame after a client NAK.
    pub fn retransmit(&mut self) -> io::Result<()> {
        if self.send_buf.is_empty() {
            warn!("client NAK with no frame to retransmit");
            return Ok(());
        }
        let buf = std::mem::take(&mut self.send_buf);
        let res = self.send_raw(&buf);
        self.send_buf = buf;
        res
    }

    fn send_raw(&mut self, frame: &[u8]) -> io::Result<()> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            // no client attached (e.g. a stop raced a disconnect)
            None => return Ok(()),
        };

        #[cfg(feature = "trace-pkt")]
        log::trace!("--> {}", String::from_utf8_lossy(frame));

        conn.write_all(frame)?;
        conn.flush()
    }

    // ------------------ thread bookkeeping ------------------

    /// Insert a thread into the known-thread table (bounded,
    /// de-duplicated).
    pub fn add_thread(&mut self, tid: Tid) {
        if tid == 0 || self.threads.contains(&tid) {
            return;
        }
        if self.threads.len() >= MAX_THREADS {
            warn!("thread table full, dropping tid {}", tid);
            return;
        }
        self.threads.push(tid);
        self.total_created_threads += 1;
    }

    /// Remove a thread; returns `true` if it was the last one.
    pub fn remove_thread(&mut self, tid: Tid) -> bool {
        self.threads.retain(|&t| t != tid);
        if self.current_tid == tid {
            self.current_tid = self.threads.first().copied().unwrap_or(0);
        }
        self.threads.is_empty()
    }

    pub fn is_thread_alive(&self, tid: Tid) -> bool {
        self.threads.contains(&tid)
    }

    /// The thread `g`/`m`-class packets operate on.
    pub fn debug_thread(&self) -> Tid {
        if self.selected_tid != 0 {
            self.selected_tid
        } else {
            self.current_tid
        }
    }

    // ------------------ lifecycle ------------------

    /// Tear down everything owed to the departing client, keeping the
    /// reservation itself intact. Mirrors the close callback of the
    /// socket layer.
    pub fn close<K: Kernel>(&mut self, kernel: &K) {
        if let Some(debug) = self.debug {
            // non-persistent breakpoints must not outlive the client
            let stale: Vec<Breakpoint> = self
                .breakpoints
                .iter()
                .copied()
                .filter(|bp| !bp.persistent)
                .collect();
            for bp in stale {
                if let Err(e) = crate::breakpoints::disable(self, kernel, &bp) {
                    warn!("failed to disable breakpoint at {:#x}: {}", bp.addr, e);
                }
            }

            if self.svc_mask.iter().any(|&b| b != 0) {
                let _ = kernel.set_syscall_mask(debug, None);
            }
        }
        self.breakpoints.clear();
        self.svc_mask = [0; 32];

        self.xfer.clear();

        let _ = kernel.clear_event(self.client_accepted);
        self.wait_target = WaitTarget::ClientAccepted;

        self.local_port = 0;
        self.conn = None;
        self.no_ack = false;
        self.send_buf.clear();
        self.state = ContextState::Closing;
    }

    /// Return the slot to its pristine, unreserved state. Runs after
    /// [`ContextInner::close`]; drains and optionally terminates the
    /// debuggee before the handle is dropped.
    pub fn release<K: Kernel>(&mut self, kernel: &K) {
        if let Some(debug) = self.debug.take() {
            self.continue_flags = ContinueFlags::empty();

            while kernel.get_process_debug_event(debug).is_ok() {}
            while kernel.continue_debug_event(debug, self.continue_flags).is_ok() {}

            if self.flags.contains(ContextFlags::TERMINATE_PROCESS) {
                if let Err(e) = kernel.terminate_debug_process(debug) {
                    warn!("failed to terminate debuggee {}: {}", self.pid, e);
                }
                self.process_ended = true;
                self.process_exited = false;
            }

            while kernel.get_process_debug_event(debug).is_ok() {}
            while kernel.continue_debug_event(debug, self.continue_flags).is_ok() {}

            kernel.close_debug(debug);
        }

        self.flags = ContextFlags::empty();
        self.state = ContextState::Disconnected;

        self.wait_target = WaitTarget::ClientAccepted;
        self.continue_flags = ContinueFlags::default_mask();
        self.latest_debug_event = None;
        self.pid = 0;
        self.current_tid = 0;
        self.selected_tid = 0;
        self.selected_continue_tid = 0;
        self.threads.clear();
        self.total_created_threads = 0;
        self.catch_thread_events = false;
        self.enable_external_memory_access = false;
    }
}

fn build_into(mut writer: ResponseWriter<'_>, build: impl FnOnce(&mut ResponseWriter<'_>)) {
    build(&mut writer);
    writer.finish();
}
