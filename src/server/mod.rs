//! The RSP server: context pool, port allocator, and the two cooperating
//! workers (socket + monitor).

mod monitor;
mod socket;

use crate::common::Pid;
use crate::common::PID_NEXT_APPLICATION;
use crate::context::ContextFlags;
use crate::context::ContextInner;
use crate::context::ContextState;
use crate::context::GdbContext;
use crate::error::Error;
use crate::kernel::DebugEventKind;
use crate::kernel::DebugHandle;
use crate::kernel::EventHandle;
use crate::kernel::ExceptionEvent;
use crate::kernel::Kernel;
use crate::kernel::KernelError;
use crate::kernel::WaitObject;
use crate::watchpoints::WatchpointManager;
use log::info;
use log::warn;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::MutexGuard;
use std::thread;
use std::time::Duration;
use std::time::Instant;

/// Number of simultaneous debugger contexts (and bound ports).
pub const MAX_DEBUG: usize = 4;

/// Default first port of the four-port listener range.
pub const GDB_PORT_BASE: u16 = 4000;

/// Upper bound on how long an accept prelude may wait for the kernel to
/// deliver the attach events.
const ATTACH_WAIT: Duration = Duration::from_secs(5);

/// The GDB server. One instance per debugger-enable session; both workers
/// own an `Arc` to it, and teardown happens when the last owner drops.
pub struct GdbServer<K: Kernel> {
    pub(crate) kernel: K,
    pub(crate) ctxs: Vec<GdbContext>,
    pub(crate) watchpoints: WatchpointManager,
    port_base: u16,

    pub(crate) shall_terminate: EventHandle,
    pub(crate) status_updated: EventHandle,
    pub(crate) started: EventHandle,
    terminating: AtomicBool,

    next_application: std::sync::Mutex<Option<usize>>,
}

/// Introspection snapshot of one context, for the host UI.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    pub flags: ContextFlags,
    pub state: ContextState,
    pub local_port: u16,
    pub pid: Pid,
    pub attached: bool,
    pub process_exited: bool,
    pub nb_threads: usize,
    pub total_created_threads: u32,
    pub nb_breakpoints: usize,
    pub nb_watchpoints: usize,
}

/// Join handles for the two workers, with the bounded join the host UI
/// requires.
pub struct ServerThreads {
    socket: thread::JoinHandle<()>,
    monitor: thread::JoinHandle<()>,
}

impl ServerThreads {
    /// Wait for both workers to exit, giving up after `timeout`.
    pub fn join_timeout(self, timeout: Duration) -> Result<(), ServerThreads> {
        let deadline = Instant::now() + timeout;
        while !self.socket.is_finished() || !self.monitor.is_finished() {
            if Instant::now() >= deadline {
                return Err(self);
            }
            thread::sleep(Duration::from_millis(10));
        }
        if self.socket.join().is_err() {
            warn!("socket worker panicked");
        }
        if self.monitor.join().is_err() {
            warn!("monitor worker panicked");
        }
        Ok(())
    }
}

impl<K: Kernel + 'static> GdbServer<K> {
    /// Spawn the socket and monitor workers.
    pub fn spawn(self: &Arc<Self>) -> Result<ServerThreads, Error<K::Error>> {
        let server = Arc::clone(self);
        let socket = thread::Builder::new()
            .name("gdbserv-socket".into())
            .spawn(move || socket::run_socket_worker(&server))
            .map_err(Error::ServerInit)?;

        let server = Arc::clone(self);
        let monitor = thread::Builder::new()
            .name("gdbserv-monitor".into())
            .spawn(move || monitor::run_monitor(&server))
            .map_err(Error::ServerInit)?;

        Ok(ServerThreads { socket, monitor })
    }
}

impl<K: Kernel> GdbServer<K> {
    /// Create a server with `MAX_DEBUG` pristine contexts. No port is
    /// bound until [`GdbServer::spawn`] starts the workers.
    pub fn new(kernel: K, port_base: u16) -> Result<Arc<GdbServer<K>>, Error<K::Error>> {
        let shall_terminate = kernel.create_event().map_err(Error::Kernel)?;
        let status_updated = kernel.create_event().map_err(Error::Kernel)?;
        let started = kernel.create_event().map_err(Error::Kernel)?;

        let mut ctxs = Vec::with_capacity(MAX_DEBUG);
        for _ in 0..MAX_DEBUG {
            let client_accepted = kernel.create_event().map_err(Error::Kernel)?;
            let continued = kernel.create_event().map_err(Error::Kernel)?;
            ctxs.push(GdbContext::new(client_accepted, continued));
        }

        Ok(Arc::new(GdbServer {
            kernel,
            ctxs,
            watchpoints: WatchpointManager::new(),
            port_base,
            shall_terminate,
            status_updated,
            started,
            terminating: AtomicBool::new(false),
            next_application: std::sync::Mutex::new(None),
        }))
    }

    /// Block until the socket worker has bound its listeners.
    pub fn wait_started(&self, timeout: Duration) -> bool {
        self.kernel
            .wait_any(&[WaitObject::Event(self.started)], Some(timeout))
            .is_ok()
    }

    /// Ask both workers to wind down.
    pub fn request_shutdown(&self) {
        self.terminating.store(true, Ordering::SeqCst);
        let _ = self.kernel.signal_event(self.shall_terminate);
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    pub fn port_base(&self) -> u16 {
        self.port_base
    }

    // ------------------ context pool ------------------

    /// Acquire every context lock, in index order. Dropping the returned
    /// guard set releases them in reverse, keeping the composite lock
    /// order total.
    pub fn lock_all_contexts(&self) -> AllContexts<'_> {
        AllContexts(
            self.ctxs
                .iter()
                .map(|ctx| lock(&ctx.inner))
                .collect(),
        )
    }

    /// Reserve a free context on the lowest unused port in
    /// `[min_port, max_port)`. Returns the context index and its port.
    pub fn select_available_context(
        &self,
        min_port: u16,
        max_port: u16,
    ) -> Option<(usize, u16)> {
        let mut all = self.lock_all_contexts();

        let id = (0..MAX_DEBUG)
            .find(|&i| !all.0[i].flags.contains(ContextFlags::SELECTED))?;

        let port = (min_port..max_port).find(|&port| {
            !all.0.iter().any(|inner| {
                inner.flags.contains(ContextFlags::SELECTED) && inner.local_port == port
            })
        });

        match port {
            Some(port) => {
                let inner = &mut all.0[id];
                inner.flags.insert(ContextFlags::SELECTED);
                inner.local_port = port;
                info!("context {} reserved on port {}", id, port);
                Some((id, port))
            }
            None => {
                // defensive: a failed reservation must leave the slot free
                all.0[id].flags.remove(ContextFlags::SELECTED);
                all.0[id].local_port = 0;
                None
            }
        }
    }

    /// Bind a debuggee PID to a reserved (but unconnected) context.
    pub fn set_context_pid(&self, id: usize, pid: Pid) -> bool {
        let ctx = match self.ctxs.get(id) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = lock(&ctx.inner);
        if inner.flags.contains(ContextFlags::SELECTED)
            && !inner.flags.contains(ContextFlags::USED)
        {
            inner.pid = pid;
            true
        } else {
            false
        }
    }

    /// Reserve the "next application" slot (the fourth port). Idempotent;
    /// returns the port a client should connect to.
    pub fn debug_next_application(&self) -> Option<u16> {
        let mut next = lock(&self.next_application);

        if next.is_none() {
            *next =
                self.select_available_context(self.port_base + 3, self.port_base + 4)
                    .map(|(id, _)| id);
        }
        let id = (*next)?;

        let mut inner = lock(&self.ctxs[id].inner);
        inner.debug = None;
        inner.pid = PID_NEXT_APPLICATION;
        Some(inner.local_port)
    }

    /// Store the externally supplied debug handle into the reserved
    /// "next application" slot. A `None` handle cancels the reservation.
    pub fn set_next_application_debug_handle(&self, debug: Option<DebugHandle>) {
        let mut next = lock(&self.next_application);
        let id = match next.take() {
            Some(id) => id,
            None => return,
        };

        let mut all = self.lock_all_contexts();
        let inner = &mut all.0[id];
        match debug {
            Some(debug) => {
                inner.debug = Some(debug);
                inner.flags.insert(ContextFlags::ATTACHED_AT_START);
            }
            None => {
                inner.flags = ContextFlags::empty();
                inner.local_port = 0;
                inner.pid = 0;
            }
        }
    }

    /// Introspection for the host UI.
    pub fn snapshot(&self) -> Vec<ContextSnapshot> {
        self.ctxs
            .iter()
            .map(|ctx| {
                let inner = lock(&ctx.inner);
                ContextSnapshot {
                    flags: inner.flags,
                    state: inner.state,
                    local_port: inner.local_port,
                    pid: inner.pid,
                    attached: inner.debug.is_some(),
                    process_exited: inner.process_exited,
                    nb_threads: inner.threads.len(),
                    total_created_threads: inner.total_created_threads,
                    nb_breakpoints: inner.breakpoints.len(),
                    nb_watchpoints: inner.watchpoints.len(),
                }
            })
            .collect()
    }

    /// Find the reserved context listening on `port` and mark it used.
    /// This is the socket-layer alloc callback.
    pub(crate) fn get_client(&self, port: u16) -> Option<usize> {
        let mut all = self.lock_all_contexts();
        let id = (0..MAX_DEBUG).find(|&i| {
            all.0[i].flags.contains(ContextFlags::SELECTED)
                && all.0[i].local_port == port
                && !all.0[i].flags.contains(ContextFlags::USED)
        })?;

        all.0[id].flags.insert(ContextFlags::USED);
        Some(id)
    }
}

/// Ordered guard set returned by [`GdbServer::lock_all_contexts`].
pub struct AllContexts<'a>(pub(crate) Vec<MutexGuard<'a, ContextInner>>);

impl Drop for AllContexts<'_> {
    fn drop(&mut self) {
        // release in reverse acquisition order
        while self.0.pop().is_some() {}
    }
}

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<K: Kernel> Drop for GdbServer<K> {
    fn drop(&mut self) {
        for ctx in &self.ctxs {
            let inner = lock(&ctx.inner);
            self.kernel.close_event(inner.client_accepted);
            self.kernel.close_event(inner.continued);
        }
        self.kernel.close_event(self.shall_terminate);
        self.kernel.close_event(self.status_updated);
        self.kernel.close_event(self.started);
        info!("gdb server finalized");
    }
}

/// Attach to the context's debuggee (unless a handle was supplied up
/// front) and drain the kernel's attach prelude, pre-processing every
/// event until the break exception that leaves the debuggee stopped under
/// debugger control.
pub(crate) fn attach_prelude<K: Kernel>(
    inner: &mut ContextInner,
    kernel: &K,
) -> Result<(), Error<K::Error>> {
    if inner.flags.contains(ContextFlags::ATTACHED_AT_START) {
        let debug = inner
            .debug
            .ok_or(Error::Kernel(KernelError::InvalidHandle))?;

        // drain-and-continue until the launch break is observed; the
        // queue shape is the kernel's business, not ours
        let mut break_event = None;
        let deadline = Instant::now() + ATTACH_WAIT;
        while break_event.is_none() {
            match kernel.get_process_debug_event(debug) {
                Ok(event) => {
                    crate::events::preprocess(inner, kernel, &event);
                    let is_break = matches!(
                        event.kind,
                        DebugEventKind::Exception(ExceptionEvent::DebuggerBreak)
                            | DebugEventKind::Exception(ExceptionEvent::AttachBreak)
                    );
                    kernel
                        .continue_debug_event(debug, inner.continue_flags)
                        .map_err(Error::Kernel)?;
                    if is_break {
                        break_event = Some(event);
                    }
                }
                Err(KernelError::WouldBlock) => {
                    wait_debug(kernel, debug, deadline)?;
                }
                Err(e) => return Err(Error::Kernel(e)),
            }
        }

        // the next event is the initial thread coming under debugger
        // control; pre-process it but leave it pending so the debuggee
        // stays stopped
        wait_debug(kernel, debug, Instant::now() + ATTACH_WAIT)?;
        let event = kernel.get_process_debug_event(debug).map_err(Error::Kernel)?;
        crate::events::preprocess(inner, kernel, &event);

        inner.latest_debug_event = break_event;
    } else {
        let debug = kernel
            .debug_active_process(inner.pid)
            .map_err(Error::Kernel)?;
        inner.debug = Some(debug);

        let deadline = Instant::now() + ATTACH_WAIT;
        loop {
            match kernel.get_process_debug_event(debug) {
                Ok(event) => {
                    crate::events::preprocess(inner, kernel, &event);
                    if matches!(
                        event.kind,
                        DebugEventKind::Exception(ExceptionEvent::AttachBreak)
                    ) {
                        // left pending: this is what keeps the debuggee
                        // stopped, and what `?` reports
                        inner.latest_debug_event = Some(event);
                        break;
                    }
                    kernel
                        .continue_debug_event(debug, inner.continue_flags)
                        .map_err(Error::Kernel)?;
                }
                Err(KernelError::WouldBlock) => {
                    wait_debug(kernel, debug, deadline)?;
                }
                Err(e) => return Err(Error::Kernel(e)),
            }
        }
    }

    Ok(())
}

fn wait_debug<K: Kernel>(
    kernel: &K,
    debug: DebugHandle,
    deadline: Instant,
) -> Result<(), Error<K::Error>> {
    let now = Instant::now();
    if now >= deadline {
        return Err(Error::Kernel(KernelError::TimedOut));
    }
    kernel
        .wait_any(&[WaitObject::Debug(debug)], Some(deadline - now))
        .map_err(Error::Kernel)?;
    Ok(())
}
