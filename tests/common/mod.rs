//! Shared test fixtures: an in-memory kernel and a tiny RSP client.

#![allow(dead_code)]

use gdbserv::arch::ArmCoreRegs;
use gdbserv::common::Pid;
use gdbserv::kernel::ContinueFlags;
use gdbserv::kernel::DebugEvent;
use gdbserv::kernel::DebugEventKind;
use gdbserv::kernel::DebugHandle;
use gdbserv::kernel::EventHandle;
use gdbserv::kernel::ExceptionEvent;
use gdbserv::kernel::Kernel;
use gdbserv::kernel::KernelError;
use gdbserv::kernel::KernelResult;
use gdbserv::kernel::MemPerm;
use gdbserv::kernel::MemRegion;
use gdbserv::kernel::ProcessInfo;
use gdbserv::kernel::WaitObject;
use gdbserv::kernel::WatchKind;
use gdbserv::GdbServer;
use gdbserv::ServerThreads;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

// ===================== mock kernel =====================

/// A scripted stand-in for the kernel debug facility. Processes are
/// plain in-memory records; debug events are queued by the fixtures and
/// drained by the server exactly like the real event queue.
#[derive(Clone)]
pub struct MockKernel {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

#[derive(Default)]
struct State {
    next_handle: u32,
    events: HashMap<u32, bool>,
    procs: HashMap<Pid, MockProcess>,
    debugs: HashMap<u32, Pid>,
}

#[derive(Default)]
struct MockProcess {
    name: String,
    regions: Vec<Region>,
    regs: HashMap<u32, ArmCoreRegs>,
    threads: Vec<u32>,
    queue: VecDeque<DebugEvent>,
    /// events delivered to the debugger but not yet continued
    retrieved: usize,
    running: bool,
    attached: bool,
    dead: bool,
    syscall_mask: Option<[u8; 32]>,
    watchpoints: Vec<(u32, u32, WatchKind)>,
    last_continue_flags: ContinueFlags,
}

struct Region {
    base: u32,
    perm: MemPerm,
    data: Vec<u8>,
}

impl Region {
    fn end(&self) -> u64 {
        self.base as u64 + self.data.len() as u64
    }
}

impl MockKernel {
    pub fn new() -> MockKernel {
        MockKernel {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                cv: Condvar::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared.state.lock().unwrap()
    }

    fn notify(&self) {
        self.shared.cv.notify_all();
    }

    pub fn add_process(&self, pid: Pid, name: &str, threads: &[u32]) {
        let mut st = self.state();
        st.procs.insert(
            pid,
            MockProcess {
                name: name.to_string(),
                threads: threads.to_vec(),
                running: true,
                ..MockProcess::default()
            },
        );
    }

    pub fn add_region(&self, pid: Pid, base: u32, perm: MemPerm, data: Vec<u8>) {
        let mut st = self.state();
        let proc = st.procs.get_mut(&pid).expect("no such process");
        proc.regions.push(Region { base, perm, data });
        proc.regions.sort_by_key(|r| r.base);
    }

    pub fn set_regs(&self, pid: Pid, tid: u32, regs: ArmCoreRegs) {
        self.state()
            .procs
            .get_mut(&pid)
            .expect("no such process")
            .regs
            .insert(tid, regs);
    }

    /// Queue a debug event as if the kernel had stopped the debuggee to
    /// report it.
    pub fn inject_event(&self, pid: Pid, event: DebugEvent) {
        {
            let mut st = self.state();
            let proc = st.procs.get_mut(&pid).expect("no such process");
            proc.queue.push_back(event);
            proc.running = false;
        }
        self.notify();
    }

    /// Attach out-of-band and pre-queue the launch-time event sequence,
    /// emulating a process started under debugger control.
    pub fn launch_suspended(&self, pid: Pid) -> DebugHandle {
        let mut st = self.state();
        let handle = st.alloc_handle();
        st.debugs.insert(handle, pid);
        let proc = st.procs.get_mut(&pid).expect("no such process");
        proc.attached = true;
        proc.running = false;

        let threads = proc.threads.clone();
        proc.queue.push_back(DebugEvent {
            tid: 0,
            kind: DebugEventKind::AttachProcess { pid },
        });
        proc.queue.push_back(DebugEvent {
            tid: threads[0],
            kind: DebugEventKind::Exception(ExceptionEvent::DebuggerBreak),
        });
        proc.queue.push_back(DebugEvent {
            tid: threads[0],
            kind: DebugEventKind::AttachThread { creator_tid: 0 },
        });
        DebugHandle(handle)
    }

    pub fn read_mem(&self, pid: Pid, addr: u32, len: usize) -> Vec<u8> {
        let st = self.state();
        let proc = &st.procs[&pid];
        let mut out = vec![0u8; len];
        proc.read(addr, &mut out).expect("unmapped test read");
        out
    }

    pub fn regs_of(&self, pid: Pid, tid: u32) -> ArmCoreRegs {
        self.state().procs[&pid].regs.get(&tid).copied().unwrap_or_default()
    }

    pub fn is_running(&self, pid: Pid) -> bool {
        self.state().procs[&pid].running
    }

    pub fn is_attached(&self, pid: Pid) -> bool {
        self.state().procs[&pid].attached
    }

    pub fn is_dead(&self, pid: Pid) -> bool {
        self.state().procs[&pid].dead
    }

    pub fn syscall_mask(&self, pid: Pid) -> Option<[u8; 32]> {
        self.state().procs[&pid].syscall_mask
    }

    pub fn watchpoint_count(&self, pid: Pid) -> usize {
        self.state().procs[&pid].watchpoints.len()
    }

    pub fn last_continue_flags(&self, pid: Pid) -> ContinueFlags {
        self.state().procs[&pid].last_continue_flags
    }
}

impl State {
    fn alloc_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn proc_of(&mut self, debug: DebugHandle) -> Result<&mut MockProcess, KernelError<String>> {
        let pid = *self
            .debugs
            .get(&debug.0)
            .ok_or(KernelError::InvalidHandle)?;
        self.procs.get_mut(&pid).ok_or(KernelError::InvalidHandle)
    }
}

impl MockProcess {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), KernelError<String>> {
        let region = self
            .regions
            .iter()
            .find(|r| {
                (r.base as u64) <= addr as u64 && addr as u64 + buf.len() as u64 <= r.end()
            })
            .ok_or_else(|| KernelError::Other("unmapped".to_string()))?;
        let off = (addr - region.base) as usize;
        buf.copy_from_slice(&region.data[off..off + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), KernelError<String>> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| {
                (r.base as u64) <= addr as u64 && addr as u64 + data.len() as u64 <= r.end()
            })
            .ok_or_else(|| KernelError::Other("unmapped".to_string()))?;
        let off = (addr - region.base) as usize;
        region.data[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Kernel for MockKernel {
    type Error = String;

    fn debug_active_process(&self, pid: Pid) -> KernelResult<DebugHandle, String> {
        let mut st = self.state();
        let handle = st.alloc_handle();
        let proc = st
            .procs
            .get_mut(&pid)
            .ok_or_else(|| KernelError::Other("no such process".to_string()))?;
        if proc.attached || proc.dead {
            return Err(KernelError::Other("not debuggable".to_string()));
        }
        proc.attached = true;
        proc.running = false;

        let threads = proc.threads.clone();
        proc.queue.push_back(DebugEvent {
            tid: 0,
            kind: DebugEventKind::AttachProcess { pid },
        });
        for tid in &threads {
            proc.queue.push_back(DebugEvent {
                tid: *tid,
                kind: DebugEventKind::AttachThread { creator_tid: 0 },
            });
        }
        proc.queue.push_back(DebugEvent {
            tid: threads[0],
            kind: DebugEventKind::Exception(ExceptionEvent::AttachBreak),
        });

        st.debugs.insert(handle, pid);
        drop(st);
        self.notify();
        Ok(DebugHandle(handle))
    }

    fn get_process_debug_event(&self, debug: DebugHandle) -> KernelResult<DebugEvent, String> {
        let mut st = self.state();
        let proc = st.proc_of(debug)?;
        match proc.queue.pop_front() {
            Some(event) => {
                proc.retrieved += 1;
                proc.running = false;
                Ok(event)
            }
            None => Err(KernelError::WouldBlock),
        }
    }

    fn continue_debug_event(
        &self,
        debug: DebugHandle,
        flags: ContinueFlags,
    ) -> KernelResult<(), String> {
        let mut st = self.state();
        let proc = st.proc_of(debug)?;
        if proc.retrieved == 0 {
            return Err(KernelError::WouldBlock);
        }
        proc.retrieved -= 1;
        proc.last_continue_flags = flags;
        if proc.retrieved == 0 && proc.queue.is_empty() && !proc.dead {
            proc.running = true;
        }
        Ok(())
    }

    fn break_debug_process(&self, debug: DebugHandle) -> KernelResult<(), String> {
        let mut st = self.state();
        let proc = st.proc_of(debug)?;
        if !proc.running {
            return Err(KernelError::WouldBlock);
        }
        let tid = proc.threads.first().copied().unwrap_or(0);
        proc.queue.push_back(DebugEvent {
            tid,
            kind: DebugEventKind::Exception(ExceptionEvent::UserBreak),
        });
        proc.running = false;
        drop(st);
        self.notify();
        Ok(())
    }

    fn terminate_debug_process(&self, debug: DebugHandle) -> KernelResult<(), String> {
        let mut st = self.state();
        let proc = st.proc_of(debug)?;
        proc.dead = true;
        proc.running = false;
        proc.queue.clear();
        Ok(())
    }

    fn close_debug(&self, debug: DebugHandle) {
        let mut st = self.state();
        if let Some(pid) = st.debugs.remove(&debug.0) {
            if let Some(proc) = st.procs.get_mut(&pid) {
                proc.attached = false;
                if !proc.dead {
                    proc.running = true;
                }
            }
        }
    }

    fn read_process_memory(
        &self,
        debug: DebugHandle,
        addr: u32,
        buf: &mut [u8],
    ) -> KernelResult<(), String> {
        let mut st = self.state();
        st.proc_of(debug)?.read(addr, buf)
    }

    fn write_process_memory(
        &self,
        debug: DebugHandle,
        addr: u32,
        data: &[u8],
    ) -> KernelResult<(), String> {
        let mut st = self.state();
        st.proc_of(debug)?.write(addr, data)
    }

    fn get_thread_context(
        &self,
        debug: DebugHandle,
        tid: u32,
    ) -> KernelResult<ArmCoreRegs, String> {
        let mut st = self.state();
        let proc = st.proc_of(debug)?;
        if !proc.threads.contains(&tid) {
            return Err(KernelError::Other("no such thread".to_string()));
        }
        Ok(proc.regs.get(&tid).copied().unwrap_or_default())
    }

    fn set_thread_context(
        &self,
        debug: DebugHandle,
        tid: u32,
        regs: &ArmCoreRegs,
    ) -> KernelResult<(), String> {
        let mut st = self.state();
        let proc = st.proc_of(debug)?;
        if !proc.threads.contains(&tid) {
            return Err(KernelError::Other("no such thread".to_string()));
        }
        proc.regs.insert(tid, *regs);
        Ok(())
    }

    fn query_memory(&self, debug: DebugHandle, addr: u32) -> KernelResult<MemRegion, String> {
        let mut st = self.state();
        let proc = st.proc_of(debug)?;

        for region in &proc.regions {
            if (region.base as u64) <= addr as u64 && (addr as u64) < region.end() {
                return Ok(MemRegion {
                    base: region.base,
                    size: region.data.len() as u32,
                    perm: region.perm,
                    mapped: true,
                });
            }
        }

        // hole from `addr` up to the next region (or the end of space)
        let next_base = proc
            .regions
            .iter()
            .map(|r| r.base as u64)
            .filter(|&b| b > addr as u64)
            .min()
            .unwrap_or(0x1_0000_0000);
        Ok(MemRegion {
            base: addr,
            size: (next_base - addr as u64) as u32,
            perm: MemPerm::empty(),
            mapped: false,
        })
    }

    fn list_processes(&self) -> KernelResult<Vec<ProcessInfo>, String> {
        let st = self.state();
        let mut procs: Vec<ProcessInfo> = st
            .procs
            .iter()
            .map(|(pid, proc)| ProcessInfo {
                pid: *pid,
                name: proc.name.clone(),
            })
            .collect();
        procs.sort_by_key(|p| p.pid);
        Ok(procs)
    }

    fn set_syscall_mask(
        &self,
        debug: DebugHandle,
        mask: Option<&[u8; 32]>,
    ) -> KernelResult<(), String> {
        let mut st = self.state();
        st.proc_of(debug)?.syscall_mask = mask.copied();
        Ok(())
    }

    fn add_watchpoint(
        &self,
        debug: DebugHandle,
        addr: u32,
        size: u32,
        kind: WatchKind,
    ) -> KernelResult<(), String> {
        let mut st = self.state();
        st.proc_of(debug)?.watchpoints.push((addr, size, kind));
        Ok(())
    }

    fn remove_watchpoint(
        &self,
        debug: DebugHandle,
        addr: u32,
        size: u32,
        kind: WatchKind,
    ) -> KernelResult<(), String> {
        let mut st = self.state();
        let proc = st.proc_of(debug)?;
        let idx = proc
            .watchpoints
            .iter()
            .position(|&w| w == (addr, size, kind))
            .ok_or(KernelError::InvalidHandle)?;
        proc.watchpoints.remove(idx);
        Ok(())
    }

    fn create_event(&self) -> KernelResult<EventHandle, String> {
        let mut st = self.state();
        let handle = st.alloc_handle();
        st.events.insert(handle, false);
        Ok(EventHandle(handle))
    }

    fn signal_event(&self, event: EventHandle) -> KernelResult<(), String> {
        let mut st = self.state();
        match st.events.get_mut(&event.0) {
            Some(signaled) => {
                *signaled = true;
                drop(st);
                self.notify();
                Ok(())
            }
            None => Err(KernelError::InvalidHandle),
        }
    }

    fn clear_event(&self, event: EventHandle) -> KernelResult<(), String> {
        let mut st = self.state();
        match st.events.get_mut(&event.0) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(KernelError::InvalidHandle),
        }
    }

    fn close_event(&self, event: EventHandle) {
        self.state().events.remove(&event.0);
    }

    fn wait_any(
        &self,
        objs: &[WaitObject],
        timeout: Option<Duration>,
    ) -> KernelResult<usize, String> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.state();
        loop {
            for (i, obj) in objs.iter().enumerate() {
                match obj {
                    WaitObject::Event(ev) => {
                        if st.events.get(&ev.0) == Some(&true) {
                            st.events.insert(ev.0, false);
                            return Ok(i);
                        }
                    }
                    WaitObject::Debug(debug) => {
                        if let Some(pid) = st.debugs.get(&debug.0) {
                            if st
                                .procs
                                .get(pid)
                                .map(|p| !p.queue.is_empty())
                                .unwrap_or(false)
                            {
                                return Ok(i);
                            }
                        }
                    }
                }
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(KernelError::TimedOut);
                    }
                    let (guard, _) = self
                        .shared
                        .cv
                        .wait_timeout(st, deadline - now)
                        .unwrap();
                    st = guard;
                }
                None => st = self.shared.cv.wait(st).unwrap(),
            }
        }
    }
}

// ===================== server fixture =====================

static NEXT_PORT_BASE: AtomicU16 = AtomicU16::new(0);

/// Start a server on an unused port range. `range_start` keeps parallel
/// test binaries out of each other's ports.
pub fn start_server(
    kernel: &MockKernel,
    range_start: u16,
) -> (Arc<GdbServer<MockKernel>>, ServerThreads) {
    let _ = pretty_env_logger::try_init();

    for _ in 0..32 {
        let offset = NEXT_PORT_BASE.fetch_add(8, Ordering::SeqCst) % 2048;
        let base = range_start + offset;

        let server = GdbServer::new(kernel.clone(), base).expect("server init");
        let threads = server.spawn().expect("spawn workers");
        if server.wait_started(Duration::from_secs(2)) {
            return (server, threads);
        }

        // bind failure (port collision); retire this instance and retry
        server.request_shutdown();
        threads
            .join_timeout(Duration::from_secs(5))
            .ok()
            .expect("worker shutdown");
    }
    panic!("could not find a free port range");
}

pub fn stop_server(server: &Arc<GdbServer<MockKernel>>, threads: ServerThreads) {
    server.request_shutdown();
    assert!(
        threads.join_timeout(Duration::from_secs(5)).is_ok(),
        "workers failed to shut down in time"
    );
}

// ===================== RSP test client =====================

pub struct GdbClient {
    stream: TcpStream,
    no_ack: bool,
}

impl GdbClient {
    pub fn connect(port: u16) -> GdbClient {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(Duration::from_secs(5)))
                        .unwrap();
                    stream.set_nodelay(true).unwrap();
                    return GdbClient {
                        stream,
                        no_ack: false,
                    };
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20))
                }
                Err(e) => panic!("connect failed: {}", e),
            }
        }
    }

    fn checksum(payload: &[u8]) -> u8 {
        payload.iter().fold(0u8, |a, &b| a.wrapping_add(b))
    }

    fn read_byte(&mut self) -> u8 {
        let mut buf = [0u8];
        self.stream.read_exact(&mut buf).expect("read from server");
        buf[0]
    }

    /// Send a command packet; in ack mode, consume the server's `+`.
    pub fn send_packet(&mut self, payload: &str) {
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.push(b'$');
        frame.extend_from_slice(payload.as_bytes());
        frame.push(b'#');
        frame.extend_from_slice(
            format!("{:02x}", Self::checksum(payload.as_bytes())).as_bytes(),
        );
        self.stream.write_all(&frame).expect("write to server");

        if !self.no_ack {
            let ack = self.read_byte();
            assert_eq!(ack, b'+', "expected ack, got {:?}", ack as char);
        }
    }

    /// Read one `$...#cc` frame, verifying the checksum. Stray acks in
    /// the stream are skipped.
    pub fn read_packet(&mut self) -> String {
        loop {
            let byte = self.read_byte();
            match byte {
                b'+' => continue,
                b'$' => break,
                other => panic!("unexpected byte {:#x} while waiting for packet", other),
            }
        }

        let mut payload = Vec::new();
        loop {
            let byte = self.read_byte();
            if byte == b'#' {
                break;
            }
            payload.push(byte);
        }
        let hi = self.read_byte();
        let lo = self.read_byte();
        let sent = u8::from_str_radix(
            std::str::from_utf8(&[hi, lo]).expect("checksum digits"),
            16,
        )
        .expect("checksum hex");
        assert_eq!(sent, Self::checksum(&payload), "bad checksum from server");

        if !self.no_ack {
            self.stream.write_all(b"+").expect("write ack");
        }

        // expand run-length encoding: `X*c` repeats X (c - 29) more times
        let mut decoded = Vec::with_capacity(payload.len());
        let mut i = 0;
        while i < payload.len() {
            if payload[i] == b'*' {
                let prev = *decoded.last().expect("RLE with no preceding byte");
                let count = payload[i + 1] - 29;
                decoded.extend(std::iter::repeat(prev).take(count as usize));
                i += 2;
            } else {
                decoded.push(payload[i]);
                i += 1;
            }
        }

        String::from_utf8_lossy(&decoded).into_owned()
    }

    pub fn request(&mut self, payload: &str) -> String {
        self.send_packet(payload);
        self.read_packet()
    }

    /// Negotiate no-ack mode, as a real gdb would.
    pub fn enable_no_ack(&mut self) {
        let reply = self.request("QStartNoAckMode");
        assert_eq!(reply, "OK");
        self.no_ack = true;
    }

    /// Send the out-of-band interrupt byte.
    pub fn send_break(&mut self) {
        self.stream.write_all(&[0x03]).expect("write interrupt");
    }

    /// Write raw bytes, bypassing framing (for transport-level tests).
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write raw");
    }

    /// Read one raw byte (for transport-level tests).
    pub fn read_raw_byte(&mut self) -> u8 {
        self.read_byte()
    }
}

/// Poll until `cond` holds, failing the test after `timeout`.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}
