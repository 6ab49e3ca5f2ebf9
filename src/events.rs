//! Debug-event pre-processing and RSP stop-reply synthesis.
//!
//! Every event drained from the kernel passes through [`preprocess`]
//! before it is either surfaced to the client or swallowed and continued.
//! Pre-processing keeps the context bookkeeping (pid, thread table, run
//! state) coherent no matter which path the event takes.

use crate::common::Signal;
use crate::context::ContextInner;
use crate::kernel::DebugEvent;
use crate::kernel::DebugEventKind;
use crate::kernel::ExceptionEvent;
use crate::kernel::ExitReason;
use crate::kernel::Kernel;
use crate::kernel::WatchKind;
use crate::protocol::ResponseWriter;
use log::debug;
use log::warn;

/// What the monitor should do with a pre-processed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Swallowed: continue the debuggee without telling the client.
    Continue,
    /// Emit an `O` console-output packet carrying the payload, then
    /// continue the debuggee.
    Notify(Vec<u8>),
    /// Surface as a stop reply; the debuggee stays stopped.
    Stop,
}

/// Update context bookkeeping for one debug event and decide its fate.
pub(crate) fn preprocess<K: Kernel>(
    inner: &mut ContextInner,
    kernel: &K,
    event: &DebugEvent,
) -> Disposition {
    match &event.kind {
        DebugEventKind::AttachProcess { pid } => {
            inner.pid = *pid;
            inner.process_exited = false;
            inner.process_ended = false;
            debug!("attached to process {}", pid);
            Disposition::Continue
        }

        DebugEventKind::AttachThread { creator_tid } => {
            inner.add_thread(event.tid);
            if inner.current_tid == 0 {
                inner.current_tid = event.tid;
            }
            debug!("thread {} attached (creator {})", event.tid, creator_tid);
            if inner.catch_thread_events {
                Disposition::Stop
            } else {
                Disposition::Continue
            }
        }

        DebugEventKind::ExitThread => {
            if inner.remove_thread(event.tid) {
                inner.process_ended = true;
            }
            if inner.catch_thread_events {
                Disposition::Stop
            } else {
                Disposition::Continue
            }
        }

        DebugEventKind::ExitProcess { reason } => {
            inner.process_ended = true;
            inner.process_exited = matches!(reason, ExitReason::Exited(_));
            Disposition::Stop
        }

        DebugEventKind::Exception(exc) => {
            if event.tid != 0 {
                inner.current_tid = event.tid;
            }
            debug!("exception {:?} on thread {}", exc, event.tid);
            Disposition::Stop
        }

        DebugEventKind::SyscallIn { number } | DebugEventKind::SyscallOut { number } => {
            if svc_mask_contains(&inner.svc_mask, *number) {
                if event.tid != 0 {
                    inner.current_tid = event.tid;
                }
                Disposition::Stop
            } else {
                Disposition::Continue
            }
        }

        DebugEventKind::OutputString { addr, len } => {
            let debug_handle = match inner.debug {
                Some(handle) => handle,
                None => return Disposition::Continue,
            };
            // the payload lives in the debuggee; fetch a bounded amount
            let len = (*len).min(512) as usize;
            let mut data = vec![0u8; len];
            match kernel.read_process_memory(debug_handle, *addr, &mut data) {
                Ok(()) => Disposition::Notify(data),
                Err(e) => {
                    warn!("failed to read debug output string: {}", e);
                    Disposition::Continue
                }
            }
        }
    }
}

pub(crate) fn svc_mask_contains(mask: &[u8; 32], number: u32) -> bool {
    let number = number as usize;
    number < 256 && mask[number / 8] & (1 << (number % 8)) != 0
}

pub(crate) fn svc_mask_insert(mask: &mut [u8; 32], number: u32) {
    let number = number as usize;
    if number < 256 {
        mask[number / 8] |= 1 << (number % 8);
    }
}

/// Map an exception to the GDB signal reported in its `T` stop reply.
fn signal_for(inner: &ContextInner, exc: &ExceptionEvent) -> Signal {
    match exc {
        ExceptionEvent::UndefinedInstruction { addr } => {
            if crate::breakpoints::find(inner, *addr).is_some() {
                Signal::SIGTRAP
            } else {
                Signal::SIGILL
            }
        }
        ExceptionEvent::PrefetchAbort { .. } | ExceptionEvent::DataAbort { .. } => {
            Signal::SIGSEGV
        }
        ExceptionEvent::AttachBreak
        | ExceptionEvent::DebuggerBreak
        | ExceptionEvent::UserBreak
        | ExceptionEvent::Watchpoint { .. } => Signal::SIGTRAP,
    }
}

/// Write the stop reply announcing a surfaced event.
pub(crate) fn write_stop_reply(
    inner: &ContextInner,
    res: &mut ResponseWriter<'_>,
    event: &DebugEvent,
) {
    match &event.kind {
        DebugEventKind::ExitProcess { reason } => match reason {
            ExitReason::Exited(code) => {
                res.write_str("W");
                res.write_hex(*code);
            }
            ExitReason::Terminated => {
                res.write_str("X");
                res.write_hex(Signal::SIGKILL.0);
            }
        },

        DebugEventKind::AttachThread { .. } => {
            res.write_str("T");
            res.write_hex(Signal::SIGTRAP.0);
            res.write_str("create:;thread:");
            res.write_tid(event.tid);
            res.write_str(";");
        }

        DebugEventKind::ExitThread => {
            res.write_str("w00;");
            res.write_num(event.tid as u64);
        }

        DebugEventKind::Exception(exc) => {
            let signal = signal_for(inner, exc);
            res.write_str("T");
            res.write_hex(signal.0);
            res.write_str("thread:");
            res.write_tid(stop_tid(inner, event));
            res.write_str(";");

            match exc {
                ExceptionEvent::UndefinedInstruction { addr }
                    if crate::breakpoints::find(inner, *addr).is_some() =>
                {
                    res.write_str("swbreak:;");
                }
                ExceptionEvent::Watchpoint { kind, fault_addr } => {
                    let reason = match kind {
                        WatchKind::Write => "watch",
                        WatchKind::Read => "rwatch",
                        WatchKind::ReadWrite => "awatch",
                    };
                    res.write_str(reason);
                    res.write_str(":");
                    res.write_num(*fault_addr as u64);
                    res.write_str(";");
                }
                _ => {}
            }
        }

        DebugEventKind::SyscallIn { number } | DebugEventKind::SyscallOut { number } => {
            res.write_str("T");
            res.write_hex(Signal::SIGTRAP.0);
            res.write_str("thread:");
            res.write_tid(stop_tid(inner, event));
            res.write_str(";");
            res.write_str(match event.kind {
                DebugEventKind::SyscallIn { .. } => "syscall_entry:",
                _ => "syscall_return:",
            });
            res.write_num(*number as u64);
            res.write_str(";");
        }

        // never surfaced as stop replies
        DebugEventKind::AttachProcess { .. } | DebugEventKind::OutputString { .. } => {
            res.write_str("T");
            res.write_hex(Signal::SIGTRAP.0);
            res.write_str("thread:");
            res.write_tid(stop_tid(inner, event));
            res.write_str(";");
        }
    }
}

fn stop_tid(inner: &ContextInner, event: &DebugEvent) -> u32 {
    if event.tid != 0 {
        event.tid
    } else if inner.current_tid != 0 {
        inner.current_tid
    } else {
        inner.threads.first().copied().unwrap_or(1)
    }
}

/// Write an `O` console-output packet.
pub(crate) fn write_output_packet(res: &mut ResponseWriter<'_>, data: &[u8]) {
    res.write_str("O");
    res.write_hex_buf(data);
}
