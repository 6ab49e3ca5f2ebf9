//! The monitor worker: pumps kernel debug events and synthesizes the
//! asynchronous stop replies.

use super::lock;
use super::GdbServer;
use crate::context::ContextFlags;
use crate::context::ContextInner;
use crate::context::ContextState;
use crate::context::WaitTarget;
use crate::events;
use crate::events::Disposition;
use crate::kernel::Kernel;
use crate::kernel::KernelError;
use crate::kernel::WaitObject;
use crate::protocol::ResponseWriter;
use log::info;
use log::warn;
use std::sync::Arc;

pub(crate) fn run_monitor<K: Kernel>(server: &Arc<GdbServer<K>>) {
    let kernel = &server.kernel;
    info!("monitor worker running");

    loop {
        // [terminate, status-updated, one wait object per context]
        let mut objs = Vec::with_capacity(2 + server.ctxs.len());
        objs.push(WaitObject::Event(server.shall_terminate));
        objs.push(WaitObject::Event(server.status_updated));
        for ctx in &server.ctxs {
            objs.push(lock(&ctx.inner).wait_object());
        }

        let idx = match kernel.wait_any(&objs, None) {
            Ok(idx) => idx,
            Err(e) => {
                warn!("monitor wait failed: {}", e);
                break;
            }
        };

        if idx == 0 || server.is_terminating() {
            break;
        }
        if idx == 1 {
            // some context changed shape; re-collect the wait set
            continue;
        }

        let ctx = &server.ctxs[idx - 2];
        let mut inner = lock(&ctx.inner);

        if inner.state != ContextState::Connected {
            continue;
        }

        match inner.wait_target {
            WaitTarget::ClientAccepted => {
                // accept prelude done; debuggee is stopped at its attach
                // break until the client asks to run
                inner.wait_target = WaitTarget::Continued;
            }
            WaitTarget::Continued => {
                if let Some(debug) = inner.debug {
                    match kernel.continue_debug_event(debug, inner.continue_flags) {
                        Ok(()) | Err(KernelError::WouldBlock) => {
                            inner.wait_target = WaitTarget::DebugEvents;
                        }
                        Err(e) => warn!("continue failed for pid {}: {}", inner.pid, e),
                    }
                }
            }
            WaitTarget::DebugEvents => handle_debug_events(server, &mut inner),
        }
    }

    info!("monitor worker exiting");
}

/// Drain pending debug events, pre-process each, and surface the first
/// stop to the client. Swallowed events are auto-continued.
fn handle_debug_events<K: Kernel>(server: &GdbServer<K>, inner: &mut ContextInner) {
    let kernel = &server.kernel;
    let debug = match inner.debug {
        Some(debug) => debug,
        None => {
            inner.wait_target = WaitTarget::Continued;
            return;
        }
    };

    loop {
        let event = match kernel.get_process_debug_event(debug) {
            Ok(event) => event,
            Err(KernelError::WouldBlock) => return,
            Err(e) => {
                // one broken fetch is not a session failure; a dead
                // handle is
                warn!("debug event fetch failed for pid {}: {}", inner.pid, e);
                let mut buf = Vec::new();
                let mut res = ResponseWriter::new(&mut buf);
                events::write_output_packet(
                    &mut res,
                    format!("debug event fetch failed: {}\n", e).as_bytes(),
                );
                res.finish();
                let _ = inner.send_frame(buf);

                if matches!(e, KernelError::InvalidHandle) {
                    inner.state = ContextState::Closing;
                }
                inner.wait_target = WaitTarget::Continued;
                return;
            }
        };

        match events::preprocess(inner, kernel, &event) {
            Disposition::Continue => {
                if let Err(e) = kernel.continue_debug_event(debug, inner.continue_flags) {
                    warn!("auto-continue failed for pid {}: {}", inner.pid, e);
                }
            }
            Disposition::Notify(data) => {
                let mut buf = Vec::new();
                let mut res = ResponseWriter::new(&mut buf);
                events::write_output_packet(&mut res, &data);
                res.finish();
                if let Err(e) = inner.send_frame(buf) {
                    warn!("failed to send output packet: {}", e);
                }
                if let Err(e) = kernel.continue_debug_event(debug, inner.continue_flags) {
                    warn!("auto-continue failed for pid {}: {}", inner.pid, e);
                }
            }
            Disposition::Stop => {
                // the event is left pending in the kernel; that is what
                // keeps the debuggee stopped until the next continue
                let mut buf = Vec::new();
                let mut res = ResponseWriter::new(&mut buf);
                events::write_stop_reply(inner, &mut res, &event);
                res.finish();

                inner.latest_debug_event = Some(event);
                if let Err(e) = inner.send_frame(buf) {
                    warn!("failed to send stop reply: {}", e);
                }
                inner.flags.remove(ContextFlags::PROCESS_CONTINUING);
                inner.wait_target = WaitTarget::Continued;
                return;
            }
        }
    }
}
