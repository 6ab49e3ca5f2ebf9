//! Execution control: `?`, `c`/`C`/`s`/`S`, `vCont`, `vAttach` and the
//! `\x03` interrupt byte.
//!
//! Continue-class handlers never reply themselves; they flip
//! `PROCESS_CONTINUING` and the reply arrives later as an asynchronous
//! stop packet from the monitor worker.

use super::parse_tid;
use super::split_at_any;
use super::HandlerStatus;
use super::Session;
use super::TidSelector;
use crate::common::Signal;
use crate::context::ContextFlags;
use crate::context::ContextInner;
use crate::error::errno;
use crate::error::HandlerError;
use crate::error::HandlerResult;
use crate::events;
use crate::kernel::ContinueFlags;
use crate::kernel::Kernel;
use crate::protocol::ResponseWriter;
use log::debug;

pub(crate) fn handle_stop_reason<K: Kernel>(
    sess: &mut Session<'_, K>,
) -> HandlerResult<HandlerStatus, K::Error> {
    let frame = stop_reason_frame(sess.inner);
    sess.inner.send_frame(frame)?;
    Ok(HandlerStatus::Handled)
}

/// Build the reply re-announcing the most recent stop. `?` never
/// initiates a stop of its own.
pub(crate) fn stop_reason_frame(inner: &ContextInner) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut res = ResponseWriter::new(&mut buf);
    match &inner.latest_debug_event {
        Some(event) => events::write_stop_reply(inner, &mut res, event),
        None => {
            res.write_str("T");
            res.write_hex(Signal::SIGTRAP.0);
            res.write_str("thread:");
            res.write_tid(inner.current_tid.max(1));
            res.write_str(";");
        }
    }
    res.finish();
    buf
}

/// `c` / `C<sig>` / `s` / `S<sig>`. The signal, if present, is parsed and
/// deliberately ignored: injecting signals into the debuggee is not
/// supported, and silently dropping the whole packet would stall the
/// client.
pub(crate) fn handle_continue<K: Kernel>(
    sess: &mut Session<'_, K>,
    _args: &[u8],
    step: bool,
) -> HandlerResult<HandlerStatus, K::Error> {
    resume(sess.inner, step)
}

fn resume<E>(inner: &mut ContextInner, step: bool) -> HandlerResult<HandlerStatus, E> {
    if inner.debug.is_none() {
        return Err(HandlerError::Errno(errno::GENERIC));
    }

    if inner.process_ended {
        // nothing left to run; re-announce the exit instead of wedging
        // the client in a wait for a stop reply that cannot come
        let frame = stop_reason_frame(inner);
        inner
            .send_frame(frame)
            .map_err(|e| HandlerError::Fatal(e.into()))?;
        return Ok(HandlerStatus::Handled);
    }

    inner
        .continue_flags
        .set(ContinueFlags::SINGLE_STEP, step);
    inner.flags.insert(ContextFlags::PROCESS_CONTINUING);
    debug!(
        "resuming pid {} ({})",
        inner.pid,
        if step { "step" } else { "continue" }
    );
    Ok(HandlerStatus::Handled)
}

/// `vCont;action[:tid][;action[:tid]...]`
///
/// All-stop target: the first matching continue/step action resumes the
/// whole process; `t` requests a stop.
pub(crate) fn handle_vcont<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let inner = &mut *sess.inner;

    let mut resume_step: Option<bool> = None;
    let mut stop_requested = false;

    let mut rest = args;
    while !rest.is_empty() {
        let (action, tail) = split_at_any(rest, b";");
        rest = tail;
        if action.is_empty() {
            continue;
        }

        let (kind, tid) = split_at_any(action, b":");
        let applies = match tid {
            [] => true,
            tid => match parse_tid::<K::Error>(tid)? {
                TidSelector::All | TidSelector::Any => true,
                TidSelector::Id(tid) => {
                    inner.is_thread_alive(tid)
                        && (inner.selected_continue_tid == 0
                            || inner.selected_continue_tid == tid)
                }
            },
        };
        if !applies {
            continue;
        }

        match kind.first() {
            Some(b'c') | Some(b'C') => resume_step.get_or_insert(false),
            Some(b's') | Some(b'S') => resume_step.get_or_insert(true),
            Some(b't') => {
                stop_requested = true;
                continue;
            }
            _ => return Err(HandlerError::Errno(errno::INVALID_ARG)),
        };
    }

    if stop_requested {
        // the continue-flag edge in the packet loop turns this into a
        // kernel break request
        inner.flags.remove(ContextFlags::PROCESS_CONTINUING);
        return Ok(HandlerStatus::Handled);
    }

    match resume_step {
        Some(step) => resume(inner, step),
        None => Err(HandlerError::Errno(errno::INVALID_ARG)),
    }
}

/// `vAttach;<pid>`: attach to a running process on a context that is not
/// yet bound to a debuggee.
pub(crate) fn handle_vattach<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let pid: u32 = super::parse_hex(args)?;

    if sess.inner.debug.is_some() {
        if pid == sess.inner.pid {
            // already attached (the usual reserved-slot path); report the
            // attach stop
            let frame = stop_reason_frame(sess.inner);
            sess.inner.send_frame(frame)?;
            return Ok(HandlerStatus::Handled);
        }
        return Err(HandlerError::Errno(errno::GENERIC));
    }

    sess.inner.pid = pid;
    crate::server::attach_prelude(sess.inner, sess.kernel)
        .map_err(|_| HandlerError::Errno(errno::GENERIC))?;
    sess.kernel
        .signal_event(sess.inner.client_accepted)
        .map_err(|_| HandlerError::Errno(errno::GENERIC))?;

    let frame = stop_reason_frame(sess.inner);
    sess.inner.send_frame(frame)?;
    Ok(HandlerStatus::Handled)
}

/// A lone `\x03` byte: asynchronous interrupt. Clearing the continuing
/// flag makes the packet loop issue the kernel break request; the monitor
/// answers with the resulting stop reply.
pub(crate) fn handle_break(inner: &mut ContextInner) {
    if inner.flags.contains(ContextFlags::PROCESS_CONTINUING) {
        debug!("client interrupt, breaking pid {}", inner.pid);
        inner.flags.remove(ContextFlags::PROCESS_CONTINUING);
    }
}
