//! Command dispatch: one handler per RSP command letter, with query
//! (`q`/`Q`) and verbose (`v`) sub-dispatchers.

mod mem;
mod monitor_cmd;
mod query;
mod regs;
mod resume;
mod stop_point;
mod xfer;

use crate::context::ContextFlags;
use crate::context::ContextInner;
use crate::error::errno;
use crate::error::HandlerError;
use crate::error::HandlerResult;
use crate::kernel::Kernel;
use crate::protocol::common::hex::decode_hex;
use crate::watchpoints::WatchpointManager;
use log::warn;

pub(crate) use resume::handle_break;

/// Why a handler asked for the session to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DisconnectReason {
    /// `D`: orderly detach, leave the debuggee running.
    Detach,
    /// `k` / `vKill`: kill the debuggee on teardown.
    Kill,
}

/// What the dispatcher should do after a handler returns.
pub(crate) enum HandlerStatus {
    /// The handler already sent its reply (or the command has none).
    Handled,
    /// Send an `OK` reply.
    NeedsOk,
    /// Close the session.
    Disconnect(DisconnectReason),
}

/// Everything a packet handler may touch: the locked context, the kernel,
/// and the server-wide watchpoint pool.
pub(crate) struct Session<'a, K: Kernel> {
    pub inner: &'a mut ContextInner,
    pub kernel: &'a K,
    pub watchpoints: &'a WatchpointManager,
}

/// Route one command body (the packet payload, `$`/`#cc` stripped) to its
/// handler.
pub(crate) fn dispatch<K: Kernel>(
    sess: &mut Session<'_, K>,
    body: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let (&mut cmd, args) = match body.split_first_mut() {
        Some(split) => split,
        None => return unsupported(sess),
    };

    match cmd {
        b'?' => resume::handle_stop_reason(sess),
        b'c' | b'C' => resume::handle_continue(sess, args, false),
        b's' | b'S' => resume::handle_continue(sess, args, true),
        b'D' => handle_detach(sess),
        b'g' => regs::handle_read_registers(sess),
        b'G' => regs::handle_write_registers(sess, args),
        b'H' => handle_set_thread(sess, args),
        b'k' => handle_kill(sess),
        b'm' => mem::handle_read_memory(sess, args),
        b'M' => mem::handle_write_memory(sess, args),
        b'X' => mem::handle_write_memory_raw(sess, args),
        b'p' => regs::handle_read_register(sess, args),
        b'P' => regs::handle_write_register(sess, args),
        b'q' | b'Q' => query::dispatch(sess, cmd, args),
        b'T' => handle_thread_alive(sess, args),
        b'v' => dispatch_verbose(sess, args),
        b'z' | b'Z' => stop_point::handle_toggle(sess, cmd, args),
        b'!' => {
            sess.inner.flags.insert(ContextFlags::EXTENDED_REMOTE);
            Ok(HandlerStatus::NeedsOk)
        }
        _ => {
            warn!("unsupported command {:?}", cmd as char);
            unsupported(sess)
        }
    }
}

/// Protocol-defined "unsupported": the empty packet, never an error.
pub(crate) fn unsupported<K: Kernel>(
    sess: &mut Session<'_, K>,
) -> HandlerResult<HandlerStatus, K::Error> {
    sess.inner.send_reply(|_| {})?;
    Ok(HandlerStatus::Handled)
}

/// Verbose (`v`) commands dispatch on the token up to `;` or `:`.
fn dispatch_verbose<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let (name, rest) = split_at_any(args, b";:");

    match &*name {
        b"Cont?" => {
            sess.inner.send_reply(|res| res.write_str("vCont;c;C;s;S;t"))?;
            Ok(HandlerStatus::Handled)
        }
        b"Cont" => resume::handle_vcont(sess, rest),
        b"Attach" => resume::handle_vattach(sess, rest),
        b"Kill" => handle_vkill(sess, rest),
        // vRun and friends: deliberately unsupported
        _ => unsupported(sess),
    }
}

fn handle_detach<K: Kernel>(
    sess: &mut Session<'_, K>,
) -> HandlerResult<HandlerStatus, K::Error> {
    sess.inner.send_reply(|res| res.write_str("OK"))?;
    Ok(HandlerStatus::Disconnect(DisconnectReason::Detach))
}

fn handle_kill<K: Kernel>(_sess: &mut Session<'_, K>) -> HandlerResult<HandlerStatus, K::Error> {
    // `k` has no reply; the TCP close is the acknowledgement
    Ok(HandlerStatus::Disconnect(DisconnectReason::Kill))
}

fn handle_vkill<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &[u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let pid: u32 = parse_hex(args)?;
    if pid != sess.inner.pid {
        return Err(HandlerError::Errno(errno::INVALID_ARG));
    }
    sess.inner.send_reply(|res| res.write_str("OK"))?;
    Ok(HandlerStatus::Disconnect(DisconnectReason::Kill))
}

fn handle_set_thread<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &[u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let (&op, tid) = args
        .split_first()
        .ok_or(HandlerError::Errno(errno::INVALID_ARG))?;
    let tid = parse_tid(tid)?;

    match (op, tid) {
        (b'g', TidSelector::Id(tid)) => sess.inner.selected_tid = tid,
        (b'g', TidSelector::Any) => sess.inner.selected_tid = 0,
        // "all" only makes sense for continue-class commands
        (b'g', TidSelector::All) => return Err(HandlerError::Errno(errno::INVALID_ARG)),
        (b'c', TidSelector::Id(tid)) => sess.inner.selected_continue_tid = tid,
        (b'c', TidSelector::Any) | (b'c', TidSelector::All) => {
            sess.inner.selected_continue_tid = 0
        }
        _ => return Err(HandlerError::Errno(errno::INVALID_ARG)),
    }

    Ok(HandlerStatus::NeedsOk)
}

fn handle_thread_alive<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &[u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    match parse_tid(args)? {
        TidSelector::Id(tid) if sess.inner.is_thread_alive(tid) => Ok(HandlerStatus::NeedsOk),
        _ => Err(HandlerError::Errno(errno::GENERIC)),
    }
}

// ------------------ shared parsing helpers ------------------

/// Thread-id as carried by `H`, `T` and `vCont` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TidSelector {
    /// `-1`
    All,
    /// `0`
    Any,
    Id(u32),
}

pub(crate) fn parse_tid<E>(buf: &[u8]) -> HandlerResult<TidSelector, E> {
    match buf {
        b"-1" => Ok(TidSelector::All),
        b"0" => Ok(TidSelector::Any),
        _ => {
            let tid: u32 = parse_hex(buf)?;
            Ok(TidSelector::Id(tid))
        }
    }
}

pub(crate) fn parse_hex<I, E>(buf: &[u8]) -> HandlerResult<I, E>
where
    I: num_traits::FromPrimitive
        + num_traits::Zero
        + num_traits::CheckedAdd
        + num_traits::CheckedMul,
{
    decode_hex(buf).map_err(|_| HandlerError::Errno(errno::INVALID_ARG))
}

/// Split at the first occurrence of any byte in `seps`; the separator is
/// consumed. Without a separator the whole buffer is the head.
pub(crate) fn split_at_any<'a>(buf: &'a mut [u8], seps: &[u8]) -> (&'a mut [u8], &'a mut [u8]) {
    match buf.iter().position(|b| seps.contains(b)) {
        Some(pos) => {
            let (head, rest) = buf.split_at_mut(pos);
            (head, &mut rest[1..])
        }
        None => {
            let len = buf.len();
            let (head, rest) = buf.split_at_mut(len);
            (head, rest)
        }
    }
}
