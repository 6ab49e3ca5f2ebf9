//! `q` / `Q` queries, dispatched on the token up to the first `:` or `,`.

use super::monitor_cmd;
use super::split_at_any;
use super::unsupported;
use super::xfer;
use super::HandlerStatus;
use super::Session;
use crate::error::errno;
use crate::error::ErrnoExt;
use crate::error::HandlerError;
use crate::error::HandlerResult;
use crate::events::svc_mask_insert;
use crate::kernel::Kernel;
use crate::protocol::GDB_BUF_LEN;

// the advertised PacketSize below is spelled out in the reply string
const _: () = assert!(GDB_BUF_LEN == 0x800);

const SUPPORTED_REPLY: &str = "PacketSize=800\
    ;qXfer:features:read+\
    ;qXfer:memory-map:read+\
    ;qXfer:threads:read+\
    ;qXfer:osdata:read+\
    ;QStartNoAckMode+\
    ;QThreadEvents+\
    ;QCatchSyscalls+\
    ;vContSupported+\
    ;swbreak+\
    ;hwbreak+";

pub(crate) fn dispatch<K: Kernel>(
    sess: &mut Session<'_, K>,
    cmd: u8,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let (name, rest) = split_at_any(args, b":,");

    match (cmd, &*name) {
        (b'q', b"Supported") => {
            // `rest` carries the client's feature list; nothing in it
            // changes what this server can do
            sess.inner.send_reply(|res| res.write_str(SUPPORTED_REPLY))?;
            Ok(HandlerStatus::Handled)
        }

        (b'q', b"Attached") => {
            // always "attached to an existing process"
            sess.inner.send_reply(|res| res.write_str("1"))?;
            Ok(HandlerStatus::Handled)
        }

        (b'q', b"C") => {
            let tid = sess.inner.current_tid;
            sess.inner.send_reply(|res| {
                res.write_str("QC");
                res.write_tid(tid);
            })?;
            Ok(HandlerStatus::Handled)
        }

        (b'q', b"fThreadInfo") => {
            let tids = sess.inner.threads.clone();
            sess.inner.send_reply(|res| {
                if tids.is_empty() {
                    res.write_str("l");
                    return;
                }
                res.write_str("m");
                for (i, tid) in tids.iter().enumerate() {
                    if i != 0 {
                        res.write_str(",");
                    }
                    res.write_num(*tid as u64);
                }
            })?;
            Ok(HandlerStatus::Handled)
        }

        (b'q', b"sThreadInfo") => {
            // the whole list fits in one `qfThreadInfo` reply
            sess.inner.send_reply(|res| res.write_str("l"))?;
            Ok(HandlerStatus::Handled)
        }

        (b'q', b"Xfer") => xfer::handle(sess, rest),

        (b'q', b"Rcmd") => monitor_cmd::handle(sess, rest),

        (b'Q', b"StartNoAckMode") => {
            // the OK reply still goes through the ack handshake; only
            // frames after it run bare
            sess.inner.no_ack = true;
            Ok(HandlerStatus::NeedsOk)
        }

        (b'Q', b"ThreadEvents") => {
            sess.inner.catch_thread_events = match &*rest {
                b"0" => false,
                b"1" => true,
                _ => return Err(HandlerError::Errno(errno::INVALID_ARG)),
            };
            Ok(HandlerStatus::NeedsOk)
        }

        (b'Q', b"CatchSyscalls") => handle_catch_syscalls(sess, rest),

        _ => unsupported(sess),
    }
}

/// `QCatchSyscalls:0` disarms; `QCatchSyscalls:1[;sysno...]` arms the
/// given syscall numbers (all of them when none are listed).
fn handle_catch_syscalls<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let debug = sess
        .inner
        .debug
        .ok_or(HandlerError::Errno(errno::GENERIC))?;

    let (mode, mut rest) = split_at_any(args, b";");
    match &*mode {
        b"0" => {
            sess.inner.svc_mask = [0; 32];
            sess.kernel
                .set_syscall_mask(debug, None)
                .or_errno(errno::GENERIC)?;
        }
        b"1" => {
            let mut mask = [0u8; 32];
            if rest.is_empty() {
                mask = [0xff; 32];
            }
            while !rest.is_empty() {
                let (num, tail) = split_at_any(rest, b";");
                rest = tail;
                let num: u32 = super::parse_hex(num)?;
                if num > 0xff {
                    return Err(HandlerError::Errno(errno::INVALID_ARG));
                }
                svc_mask_insert(&mut mask, num);
            }
            sess.inner.svc_mask = mask;
            sess.kernel
                .set_syscall_mask(debug, Some(&mask))
                .or_errno(errno::GENERIC)?;
        }
        _ => return Err(HandlerError::Errno(errno::INVALID_ARG)),
    }

    Ok(HandlerStatus::NeedsOk)
}
