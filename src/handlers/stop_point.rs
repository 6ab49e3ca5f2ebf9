//! `Z` / `z`: insert and remove stop points.

use super::parse_hex;
use super::split_at_any;
use super::HandlerStatus;
use super::Session;
use crate::arch::ArmBreakpointKind;
use crate::error::errno;
use crate::error::ErrnoExt;
use crate::error::HandlerError;
use crate::error::HandlerResult;
use crate::kernel::Kernel;
use crate::kernel::WatchKind;

pub(crate) fn handle_toggle<K: Kernel>(
    sess: &mut Session<'_, K>,
    cmd: u8,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let add = cmd == b'Z';

    let (type_, rest) = split_at_any(args, b",");
    let (addr, rest) = split_at_any(rest, b",");
    let type_: u32 = parse_hex(type_)?;
    let addr: u32 = parse_hex(addr)?;
    let kind: u32 = parse_hex(rest)?;

    match type_ {
        // software breakpoint
        0 => {
            let kind = ArmBreakpointKind::from_kind(kind)
                .ok_or(HandlerError::Errno(errno::INVALID_ARG))?;
            if add {
                crate::breakpoints::add(sess.inner, sess.kernel, addr, kind, false)
                    .or_errno(errno::GENERIC)?;
            } else {
                crate::breakpoints::remove(sess.inner, sess.kernel, addr)
                    .or_errno(errno::GENERIC)?;
            }
            Ok(HandlerStatus::NeedsOk)
        }

        // hardware watchpoints; `kind` carries the watched length
        2 | 3 | 4 => {
            let watch_kind = match type_ {
                2 => WatchKind::Write,
                3 => WatchKind::Read,
                _ => WatchKind::ReadWrite,
            };
            if add {
                sess.watchpoints
                    .add(sess.inner, sess.kernel, addr, kind, watch_kind)
                    .or_errno(errno::GENERIC)?;
            } else {
                sess.watchpoints
                    .remove(sess.inner, sess.kernel, addr, kind, watch_kind)
                    .or_errno(errno::GENERIC)?;
            }
            Ok(HandlerStatus::NeedsOk)
        }

        // hardware breakpoints are not wired up; empty reply means
        // "unsupported" and gdb falls back to software breakpoints
        _ => super::unsupported(sess),
    }
}
