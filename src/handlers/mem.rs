//! `m` / `M` / `X`: debuggee memory access.

use super::parse_hex;
use super::split_at_any;
use super::HandlerStatus;
use super::Session;
use crate::error::errno;
use crate::error::ErrnoExt;
use crate::error::HandlerError;
use crate::error::HandlerResult;
use crate::kernel::DebugHandle;
use crate::kernel::Kernel;
use crate::kernel::MemPerm;
use crate::protocol::common::hex::decode_bin_buf;
use crate::protocol::common::hex::decode_hex_buf;
use crate::protocol::GDB_BUF_LEN;

/// Longest read the `m` handler will serve: the hex encoding plus frame
/// overhead must fit the advertised packet size.
const MAX_READ_LEN: usize = (GDB_BUF_LEN - 16) / 2;

pub(crate) fn handle_read_memory<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let (addr, rest) = split_at_any(args, b",");
    let addr: u32 = parse_hex(addr)?;
    let len: usize = parse_hex(rest)?;

    if len == 0 || len > MAX_READ_LEN {
        return Err(HandlerError::Errno(errno::INVALID_ARG));
    }

    let debug = attached(sess)?;
    validate_range(sess, addr, len, Access::Read)?;

    let mut data = vec![0u8; len];
    sess.kernel
        .read_process_memory(debug, addr, &mut data)
        .or_errno(errno::BAD_ADDRESS)?;

    sess.inner.send_reply(|res| res.write_hex_buf(&data))?;
    Ok(HandlerStatus::Handled)
}

pub(crate) fn handle_write_memory<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let (header, payload) = split_at_any(args, b":");
    let (addr, len) = parse_write_header(header)?;
    let data = decode_hex_buf(payload).or_errno(errno::INVALID_ARG)?;
    write_checked(sess, addr, len, data)
}

pub(crate) fn handle_write_memory_raw<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let (header, payload) = split_at_any(args, b":");
    let (addr, len) = parse_write_header(header)?;
    let data = decode_bin_buf(payload).or_errno(errno::INVALID_ARG)?;

    // gdb probes X support with a zero-length write
    if len == 0 && data.is_empty() {
        return Ok(HandlerStatus::NeedsOk);
    }
    write_checked(sess, addr, len, data)
}

fn parse_write_header<E>(header: &mut [u8]) -> HandlerResult<(u32, usize), E> {
    let (addr, len) = split_at_any(header, b",");
    Ok((parse_hex(addr)?, parse_hex(len)?))
}

fn write_checked<K: Kernel>(
    sess: &mut Session<'_, K>,
    addr: u32,
    len: usize,
    data: &[u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    if data.len() != len {
        return Err(HandlerError::Errno(errno::INVALID_ARG));
    }

    let debug = attached(sess)?;
    validate_range(sess, addr, len, Access::Write)?;

    sess.kernel
        .write_process_memory(debug, addr, data)
        .or_errno(errno::BAD_ADDRESS)?;
    Ok(HandlerStatus::NeedsOk)
}

fn attached<K: Kernel>(sess: &Session<'_, K>) -> HandlerResult<DebugHandle, K::Error> {
    sess.inner.debug.ok_or(HandlerError::Errno(errno::GENERIC))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Walk the kernel memory map and check that `[addr, addr+len)` is fully
/// mapped (and writable, for writes, unless external memory access was
/// enabled via the monitor console).
fn validate_range<K: Kernel>(
    sess: &Session<'_, K>,
    addr: u32,
    len: usize,
    access: Access,
) -> HandlerResult<(), K::Error> {
    let debug = attached(sess)?;

    let end = addr as u64 + len as u64;
    if end > u32::MAX as u64 + 1 {
        return Err(HandlerError::Errno(errno::BAD_ADDRESS));
    }

    let mut cursor = addr as u64;
    while cursor < end {
        let region = sess
            .kernel
            .query_memory(debug, cursor as u32)
            .or_errno(errno::BAD_ADDRESS)?;

        if !region.mapped {
            return Err(HandlerError::Errno(errno::GENERIC));
        }
        let writable =
            region.perm.contains(MemPerm::W) || sess.inner.enable_external_memory_access;
        if access == Access::Write && !writable {
            return Err(HandlerError::Errno(errno::GENERIC));
        }
        if region.end() <= cursor {
            // a zero-progress region means a lying map; bail out
            return Err(HandlerError::Errno(errno::BAD_ADDRESS));
        }
        cursor = region.end();
    }

    Ok(())
}
