//! `g` / `G` / `p` / `P`: register file access.

use super::parse_hex;
use super::HandlerStatus;
use super::Session;
use crate::arch::ArmCoreRegs;
use crate::arch::ArmRegId;
use crate::error::errno;
use crate::error::ErrnoExt;
use crate::error::HandlerError;
use crate::error::HandlerResult;
use crate::kernel::Kernel;
use crate::protocol::common::hex::decode_hex_buf;

pub(crate) fn handle_read_registers<K: Kernel>(
    sess: &mut Session<'_, K>,
) -> HandlerResult<HandlerStatus, K::Error> {
    let regs = thread_context(sess)?;
    sess.inner
        .send_reply(|res| res.write_hex_buf(&regs.to_bytes()))?;
    Ok(HandlerStatus::Handled)
}

pub(crate) fn handle_write_registers<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let bytes = decode_hex_buf(args).or_errno(errno::INVALID_ARG)?;
    let regs = ArmCoreRegs::from_bytes(bytes).or_errno(errno::INVALID_ARG)?;

    let debug = sess
        .inner
        .debug
        .ok_or(HandlerError::Errno(errno::GENERIC))?;
    let tid = sess.inner.debug_thread();
    sess.kernel
        .set_thread_context(debug, tid, &regs)
        .or_errno(errno::GENERIC)?;
    Ok(HandlerStatus::NeedsOk)
}

pub(crate) fn handle_read_register<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let id = reg_id(args)?;
    let regs = thread_context(sess)?;
    sess.inner
        .send_reply(|res| res.write_hex_buf(&regs.reg(id).to_le_bytes()))?;
    Ok(HandlerStatus::Handled)
}

pub(crate) fn handle_write_register<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let eq = args
        .iter()
        .position(|&b| b == b'=')
        .ok_or(HandlerError::Errno(errno::INVALID_ARG))?;
    let (id, val) = args.split_at_mut(eq);
    let id = reg_id(id)?;

    let val = decode_hex_buf(&mut val[1..]).or_errno(errno::INVALID_ARG)?;
    if val.len() != 4 {
        return Err(HandlerError::Errno(errno::INVALID_ARG));
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(val);
    let word = u32::from_le_bytes(word);

    let debug = sess
        .inner
        .debug
        .ok_or(HandlerError::Errno(errno::GENERIC))?;
    let tid = sess.inner.debug_thread();

    let mut regs = sess
        .kernel
        .get_thread_context(debug, tid)
        .or_errno(errno::GENERIC)?;
    regs.set_reg(id, word);
    sess.kernel
        .set_thread_context(debug, tid, &regs)
        .or_errno(errno::GENERIC)?;
    Ok(HandlerStatus::NeedsOk)
}

fn reg_id<E>(buf: &[u8]) -> HandlerResult<ArmRegId, E> {
    let raw: u32 = parse_hex(buf)?;
    ArmRegId::from_raw_id(raw).ok_or(HandlerError::Errno(errno::INVALID_ARG))
}

fn thread_context<K: Kernel>(sess: &Session<'_, K>) -> HandlerResult<ArmCoreRegs, K::Error> {
    let debug = sess
        .inner
        .debug
        .ok_or(HandlerError::Errno(errno::GENERIC))?;
    let tid = sess.inner.debug_thread();
    sess.kernel
        .get_thread_context(debug, tid)
        .or_errno(errno::GENERIC)
}
