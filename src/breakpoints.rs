//! Software breakpoint table: patch/restore of original instructions.

use crate::arch::ArmBreakpointKind;
use crate::context::Breakpoint;
use crate::context::ContextInner;
use crate::context::MAX_BREAKPOINTS;
use crate::kernel::Kernel;
use crate::kernel::KernelError;
use log::debug;

/// Patch the trap instruction at `addr`, remembering the original bytes.
///
/// Adding a breakpoint twice at the same address is idempotent.
pub(crate) fn add<K: Kernel>(
    inner: &mut ContextInner,
    kernel: &K,
    addr: u32,
    kind: ArmBreakpointKind,
    persistent: bool,
) -> Result<(), KernelError<K::Error>> {
    let debug = inner.debug.ok_or(KernelError::InvalidHandle)?;

    if let Some(bp) = inner.breakpoints.iter_mut().find(|bp| bp.addr == addr) {
        bp.persistent |= persistent;
        return Ok(());
    }

    if inner.breakpoints.len() >= MAX_BREAKPOINTS {
        return Err(KernelError::WouldBlock);
    }

    let len = kind.len();
    let mut original = [0u8; 4];
    kernel.read_process_memory(debug, addr, &mut original[..len])?;
    kernel.write_process_memory(debug, addr, &kind.trap_bytes()[..len])?;

    debug!("breakpoint set at {:#010x} (kind {:?})", addr, kind);

    inner.breakpoints.push(Breakpoint {
        addr,
        original,
        kind,
        persistent,
    });
    Ok(())
}

/// Restore the original instruction behind a breakpoint. The table entry
/// is left to the caller.
pub(crate) fn disable<K: Kernel>(
    inner: &ContextInner,
    kernel: &K,
    bp: &Breakpoint,
) -> Result<(), KernelError<K::Error>> {
    let debug = inner.debug.ok_or(KernelError::InvalidHandle)?;
    kernel.write_process_memory(debug, bp.addr, &bp.original[..bp.kind.len()])?;
    debug!("breakpoint cleared at {:#010x}", bp.addr);
    Ok(())
}

/// Remove the breakpoint at `addr`, restoring the original instruction.
///
/// Unknown addresses are an error (the client asked to clear a breakpoint
/// the server never set).
pub(crate) fn remove<K: Kernel>(
    inner: &mut ContextInner,
    kernel: &K,
    addr: u32,
) -> Result<(), KernelError<K::Error>> {
    let idx = inner
        .breakpoints
        .iter()
        .position(|bp| bp.addr == addr)
        .ok_or(KernelError::InvalidHandle)?;

    let bp = inner.breakpoints.remove(idx);
    disable(inner, kernel, &bp)
}

/// Look up the breakpoint covering `addr`, if any.
pub(crate) fn find(inner: &ContextInner, addr: u32) -> Option<&Breakpoint> {
    inner.breakpoints.iter().find(|bp| bp.addr == addr)
}

/// Mark an existing breakpoint persistent (`monitor persist <addr>`).
pub(crate) fn persist(inner: &mut ContextInner, addr: u32) -> bool {
    match inner.breakpoints.iter_mut().find(|bp| bp.addr == addr) {
        Some(bp) => {
            bp.persistent = true;
            true
        }
        None => false,
    }
}
