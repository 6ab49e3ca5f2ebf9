//! Hardware watchpoint manager.
//!
//! The device exposes a small fixed pool of watchpoint slots shared by
//! every debuggee; the manager owns the pool and mirrors slot assignments
//! into the kernel. Contexts additionally track which addresses they own
//! so a disconnect can return its slots.

use crate::context::ContextInner;
use crate::kernel::DebugHandle;
use crate::kernel::Kernel;
use crate::kernel::KernelError;
use crate::kernel::WatchKind;
use log::debug;
use std::sync::Mutex;

/// Number of hardware watchpoint slots.
pub const MAX_WATCHPOINTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    debug: DebugHandle,
    addr: u32,
    size: u32,
    kind: WatchKind,
}

/// Server-wide watchpoint slot pool.
pub(crate) struct WatchpointManager {
    slots: Mutex<[Option<Slot>; MAX_WATCHPOINTS]>,
}

impl WatchpointManager {
    pub fn new() -> WatchpointManager {
        WatchpointManager {
            slots: Mutex::new([None; MAX_WATCHPOINTS]),
        }
    }

    /// Program a watchpoint for the given context. Errors with
    /// [`KernelError::WouldBlock`] when the pool is exhausted; duplicates
    /// are idempotent.
    pub fn add<K: Kernel>(
        &self,
        inner: &mut ContextInner,
        kernel: &K,
        addr: u32,
        size: u32,
        kind: WatchKind,
    ) -> Result<(), KernelError<K::Error>> {
        let debug = inner.debug.ok_or(KernelError::InvalidHandle)?;
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };

        let new = Slot {
            debug,
            addr,
            size,
            kind,
        };
        if slots.iter().flatten().any(|&s| s == new) {
            return Ok(());
        }

        let free = slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(KernelError::WouldBlock)?;

        kernel.add_watchpoint(debug, addr, size, kind)?;
        *free = Some(new);

        if !inner.watchpoints.contains(&addr) {
            inner.watchpoints.push(addr);
        }
        debug!("watchpoint set at {:#010x}+{} ({:?})", addr, size, kind);
        Ok(())
    }

    /// Free the matching watchpoint slot.
    pub fn remove<K: Kernel>(
        &self,
        inner: &mut ContextInner,
        kernel: &K,
        addr: u32,
        size: u32,
        kind: WatchKind,
    ) -> Result<(), KernelError<K::Error>> {
        let debug = inner.debug.ok_or(KernelError::InvalidHandle)?;
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };

        let target = Slot {
            debug,
            addr,
            size,
            kind,
        };
        let slot = slots
            .iter_mut()
            .find(|s| **s == Some(target))
            .ok_or(KernelError::InvalidHandle)?;

        kernel.remove_watchpoint(debug, addr, size, kind)?;
        *slot = None;

        // keep the context's list densely packed
        if !slots
            .iter()
            .flatten()
            .any(|s| s.debug == debug && s.addr == addr)
        {
            inner.watchpoints.retain(|&a| a != addr);
        }
        debug!("watchpoint cleared at {:#010x}", addr);
        Ok(())
    }

    /// Return every slot owned by the given context, used on disconnect.
    pub fn remove_all<K: Kernel>(&self, inner: &mut ContextInner, kernel: &K) {
        let debug = match inner.debug {
            Some(debug) => debug,
            None => {
                inner.watchpoints.clear();
                return;
            }
        };

        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        for slot in slots.iter_mut() {
            if let Some(s) = *slot {
                if s.debug == debug {
                    let _ = kernel.remove_watchpoint(debug, s.addr, s.size, s.kind);
                    *slot = None;
                }
            }
        }
        inner.watchpoints.clear();
    }
}
