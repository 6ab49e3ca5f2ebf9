//! `qRcmd`: the `monitor` console.

use super::HandlerStatus;
use super::Session;
use crate::error::errno;
use crate::error::ErrnoExt;
use crate::error::HandlerResult;
use crate::kernel::Kernel;
use crate::kernel::MemPerm;
use crate::protocol::common::hex::decode_hex_buf;

const HELP: &str = "\
commands:\n\
  help                    this text\n\
  extmemaccess on|off     allow writes outside writable regions\n\
  catchthreads on|off     report thread create/exit events\n\
  persist <addr>          keep the breakpoint at <addr> after detach\n\
  memregions              dump the debuggee memory map\n";

pub(crate) fn handle<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let decoded = decode_hex_buf(args).or_errno(errno::INVALID_ARG)?;
    let line = core::str::from_utf8(decoded).or_errno(errno::INVALID_ARG)?;
    let mut words = line.split_whitespace();

    let output = match (words.next(), words.next()) {
        (Some("help"), _) | (None, _) => HELP.to_string(),

        (Some("extmemaccess"), Some(state)) => match parse_switch(state) {
            Some(on) => {
                sess.inner.enable_external_memory_access = on;
                format!("external memory access {}\n", if on { "enabled" } else { "disabled" })
            }
            None => HELP.to_string(),
        },

        (Some("catchthreads"), Some(state)) => match parse_switch(state) {
            Some(on) => {
                sess.inner.catch_thread_events = on;
                format!("thread events {}\n", if on { "reported" } else { "ignored" })
            }
            None => HELP.to_string(),
        },

        (Some("persist"), Some(addr)) => {
            match u32::from_str_radix(addr.trim_start_matches("0x"), 16) {
                Ok(addr) if crate::breakpoints::persist(sess.inner, addr) => {
                    format!("breakpoint at {:#010x} made persistent\n", addr)
                }
                Ok(addr) => format!("no breakpoint at {:#010x}\n", addr),
                Err(_) => HELP.to_string(),
            }
        }

        (Some("memregions"), _) => match memregions(sess) {
            Some(listing) => listing,
            None => "not attached\n".to_string(),
        },

        _ => "unknown command; try 'monitor help'\n".to_string(),
    };

    sess.inner
        .send_reply(|res| res.write_hex_buf(output.as_bytes()))?;
    Ok(HandlerStatus::Handled)
}

fn parse_switch(word: &str) -> Option<bool> {
    match word {
        "on" | "1" => Some(true),
        "off" | "0" => Some(false),
        _ => None,
    }
}

fn memregions<K: Kernel>(sess: &Session<'_, K>) -> Option<String> {
    let debug = sess.inner.debug?;

    let mut out = String::new();
    let mut addr: u64 = 0;
    while addr <= u32::MAX as u64 {
        let region = sess.kernel.query_memory(debug, addr as u32).ok()?;
        if region.end() <= addr {
            break;
        }
        if region.mapped {
            out.push_str(&format!(
                "{:#010x}-{:#010x} {}{}{}\n",
                region.base,
                region.end(),
                if region.perm.contains(MemPerm::R) { 'r' } else { '-' },
                if region.perm.contains(MemPerm::W) { 'w' } else { '-' },
                if region.perm.contains(MemPerm::X) { 'x' } else { '-' },
            ));
        }
        addr = region.end();
    }
    Some(out)
}
