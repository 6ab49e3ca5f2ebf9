//! `qXfer:<object>:read:<annex>:<offset>,<length>` — chunked reads of the
//! target description, memory map, thread list and process list.

use super::parse_hex;
use super::split_at_any;
use super::unsupported;
use super::HandlerStatus;
use super::Session;
use crate::arch::TARGET_XML;
use crate::error::errno;
use crate::error::ErrnoExt;
use crate::error::HandlerError;
use crate::error::HandlerResult;
use crate::kernel::Kernel;
use crate::kernel::MemPerm;
use crate::protocol::GDB_BUF_LEN;

pub(crate) fn handle<K: Kernel>(
    sess: &mut Session<'_, K>,
    args: &mut [u8],
) -> HandlerResult<HandlerStatus, K::Error> {
    let (object, rest) = split_at_any(args, b":");
    let (op, rest) = split_at_any(rest, b":");
    if op != b"read" {
        return unsupported(sess);
    }
    let (annex, rest) = split_at_any(rest, b":");
    let (offset, rest) = split_at_any(rest, b",");
    let offset: usize = parse_hex(offset)?;
    let length: usize = parse_hex(rest)?;
    let length = length.min(GDB_BUF_LEN - 16);

    // regenerate cached blobs whenever a fresh read starts
    match (&*object, &*annex) {
        (b"features", b"target.xml") => {}
        (b"memory-map", _) => {
            if offset == 0 {
                let map = build_memory_map(sess)?;
                sess.inner.xfer.memory_map = map;
            }
        }
        (b"threads", _) => {
            if offset == 0 {
                sess.inner.xfer.threads = build_thread_list(sess);
            }
        }
        (b"osdata", b"processes") => {
            if offset == 0 {
                let list = sess.kernel.list_processes().or_errno(errno::GENERIC)?;
                sess.inner.xfer.processes = build_process_list(&list);
            }
        }
        _ => return unsupported(sess),
    }

    let blob: &[u8] = match &*object {
        b"features" => TARGET_XML.as_bytes(),
        b"memory-map" => &sess.inner.xfer.memory_map,
        b"threads" => &sess.inner.xfer.threads,
        b"osdata" => &sess.inner.xfer.processes,
        _ => &[],
    };

    let (marker, chunk) = if offset >= blob.len() {
        ('l', Vec::new())
    } else {
        let end = (offset + length).min(blob.len());
        let marker = if end == blob.len() { 'l' } else { 'm' };
        (marker, blob[offset..end].to_vec())
    };

    sess.inner.send_reply(|res| {
        res.write_str(if marker == 'l' { "l" } else { "m" });
        res.write_binary(&chunk);
    })?;
    Ok(HandlerStatus::Handled)
}

/// Walk the debuggee address space and render the mapped regions.
fn build_memory_map<K: Kernel>(sess: &Session<'_, K>) -> HandlerResult<Vec<u8>, K::Error> {
    let debug = sess
        .inner
        .debug
        .ok_or(HandlerError::Errno(errno::GENERIC))?;

    let mut xml = String::from(
        "<?xml version=\"1.0\"?>\n<!DOCTYPE memory-map PUBLIC \"+//IDN gnu.org//DTD GDB Memory Map V1.0//EN\" \"http://sourceware.org/gdb/gdb-memory-map.dtd\">\n<memory-map>\n",
    );

    let mut addr: u64 = 0;
    while addr <= u32::MAX as u64 {
        let region = sess
            .kernel
            .query_memory(debug, addr as u32)
            .or_errno(errno::GENERIC)?;
        if region.end() <= addr {
            break;
        }
        if region.mapped {
            let kind = if region.perm.contains(MemPerm::W) {
                "ram"
            } else {
                "rom"
            };
            xml.push_str(&format!(
                "  <memory type=\"{}\" start=\"{:#x}\" length=\"{:#x}\"/>\n",
                kind, region.base, region.size
            ));
        }
        addr = region.end();
    }

    xml.push_str("</memory-map>\n");
    Ok(xml.into_bytes())
}

fn build_thread_list<K: Kernel>(sess: &Session<'_, K>) -> Vec<u8> {
    let mut xml = String::from("<?xml version=\"1.0\"?>\n<threads>\n");
    for tid in &sess.inner.threads {
        xml.push_str(&format!("  <thread id=\"{:x}\" core=\"0\"/>\n", tid));
    }
    xml.push_str("</threads>\n");
    xml.into_bytes()
}

fn build_process_list(list: &[crate::kernel::ProcessInfo]) -> Vec<u8> {
    let mut xml = String::from(
        "<?xml version=\"1.0\"?>\n<!DOCTYPE target SYSTEM \"osdata.dtd\">\n<osdata type=\"processes\">\n",
    );
    for proc in list {
        xml.push_str(&format!(
            "  <item>\n    <column name=\"pid\">{}</column>\n    <column name=\"command\">{}</column>\n  </item>\n",
            proc.pid,
            xml_escape(&proc.name)
        ));
    }
    xml.push_str("</osdata>\n");
    xml.into_bytes()
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}
