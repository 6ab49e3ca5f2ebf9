//! End-to-end RSP sessions over loopback TCP against the mock kernel.

mod common;

use common::wait_until;
use common::GdbClient;
use common::MockKernel;
use gdbserv::arch::ArmCoreRegs;
use gdbserv::kernel::MemPerm;
use gdbserv::ContextState;
use gdbserv::GdbServer;
use gdbserv::ServerThreads;
use std::sync::Arc;
use std::time::Duration;

const PID: u32 = 42;
const CODE_BASE: u32 = 0x0010_0000;
const DATA_BASE: u32 = 0x0800_0000;

fn fixture() -> MockKernel {
    let kernel = MockKernel::new();
    kernel.add_process(PID, "app", &[1, 2]);

    let mut code = vec![0u8; 0x1000];
    code[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    code[0x100..0x104].copy_from_slice(&[0x00, 0x01, 0x02, 0x03]);
    kernel.add_region(PID, CODE_BASE, MemPerm::R | MemPerm::X, code);
    kernel.add_region(PID, DATA_BASE, MemPerm::R | MemPerm::W, vec![0u8; 0x1000]);

    let mut regs = ArmCoreRegs::default();
    regs.pc = CODE_BASE;
    regs.sp = DATA_BASE + 0x1000;
    regs.cpsr = 0x6000_0010;
    kernel.set_regs(PID, 1, regs);

    kernel
}

/// Reserve a context for `PID`, start the workers, and connect a client.
fn session(
    kernel: &MockKernel,
) -> (Arc<GdbServer<MockKernel>>, ServerThreads, GdbClient, usize) {
    let (server, threads) = common::start_server(kernel, 42000);
    let base = server.port_base();
    let (id, port) = server
        .select_available_context(base, base + 3)
        .expect("free context");
    assert!(server.set_context_pid(id, PID));
    let client = GdbClient::connect(port);
    (server, threads, client, id)
}

fn hex(s: &str) -> String {
    s.bytes().map(|b| format!("{:02x}", b)).collect()
}

#[test]
fn handshake_and_no_ack_mode() {
    let kernel = fixture();
    let (server, threads, mut client, _) = session(&kernel);

    // S1: qSupported negotiation
    let reply = client.request("qSupported:multiprocess+;swbreak+;hwbreak+");
    assert!(reply.contains("PacketSize=800"), "reply: {}", reply);
    assert!(reply.contains("qXfer:features:read+"));
    assert!(reply.contains("qXfer:memory-map:read+"));
    assert!(reply.contains("QStartNoAckMode+"));
    assert!(reply.contains("swbreak+"));

    // S2: after QStartNoAckMode neither side emits +/-
    client.enable_no_ack();
    assert_eq!(client.request("qAttached"), "1");

    common::stop_server(&server, threads);
}

#[test]
fn read_memory() {
    let kernel = fixture();
    let (server, threads, mut client, _) = session(&kernel);

    // S3
    assert_eq!(client.request("m100000,4"), "deadbeef");

    // unmapped address
    assert_eq!(client.request("m40,4"), "E01");
    // straddling the end of a region
    assert_eq!(client.request("m100ffe,4"), "E01");

    common::stop_server(&server, threads);
}

#[test]
fn write_memory_hex_and_binary() {
    let kernel = fixture();
    let (server, threads, mut client, _) = session(&kernel);

    assert_eq!(client.request("M8000000,4:cafebabe"), "OK");
    assert_eq!(kernel.read_mem(PID, DATA_BASE, 4), vec![0xca, 0xfe, 0xba, 0xbe]);

    assert_eq!(client.request("X8000010,4:\u{1}\u{2}\u{3}\u{4}"), "OK");
    assert_eq!(kernel.read_mem(PID, DATA_BASE + 0x10, 4), vec![1, 2, 3, 4]);

    // read-only region refuses writes...
    assert_eq!(client.request("M100000,2:ffff"), "E01");
    // ...until external memory access is enabled via the console
    let reply = client.request(&format!("qRcmd,{}", hex("extmemaccess on")));
    assert!(reply.contains(&hex("enabled")), "reply: {}", reply);
    assert_eq!(client.request("M100000,2:ffff"), "OK");

    common::stop_server(&server, threads);
}

#[test]
fn software_breakpoints() {
    let kernel = fixture();
    let (server, threads, mut client, _) = session(&kernel);

    // S4: set, observe the patched trap, clear, observe the original
    assert_eq!(client.request("Z0,100100,4"), "OK");
    assert_eq!(client.request("m100100,4"), "fedeffe7");

    // duplicate insertion is idempotent
    assert_eq!(client.request("Z0,100100,4"), "OK");

    assert_eq!(client.request("z0,100100,4"), "OK");
    assert_eq!(client.request("m100100,4"), "00010203");

    // removing an unknown breakpoint fails
    assert_eq!(client.request("z0,100200,4"), "E01");

    common::stop_server(&server, threads);
}

#[test]
fn registers() {
    let kernel = fixture();
    let (server, threads, mut client, _) = session(&kernel);

    let reply = client.request("g");
    assert_eq!(reply.len(), 17 * 8);
    // pc is the 16th register, little-endian
    assert_eq!(&reply[15 * 8..16 * 8], "00001000");

    // single register reads: r0, pc (15), cpsr (25)
    assert_eq!(client.request("p0"), "00000000");
    assert_eq!(client.request("pf"), "00001000");
    assert_eq!(client.request("p19"), "10000060");
    // register numbers 16-24 are not described
    assert_eq!(client.request("p10"), "E22");

    // write r1 and read it back through the kernel
    assert_eq!(client.request("P1=78563412"), "OK");
    assert_eq!(kernel.regs_of(PID, 1).r[1], 0x1234_5678);

    // full write round-trip
    let mut image = kernel.regs_of(PID, 1);
    image.r[0] = 0xaabb_ccdd;
    let hex_image: String = image
        .to_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    assert_eq!(client.request(&format!("G{}", hex_image)), "OK");
    assert_eq!(kernel.regs_of(PID, 1).r[0], 0xaabb_ccdd);

    common::stop_server(&server, threads);
}

#[test]
fn thread_queries() {
    let kernel = fixture();
    let (server, threads, mut client, _) = session(&kernel);

    assert_eq!(client.request("qC"), "QC01");
    assert_eq!(client.request("qfThreadInfo"), "m01,02");
    assert_eq!(client.request("qsThreadInfo"), "l");

    assert_eq!(client.request("Hg2"), "OK");
    assert_eq!(client.request("Hc-1"), "OK");
    assert_eq!(client.request("T1"), "OK");
    assert_eq!(client.request("T5"), "E01");

    // initial stop reason (the attach break)
    assert_eq!(client.request("?"), "T05thread:01;");

    common::stop_server(&server, threads);
}

#[test]
fn continue_and_interrupt() {
    let kernel = fixture();
    let (server, threads, mut client, _) = session(&kernel);

    // S5: continue, then interrupt with a lone \x03 byte
    client.send_packet("c");
    wait_until(Duration::from_secs(5), || kernel.is_running(PID));

    client.send_break();
    let reply = client.read_packet();
    assert_eq!(reply, "T05thread:01;");
    assert!(!kernel.is_running(PID));

    // `?` re-reports the same stop
    assert_eq!(client.request("?"), "T05thread:01;");

    common::stop_server(&server, threads);
}

#[test]
fn vcont_continue_and_query() {
    let kernel = fixture();
    let (server, threads, mut client, _) = session(&kernel);

    assert_eq!(client.request("vCont?"), "vCont;c;C;s;S;t");

    client.send_packet("vCont;c");
    wait_until(Duration::from_secs(5), || kernel.is_running(PID));

    client.send_break();
    assert_eq!(client.read_packet(), "T05thread:01;");

    common::stop_server(&server, threads);
}

#[test]
fn detach_restores_context() {
    let kernel = fixture();
    let (server, threads, mut client, id) = session(&kernel);

    assert_eq!(client.request("Z0,100100,4"), "OK");

    // S6
    assert_eq!(client.request("D"), "OK");

    wait_until(Duration::from_secs(5), || {
        server.snapshot()[id].state == ContextState::Disconnected
    });

    let snap = &server.snapshot()[id];
    assert!(snap.flags.is_empty());
    assert_eq!(snap.local_port, 0);
    assert!(!snap.attached);
    assert_eq!(snap.nb_breakpoints, 0);
    assert_eq!(snap.nb_watchpoints, 0);

    // the non-persistent breakpoint was disabled on the way out
    assert_eq!(kernel.read_mem(PID, CODE_BASE + 0x100, 4), vec![0, 1, 2, 3]);
    // and the debuggee keeps running without a debugger
    assert!(!kernel.is_attached(PID));
    assert!(kernel.is_running(PID));

    common::stop_server(&server, threads);
}

#[test]
fn persistent_breakpoint_survives_detach() {
    let kernel = fixture();
    let (server, threads, mut client, id) = session(&kernel);

    assert_eq!(client.request("Z0,100100,4"), "OK");
    let reply = client.request(&format!("qRcmd,{}", hex("persist 0x100100")));
    assert!(reply.contains(&hex("persistent")), "reply: {}", reply);

    assert_eq!(client.request("D"), "OK");
    wait_until(Duration::from_secs(5), || {
        server.snapshot()[id].state == ContextState::Disconnected
    });

    // the trap is left in place
    assert_eq!(
        kernel.read_mem(PID, CODE_BASE + 0x100, 4),
        vec![0xfe, 0xde, 0xff, 0xe7]
    );

    common::stop_server(&server, threads);
}

#[test]
fn kill_terminates_debuggee() {
    let kernel = fixture();
    let (server, threads, mut client, id) = session(&kernel);

    client.send_packet("k");
    wait_until(Duration::from_secs(5), || kernel.is_dead(PID));
    wait_until(Duration::from_secs(5), || {
        server.snapshot()[id].state == ContextState::Disconnected
    });

    common::stop_server(&server, threads);
}

#[test]
fn qxfer_blobs() {
    let kernel = fixture();
    let (server, threads, mut client, _) = session(&kernel);

    let reply = client.request("qXfer:features:read:target.xml:0,ffb");
    assert!(reply.starts_with('l'), "reply: {}", reply);
    assert!(reply.contains("org.gnu.gdb.arm.core"));
    assert!(reply.contains("<reg name=\"cpsr\" bitsize=\"32\" regnum=\"25\"/>"));

    // chunked read: two halves glue back together
    let full = &reply[1..];
    let first = client.request(&format!("qXfer:features:read:target.xml:0,{:x}", full.len() / 2));
    assert!(first.starts_with('m'));
    let second = client.request(&format!(
        "qXfer:features:read:target.xml:{:x},ffb",
        full.len() / 2
    ));
    assert!(second.starts_with('l'));
    assert_eq!(format!("{}{}", &first[1..], &second[1..]), full);

    let reply = client.request("qXfer:memory-map:read::0,ffb");
    assert!(reply.contains("<memory type=\"rom\" start=\"0x100000\" length=\"0x1000\"/>"));
    assert!(reply.contains("<memory type=\"ram\" start=\"0x8000000\" length=\"0x1000\"/>"));

    let reply = client.request("qXfer:threads:read::0,ffb");
    assert!(reply.contains("<thread id=\"1\" core=\"0\"/>"));
    assert!(reply.contains("<thread id=\"2\" core=\"0\"/>"));

    let reply = client.request("qXfer:osdata:read:processes:0,ffb");
    assert!(reply.contains("<column name=\"pid\">42</column>"));
    assert!(reply.contains("<column name=\"command\">app</column>"));

    common::stop_server(&server, threads);
}

#[test]
fn monitor_memregions() {
    let kernel = fixture();
    let (server, threads, mut client, _) = session(&kernel);

    let reply = client.request(&format!("qRcmd,{}", hex("memregions")));
    let decoded: String = reply
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            u8::from_str_radix(std::str::from_utf8(pair).unwrap(), 16).unwrap() as char
        })
        .collect();
    assert!(decoded.contains("0x00100000"), "decoded: {}", decoded);
    assert!(decoded.contains("r-x"), "decoded: {}", decoded);
    assert!(decoded.contains("rw-"), "decoded: {}", decoded);

    common::stop_server(&server, threads);
}

#[test]
fn vattach_to_unbound_context() {
    let kernel = fixture();
    let (server, threads) = common::start_server(&kernel, 42000);
    let base = server.port_base();
    let (_, port) = server
        .select_available_context(base, base + 3)
        .expect("free context");
    // no pid bound: the client must vAttach

    let mut client = GdbClient::connect(port);
    let reply = client.request("vAttach;2a");
    assert_eq!(reply, "T05thread:01;");
    assert_eq!(client.request("m100000,4"), "deadbeef");

    common::stop_server(&server, threads);
}

#[test]
fn bad_checksum_gets_nak_and_retransmit_works() {
    let kernel = fixture();
    let (server, threads, mut client, _) = session(&kernel);

    // a frame with a wrong checksum is NAK'd and not executed
    client.send_raw(b"$qAttached#00");
    assert_eq!(client.read_raw_byte(), b'-');

    // the retransmitted (correct) frame goes through
    assert_eq!(client.request("qAttached"), "1");

    // a client NAK makes the server resend its last reply verbatim
    client.send_raw(b"-");
    assert_eq!(client.read_packet(), "1");

    common::stop_server(&server, threads);
}

#[test]
fn unsupported_commands_get_empty_replies() {
    let kernel = fixture();
    let (server, threads, mut client, _) = session(&kernel);

    assert_eq!(client.request("qFooBar"), "");
    assert_eq!(client.request("vRun;"), "");
    assert_eq!(client.request("r"), "");

    common::stop_server(&server, threads);
}
