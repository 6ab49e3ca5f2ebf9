//! The socket worker: binds the listener range, accepts clients into
//! free contexts, and services each client's packet stream.

use super::attach_prelude;
use super::lock;
use super::GdbServer;
use super::MAX_DEBUG;
use crate::common::PID_NEXT_APPLICATION;
use crate::conn::Connection;
use crate::conn::ConnectionExt;
use crate::context::ContextFlags;
use crate::context::ContextInner;
use crate::context::ContextState;
use crate::error::HandlerError;
use crate::handlers;
use crate::handlers::DisconnectReason;
use crate::handlers::HandlerStatus;
use crate::handlers::Session;
use crate::kernel::Kernel;
use crate::protocol::Packet;
use crate::protocol::RecvPacketStateMachine;
use log::error;
use log::info;
use log::warn;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Accept-loop polling interval.
const ACCEPT_POLL: Duration = Duration::from_millis(30);

/// Upper bound on a single blocking client read; bounds shutdown latency.
const READ_POLL: Duration = Duration::from_millis(100);

pub(crate) fn run_socket_worker<K: Kernel + 'static>(server: &Arc<GdbServer<K>>) {
    let mut listeners = Vec::with_capacity(MAX_DEBUG);
    for i in 0..MAX_DEBUG as u16 {
        let port = server.port_base() + i;
        let listener = match TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to bind port {}: {}", port, e);
                return;
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            error!("failed to configure listener on port {}: {}", port, e);
            return;
        }
        listeners.push((port, listener));
    }

    let _ = server.kernel.signal_event(server.started);
    info!(
        "gdb server listening on ports {}-{}",
        server.port_base(),
        server.port_base() + MAX_DEBUG as u16 - 1
    );

    let mut clients: Vec<thread::JoinHandle<()>> = Vec::new();
    while !server.is_terminating() {
        for (port, listener) in &listeners {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!("accept failed on port {}: {}", port, e);
                    continue;
                }
            };

            match server.get_client(*port) {
                Some(id) => {
                    info!("client {} connected on port {}", peer, port);
                    let server = Arc::clone(server);
                    let spawned = thread::Builder::new()
                        .name(format!("gdbserv-client-{}", id))
                        .spawn(move || serve_client(&server, id, stream));
                    match spawned {
                        Ok(handle) => clients.push(handle),
                        Err(e) => error!("failed to spawn client thread: {}", e),
                    }
                }
                None => {
                    // port not reserved (or its context already taken)
                    warn!("refusing client {} on unreserved port {}", peer, port);
                }
            }
        }

        clients.retain(|handle| !handle.is_finished());
        thread::sleep(ACCEPT_POLL);
    }

    for handle in clients {
        let _ = handle.join();
    }
    info!("socket worker exiting");
}

/// One I/O-servicing thread per accepted client.
fn serve_client<K: Kernel>(server: &Arc<GdbServer<K>>, id: usize, mut stream: TcpStream) {
    let kernel = &server.kernel;

    let accepted = match stream.try_clone() {
        Ok(mut write_half) => {
            if let Err(e) = write_half.on_session_start() {
                warn!("session setup failed: {}", e);
            }
            let mut inner = lock(&server.ctxs[id].inner);
            inner.conn = Some(Box::new(write_half));
            accept_client(&mut inner, kernel)
        }
        Err(e) => {
            warn!("failed to clone client stream: {}", e);
            false
        }
    };

    if accepted {
        let mut recv = RecvPacketStateMachine::new();

        'session: while !server.is_terminating() {
            let byte = match stream.read(READ_POLL) {
                Ok(Some(byte)) => byte,
                Ok(None) => continue,
                Err(_) => break 'session,
            };

            match recv.pump(byte) {
                Ok(None) => {}
                Ok(Some(frame)) => {
                    let frame = std::mem::take(frame);
                    let mut inner = lock(&server.ctxs[id].inner);
                    match process_packet(server, &mut inner, frame) {
                        PacketOutcome::Continue => {}
                        PacketOutcome::Close => break 'session,
                    }
                }
                Err(()) => {
                    warn!("oversized inbound frame, NAKing");
                    let mut inner = lock(&server.ctxs[id].inner);
                    let _ = inner.send_byte(b'-');
                }
            }
        }
    }

    // teardown: close then release, exactly once, whatever path got here
    {
        let mut inner = lock(&server.ctxs[id].inner);
        server.watchpoints.remove_all(&mut inner, kernel);
        inner.close(kernel);
        let _ = kernel.signal_event(server.status_updated);
        inner.release(kernel);
    }
    info!("client on context {} disconnected", id);
}

/// The accept prelude: bring the debuggee under debugger control before
/// the first packet is answered.
fn accept_client<K: Kernel>(inner: &mut ContextInner, kernel: &K) -> bool {
    inner.state = ContextState::Connected;
    inner.process_exited = false;
    inner.process_ended = false;
    inner.send_buf.clear();

    let attach_now = inner.flags.contains(ContextFlags::ATTACHED_AT_START)
        || (inner.pid != 0 && inner.pid != PID_NEXT_APPLICATION);

    if attach_now {
        if let Err(e) = attach_prelude(inner, kernel) {
            warn!("attach to pid {} failed: {}", inner.pid, e);
            return false;
        }
        if let Err(e) = kernel.signal_event(inner.client_accepted) {
            warn!("failed to signal accept: {}", e);
            return false;
        }
        true
    } else if inner.pid == PID_NEXT_APPLICATION {
        // reserved slot whose debug handle never arrived
        warn!("next-application slot has no debug handle; refusing client");
        false
    } else {
        // no debuggee bound yet; the client is expected to `vAttach`
        true
    }
}

#[derive(PartialEq, Eq)]
enum PacketOutcome {
    Continue,
    Close,
}

/// Handle one received packet: ack handshake, dispatch, reply, and the
/// continue/break edge transitions.
fn process_packet<K: Kernel>(
    server: &GdbServer<K>,
    inner: &mut ContextInner,
    mut frame: Vec<u8>,
) -> PacketOutcome {
    if inner.state == ContextState::Disconnected {
        return PacketOutcome::Close;
    }

    #[cfg(feature = "trace-pkt")]
    log::trace!("<-- {}", String::from_utf8_lossy(&frame));

    let old_continuing = inner.flags.contains(ContextFlags::PROCESS_CONTINUING);
    let mut outcome = PacketOutcome::Continue;

    match Packet::from_buf(&mut frame) {
        Err(e) => {
            warn!("malformed packet: {:?}", e);
            if inner.send_byte(b'-').is_err() {
                outcome = PacketOutcome::Close;
            }
        }
        Ok(Packet::Ack) => {}
        Ok(Packet::Nack) => {
            if inner.retransmit().is_err() {
                outcome = PacketOutcome::Close;
            }
        }
        Ok(Packet::Interrupt) => handlers::handle_break(inner),
        Ok(Packet::Command(body)) => {
            if !inner.no_ack && inner.send_byte(b'+').is_err() {
                outcome = PacketOutcome::Close;
            }

            if outcome == PacketOutcome::Continue {
                let mut sess = Session {
                    inner: &mut *inner,
                    kernel: &server.kernel,
                    watchpoints: &server.watchpoints,
                };
                match handlers::dispatch(&mut sess, body) {
                    Ok(HandlerStatus::Handled) => {}
                    Ok(HandlerStatus::NeedsOk) => {
                        if inner.send_reply(|res| res.write_str("OK")).is_err() {
                            outcome = PacketOutcome::Close;
                        }
                    }
                    Ok(HandlerStatus::Disconnect(reason)) => {
                        if reason == DisconnectReason::Kill {
                            inner.flags.insert(ContextFlags::TERMINATE_PROCESS);
                        }
                        inner.state = ContextState::Closing;
                    }
                    Err(HandlerError::Errno(nn)) => {
                        let sent = inner.send_reply(|res| {
                            res.write_str("E");
                            res.write_hex(nn);
                        });
                        if sent.is_err() {
                            outcome = PacketOutcome::Close;
                        }
                    }
                    Err(HandlerError::Fatal(e)) => {
                        warn!("session fault: {}", e);
                        inner.state = ContextState::Closing;
                    }
                }
            }
        }
    }

    // pair up PROCESS_CONTINUING transitions with their kernel side:
    // set -> wake the monitor; cleared mid-run -> asynchronous break
    let now_continuing = inner.flags.contains(ContextFlags::PROCESS_CONTINUING);
    if old_continuing && !now_continuing {
        if let Some(debug) = inner.debug {
            if server.kernel.break_debug_process(debug).is_err() {
                // the process already stopped on its own; keep the
                // invariant and let the monitor report it
                inner.flags.insert(ContextFlags::PROCESS_CONTINUING);
            }
        }
    } else if !old_continuing && now_continuing {
        let _ = server.kernel.signal_event(inner.continued);
    }

    if inner.state == ContextState::Closing {
        PacketOutcome::Close
    } else {
        outcome
    }
}
