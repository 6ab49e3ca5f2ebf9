//! Traits to perform in-order, serial, byte-wise I/O.

mod impls;

use std::time::Duration;

/// A trait to perform in-order, serial, byte-wise I/O.
///
/// This trait is implemented for [`TcpStream`](std::net::TcpStream) out of
/// the box.
pub trait Connection: Send {
    /// Transport-specific error type.
    type Error;

    /// Write a single byte.
    fn write(&mut self, byte: u8) -> Result<(), Self::Error>;

    /// Write the entire buffer, blocking until complete.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        for b in buf {
            self.write(*b)?;
        }
        Ok(())
    }

    /// Flush this Connection, ensuring that all intermediately buffered
    /// contents reach their destination.
    fn flush(&mut self) -> Result<(), Self::Error>;

    /// Called once when a client session begins, _before_ any GDB packets
    /// have been sent/received.
    ///
    /// The `TcpStream` implementation uses this to `set_nodelay(true)`:
    /// RSP exchanges many tiny packets, and leaving Nagle's algorithm
    /// enabled wrecks interactive latency.
    fn on_session_start(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Extends [`Connection`] with a bounded read, used by the socket worker
/// to service a client while periodically observing server shutdown.
pub trait ConnectionExt: Connection {
    /// Read a single byte, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the timeout elapsed with no byte available,
    /// and `Err` on a closed or faulted transport.
    fn read(&mut self, timeout: Duration) -> Result<Option<u8>, Self::Error>;
}
