use crate::conn::Connection;
use crate::conn::ConnectionExt;
use std::net::TcpStream;
use std::time::Duration;

impl Connection for TcpStream {
    type Error = std::io::Error;

    fn write(&mut self, byte: u8) -> Result<(), Self::Error> {
        use std::io::Write;

        Write::write_all(self, &[byte])
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        use std::io::Write;

        Write::write_all(self, buf)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        use std::io::Write;

        Write::flush(self)
    }

    fn on_session_start(&mut self) -> Result<(), Self::Error> {
        self.set_nodelay(true)
    }
}

impl ConnectionExt for TcpStream {
    fn read(&mut self, timeout: Duration) -> Result<Option<u8>, Self::Error> {
        use std::io::Read;

        self.set_read_timeout(Some(timeout))?;

        let mut buf = [0u8];
        match Read::read(self, &mut buf) {
            // a zero-length read is EOF: the peer closed the connection
            Ok(0) => Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(_) => Ok(Some(buf[0])),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
