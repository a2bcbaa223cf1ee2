//! Byte-stream transports the client can run over.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// Smallest read timeout handed to the OS; zero means "block forever" there.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Ordered, reliable byte stream.
pub trait Transport: Read + Write {
    /// Bound the next blocking read to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the timeout cannot be applied.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Close both directions of the stream.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the shutdown fails.
    fn shutdown(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        TcpStream::set_read_timeout(self, Some(timeout.max(MIN_READ_TIMEOUT)))
    }

    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// Closes a client's connection from another thread.
///
/// A call blocked in a read returns [`mbtcp_common::error::ModbusError::ConnectionClosed`]
/// as soon as the socket is shut down.
#[derive(Debug)]
pub struct CloseHandle {
    stream: TcpStream,
}

impl CloseHandle {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Shut the connection down. Closing an already closed connection is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the shutdown fails for another reason.
    pub fn close(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_zero_timeout_is_clamped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        Transport::set_read_timeout(&mut stream, Duration::ZERO).unwrap();
        assert_eq!(stream.read_timeout().unwrap(), Some(MIN_READ_TIMEOUT));
    }

    #[test]
    fn test_close_handle_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let handle = CloseHandle::new(stream.try_clone().unwrap());

        handle.close().unwrap();
        handle.close().unwrap();
    }
}
