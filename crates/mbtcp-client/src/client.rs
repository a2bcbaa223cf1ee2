//! Client transaction engine.
//!
//! Each call allocates a transaction id, sends one framed request and reads
//! frames until the matching response arrives or the deadline passes.
//! Frames carrying another transaction id are late answers to earlier,
//! abandoned calls and are dropped.

use mbtcp_common::config::ClientConfig;
use mbtcp_common::error::{ModbusError, ModbusResult};
use mbtcp_protocol::{wrap, Frame, FrameDecoder, Request, Response, MAX_FRAME_SIZE};
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::transport::{CloseHandle, Transport};

/// Per-read timeout used when a call has no representable deadline.
const UNBOUNDED_READ_SLICE: Duration = Duration::from_secs(3600);

/// Modbus TCP client holding one persistent connection.
pub struct ModbusTcpClient<T: Transport = TcpStream> {
    config: ClientConfig,
    /// `None` once the connection has been lost or closed.
    transport: Option<T>,
    transaction_id: u16,
    /// Receive buffer; survives timeouts so late frames are recognized.
    decoder: FrameDecoder,
}

impl ModbusTcpClient<TcpStream> {
    /// Connect to `config.server_address`.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::Io`] if the address does not resolve or no
    /// resolved address accepts the connection within `connect_timeout`.
    pub fn connect(config: &ClientConfig) -> ModbusResult<Self> {
        let stream = Self::open(config)?;
        Ok(Self::with_transport(stream, config.clone()))
    }

    /// Drop the current connection, if any, and connect again.
    ///
    /// # Errors
    ///
    /// Same as [`ModbusTcpClient::connect`].
    pub fn reconnect(&mut self) -> ModbusResult<()> {
        self.close();
        self.transport = Some(Self::open(&self.config)?);
        Ok(())
    }

    /// Handle that shuts this connection down from another thread.
    ///
    /// # Errors
    ///
    /// - [`ModbusError::ConnectionClosed`] if the client is not connected.
    /// - [`ModbusError::Io`] if the socket cannot be duplicated.
    pub fn close_handle(&self) -> ModbusResult<CloseHandle> {
        let stream = self
            .transport
            .as_ref()
            .ok_or(ModbusError::ConnectionClosed)?;
        Ok(CloseHandle::new(stream.try_clone()?))
    }

    fn open(config: &ClientConfig) -> ModbusResult<TcpStream> {
        info!(addr = %config.server_address, "Connecting to Modbus TCP server");

        let mut last_error = None;
        for addr in config.server_address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    info!(%addr, unit_id = config.unit_id, "Connected to Modbus TCP server");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "Connection attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => ModbusError::Io(format!(
                "connection to {} failed: {e}",
                config.server_address
            )),
            None => ModbusError::Io(format!(
                "{} did not resolve to any address",
                config.server_address
            )),
        })
    }
}

impl<T: Transport> ModbusTcpClient<T> {
    /// Run the client over an already established transport.
    pub fn with_transport(transport: T, config: ClientConfig) -> Self {
        Self {
            config,
            transport: Some(transport),
            transaction_id: 0,
            decoder: FrameDecoder::new(),
        }
    }

    /// Unit identifier placed in every request.
    pub fn unit_id(&self) -> u8 {
        self.config.unit_id
    }

    /// Whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Shut the connection down. Later calls fail with `ConnectionClosed`.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.shutdown() {
                debug!(error = %e, "Shutdown of closed transport failed");
            }
            info!(addr = %self.config.server_address, "Disconnected from Modbus TCP server");
        }
        self.decoder.reset();
    }

    /// Get the next transaction ID.
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    /// Read `count` consecutive holding registers starting at `address`.
    ///
    /// # Errors
    ///
    /// - [`ModbusError::InvalidRequest`] if `count` is outside 1..=125.
    /// - [`ModbusError::Exception`] if the server answered with an exception.
    /// - [`ModbusError::Timeout`] or [`ModbusError::ConnectionClosed`] if no
    ///   answer arrived.
    pub fn read_registers(&mut self, address: u16, count: u16) -> ModbusResult<Vec<u16>> {
        let request = Request::ReadHoldingRegisters { address, count };
        match self.call(&request, self.config.response_timeout)? {
            Response::ReadHoldingRegisters(values) if values.len() == usize::from(count) => {
                Ok(values)
            }
            Response::ReadHoldingRegisters(values) => {
                Err(ModbusError::UnexpectedResponse(format!(
                    "requested {count} registers, received {}",
                    values.len()
                )))
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Read one holding register.
    ///
    /// # Errors
    ///
    /// Same as [`ModbusTcpClient::read_registers`].
    pub fn read_register(&mut self, address: u16) -> ModbusResult<u16> {
        let values = self.read_registers(address, 1)?;
        Ok(values[0])
    }

    /// Write one holding register.
    ///
    /// # Errors
    ///
    /// - [`ModbusError::WriteMismatch`] if the echo differs from the request.
    /// - Any transaction error of [`ModbusTcpClient::call`].
    pub fn write_register(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        let request = Request::WriteSingleRegister { address, value };
        match self.call(&request, self.config.response_timeout)? {
            Response::WriteSingleRegister {
                address: echoed_address,
                value: echoed_value,
            } => {
                check_echo("address", address, echoed_address)?;
                check_echo("value", value, echoed_value)
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Write consecutive holding registers starting at `address`.
    ///
    /// # Errors
    ///
    /// - [`ModbusError::InvalidRequest`] if `values` is empty or longer than 123.
    /// - [`ModbusError::WriteMismatch`] if the acknowledged range differs.
    /// - Any transaction error of [`ModbusTcpClient::call`].
    pub fn write_registers(&mut self, address: u16, values: &[u16]) -> ModbusResult<()> {
        let request = Request::WriteMultipleRegisters {
            address,
            values: values.to_vec(),
        };
        match self.call(&request, self.config.response_timeout)? {
            Response::WriteMultipleRegisters {
                address: echoed_address,
                count,
            } => {
                check_echo("address", address, echoed_address)?;
                // validate() has bounded the length to 123
                check_echo("count", values.len() as u16, count)
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Run one transaction with an explicit deadline.
    ///
    /// Exception responses are returned as [`ModbusError::Exception`], so a
    /// successful result is always a normal response to `request`.
    ///
    /// # Errors
    ///
    /// - [`ModbusError::InvalidRequest`] if the request fails local validation;
    ///   nothing is sent.
    /// - [`ModbusError::Timeout`] if no matching response arrives in time.
    /// - [`ModbusError::ConnectionClosed`] if the transport is closed; the
    ///   client stays disconnected afterwards.
    /// - [`ModbusError::FrameError`] if the byte stream is not Modbus TCP; the
    ///   connection is dropped.
    /// - [`ModbusError::MalformedPdu`] or [`ModbusError::UnexpectedResponse`]
    ///   if the matching response is unusable.
    pub fn call(&mut self, request: &Request, timeout: Duration) -> ModbusResult<Response> {
        request.validate()?;
        if self.transport.is_none() {
            return Err(ModbusError::ConnectionClosed);
        }

        let transaction_id = self.next_transaction_id();
        let unit_id = self.config.unit_id;
        let frame = wrap(transaction_id, unit_id, &request.encode())?;
        // Too far out to represent means no deadline at all
        let deadline = Instant::now().checked_add(timeout);

        trace!(
            transaction_id,
            function = request.function_code().as_byte(),
            frame_len = frame.len(),
            "Sending Modbus request"
        );
        self.send(&frame)?;

        let reply = self.receive(transaction_id, deadline, timeout)?;
        if reply.unit_id != unit_id {
            return Err(ModbusError::UnexpectedResponse(format!(
                "unit id mismatch: expected {unit_id}, got {}",
                reply.unit_id
            )));
        }

        let response = Response::decode(&reply.pdu)?;
        let expected = request.function_code().as_byte();
        if response.function() != expected {
            return Err(ModbusError::UnexpectedResponse(format!(
                "function code mismatch: expected 0x{expected:02X}, got 0x{:02X}",
                reply.pdu.function()
            )));
        }

        trace!(transaction_id, pdu_len = reply.pdu.len(), "Received Modbus response");

        match response {
            Response::Exception { function, code } => {
                debug!(transaction_id, function, %code, "Server answered with exception");
                Err(ModbusError::Exception { function, code })
            }
            response => Ok(response),
        }
    }

    fn send(&mut self, frame: &[u8]) -> ModbusResult<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(ModbusError::ConnectionClosed);
        };
        let written = transport.write_all(frame).and_then(|()| transport.flush());
        match written {
            Ok(()) => Ok(()),
            Err(e) => Err(self.disconnect(e.into())),
        }
    }

    /// Read frames until one carries `transaction_id`.
    fn receive(
        &mut self,
        transaction_id: u16,
        deadline: Option<Instant>,
        timeout: Duration,
    ) -> ModbusResult<Frame> {
        let mut buffer = [0u8; MAX_FRAME_SIZE];

        loop {
            loop {
                let frame = match self.decoder.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => return Err(self.disconnect(e)),
                };
                if frame.transaction_id == transaction_id {
                    return Ok(frame);
                }
                debug!(
                    expected = transaction_id,
                    received = frame.transaction_id,
                    "Discarding stale response"
                );
            }

            let read_timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(transaction_id, ?timeout, "Response timed out");
                        return Err(ModbusError::Timeout(timeout));
                    }
                    deadline - now
                }
                None => UNBOUNDED_READ_SLICE,
            };

            let Some(transport) = self.transport.as_mut() else {
                return Err(ModbusError::ConnectionClosed);
            };
            let read = transport
                .set_read_timeout(read_timeout)
                .and_then(|()| transport.read(&mut buffer));
            match read {
                Ok(0) => return Err(self.disconnect(ModbusError::ConnectionClosed)),
                Ok(n) => self.decoder.feed(&buffer[..n]),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(self.disconnect(e.into())),
            }
        }
    }

    /// Drop the transport after a fatal fault and hand the fault back.
    fn disconnect(&mut self, error: ModbusError) -> ModbusError {
        warn!(
            addr = %self.config.server_address,
            error = %error,
            "Modbus TCP connection lost"
        );
        if let Some(mut transport) = self.transport.take() {
            // The peer may already be gone
            let _ = transport.shutdown();
        }
        self.decoder.reset();
        error
    }
}

impl<T: Transport> Drop for ModbusTcpClient<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_echo(field: &'static str, expected: u16, actual: u16) -> ModbusResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ModbusError::WriteMismatch {
            field,
            expected,
            actual,
        })
    }
}

fn unexpected(response: &Response) -> ModbusError {
    ModbusError::UnexpectedResponse(format!("unexpected response {response:?}"))
}
