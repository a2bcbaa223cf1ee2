//! Per-connection request handling.
//!
//! A [`Session`] reads bytes from one client, unwraps frames, executes each
//! request against the shared [`UnitContext`], and writes the answer with
//! the request's transaction and unit identifiers.

use mbtcp_common::error::{ModbusError, ModbusResult};
use mbtcp_protocol::{Frame, FrameDecoder, Pdu, Request, Response, MAX_FRAME_SIZE};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::datastore::{RegisterKind, UnitContext};

/// Run one request against the holding register view of `context`.
fn execute(context: &UnitContext, request: &Request) -> ModbusResult<Response> {
    match request {
        Request::ReadHoldingRegisters { address, count } => {
            let values = context.get(RegisterKind::HoldingRegisters, *address, *count)?;
            Ok(Response::ReadHoldingRegisters(values))
        }
        Request::WriteSingleRegister { address, value } => {
            context.set(RegisterKind::HoldingRegisters, *address, &[*value])?;
            Ok(Response::WriteSingleRegister {
                address: *address,
                value: *value,
            })
        }
        Request::WriteMultipleRegisters { address, values } => {
            context.set(RegisterKind::HoldingRegisters, *address, values)?;
            Ok(Response::WriteMultipleRegisters {
                address: *address,
                count: values.len() as u16,
            })
        }
    }
}

/// Decode a request PDU, execute it, and encode the answer.
///
/// Faults that have a Modbus exception code are answered with an exception
/// response.
///
/// # Errors
///
/// Returns the fault when it has no exception code (a malformed PDU); the
/// caller should end the session.
pub fn process_request(context: &UnitContext, pdu: &Pdu) -> ModbusResult<Pdu> {
    let outcome = Request::decode(pdu).and_then(|request| execute(context, &request));

    let response = match outcome {
        Ok(response) => response,
        Err(e) => match e.exception_code() {
            Some(code) => {
                debug!(function = pdu.function(), error = %e, "Answering with exception");
                Response::exception(pdu.function(), code)
            }
            None => return Err(e),
        },
    };

    Ok(response.encode())
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the connection.
    PeerClosed,
    /// The server is shutting down.
    Stopped,
}

/// One client connection.
pub struct Session<S> {
    stream: S,
    context: Arc<UnitContext>,
    decoder: FrameDecoder,
    stop_signal: Arc<AtomicBool>,
    requests_served: u64,
}

impl<S: Read + Write> Session<S> {
    /// Wrap an accepted stream.
    ///
    /// The stream should have a read timeout so the stop signal is polled.
    pub fn new(stream: S, context: Arc<UnitContext>, stop_signal: Arc<AtomicBool>) -> Self {
        Self {
            stream,
            context,
            decoder: FrameDecoder::new(),
            stop_signal,
            requests_served: 0,
        }
    }

    /// Requests answered so far.
    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    /// Serve requests until the peer disconnects or the server stops.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::FrameError`] or [`ModbusError::MalformedPdu`] for a
    /// protocol violation, or a transport error; either way the connection
    /// should be dropped.
    pub fn run(&mut self) -> ModbusResult<SessionEnd> {
        let mut buffer = [0u8; MAX_FRAME_SIZE];

        while !self.stop_signal.load(Ordering::SeqCst) {
            let n = match self.stream.read(&mut buffer) {
                Ok(0) => return Ok(SessionEnd::PeerClosed),
                Ok(n) => n,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.decoder.feed(&buffer[..n]);
            while let Some(frame) = self.decoder.next_frame()? {
                self.answer(&frame)?;
            }
        }

        Ok(SessionEnd::Stopped)
    }

    fn answer(&mut self, frame: &Frame) -> ModbusResult<()> {
        let pdu = process_request(&self.context, &frame.pdu)?;
        let reply = Frame::new(frame.transaction_id, frame.unit_id, pdu).encode()?;

        trace!(
            transaction_id = frame.transaction_id,
            unit_id = frame.unit_id,
            reply_len = reply.len(),
            "Sending response"
        );

        self.stream.write_all(&reply).map_err(ModbusError::from)?;
        self.requests_served += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbtcp_common::config::RegisterLayout;
    use mbtcp_common::error::ExceptionCode;
    use mbtcp_protocol::{wrap, FrameDecoder};
    use std::io::{self, Cursor};

    fn context() -> UnitContext {
        UnitContext::new(1024, RegisterLayout::Independent)
    }

    #[test]
    fn test_process_read() {
        let ctx = context();
        ctx.set(RegisterKind::HoldingRegisters, 0, &[0x1234, 0x5678])
            .unwrap();

        let request = Request::ReadHoldingRegisters {
            address: 0,
            count: 2,
        }
        .encode();
        let reply = process_request(&ctx, &request).unwrap();
        assert_eq!(reply.to_bytes(), [0x03, 0x04, 0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_process_write_single_echoes() {
        let ctx = context();
        let request = Request::WriteSingleRegister {
            address: 10,
            value: 0x1234,
        }
        .encode();
        let reply = process_request(&ctx, &request).unwrap();

        assert_eq!(reply, request);
        assert_eq!(
            ctx.get(RegisterKind::HoldingRegisters, 10, 1).unwrap(),
            vec![0x1234]
        );
    }

    #[test]
    fn test_process_write_multiple() {
        let ctx = context();
        let request = Request::WriteMultipleRegisters {
            address: 0,
            values: vec![10, 20, 30],
        }
        .encode();
        let reply = process_request(&ctx, &request).unwrap();

        assert_eq!(reply.to_bytes(), [0x10, 0x00, 0x00, 0x00, 0x03]);
        assert_eq!(
            ctx.get(RegisterKind::HoldingRegisters, 0, 3).unwrap(),
            vec![10, 20, 30]
        );
    }

    #[test]
    fn test_out_of_range_becomes_exception() {
        let ctx = context();
        let request = Request::ReadHoldingRegisters {
            address: 1022,
            count: 5,
        }
        .encode();
        let reply = process_request(&ctx, &request).unwrap();
        assert_eq!(
            reply,
            Pdu::exception(0x03, ExceptionCode::IllegalDataAddress)
        );

        let write = Request::WriteMultipleRegisters {
            address: 1023,
            values: vec![1, 2],
        }
        .encode();
        let reply = process_request(&ctx, &write).unwrap();
        assert_eq!(reply.to_bytes(), [0x90, 0x02]);
        assert_eq!(
            ctx.get(RegisterKind::HoldingRegisters, 1023, 1).unwrap(),
            vec![0]
        );
    }

    #[test]
    fn test_unknown_function_becomes_exception() {
        let ctx = context();
        let pdu = Pdu::from_slice(&[0x01, 0x00, 0x00, 0x00, 0x08]).unwrap();
        let reply = process_request(&ctx, &pdu).unwrap();
        assert_eq!(reply.to_bytes(), [0x81, 0x01]);
    }

    #[test]
    fn test_byte_count_mismatch_becomes_exception() {
        let ctx = context();
        let pdu = Pdu::from_slice(&[0x10, 0x00, 0x00, 0x00, 0x02, 0x03, 0x00, 0x01, 0x02])
            .unwrap();
        let reply = process_request(&ctx, &pdu).unwrap();
        assert_eq!(reply.to_bytes(), [0x90, 0x03]);
    }

    #[test]
    fn test_malformed_pdu_is_an_error() {
        let ctx = context();
        let pdu = Pdu::from_slice(&[0x03, 0x00]).unwrap();
        assert!(matches!(
            process_request(&ctx, &pdu),
            Err(ModbusError::MalformedPdu(_))
        ));
    }

    /// In-memory duplex stream: reads from a fixed input, records writes.
    struct Loopback {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            // Deliver at most 3 bytes per read to exercise reassembly
            let limit = buf.len().min(3);
            self.input.read(&mut buf[..limit])
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_session_answers_each_frame_in_order() {
        let mut input = Vec::new();
        let write = Request::WriteMultipleRegisters {
            address: 5,
            values: vec![1, 2, 3],
        }
        .encode();
        let read = Request::ReadHoldingRegisters {
            address: 5,
            count: 3,
        }
        .encode();
        input.extend(wrap(41, 1, &write).unwrap());
        input.extend(wrap(42, 1, &read).unwrap());

        let stream = Loopback {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        let mut session = Session::new(
            stream,
            Arc::new(context()),
            Arc::new(AtomicBool::new(false)),
        );
        assert_eq!(session.run().unwrap(), SessionEnd::PeerClosed);
        assert_eq!(session.requests_served(), 2);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&session.stream.output);
        let first = decoder.next_frame().unwrap().unwrap();
        let second = decoder.next_frame().unwrap().unwrap();

        assert_eq!(first.transaction_id, 41);
        assert_eq!(first.pdu.to_bytes(), [0x10, 0x00, 0x05, 0x00, 0x03]);
        assert_eq!(second.transaction_id, 42);
        assert_eq!(
            Response::decode(&second.pdu).unwrap(),
            Response::ReadHoldingRegisters(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_session_ends_on_bad_frame() {
        let stream = Loopback {
            input: Cursor::new(vec![0x00, 0x01, 0x00, 0x07, 0x00, 0x06, 0x01, 0x03]),
            output: Vec::new(),
        };
        let mut session = Session::new(
            stream,
            Arc::new(context()),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(session.run(), Err(ModbusError::FrameError(_))));
        assert!(session.stream.output.is_empty());
    }

    #[test]
    fn test_session_honours_stop_signal() {
        let stream = Loopback {
            input: Cursor::new(Vec::new()),
            output: Vec::new(),
        };
        let mut session = Session::new(
            stream,
            Arc::new(context()),
            Arc::new(AtomicBool::new(true)),
        );
        assert_eq!(session.run().unwrap(), SessionEnd::Stopped);
    }
}
