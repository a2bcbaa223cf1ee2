//! MBAP framing over a byte stream.
//!
//! Wrapping prefixes a PDU with the 7-byte Modbus Application Protocol
//! header. Unwrapping is driven by [`FrameDecoder`], a resumable state
//! machine that accepts bytes in whatever chunks the transport delivers.

use bytes::{Buf, BytesMut};
use mbtcp_common::error::{ModbusError, ModbusResult};
use tracing::trace;

use crate::pdu::{Pdu, MAX_PDU_SIZE};

/// Modbus protocol identifier; anything else is not Modbus.
pub const PROTOCOL_ID: u16 = 0;

/// Largest complete frame on the wire (header + PDU).
pub const MAX_FRAME_SIZE: usize = MbapHeader::SIZE + MAX_PDU_SIZE;

/// Modbus TCP Application Protocol (MBAP) header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier (echoed by server).
    pub transaction_id: u16,
    /// Protocol identifier (0 for Modbus).
    pub protocol_id: u16,
    /// Length of remaining data (unit ID + PDU).
    pub length: u16,
    /// Unit identifier (slave address).
    pub unit_id: u8,
}

impl MbapHeader {
    /// MBAP header size in bytes.
    pub const SIZE: usize = 7;

    /// Create a header announcing a PDU of `pdu_length` bytes.
    ///
    /// The length field saturates at `u16::MAX`; [`MbapHeader::validate`]
    /// rejects anything above the Modbus limit.
    pub fn new(transaction_id: u16, pdu_length: u16, unit_id: u8) -> Self {
        Self {
            transaction_id,
            protocol_id: PROTOCOL_ID,
            length: pdu_length.saturating_add(1), // +1 for unit_id
            unit_id,
        }
    }

    /// Serialize the header to bytes (big-endian).
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }

    /// Parse a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::FrameError`] if fewer than 7 bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> ModbusResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ModbusError::FrameError(format!(
                "MBAP header too short: {} bytes",
                bytes.len()
            )));
        }

        Ok(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }

    /// Check the protocol id and length field.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::FrameError`] for a non-zero protocol id, a zero
    /// length, or a length announcing more than [`MAX_PDU_SIZE`] PDU bytes.
    pub fn validate(&self) -> ModbusResult<()> {
        if self.protocol_id != PROTOCOL_ID {
            return Err(ModbusError::FrameError(format!(
                "invalid protocol ID: {}",
                self.protocol_id
            )));
        }
        if self.length == 0 {
            return Err(ModbusError::FrameError("zero length field".into()));
        }
        if self.pdu_length() > MAX_PDU_SIZE {
            return Err(ModbusError::FrameError(format!(
                "length field {} exceeds {} byte PDU limit",
                self.length, MAX_PDU_SIZE
            )));
        }
        Ok(())
    }

    /// PDU bytes that follow the header.
    #[inline]
    pub fn pdu_length(&self) -> usize {
        usize::from(self.length).saturating_sub(1)
    }
}

/// A complete, unwrapped frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Transaction identifier from the header.
    pub transaction_id: u16,
    /// Unit identifier from the header.
    pub unit_id: u8,
    /// The carried PDU.
    pub pdu: Pdu,
}

impl Frame {
    /// Bundle a PDU with its addressing.
    pub fn new(transaction_id: u16, unit_id: u8, pdu: Pdu) -> Self {
        Self {
            transaction_id,
            unit_id,
            pdu,
        }
    }

    /// Wrap into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::FrameError`] if the PDU exceeds [`MAX_PDU_SIZE`].
    pub fn encode(&self) -> ModbusResult<Vec<u8>> {
        wrap(self.transaction_id, self.unit_id, &self.pdu)
    }
}

/// Prefix `pdu` with an MBAP header.
///
/// # Errors
///
/// Returns [`ModbusError::FrameError`] if the PDU exceeds [`MAX_PDU_SIZE`].
pub fn wrap(transaction_id: u16, unit_id: u8, pdu: &Pdu) -> ModbusResult<Vec<u8>> {
    let pdu_len = pdu.len();
    if pdu_len > MAX_PDU_SIZE {
        return Err(ModbusError::FrameError(format!(
            "PDU of {pdu_len} bytes exceeds {MAX_PDU_SIZE} byte limit"
        )));
    }

    let header = MbapHeader::new(transaction_id, pdu_len as u16, unit_id);
    let mut frame = Vec::with_capacity(MbapHeader::SIZE + pdu_len);
    frame.extend_from_slice(&header.to_bytes());
    frame.push(pdu.function());
    frame.extend_from_slice(pdu.payload());
    Ok(frame)
}

/// Where the decoder is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    /// Waiting for 7 header bytes.
    AwaitingHeader,
    /// Header parsed; waiting for `length - 1` PDU bytes.
    AwaitingBody(MbapHeader),
}

/// Incremental MBAP unwrapper.
///
/// Feed it whatever the transport returned, then drain complete frames with
/// [`FrameDecoder::next_frame`]. Bytes past the end of a frame stay buffered
/// for the next one.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: DecoderState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_SIZE),
            state: DecoderState::AwaitingHeader,
        }
    }

    /// Append received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes still waiting to form a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True between frames with nothing buffered.
    pub fn is_idle(&self) -> bool {
        self.state == DecoderState::AwaitingHeader && self.buffer.is_empty()
    }

    /// Drop buffered bytes and return to `AwaitingHeader`.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = DecoderState::AwaitingHeader;
    }

    /// Pull the next complete frame, if the buffer holds one.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::FrameError`] on an invalid header, or
    /// [`ModbusError::MalformedPdu`] when a frame carries an empty PDU. The
    /// decoder is reset on error; the stream should be considered
    /// desynchronized.
    pub fn next_frame(&mut self) -> ModbusResult<Option<Frame>> {
        loop {
            match self.state {
                DecoderState::AwaitingHeader => {
                    if self.buffer.len() < MbapHeader::SIZE {
                        return Ok(None);
                    }
                    let header = MbapHeader::from_bytes(&self.buffer[..MbapHeader::SIZE])?;
                    if let Err(e) = header.validate() {
                        self.reset();
                        return Err(e);
                    }
                    self.buffer.advance(MbapHeader::SIZE);
                    self.state = DecoderState::AwaitingBody(header);
                }
                DecoderState::AwaitingBody(header) => {
                    let needed = header.pdu_length();
                    if self.buffer.len() < needed {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(needed).freeze();
                    self.state = DecoderState::AwaitingHeader;

                    let pdu = match Pdu::from_bytes(body) {
                        Ok(pdu) => pdu,
                        Err(e) => {
                            self.reset();
                            return Err(e);
                        }
                    };

                    trace!(
                        transaction_id = header.transaction_id,
                        unit_id = header.unit_id,
                        function = pdu.function(),
                        pdu_len = needed,
                        "Frame decoded"
                    );

                    return Ok(Some(Frame::new(header.transaction_id, header.unit_id, pdu)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::Request;

    fn sample_frame() -> Frame {
        let pdu = Request::WriteMultipleRegisters {
            address: 0,
            values: vec![10, 20, 30],
        }
        .encode();
        Frame::new(0xBEEF, 1, pdu)
    }

    #[test]
    fn test_mbap_header_serialization() {
        let header = MbapHeader::new(0x1234, 5, 1);
        let bytes = header.to_bytes();

        assert_eq!(bytes[0], 0x12); // transaction_id high
        assert_eq!(bytes[1], 0x34); // transaction_id low
        assert_eq!(bytes[2], 0x00); // protocol_id high
        assert_eq!(bytes[3], 0x00); // protocol_id low
        assert_eq!(bytes[4], 0x00); // length high (5 + 1 = 6)
        assert_eq!(bytes[5], 0x06); // length low
        assert_eq!(bytes[6], 0x01); // unit_id
    }

    #[test]
    fn test_mbap_header_length_saturates() {
        let header = MbapHeader::new(1, u16::MAX, 1);
        assert_eq!(header.length, u16::MAX);
        assert!(matches!(header.validate(), Err(ModbusError::FrameError(_))));
    }

    #[test]
    fn test_mbap_header_parsing() {
        let bytes = [0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01];
        let header = MbapHeader::from_bytes(&bytes).unwrap();

        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.protocol_id, 0);
        assert_eq!(header.length, 6);
        assert_eq!(header.unit_id, 1);
        assert_eq!(header.pdu_length(), 5);
    }

    #[test]
    fn test_wrap_layout() {
        let pdu = Pdu::from_slice(&[0x03, 0x00, 0x00, 0x00, 0x03]).unwrap();
        let bytes = wrap(7, 0xFF, &pdu).unwrap();
        assert_eq!(
            bytes,
            [0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0xFF, 0x03, 0x00, 0x00, 0x00, 0x03]
        );
    }

    #[test]
    fn test_wrap_rejects_oversized_pdu() {
        let pdu = Pdu::new(0x10, vec![0u8; MAX_PDU_SIZE]);
        assert!(matches!(wrap(1, 1, &pdu), Err(ModbusError::FrameError(_))));
    }

    #[test]
    fn test_unwrap_whole_frame() {
        let frame = sample_frame();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame.encode().unwrap());

        assert_eq!(decoder.next_frame().unwrap(), Some(frame));
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_unwrap_in_small_chunks() {
        let frame = sample_frame();
        let bytes = frame.encode().unwrap();

        for chunk_size in 1..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                decoder.feed(chunk);
                while let Some(f) = decoder.next_frame().unwrap() {
                    decoded.push(f);
                }
            }
            assert_eq!(decoded, vec![frame.clone()], "chunk size {chunk_size}");
            assert!(decoder.is_idle());
        }
    }

    #[test]
    fn test_back_to_back_frames() {
        let first = sample_frame();
        let second = Frame::new(
            2,
            1,
            Request::ReadHoldingRegisters {
                address: 0,
                count: 3,
            }
            .encode(),
        );

        let mut stream = first.encode().unwrap();
        stream.extend(second.encode().unwrap());
        // Half of a third frame
        let third = second.encode().unwrap();
        stream.extend_from_slice(&third[..4]);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&stream);
        assert_eq!(decoder.next_frame().unwrap(), Some(first));
        assert_eq!(decoder.next_frame().unwrap(), Some(second));
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 4);
        assert!(!decoder.is_idle());
    }

    #[test]
    fn test_bad_protocol_id() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0x00, 0x01, 0xDE, 0xAD, 0x00, 0x06, 0x01]);
        assert!(matches!(
            decoder.next_frame(),
            Err(ModbusError::FrameError(_))
        ));
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_bad_length_field() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01]);
        assert!(matches!(
            decoder.next_frame(),
            Err(ModbusError::FrameError(_))
        ));

        // 255 = unit id + 254 PDU bytes, one past the limit
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0x00, 0x01, 0x00, 0x00, 0x00, 0xFF, 0x01]);
        assert!(matches!(
            decoder.next_frame(),
            Err(ModbusError::FrameError(_))
        ));
    }

    #[test]
    fn test_largest_frame_accepted() {
        let pdu = Pdu::new(0x10, vec![0xAAu8; MAX_PDU_SIZE - 1]);
        let frame = Frame::new(9, 1, pdu);
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame.encode().unwrap());
        assert_eq!(decoder.next_frame().unwrap(), Some(frame));
    }

    #[test]
    fn test_empty_pdu_frame_is_malformed() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01]);
        assert!(matches!(
            decoder.next_frame(),
            Err(ModbusError::MalformedPdu(_))
        ));
    }
}
