use crate::protocol::error::{ProtocolError, Result};

use super::constants::{
    CR, ETB, ETX, FIRST_FRAME_SEQUENCE, FRAME_SEQUENCE_MODULO, LF, MAX_FRAME_PAYLOAD, STX,
};

/// Represents an ASTM frame at the data link layer.
///
/// Wire layout: `STX seqDigit data (ETB|ETX) checksumHi checksumLo CR LF`.
/// The checksum is the 8-bit sum of every byte from the sequence digit
/// through the terminator inclusive, rendered as two uppercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The sequence number of the frame (0..=7)
    pub sequence: u8,
    /// The payload bytes (without STX, sequence, terminator and checksum)
    pub payload: Vec<u8>,
    /// Whether this frame terminates the transmission (ETX vs ETB)
    pub is_last: bool,
}

impl Frame {
    /// Create a new frame with the given sequence number and payload
    pub fn new(sequence: u8, payload: Vec<u8>, is_last: bool) -> Self {
        Self {
            sequence: sequence % FRAME_SEQUENCE_MODULO,
            payload,
            is_last,
        }
    }

    /// Encode the frame to bytes according to ASTM E1381
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.payload.len() + 7);

        buffer.push(STX);
        buffer.push(self.sequence + b'0');
        buffer.extend_from_slice(&self.payload);
        buffer.push(if self.is_last { ETX } else { ETB });

        // Checksum covers everything after STX, terminator included
        let checksum = Self::calculate_checksum(&buffer[1..]);
        buffer.extend_from_slice(format!("{:02X}", checksum).as_bytes());

        buffer.push(CR);
        buffer.push(LF);

        buffer
    }

    /// Parse a frame from bytes according to ASTM E1381.
    ///
    /// Validates the STX prefix, sequence digit range, ETB/ETX terminator,
    /// the two uppercase hex checksum characters, the trailing CR LF, and
    /// that the recomputed checksum matches.
    pub fn parse(data: &[u8]) -> Result<Self> {
        // STX + seq + terminator + 2 checksum chars + CR LF
        if data.len() < 7 {
            return Err(ProtocolError::InvalidFrameFormat(
                "Frame too short".to_string(),
            ));
        }

        if data[0] != STX {
            return Err(ProtocolError::InvalidFrameFormat(format!(
                "Invalid start byte: 0x{:02X}",
                data[0]
            )));
        }

        if !data[1].is_ascii_digit() || data[1] > b'7' {
            return Err(ProtocolError::InvalidFrameSequence(format!(
                "Sequence digit out of range: 0x{:02X}",
                data[1]
            )));
        }
        let sequence = data[1] - b'0';

        // The terminator is a fixed distance from the end of the frame
        if data[data.len() - 2] != CR || data[data.len() - 1] != LF {
            return Err(ProtocolError::InvalidFrameFormat(
                "Missing CR LF trailer".to_string(),
            ));
        }

        let terminator_pos = data.len() - 5;
        if terminator_pos < 2 {
            return Err(ProtocolError::InvalidFrameFormat(
                "Frame too short for terminator".to_string(),
            ));
        }

        let terminator = data[terminator_pos];
        let is_last = match terminator {
            ETX => true,
            ETB => false,
            other => {
                return Err(ProtocolError::InvalidFrameFormat(format!(
                    "Invalid terminator: 0x{:02X}",
                    other
                )))
            }
        };

        let payload = data[2..terminator_pos].to_vec();

        let expected = Self::parse_checksum(&data[terminator_pos + 1..terminator_pos + 3])?;
        let actual = Self::calculate_checksum(&data[1..=terminator_pos]);
        if expected != actual {
            return Err(ProtocolError::InvalidChecksum {
                expected: format!("{:02X}", expected),
                actual: format!("{:02X}", actual),
            });
        }

        Ok(Self {
            sequence,
            payload,
            is_last,
        })
    }

    /// Calculate the checksum of a byte slice (sum of byte values mod 256)
    pub fn calculate_checksum(data: &[u8]) -> u8 {
        let sum: u32 = data.iter().map(|&b| b as u32).sum();
        (sum % 256) as u8
    }

    /// Parse a two-character uppercase hexadecimal checksum into a byte
    fn parse_checksum(checksum_bytes: &[u8]) -> Result<u8> {
        if checksum_bytes.len() < 2 {
            return Err(ProtocolError::InvalidFrameFormat(
                "Checksum too short".to_string(),
            ));
        }

        if checksum_bytes
            .iter()
            .any(|b| !b.is_ascii_digit() && !(b'A'..=b'F').contains(b))
        {
            return Err(ProtocolError::InvalidFrameFormat(
                "Checksum is not two uppercase hex digits".to_string(),
            ));
        }

        let hex_str = std::str::from_utf8(&checksum_bytes[..2]).map_err(|_| {
            ProtocolError::InvalidFrameFormat("Invalid checksum encoding".to_string())
        })?;

        u8::from_str_radix(hex_str, 16)
            .map_err(|_| ProtocolError::InvalidFrameFormat("Invalid checksum format".to_string()))
    }

    /// Advance a frame sequence number (1,2,..,7,0,1,..)
    pub fn next_sequence(sequence: u8) -> u8 {
        (sequence + 1) % FRAME_SEQUENCE_MODULO
    }
}

/// Split transmission content into frames ready for the wire.
///
/// Content longer than the soft payload limit is carried in consecutive
/// ETB-terminated frames with only the final frame carrying ETX. Splits
/// prefer a CR record boundary inside the window; a raw byte boundary is the
/// fallback when a single record overruns the limit. Sequence numbers start
/// at 1 and cycle through 0 after 7.
pub fn split_into_frames(content: &[u8]) -> Vec<Frame> {
    split_into_frames_with_limit(content, MAX_FRAME_PAYLOAD)
}

/// Split with an explicit payload limit (exposed for tests and config)
pub fn split_into_frames_with_limit(content: &[u8], limit: usize) -> Vec<Frame> {
    let limit = limit.max(1);
    let mut frames = Vec::new();
    let mut sequence = FIRST_FRAME_SEQUENCE;
    let mut rest = content;

    loop {
        if rest.len() <= limit {
            frames.push(Frame::new(sequence, rest.to_vec(), true));
            break;
        }

        let window = &rest[..limit];
        let cut = match window.iter().rposition(|&b| b == CR) {
            Some(pos) if pos + 1 < rest.len() => pos + 1,
            _ => limit,
        };

        frames.push(Frame::new(sequence, rest[..cut].to_vec(), false));
        sequence = Frame::next_sequence(sequence);
        rest = &rest[cut..];
    }

    frames
}
