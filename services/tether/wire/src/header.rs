//! Frame header processing for the wire protocol.
//!
//! Every frame starts with a single header byte: the top two bits select the
//! frame type and the low six bits carry type-specific data (a control body
//! length or a stream id). STREAM frames are followed by a two byte
//! sub-header whose layout depends on whether the stream is still
//! initializing.

use bytes::BufMut;

use crate::WireError;

/// Largest value the six data bits of a header can carry
pub const HEADER_MAX_DATA: u8 = 0x3f;

/// Number of stream slots addressable by a header
pub const MAX_STREAMS: usize = HEADER_MAX_DATA as usize + 1;

/// Size of both stream sub-header layouts in bytes
pub const STREAM_HEADER_SIZE: usize = 2;

/// Largest payload a single STREAM frame can carry
pub const STREAM_MAX_LENGTH: u16 = 0x1fff;

/// Largest application marker of a STREAM frame
pub const STREAM_MAX_MARKER: u8 = 0x07;

/// Largest command id an initial stream header can carry
pub const INITIAL_MAX_COMMAND: u8 = 0x0f;

/// Largest data value an initial stream header can carry
pub const INITIAL_MAX_DATA: u16 = 0x07ff;

const TYPE_MASK: u8 = 0xc0;
const INITIAL_SUCCESS: u16 = 0x0800;

/// Frame types as defined by the two top bits of the header byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Control frame; data is the body length
    Control = 0x00,
    /// Stream frame; data is the stream id
    Stream = 0x40,
    /// Close request; data is the stream id
    Close = 0x80,
    /// Close acknowledgment; data is the stream id
    Completed = 0xc0,
}

impl FrameType {
    fn from_bits(value: u8) -> Self {
        match value & TYPE_MASK {
            0x00 => FrameType::Control,
            0x40 => FrameType::Stream,
            0x80 => FrameType::Close,
            _ => FrameType::Completed,
        }
    }
}

/// Control subtypes carried by the first body byte of a CONTROL frame
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    /// Latency probe, echoed back verbatim by the remote
    Echo = 0x00,
    /// Ask the remote to stop emitting STREAM frames
    PauseStream = 0x01,
    /// Ask the remote to continue emitting STREAM frames
    ResumeStream = 0x02,
}

impl TryFrom<u8> for ControlType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ControlType::Echo),
            0x01 => Ok(ControlType::PauseStream),
            0x02 => Ok(ControlType::ResumeStream),
            _ => Err(WireError::Control(value)),
        }
    }
}

/// One byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header(u8);

impl Header {
    /// Build a header, failing when `data` does not fit in six bits
    pub fn new(typ: FrameType, data: u8) -> Result<Self, WireError> {
        if data > HEADER_MAX_DATA {
            return Err(WireError::FieldTooLarge {
                field: "header data",
                value: data as usize,
                max: HEADER_MAX_DATA as usize,
            });
        }

        Ok(Self(typ as u8 | data))
    }

    /// Interpret a raw header byte
    pub fn decode(byte: u8) -> Self {
        Self(byte)
    }

    /// Frame type
    pub fn typ(&self) -> FrameType {
        FrameType::from_bits(self.0)
    }

    /// Six bit data field
    pub fn data(&self) -> u8 {
        self.0 & HEADER_MAX_DATA
    }

    /// Raw header byte
    pub fn value(&self) -> u8 {
        self.0
    }
}

/// Sub-header of a STREAM frame for a running stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Application-defined sub-type (0..7)
    pub marker: u8,
    /// Number of payload bytes that follow (0..8191)
    pub length: u16,
}

impl StreamHeader {
    /// Create a stream header, validating both fields
    pub fn new(marker: u8, length: usize) -> Result<Self, WireError> {
        if marker > STREAM_MAX_MARKER {
            return Err(WireError::FieldTooLarge {
                field: "stream marker",
                value: marker as usize,
                max: STREAM_MAX_MARKER as usize,
            });
        }

        if length > STREAM_MAX_LENGTH as usize {
            return Err(WireError::FieldTooLarge {
                field: "stream length",
                value: length,
                max: STREAM_MAX_LENGTH as usize,
            });
        }

        Ok(Self {
            marker,
            length: length as u16,
        })
    }

    /// Pack into two bytes
    pub fn pack(self) -> [u8; STREAM_HEADER_SIZE] {
        (((self.marker as u16) << 13) | self.length).to_be_bytes()
    }

    /// Unpack from two bytes
    pub fn unpack(bytes: [u8; STREAM_HEADER_SIZE]) -> Self {
        let value = u16::from_be_bytes(bytes);

        Self {
            marker: (value >> 13) as u8,
            length: value & STREAM_MAX_LENGTH,
        }
    }

    /// Encode the header to a buffer
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.pack());
    }
}

/// Sub-header of the first STREAM frame exchanged on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialStreamHeader {
    /// Command the stream was opened for (0..15)
    pub command: u8,
    /// Whether the remote accepted the request
    pub success: bool,
    /// Error code or payload length (0..2047)
    pub data: u16,
}

impl InitialStreamHeader {
    /// Create an initial stream header, validating both numeric fields
    pub fn new(command: u8, data: usize, success: bool) -> Result<Self, WireError> {
        if command > INITIAL_MAX_COMMAND {
            return Err(WireError::FieldTooLarge {
                field: "command id",
                value: command as usize,
                max: INITIAL_MAX_COMMAND as usize,
            });
        }

        if data > INITIAL_MAX_DATA as usize {
            return Err(WireError::FieldTooLarge {
                field: "initial data",
                value: data,
                max: INITIAL_MAX_DATA as usize,
            });
        }

        Ok(Self {
            command,
            success,
            data: data as u16,
        })
    }

    /// Pack into two bytes
    pub fn pack(self) -> [u8; STREAM_HEADER_SIZE] {
        let mut value = ((self.command as u16) << 12) | self.data;
        if self.success {
            value |= INITIAL_SUCCESS;
        }
        value.to_be_bytes()
    }

    /// Unpack from two bytes
    pub fn unpack(bytes: [u8; STREAM_HEADER_SIZE]) -> Self {
        let value = u16::from_be_bytes(bytes);

        Self {
            command: (value >> 12) as u8,
            success: value & INITIAL_SUCCESS != 0,
            data: value & INITIAL_MAX_DATA,
        }
    }

    /// Encode the header to a buffer
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.pack());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_type_and_data() {
        for typ in [
            FrameType::Control,
            FrameType::Stream,
            FrameType::Close,
            FrameType::Completed,
        ] {
            for data in 0..=HEADER_MAX_DATA {
                let header = Header::new(typ, data).unwrap();
                let decoded = Header::decode(header.value());
                assert_eq!(decoded.typ(), typ);
                assert_eq!(decoded.data(), data);
            }
        }

        assert!(Header::new(FrameType::Stream, 64).is_err());
        assert_eq!(Header::new(FrameType::Close, 5).unwrap().value(), 0x85);
    }

    #[test]
    fn test_stream_header_pack_unpack() {
        for marker in 0..=STREAM_MAX_MARKER {
            for length in [0usize, 1, 255, 256, 4096, 8191] {
                let header = StreamHeader::new(marker, length).unwrap();
                assert_eq!(StreamHeader::unpack(header.pack()), header);
            }
        }

        assert_eq!(StreamHeader::new(0, 3).unwrap().pack(), [0x00, 0x03]);
        assert_eq!(StreamHeader::new(7, 8191).unwrap().pack(), [0xff, 0xff]);
    }

    #[test]
    fn test_stream_header_limits() {
        assert_eq!(
            StreamHeader::new(0, 8192),
            Err(WireError::FieldTooLarge {
                field: "stream length",
                value: 8192,
                max: 8191,
            })
        );
        assert!(StreamHeader::new(8, 0).is_err());
    }

    #[test]
    fn test_initial_header_pack_unpack() {
        for command in 0..=INITIAL_MAX_COMMAND {
            for data in [0usize, 1, 0x183, 2047] {
                for success in [true, false] {
                    let header = InitialStreamHeader::new(command, data, success).unwrap();
                    assert_eq!(InitialStreamHeader::unpack(header.pack()), header);
                }
            }
        }

        let header = InitialStreamHeader::unpack([0x18, 0x03]);
        assert_eq!(header.command, 1);
        assert!(header.success);
        assert_eq!(header.data, 3);
    }

    #[test]
    fn test_initial_header_limits() {
        assert!(InitialStreamHeader::new(16, 0, true).is_err());
        assert!(InitialStreamHeader::new(0, 2048, true).is_err());
    }

    #[test]
    fn test_control_type_conversion() {
        assert_eq!(ControlType::try_from(0x00).unwrap(), ControlType::Echo);
        assert_eq!(ControlType::try_from(0x02).unwrap(), ControlType::ResumeStream);
        assert_eq!(ControlType::try_from(0x03), Err(WireError::Control(0x03)));
    }
}
