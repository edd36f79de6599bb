//! Frame builders for the wire protocol.
//!
//! Frames are concatenated inside one plaintext envelope, so every builder
//! returns a self-contained byte string starting with its header byte.

use bytes::{BufMut, Bytes, BytesMut};

use crate::header::{
    ControlType, FrameType, Header, InitialStreamHeader, StreamHeader, HEADER_MAX_DATA,
    STREAM_HEADER_SIZE, STREAM_MAX_LENGTH,
};
use crate::WireError;

/// Largest CONTROL body, subtype byte included
pub const CONTROL_MAX_BODY: usize = HEADER_MAX_DATA as usize;

/// Number of random bytes carried by an ECHO probe
pub const ECHO_PAYLOAD_SIZE: usize = 6;

/// Build a CONTROL frame. The header data is the body length, subtype included.
pub fn build_control(typ: ControlType, payload: &[u8]) -> Result<Bytes, WireError> {
    let body_len = payload.len() + 1;
    if body_len > CONTROL_MAX_BODY {
        return Err(WireError::FieldTooLarge {
            field: "control body",
            value: body_len,
            max: CONTROL_MAX_BODY,
        });
    }

    let header = Header::new(FrameType::Control, body_len as u8)?;
    let mut buf = BytesMut::with_capacity(1 + body_len);
    buf.put_u8(header.value());
    buf.put_u8(typ as u8);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Build an ECHO probe carrying the given random bytes
pub fn build_echo(payload: &[u8; ECHO_PAYLOAD_SIZE]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + ECHO_PAYLOAD_SIZE);
    buf.put_u8(FrameType::Control as u8 | (ECHO_PAYLOAD_SIZE as u8 + 1));
    buf.put_u8(ControlType::Echo as u8);
    buf.put_slice(payload);
    buf.freeze()
}

/// Build a PAUSESTREAM request
pub fn build_pause() -> Bytes {
    Bytes::from_static(&[FrameType::Control as u8 | 1, ControlType::PauseStream as u8])
}

/// Build a RESUMESTREAM request
pub fn build_resume() -> Bytes {
    Bytes::from_static(&[FrameType::Control as u8 | 1, ControlType::ResumeStream as u8])
}

/// Build a STREAM frame for a running stream
pub fn build_stream(id: u8, marker: u8, payload: &[u8]) -> Result<Bytes, WireError> {
    let header = Header::new(FrameType::Stream, id)?;
    let sub = StreamHeader::new(marker, payload.len())?;

    let mut buf = BytesMut::with_capacity(1 + STREAM_HEADER_SIZE + payload.len());
    buf.put_u8(header.value());
    sub.encode(&mut buf);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Build the first STREAM frame of a stream, requesting `command`
pub fn build_initial(id: u8, command: u8, payload: &[u8]) -> Result<Bytes, WireError> {
    let header = Header::new(FrameType::Stream, id)?;
    let sub = InitialStreamHeader::new(command, payload.len(), true)?;

    let mut buf = BytesMut::with_capacity(1 + STREAM_HEADER_SIZE + payload.len());
    buf.put_u8(header.value());
    sub.encode(&mut buf);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Build a CLOSE frame for a stream
pub fn build_close(id: u8) -> Result<Bytes, WireError> {
    let header = Header::new(FrameType::Close, id)?;
    Ok(Bytes::copy_from_slice(&[header.value()]))
}

/// Build a COMPLETED frame for a stream
pub fn build_completed(id: u8) -> Result<Bytes, WireError> {
    let header = Header::new(FrameType::Completed, id)?;
    Ok(Bytes::copy_from_slice(&[header.value()]))
}

/// Split a payload into pieces that each fit one STREAM frame
pub fn split_stream_payload(payload: Bytes) -> Vec<Bytes> {
    let max = STREAM_MAX_LENGTH as usize;
    if payload.len() <= max {
        return vec![payload];
    }

    let mut pieces = Vec::with_capacity(payload.len().div_ceil(max));
    let mut offset = 0;
    while offset < payload.len() {
        let end = std::cmp::min(offset + max, payload.len());
        pieces.push(payload.slice(offset..end));
        offset = end;
    }

    pieces
}
