//! Frame headers, frame builders, and the envelope codec for tether.
//!
//! This crate provides the byte-level protocol spoken between a tether client
//! and a remote-access server: how individual frames are laid out, and how
//! batches of frames are sealed into authenticated WebSocket messages.
//!
//! ## Frame Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | header (1B)          | type (2 bits) + data (6)   |
//! +----------------------+----------------------------+
//! | stream header (2B)   | STREAM frames only         |
//! +----------------------+----------------------------+
//! | body                 | control body or payload    |
//! +----------------------+----------------------------+
//! ```
//!
//! Several frames may share one plaintext envelope; frame boundaries are
//! implied by the header fields, never by envelope boundaries.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;

// Re-export main types
pub use codec::{
    derive_key, envelope_len, time_bucket, EnvelopeCipher, NonceCounter, ENVELOPE_PREFIX_SIZE,
    KEY_SIZE, KEY_TIME_BUCKET, MAX_CIPHERTEXT, NONCE_SIZE, TAG_SIZE,
};
pub use error::WireError;
pub use frame::{
    build_close, build_completed, build_control, build_echo, build_initial, build_pause,
    build_resume, build_stream, split_stream_payload, CONTROL_MAX_BODY, ECHO_PAYLOAD_SIZE,
};
pub use header::{
    ControlType, FrameType, Header, InitialStreamHeader, StreamHeader, HEADER_MAX_DATA,
    INITIAL_MAX_COMMAND, INITIAL_MAX_DATA, MAX_STREAMS, STREAM_HEADER_SIZE, STREAM_MAX_LENGTH,
    STREAM_MAX_MARKER,
};
