//! Frame struct with typed accessors.
//!
//! Represents one complete inbound info frame: the type tag and exactly
//! `length` payload bytes. Uses `bytes::Bytes` so payloads are shared with
//! the reassembly buffer instead of copied.
//!
//! # Example
//!
//! ```
//! use kext_interface::protocol::{Frame, InfoType};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(1, Bytes::from_static(b"\x01hi!!"));
//!
//! assert_eq!(frame.known_type(), Some(InfoType::LogLine));
//! assert_eq!(frame.payload_len(), 5);
//! ```

use bytes::Bytes;

use super::wire_format::{Header, InfoType, HEADER_SIZE};

/// A complete info frame, not yet interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw info type tag.
    pub info_type: u8,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from type and payload.
    pub fn new(info_type: u8, payload: Bytes) -> Self {
        Self { info_type, payload }
    }

    /// Create a frame from raw bytes (copies data).
    pub fn from_parts(info_type: u8, payload: &[u8]) -> Self {
        Self {
            info_type,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// The typed info tag, if known.
    #[inline]
    pub fn known_type(&self) -> Option<InfoType> {
        InfoType::from_u8(self.info_type)
    }

    /// Header describing this frame.
    ///
    /// # Panics
    ///
    /// Panics if the payload is longer than `u32::MAX`.
    pub fn header(&self) -> Header {
        let length = u32::try_from(self.payload.len()).expect("payload length fits in u32");
        Header::new(self.info_type, length)
    }

    /// Serialize the frame as `[type][length LE][payload]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        build_frame(self.info_type, &self.payload)
    }
}

/// Build a complete frame as a single byte vector.
///
/// # Example
///
/// ```
/// use kext_interface::protocol::build_frame;
///
/// let bytes = build_frame(1, b"\x01hi!!");
/// assert_eq!(bytes, [1, 5, 0, 0, 0, 1, b'h', b'i', b'!', b'!']);
/// ```
///
/// # Panics
///
/// Panics if the payload is longer than `u32::MAX`.
pub fn build_frame(info_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = u32::try_from(payload.len()).expect("payload length fits in u32");
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&Header::new(info_type, length).encode());
    buf.extend_from_slice(payload);
    buf
}
