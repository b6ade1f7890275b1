//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `AwaitingHeader`: Need at least 5 bytes (type + length)
//! - `FillingPayload`: Header parsed, need `length` payload bytes
//!
//! Bytes beyond the end of the current frame stay in the buffer and become
//! the start of the next frame; nothing is discarded or read twice.
//!
//! # Example
//!
//! ```
//! use kext_interface::protocol::{build_frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = build_frame(1, b"\x03hello");
//!
//! // Data arrives in arbitrary chunks from the device
//! assert!(buffer.push(&bytes[..3]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[3..]).unwrap();
//!
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].info_type, 1);
//! ```

use bytes::BytesMut;

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::{KextError, Result};

/// Initial accumulator capacity.
const DEFAULT_CAPACITY: usize = 64 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for complete header (need 5 bytes).
    AwaitingHeader,
    /// Header parsed, accumulating `length` payload bytes.
    FillingPayload { info_type: u8, length: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// All data is stored in a single owned `BytesMut`; completed payloads are
/// split off it without copying.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Accumulated bytes from device reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 16MB.
    pub fn new() -> Self {
        Self::with_capacity_and_max_payload(DEFAULT_CAPACITY, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self::with_capacity_and_max_payload(DEFAULT_CAPACITY, max_payload_size)
    }

    /// Create a new frame buffer with custom capacity and max payload.
    pub fn with_capacity_and_max_payload(capacity: usize, max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::AwaitingHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns [`KextError::PayloadTooLarge`] if a header declares a payload
    /// above the configured maximum. The buffer cannot resynchronize after
    /// that and should be discarded.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Try to extract a single frame from the bytes already buffered.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the declared payload is too large
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let State::AwaitingHeader = self.state {
            let Some(header) = Header::decode(&self.buffer) else {
                return Ok(None);
            };

            if header.payload_length > self.max_payload_size {
                return Err(KextError::PayloadTooLarge {
                    length: header.payload_length,
                    max: self.max_payload_size,
                });
            }

            let _ = self.buffer.split_to(HEADER_SIZE);
            self.buffer.reserve(header.payload_length as usize);
            self.state = State::FillingPayload {
                info_type: header.info_type,
                length: header.payload_length,
            };
        }

        let State::FillingPayload { info_type, length } = self.state else {
            return Ok(None);
        };

        let length = length as usize;
        if self.buffer.len() < length {
            return Ok(None);
        }

        let payload = self.buffer.split_to(length).freeze();
        self.state = State::AwaitingHeader;

        Ok(Some(Frame::new(info_type, payload)))
    }

    /// Append data to the buffer without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes still needed to finish the current step (header or
    /// payload), given what is buffered.
    pub fn bytes_needed(&self) -> usize {
        match self.state {
            State::AwaitingHeader => HEADER_SIZE.saturating_sub(self.buffer.len()),
            State::FillingPayload { length, .. } => {
                (length as usize).saturating_sub(self.buffer.len())
            }
        }
    }

    /// Whether a header has been consumed and its payload is being filled.
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, State::FillingPayload { .. })
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::AwaitingHeader;
    }

    /// Configured payload limit.
    pub fn max_payload_size(&self) -> u32 {
        self.max_payload_size
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::AwaitingHeader => "AwaitingHeader",
            State::FillingPayload { .. } => "FillingPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
