//! Pull-based frame reader over a blocking byte source.
//!
//! [`FrameReader`] owns the source, a fixed-size scratch chunk and a
//! [`FrameBuffer`]. Every call to [`FrameReader::next_frame`] first drains
//! frames already buffered, then reads at most one chunk at a time until a
//! frame completes. Chunk boundaries never affect the frames produced.

use std::io::{ErrorKind, Read};

use tracing::trace;

use crate::error::{KextError, Result};
use crate::protocol::{Frame, FrameBuffer, DEFAULT_MAX_PAYLOAD_SIZE};

/// Default size of a single device read (64 KB).
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Reassembles info frames from a [`Read`] source.
///
/// # Example
///
/// ```
/// use std::io::Cursor;
/// use kext_interface::protocol::build_frame;
/// use kext_interface::reader::FrameReader;
///
/// let mut reader = FrameReader::new(Cursor::new(build_frame(8, &[])));
/// assert_eq!(reader.next_frame().unwrap().info_type, 8);
/// assert!(reader.next_frame().is_err()); // source exhausted
/// ```
#[derive(Debug)]
pub struct FrameReader<R> {
    source: R,
    chunk: Vec<u8>,
    buffer: FrameBuffer,
}

impl<R: Read> FrameReader<R> {
    /// Create a reader with the default chunk size and payload limit.
    pub fn new(source: R) -> Self {
        Self::with_limits(source, DEFAULT_READ_CHUNK_SIZE, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a reader with an explicit chunk size and payload limit.
    ///
    /// A chunk size of zero is raised to one byte.
    pub fn with_limits(source: R, read_chunk_size: usize, max_payload_size: u32) -> Self {
        Self {
            source,
            chunk: vec![0u8; read_chunk_size.max(1)],
            buffer: FrameBuffer::with_max_payload(max_payload_size),
        }
    }

    /// Return the next complete frame.
    ///
    /// # Errors
    ///
    /// - [`KextError::ConnectionClosed`] when the source reports end of
    ///   stream. Any partial frame still buffered is discarded.
    /// - [`KextError::Io`] for read failures other than `Interrupted`.
    /// - [`KextError::PayloadTooLarge`] when a header exceeds the limit.
    ///
    /// All three are terminal; the reader should not be used afterwards.
    pub fn next_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.buffer.next_frame()? {
                return Ok(frame);
            }

            let n = match self.source.read(&mut self.chunk) {
                Ok(0) => {
                    if !self.buffer.is_empty() {
                        trace!(
                            buffered = self.buffer.len(),
                            "source closed with a partial frame buffered"
                        );
                    }
                    return Err(KextError::ConnectionClosed);
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(KextError::Io(e)),
            };

            self.buffer.extend(&self.chunk[..n]);
        }
    }

    /// Iterate over frames until the source closes.
    ///
    /// A clean close ends the iteration; any other error is yielded once and
    /// then the iteration ends.
    pub fn into_frames(self) -> Frames<R> {
        Frames {
            reader: self,
            done: false,
        }
    }

    /// Bytes buffered but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Configured read chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk.len()
    }

    pub fn get_ref(&self) -> &R {
        &self.source
    }

    /// Consume the reader, returning the source. Buffered bytes are lost.
    pub fn into_inner(self) -> R {
        self.source
    }
}

/// Iterator returned by [`FrameReader::into_frames`].
#[derive(Debug)]
pub struct Frames<R> {
    reader: FrameReader<R>,
    done: bool,
}

impl<R: Read> Iterator for Frames<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.reader.next_frame() {
            Ok(frame) => Some(Ok(frame)),
            Err(KextError::ConnectionClosed) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
