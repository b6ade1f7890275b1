//! Error types for kext-interface.

use thiserror::Error;

/// Main error type for all driver protocol operations.
///
/// `Io`, `ConnectionClosed` and `PayloadTooLarge` end the current session.
/// `Malformed` concerns a single frame; the stream stays synchronized because
/// every frame is length-delimited. `ShortWrite` is left to the caller, who
/// decides whether resending makes sense.
#[derive(Debug, Error)]
pub enum KextError {
    /// I/O error from the device handle.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device accepted fewer bytes than the command occupies.
    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },

    /// The read side returned zero bytes (driver closed the channel).
    #[error("Connection closed")]
    ConnectionClosed,

    /// A frame header declared a payload larger than the configured maximum.
    #[error("Payload size {length} exceeds maximum {max}")]
    PayloadTooLarge { length: u32, max: u32 },

    /// A frame's payload did not match the layout of its info type.
    #[error("malformed info frame (type {info_type}): {reason}")]
    Malformed { info_type: u8, reason: String },

    /// First byte of a command buffer is not a known command tag.
    #[error("unknown command type: {0}")]
    UnknownCommand(u8),

    /// Command buffer length does not match the fixed size of its tag.
    #[error("invalid size for command type {command_type}: expected {expected}, got {actual}")]
    InvalidCommandSize {
        command_type: u8,
        expected: usize,
        actual: usize,
    },

    /// Configuration could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl KextError {
    /// Build a [`KextError::Malformed`] for the given info type.
    pub(crate) fn malformed(info_type: u8, reason: impl Into<String>) -> Self {
        Self::Malformed {
            info_type,
            reason: reason.into(),
        }
    }

    /// Whether this error ends the session (as opposed to a per-frame error).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::PayloadTooLarge { .. }
        )
    }
}

/// Result type alias using KextError.
pub type Result<T> = std::result::Result<T, KextError>;
