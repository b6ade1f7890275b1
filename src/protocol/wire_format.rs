//! Wire format encoding and decoding.
//!
//! Inbound info frames use a 5-byte header:
//! ```text
//! ┌──────────┬──────────┬─────────────────┐
//! │ Type     │ Length   │ Payload         │
//! │ 1 byte   │ 4 bytes  │ Length bytes    │
//! │ uint8    │ uint32 LE│                 │
//! └──────────┴──────────┴─────────────────┘
//! ```
//!
//! Outbound commands have no header: the first byte is the command type and
//! the rest of the buffer is the fixed layout for that type.
//!
//! All multi-byte integers are Little Endian. Both tag tables are
//! append-only: new variants get the next free number and no number is ever
//! reused, so older captures stay decodable.

use serde::{Deserialize, Serialize};

/// Info header size in bytes (type + length).
pub const HEADER_SIZE: usize = 5;

/// Default maximum info payload size (16 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Decoded info frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Info type tag (see [`InfoType`]).
    pub info_type: u8,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(info_type: u8, payload_length: u32) -> Self {
        Self {
            info_type,
            payload_length,
        }
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use kext_interface::protocol::Header;
    ///
    /// let bytes = Header::new(1, 5).encode();
    /// assert_eq!(bytes, [1, 5, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.info_type;
        buf[1..5].copy_from_slice(&self.payload_length.to_le_bytes());
        buf
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            info_type: buf[0],
            payload_length: u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]),
        })
    }

    /// The typed info tag, if known to this version of the crate.
    pub fn known_type(&self) -> Option<InfoType> {
        InfoType::from_u8(self.info_type)
    }
}

/// Command type tags (first byte of every command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandType {
    Shutdown = 0,
    Verdict = 1,
    RedirectV4 = 2,
    RedirectV6 = 3,
    UpdateV4 = 4,
    UpdateV6 = 5,
    ClearCache = 6,
    GetLogs = 7,
    GetBandwidthStats = 8,
    GetConnectionsUpdate = 9,
    CleanEndedConnections = 10,
    PrintMemoryStats = 11,
}

impl CommandType {
    /// Map a raw tag to a command type.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Shutdown,
            1 => Self::Verdict,
            2 => Self::RedirectV4,
            3 => Self::RedirectV6,
            4 => Self::UpdateV4,
            5 => Self::UpdateV6,
            6 => Self::ClearCache,
            7 => Self::GetLogs,
            8 => Self::GetBandwidthStats,
            9 => Self::GetConnectionsUpdate,
            10 => Self::CleanEndedConnections,
            11 => Self::PrintMemoryStats,
            _ => return None,
        })
    }

    /// Raw tag value.
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Total encoded size of a command of this type, tag byte included.
    pub fn encoded_size(self) -> usize {
        match self {
            Self::Shutdown
            | Self::ClearCache
            | Self::GetLogs
            | Self::GetBandwidthStats
            | Self::CleanEndedConnections
            | Self::PrintMemoryStats => 1,
            // id + verdict
            Self::Verdict => 1 + 8 + 1,
            // id + address + port
            Self::RedirectV4 => 1 + 8 + 4 + 2,
            Self::RedirectV6 => 1 + 8 + 16 + 2,
            // protocol + 3 x (address + port) + verdict
            Self::UpdateV4 => 1 + 1 + 3 * (4 + 2) + 1,
            Self::UpdateV6 => 1 + 1 + 3 * (16 + 2) + 1,
            Self::GetConnectionsUpdate => 1 + 8,
        }
    }
}

/// Info type tags (first byte of every inbound frame).
///
/// Tag 0 is reserved and never issued by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum InfoType {
    LogLine = 1,
    ConnectionV4 = 2,
    ConnectionV6 = 3,
    ConnectionEndV4 = 4,
    ConnectionEndV6 = 5,
    ConnectionUpdateV4 = 6,
    ConnectionUpdateV6 = 7,
    ConnectionUpdateEnd = 8,
    BandwidthStatsV4 = 9,
    BandwidthStatsV6 = 10,
}

impl InfoType {
    /// Map a raw tag to an info type. Unknown tags return `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::LogLine,
            2 => Self::ConnectionV4,
            3 => Self::ConnectionV6,
            4 => Self::ConnectionEndV4,
            5 => Self::ConnectionEndV6,
            6 => Self::ConnectionUpdateV4,
            7 => Self::ConnectionUpdateV6,
            8 => Self::ConnectionUpdateEnd,
            9 => Self::BandwidthStatsV4,
            10 => Self::BandwidthStatsV6,
            _ => return None,
        })
    }

    /// Raw tag value.
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_little_endian_byte_order() {
        let header = Header::new(0x07, 0x0102_0304);
        let bytes = header.encode();

        assert_eq!(bytes[0], 0x07);
        assert_eq!(&bytes[1..], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(Header::decode(&bytes), Some(header));
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(Header::decode(&[1, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_command_tags_are_stable() {
        assert_eq!(CommandType::Shutdown.to_u8(), 0);
        assert_eq!(CommandType::Verdict.to_u8(), 1);
        assert_eq!(CommandType::ClearCache.to_u8(), 6);
        assert_eq!(CommandType::GetConnectionsUpdate.to_u8(), 9);
        assert_eq!(CommandType::CleanEndedConnections.to_u8(), 10);
        assert_eq!(CommandType::PrintMemoryStats.to_u8(), 11);

        for tag in 0..=11u8 {
            let ty = CommandType::from_u8(tag).unwrap();
            assert_eq!(ty.to_u8(), tag);
        }
        assert!(CommandType::from_u8(12).is_none());
    }

    #[test]
    fn test_info_tags_are_stable() {
        assert!(InfoType::from_u8(0).is_none());
        assert_eq!(InfoType::from_u8(1), Some(InfoType::LogLine));
        for tag in 1..=10u8 {
            assert_eq!(InfoType::from_u8(tag).unwrap().to_u8(), tag);
        }
        assert!(InfoType::from_u8(11).is_none());
        assert!(InfoType::from_u8(0xFF).is_none());
    }

    #[test]
    fn test_command_sizes() {
        assert_eq!(CommandType::Shutdown.encoded_size(), 1);
        assert_eq!(CommandType::Verdict.encoded_size(), 10);
        assert_eq!(CommandType::RedirectV4.encoded_size(), 15);
        assert_eq!(CommandType::RedirectV6.encoded_size(), 27);
        assert_eq!(CommandType::UpdateV4.encoded_size(), 21);
        assert_eq!(CommandType::UpdateV6.encoded_size(), 57);
        assert_eq!(CommandType::GetConnectionsUpdate.encoded_size(), 9);
    }

    #[test]
    fn test_known_type() {
        assert_eq!(Header::new(8, 0).known_type(), Some(InfoType::ConnectionUpdateEnd));
        assert_eq!(Header::new(200, 3).known_type(), None);
    }
}
