//! Protocol module - wire format, framing, commands and info values.
//!
//! This module implements the binary protocol spoken over the driver handle:
//! - 5-byte info header encoding/decoding
//! - Frame buffer for reassembling info frames from partial reads
//! - Command encoder (user space to driver)
//! - Info decoder (driver to user space)

mod command;
mod frame;
mod frame_buffer;
mod info;
mod types;
mod wire_format;

pub use command::{
    Command, Redirect, RedirectTarget, RedirectV4, RedirectV6, Update, UpdateV4, UpdateV6,
};
pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use info::{
    BandwidthStats, BandwidthStatsV4, BandwidthStatsV6, BandwidthValue, BandwidthValueV4,
    BandwidthValueV6, Connection, ConnectionEnd, ConnectionEndV4, ConnectionEndV6,
    ConnectionUpdate, ConnectionUpdateV4, ConnectionUpdateV6, ConnectionV4, ConnectionV6, Info,
    LogLine,
};
pub use types::{socket_addr, Direction, IpBytes, Severity, Verdict};
pub use wire_format::{CommandType, Header, InfoType, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
