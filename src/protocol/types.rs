//! Typed views over raw wire fields.
//!
//! Wire structs keep `direction`, `protocol`, severity and verdict fields as
//! raw `u8` so a driver that starts sending a new code never breaks decoding.
//! The enums here are for callers that want to match on the known values.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Verdict codes understood by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Verdict {
    /// Default status of new connections.
    Undecided = 0,
    Undeterminable = 1,
    Accept = 2,
    Block = 3,
    Drop = 4,
    RedirectNameServer = 5,
    RedirectTunnel = 6,
    Failed = 7,
}

impl Verdict {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Undecided,
            1 => Self::Undeterminable,
            2 => Self::Accept,
            3 => Self::Block,
            4 => Self::Drop,
            5 => Self::RedirectNameServer,
            6 => Self::RedirectTunnel,
            7 => Self::Failed,
            _ => return None,
        })
    }

    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether the driver needs a redirect target alongside this verdict.
    pub fn is_redirect(self) -> bool {
        matches!(self, Self::RedirectNameServer | Self::RedirectTunnel)
    }
}

impl From<Verdict> for u8 {
    fn from(verdict: Verdict) -> Self {
        verdict.to_u8()
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undecided => "Undecided",
            Self::Undeterminable => "Undeterminable",
            Self::Accept => "Accept",
            Self::Block => "Block",
            Self::Drop => "Drop",
            Self::RedirectNameServer => "RedirectNameServer",
            Self::RedirectTunnel => "RedirectTunnel",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Connection direction as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    Outbound = 0,
    Inbound = 1,
}

impl Direction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Outbound),
            1 => Some(Self::Inbound),
            _ => None,
        }
    }
}

/// Severity of a driver log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Severity {
    Trace = 1,
    Debug = 2,
    Info = 3,
    Warning = 4,
    Error = 5,
    Fatal = 6,
}

impl Severity {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Trace,
            2 => Self::Debug,
            3 => Self::Info,
            4 => Self::Warning,
            5 => Self::Error,
            6 => Self::Fatal,
            _ => return None,
        })
    }

    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Raw address arrays that map onto an IP family.
///
/// Implemented for `[u8; 4]` and `[u8; 16]`, the only address widths on the
/// wire.
pub trait IpBytes: Copy {
    /// Interpret the bytes as an address (network byte order, as captured).
    fn to_ip_addr(self) -> IpAddr;

    /// Whether every byte is zero (the "no address" encoding).
    fn is_unspecified(self) -> bool;
}

impl IpBytes for [u8; 4] {
    fn to_ip_addr(self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(self))
    }

    fn is_unspecified(self) -> bool {
        self == [0; 4]
    }
}

impl IpBytes for [u8; 16] {
    fn to_ip_addr(self) -> IpAddr {
        IpAddr::V6(Ipv6Addr::from(self))
    }

    fn is_unspecified(self) -> bool {
        self == [0; 16]
    }
}

/// Build a socket address from raw wire fields.
#[inline]
pub fn socket_addr<A: IpBytes>(address: A, port: u16) -> SocketAddr {
    SocketAddr::new(address.to_ip_addr(), port)
}
