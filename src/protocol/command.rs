//! Outbound commands.
//!
//! Every command is encoded as its type tag followed by a fixed layout:
//!
//! ```text
//! Verdict:    [1][id u64][verdict u8]
//! RedirectV4: [2][id u64][address 4][port u16]
//! UpdateV4:   [4][protocol u8][local 4][port u16][remote 4][port u16][verdict u8][redirect 4][port u16]
//! GetConnectionsUpdate: [9][threshold u64]
//! ```
//!
//! No length prefix: the driver knows the size of each tag. Integers are
//! Little Endian; ports are copied as-is without byte-order conversion.

use bytes::{Buf, BufMut};

use super::types::{IpBytes, Verdict};
use super::wire_format::CommandType;
use crate::error::{KextError, Result};

/// Redirect a pending connection to another remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirect<const N: usize> {
    /// Connection Id from the matching connection info.
    pub id: u64,
    pub remote_address: [u8; N],
    pub remote_port: u16,
}

pub type RedirectV4 = Redirect<4>;
pub type RedirectV6 = Redirect<16>;

/// Address and port a connection is redirected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectTarget<const N: usize> {
    pub address: [u8; N],
    pub port: u16,
}

/// Change the verdict of an already decided connection, keyed by its
/// protocol and endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Update<const N: usize> {
    pub protocol: u8,
    pub local_address: [u8; N],
    pub local_port: u16,
    pub remote_address: [u8; N],
    pub remote_port: u16,
    pub verdict: u8,
    /// Encoded as an all-zero address and port when absent.
    pub redirect: Option<RedirectTarget<N>>,
}

pub type UpdateV4 = Update<4>;
pub type UpdateV6 = Update<16>;

/// A command for the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Stop filtering and release pending reads.
    Shutdown,
    /// Decide the fate of a pending connection.
    Verdict { id: u64, verdict: u8 },
    RedirectV4(RedirectV4),
    RedirectV6(RedirectV6),
    UpdateV4(UpdateV4),
    UpdateV6(UpdateV6),
    /// Drop all cached verdicts.
    ClearCache,
    /// Ask for buffered driver log lines.
    GetLogs,
    /// Ask for a bandwidth snapshot (one frame per protocol and family).
    GetBandwidthStats,
    /// Ask for counters of connections changed since `threshold`.
    GetConnectionsUpdate { threshold: u64 },
    /// Garbage-collect ended-connection bookkeeping.
    CleanEndedConnections,
    /// Make the driver log its cache sizes.
    PrintMemoryStats,
}

impl Command {
    /// Verdict command from a typed verdict code.
    pub fn verdict(id: u64, verdict: Verdict) -> Self {
        Self::Verdict {
            id,
            verdict: verdict.to_u8(),
        }
    }

    /// The tag written as the first byte.
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Shutdown => CommandType::Shutdown,
            Self::Verdict { .. } => CommandType::Verdict,
            Self::RedirectV4(_) => CommandType::RedirectV4,
            Self::RedirectV6(_) => CommandType::RedirectV6,
            Self::UpdateV4(_) => CommandType::UpdateV4,
            Self::UpdateV6(_) => CommandType::UpdateV6,
            Self::ClearCache => CommandType::ClearCache,
            Self::GetLogs => CommandType::GetLogs,
            Self::GetBandwidthStats => CommandType::GetBandwidthStats,
            Self::GetConnectionsUpdate { .. } => CommandType::GetConnectionsUpdate,
            Self::CleanEndedConnections => CommandType::CleanEndedConnections,
            Self::PrintMemoryStats => CommandType::PrintMemoryStats,
        }
    }

    /// Exact number of bytes [`Command::encode`] produces.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        self.command_type().encoded_size()
    }

    /// Encode to the driver's byte layout.
    ///
    /// # Example
    ///
    /// ```
    /// use kext_interface::protocol::Command;
    ///
    /// let bytes = Command::Verdict { id: 1, verdict: 2 }.encode();
    /// assert_eq!(bytes, [1, 1, 0, 0, 0, 0, 0, 0, 0, 2]);
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Encode into an existing buffer.
    pub fn encode_into<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(self.command_type().to_u8());
        match self {
            Self::Shutdown
            | Self::ClearCache
            | Self::GetLogs
            | Self::GetBandwidthStats
            | Self::CleanEndedConnections
            | Self::PrintMemoryStats => {}
            Self::Verdict { id, verdict } => {
                dst.put_u64_le(*id);
                dst.put_u8(*verdict);
            }
            Self::RedirectV4(redirect) => put_redirect(dst, redirect),
            Self::RedirectV6(redirect) => put_redirect(dst, redirect),
            Self::UpdateV4(update) => put_update(dst, update),
            Self::UpdateV6(update) => put_update(dst, update),
            Self::GetConnectionsUpdate { threshold } => dst.put_u64_le(*threshold),
        }
    }

    /// Parse a command the way the driver does.
    ///
    /// Used to check encodings and to replay recorded command streams.
    ///
    /// # Errors
    ///
    /// [`KextError::UnknownCommand`] for an unknown tag,
    /// [`KextError::InvalidCommandSize`] when the buffer is not exactly the
    /// fixed size of its tag.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&tag, mut src) = bytes
            .split_first()
            .ok_or(KextError::InvalidCommandSize {
                command_type: 0,
                expected: 1,
                actual: 0,
            })?;
        let command_type = CommandType::from_u8(tag).ok_or(KextError::UnknownCommand(tag))?;

        let expected = command_type.encoded_size();
        if bytes.len() != expected {
            return Err(KextError::InvalidCommandSize {
                command_type: tag,
                expected,
                actual: bytes.len(),
            });
        }

        let command = match command_type {
            CommandType::Shutdown => Self::Shutdown,
            CommandType::Verdict => Self::Verdict {
                id: src.get_u64_le(),
                verdict: src.get_u8(),
            },
            CommandType::RedirectV4 => Self::RedirectV4(get_redirect(&mut src)),
            CommandType::RedirectV6 => Self::RedirectV6(get_redirect(&mut src)),
            CommandType::UpdateV4 => Self::UpdateV4(get_update(&mut src)),
            CommandType::UpdateV6 => Self::UpdateV6(get_update(&mut src)),
            CommandType::ClearCache => Self::ClearCache,
            CommandType::GetLogs => Self::GetLogs,
            CommandType::GetBandwidthStats => Self::GetBandwidthStats,
            CommandType::GetConnectionsUpdate => Self::GetConnectionsUpdate {
                threshold: src.get_u64_le(),
            },
            CommandType::CleanEndedConnections => Self::CleanEndedConnections,
            CommandType::PrintMemoryStats => Self::PrintMemoryStats,
        };

        Ok(command)
    }

    /// Split a recorded byte stream of back-to-back commands.
    ///
    /// Stops at the first unknown tag or truncated command.
    pub fn decode_stream(mut bytes: &[u8]) -> Result<Vec<Self>> {
        let mut commands = Vec::new();
        while let Some(&tag) = bytes.first() {
            let command_type = CommandType::from_u8(tag).ok_or(KextError::UnknownCommand(tag))?;
            let size = command_type.encoded_size();
            if bytes.len() < size {
                return Err(KextError::InvalidCommandSize {
                    command_type: tag,
                    expected: size,
                    actual: bytes.len(),
                });
            }
            commands.push(Self::decode(&bytes[..size])?);
            bytes = &bytes[size..];
        }
        Ok(commands)
    }
}

fn put_redirect<const N: usize, B: BufMut>(dst: &mut B, redirect: &Redirect<N>) {
    dst.put_u64_le(redirect.id);
    dst.put_slice(&redirect.remote_address);
    dst.put_u16_le(redirect.remote_port);
}

fn put_update<const N: usize, B: BufMut>(dst: &mut B, update: &Update<N>) {
    dst.put_u8(update.protocol);
    dst.put_slice(&update.local_address);
    dst.put_u16_le(update.local_port);
    dst.put_slice(&update.remote_address);
    dst.put_u16_le(update.remote_port);
    dst.put_u8(update.verdict);
    match &update.redirect {
        Some(target) => {
            dst.put_slice(&target.address);
            dst.put_u16_le(target.port);
        }
        None => {
            dst.put_bytes(0, N);
            dst.put_u16_le(0);
        }
    }
}

// The getters below run after the caller checked the exact buffer size.

fn get_array<const N: usize>(src: &mut &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    src.copy_to_slice(&mut out);
    out
}

fn get_redirect<const N: usize>(src: &mut &[u8]) -> Redirect<N> {
    Redirect {
        id: src.get_u64_le(),
        remote_address: get_array(src),
        remote_port: src.get_u16_le(),
    }
}

fn get_update<const N: usize>(src: &mut &[u8]) -> Update<N>
where
    [u8; N]: IpBytes,
{
    let protocol = src.get_u8();
    let local_address = get_array(src);
    let local_port = src.get_u16_le();
    let remote_address = get_array(src);
    let remote_port = src.get_u16_le();
    let verdict = src.get_u8();
    let address: [u8; N] = get_array(src);
    let port = src.get_u16_le();

    let redirect = if port == 0 && address.is_unspecified() {
        None
    } else {
        Some(RedirectTarget { address, port })
    };

    Update {
        protocol,
        local_address,
        local_port,
        remote_address,
        remote_port,
        verdict,
        redirect,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_commands() -> Vec<Command> {
        vec![
            Command::Shutdown,
            Command::Verdict { id: 1, verdict: 2 },
            Command::RedirectV4(Redirect {
                id: 0xDEAD_BEEF,
                remote_address: [1, 1, 1, 1],
                remote_port: 53,
            }),
            Command::RedirectV6(Redirect {
                id: 7,
                remote_address: [0xFE; 16],
                remote_port: 853,
            }),
            Command::UpdateV4(Update {
                protocol: 1,
                local_address: [1, 2, 3, 4],
                local_port: 2,
                remote_address: [2, 3, 4, 5],
                remote_port: 3,
                verdict: 4,
                redirect: None,
            }),
            Command::UpdateV6(Update {
                protocol: 17,
                local_address: [1; 16],
                local_port: 5353,
                remote_address: [2; 16],
                remote_port: 53,
                verdict: 5,
                redirect: Some(RedirectTarget {
                    address: [3; 16],
                    port: 5300,
                }),
            }),
            Command::ClearCache,
            Command::GetLogs,
            Command::GetBandwidthStats,
            Command::GetConnectionsUpdate {
                threshold: 1_700_000_000,
            },
            Command::CleanEndedConnections,
            Command::PrintMemoryStats,
        ]
    }

    #[test]
    fn test_every_command_round_trips_through_driver_layout() {
        for command in all_commands() {
            let bytes = command.encode();
            assert_eq!(bytes.len(), command.encoded_len(), "{command:?}");
            assert_eq!(bytes[0], command.command_type().to_u8());
            assert_eq!(Command::decode(&bytes).unwrap(), command);
        }
    }

    #[test]
    fn test_verdict_layout() {
        let bytes = Command::verdict(0x0102_0304_0506_0708, Verdict::Block).encode();
        assert_eq!(bytes, [1, 8, 7, 6, 5, 4, 3, 2, 1, 3]);
    }

    #[test]
    fn test_redirect_v4_layout() {
        let bytes = Command::RedirectV4(Redirect {
            id: 1,
            remote_address: [9, 9, 9, 9],
            remote_port: 0x0135,
        })
        .encode();
        assert_eq!(bytes, [2, 1, 0, 0, 0, 0, 0, 0, 0, 9, 9, 9, 9, 0x35, 0x01]);
    }

    #[test]
    fn test_update_v4_layout_without_redirect() {
        let bytes = Command::UpdateV4(Update {
            protocol: 6,
            local_address: [10, 0, 0, 1],
            local_port: 0x1234,
            remote_address: [10, 0, 0, 2],
            remote_port: 443,
            verdict: Verdict::Accept.to_u8(),
            redirect: None,
        })
        .encode();

        assert_eq!(
            bytes,
            [
                4, 6, 10, 0, 0, 1, 0x34, 0x12, 10, 0, 0, 2, 0xBB, 0x01, 2, 0, 0, 0, 0, 0, 0
            ]
        );
    }

    #[test]
    fn test_get_connections_update_layout() {
        let bytes = Command::GetConnectionsUpdate { threshold: 0x10 }.encode();
        assert_eq!(bytes, [9, 0x10, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_single_byte_commands() {
        assert_eq!(Command::Shutdown.encode(), [0]);
        assert_eq!(Command::ClearCache.encode(), [6]);
        assert_eq!(Command::GetLogs.encode(), [7]);
        assert_eq!(Command::GetBandwidthStats.encode(), [8]);
        assert_eq!(Command::CleanEndedConnections.encode(), [10]);
        assert_eq!(Command::PrintMemoryStats.encode(), [11]);
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        assert!(matches!(
            Command::decode(&[42]),
            Err(KextError::UnknownCommand(42))
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_size() {
        let mut bytes = Command::Verdict { id: 1, verdict: 2 }.encode();
        bytes.push(0);
        assert!(matches!(
            Command::decode(&bytes),
            Err(KextError::InvalidCommandSize {
                command_type: 1,
                expected: 10,
                actual: 11
            })
        ));
        assert!(matches!(
            Command::decode(&[]),
            Err(KextError::InvalidCommandSize { .. })
        ));
    }

    #[test]
    fn test_decode_stream() {
        let mut stream = Vec::new();
        for command in all_commands() {
            command.encode_into(&mut stream);
        }

        assert_eq!(Command::decode_stream(&stream).unwrap(), all_commands());

        // Truncated trailing command.
        stream.extend(Command::Verdict { id: 5, verdict: 4 }.encode());
        stream.pop();
        assert!(matches!(
            Command::decode_stream(&stream),
            Err(KextError::InvalidCommandSize {
                command_type: 1,
                expected: 10,
                actual: 9
            })
        ));
    }

    #[test]
    fn test_zero_redirect_decodes_as_none() {
        let update = |address: [u8; 16], port: u16| {
            Command::UpdateV6(Update {
                protocol: 17,
                local_address: [1; 16],
                local_port: 5353,
                remote_address: [2; 16],
                remote_port: 53,
                verdict: Verdict::RedirectNameServer.to_u8(),
                redirect: Some(RedirectTarget { address, port }),
            })
        };

        let Command::UpdateV6(decoded) = Command::decode(&update([0; 16], 0).encode()).unwrap() else {
            panic!("expected UpdateV6");
        };
        assert_eq!(decoded.redirect, None);

        let kept = update([0; 16], 53);
        assert_eq!(Command::decode(&kept.encode()).unwrap(), kept);
    }
}
