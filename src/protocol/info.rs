//! Inbound info values and their payload codec.
//!
//! Each info frame's payload is decoded by the parser for its type tag. A
//! parser reads the fixed fields first, then at most one trailing variable
//! section (a `u32`-prefixed byte array or element array), and must consume
//! the payload exactly. Short or overlong payloads are
//! [`KextError::Malformed`]; unknown tags become [`Info::Unknown`] so the
//! stream keeps going.
//!
//! ```text
//! LogLine:        [severity u8][text: length - 1 bytes]
//! ConnectionV4:   [id u64][pid u64][direction u8][protocol u8][local 4][remote 4]
//!                 [local port u16][remote port u16][payload layer u8][len u32][payload]
//! ConnectionEnd:  [pid u64][direction u8][protocol u8][local][remote][ports]
//!                 [rx bytes u64][rx packets u64][tx bytes u64][tx packets u64]
//! Update:         [protocol u8][local][remote][ports][rx/tx counters 4 x u64]
//! BandwidthStats: [protocol u8][count u32] count x [local][port][remote][port][tx u64][rx u64]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;

use super::frame::Frame;
use super::types::{socket_addr, Direction, IpBytes, Severity};
use super::wire_format::{Header, InfoType, HEADER_SIZE};
use crate::error::{KextError, Result};

/// Log line buffered by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub severity: u8,
    pub line: String,
}

impl LogLine {
    pub fn severity(&self) -> Option<Severity> {
        Severity::from_u8(self.severity)
    }
}

/// A new connection waiting for a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection<const N: usize> {
    /// Driver-assigned Id; the only key accepted by verdict and redirect.
    pub id: u64,
    pub process_id: u64,
    pub direction: u8,
    pub protocol: u8,
    pub local_ip: [u8; N],
    pub remote_ip: [u8; N],
    pub local_port: u16,
    pub remote_port: u16,
    /// Depth up to which leading packet bytes were captured into `payload`.
    pub payload_layer: u8,
    pub payload: Bytes,
}

pub type ConnectionV4 = Connection<4>;
pub type ConnectionV6 = Connection<16>;

impl<const N: usize> Connection<N> {
    /// Field-wise equality ignoring `payload`.
    pub fn compare(&self, other: &Self) -> bool {
        self.id == other.id
            && self.process_id == other.process_id
            && self.direction == other.direction
            && self.protocol == other.protocol
            && self.local_ip == other.local_ip
            && self.remote_ip == other.remote_ip
            && self.local_port == other.local_port
            && self.remote_port == other.remote_port
            && self.payload_layer == other.payload_layer
    }

    pub fn direction(&self) -> Option<Direction> {
        Direction::from_u8(self.direction)
    }
}

impl<const N: usize> Connection<N>
where
    [u8; N]: IpBytes,
{
    pub fn local_addr(&self) -> SocketAddr {
        socket_addr(self.local_ip, self.local_port)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        socket_addr(self.remote_ip, self.remote_port)
    }
}

/// Final accounting for a connection that ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEnd<const N: usize> {
    pub process_id: u64,
    pub direction: u8,
    pub protocol: u8,
    pub local_ip: [u8; N],
    pub remote_ip: [u8; N],
    pub local_port: u16,
    pub remote_port: u16,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

pub type ConnectionEndV4 = ConnectionEnd<4>;
pub type ConnectionEndV6 = ConnectionEnd<16>;

/// Point-in-time counters of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionUpdate<const N: usize> {
    pub protocol: u8,
    pub local_ip: [u8; N],
    pub remote_ip: [u8; N],
    pub local_port: u16,
    pub remote_port: u16,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

pub type ConnectionUpdateV4 = ConnectionUpdate<4>;
pub type ConnectionUpdateV6 = ConnectionUpdate<16>;

/// One connection's traffic inside a bandwidth snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthValue<const N: usize> {
    pub local_ip: [u8; N],
    pub local_port: u16,
    pub remote_ip: [u8; N],
    pub remote_port: u16,
    pub transmitted_bytes: u64,
    pub received_bytes: u64,
}

/// Bandwidth snapshot for one protocol and one IP family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthStats<const N: usize> {
    pub protocol: u8,
    pub values: Vec<BandwidthValue<N>>,
}

pub type BandwidthValueV4 = BandwidthValue<4>;
pub type BandwidthValueV6 = BandwidthValue<16>;
pub type BandwidthStatsV4 = BandwidthStats<4>;
pub type BandwidthStatsV6 = BandwidthStats<16>;

/// A decoded info frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Info {
    LogLine(LogLine),
    ConnectionV4(ConnectionV4),
    ConnectionV6(ConnectionV6),
    ConnectionEndV4(ConnectionEndV4),
    ConnectionEndV6(ConnectionEndV6),
    ConnectionUpdateV4(ConnectionUpdateV4),
    ConnectionUpdateV6(ConnectionUpdateV6),
    /// Terminates the batch answering a `GetConnectionsUpdate`.
    ConnectionUpdateEnd,
    BandwidthStatsV4(BandwidthStatsV4),
    BandwidthStatsV6(BandwidthStatsV6),
    /// Type tag this version does not know. The payload is kept verbatim.
    Unknown { info_type: u8, payload: Bytes },
}

impl Info {
    /// Decode one frame's payload.
    ///
    /// # Example
    ///
    /// ```
    /// use kext_interface::protocol::{Info, LogLine, Severity};
    ///
    /// let info = Info::decode(1, b"\x01hi!!").unwrap();
    /// assert_eq!(
    ///     info,
    ///     Info::LogLine(LogLine { severity: 1, line: "hi!!".into() })
    /// );
    /// if let Info::LogLine(log) = info {
    ///     assert_eq!(log.severity(), Some(Severity::Trace));
    /// }
    /// ```
    ///
    /// # Errors
    ///
    /// [`KextError::Malformed`] when the payload does not match the layout
    /// of a known type.
    pub fn decode(info_type: u8, payload: &[u8]) -> Result<Self> {
        Self::decode_bytes(info_type, Bytes::copy_from_slice(payload))
    }

    /// Decode a reassembled frame without copying its payload.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Self::decode_bytes(frame.info_type, frame.payload.clone())
    }

    fn decode_bytes(info_type: u8, payload: Bytes) -> Result<Self> {
        let Some(known) = InfoType::from_u8(info_type) else {
            return Ok(Self::Unknown { info_type, payload });
        };

        let mut reader = PayloadReader::new(info_type, payload);
        let info = match known {
            InfoType::LogLine => Self::LogLine(reader.log_line()?),
            InfoType::ConnectionV4 => Self::ConnectionV4(reader.connection()?),
            InfoType::ConnectionV6 => Self::ConnectionV6(reader.connection()?),
            InfoType::ConnectionEndV4 => Self::ConnectionEndV4(reader.connection_end()?),
            InfoType::ConnectionEndV6 => Self::ConnectionEndV6(reader.connection_end()?),
            InfoType::ConnectionUpdateV4 => Self::ConnectionUpdateV4(reader.connection_update()?),
            InfoType::ConnectionUpdateV6 => Self::ConnectionUpdateV6(reader.connection_update()?),
            InfoType::ConnectionUpdateEnd => Self::ConnectionUpdateEnd,
            InfoType::BandwidthStatsV4 => Self::BandwidthStatsV4(reader.bandwidth_stats()?),
            InfoType::BandwidthStatsV6 => Self::BandwidthStatsV6(reader.bandwidth_stats()?),
        };
        reader.finish()?;

        Ok(info)
    }

    /// Raw type tag of this info.
    pub fn info_type(&self) -> u8 {
        let known = match self {
            Self::LogLine(_) => InfoType::LogLine,
            Self::ConnectionV4(_) => InfoType::ConnectionV4,
            Self::ConnectionV6(_) => InfoType::ConnectionV6,
            Self::ConnectionEndV4(_) => InfoType::ConnectionEndV4,
            Self::ConnectionEndV6(_) => InfoType::ConnectionEndV6,
            Self::ConnectionUpdateV4(_) => InfoType::ConnectionUpdateV4,
            Self::ConnectionUpdateV6(_) => InfoType::ConnectionUpdateV6,
            Self::ConnectionUpdateEnd => InfoType::ConnectionUpdateEnd,
            Self::BandwidthStatsV4(_) => InfoType::BandwidthStatsV4,
            Self::BandwidthStatsV6(_) => InfoType::BandwidthStatsV6,
            Self::Unknown { info_type, .. } => return *info_type,
        };
        known.to_u8()
    }

    /// Whether this info belongs to a `GetConnectionsUpdate` batch.
    pub fn is_connection_update(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUpdateV4(_) | Self::ConnectionUpdateV6(_) | Self::ConnectionUpdateEnd
        )
    }

    /// Encode the payload the way the driver writes it.
    pub fn encode_payload<B: BufMut>(&self, dst: &mut B) {
        match self {
            Self::LogLine(log) => {
                dst.put_u8(log.severity);
                dst.put_slice(log.line.as_bytes());
            }
            Self::ConnectionV4(conn) => put_connection(dst, conn),
            Self::ConnectionV6(conn) => put_connection(dst, conn),
            Self::ConnectionEndV4(end) => put_connection_end(dst, end),
            Self::ConnectionEndV6(end) => put_connection_end(dst, end),
            Self::ConnectionUpdateV4(update) => put_connection_update(dst, update),
            Self::ConnectionUpdateV6(update) => put_connection_update(dst, update),
            Self::ConnectionUpdateEnd => {}
            Self::BandwidthStatsV4(stats) => put_bandwidth_stats(dst, stats),
            Self::BandwidthStatsV6(stats) => put_bandwidth_stats(dst, stats),
            Self::Unknown { payload, .. } => dst.put_slice(payload),
        }
    }

    /// Encode as a complete `[type][length][payload]` frame.
    ///
    /// # Panics
    ///
    /// Panics if the payload is longer than `u32::MAX`.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload);

        let length = u32::try_from(payload.len()).expect("payload length fits in u32");
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&Header::new(self.info_type(), length).encode());
        buf.extend_from_slice(&payload);
        buf
    }
}

/// Bounds-checked reader over one frame's payload.
struct PayloadReader {
    info_type: u8,
    buf: Bytes,
}

impl PayloadReader {
    fn new(info_type: u8, buf: Bytes) -> Self {
        Self { info_type, buf }
    }

    fn need(&self, n: usize, field: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(KextError::malformed(
                self.info_type,
                format!(
                    "truncated at {field}: need {n} bytes, {} left",
                    self.buf.remaining()
                ),
            ));
        }
        Ok(())
    }

    fn u8(&mut self, field: &str) -> Result<u8> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &str) -> Result<u16> {
        self.need(2, field)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self, field: &str) -> Result<u32> {
        self.need(4, field)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self, field: &str) -> Result<u64> {
        self.need(8, field)?;
        Ok(self.buf.get_u64_le())
    }

    fn array<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        self.need(N, field)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    fn bytes(&mut self, len: usize, field: &str) -> Result<Bytes> {
        self.need(len, field)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    /// Reject leftover bytes.
    fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(KextError::malformed(
                self.info_type,
                format!("{} trailing bytes", self.buf.remaining()),
            ));
        }
        Ok(())
    }

    fn log_line(&mut self) -> Result<LogLine> {
        let severity = self.u8("severity")?;
        let text = self.buf.split_to(self.buf.len());
        let line = String::from_utf8(text.to_vec())
            .map_err(|e| KextError::malformed(self.info_type, format!("log text: {e}")))?;
        Ok(LogLine { severity, line })
    }

    fn connection<const N: usize>(&mut self) -> Result<Connection<N>> {
        let id = self.u64("id")?;
        let process_id = self.u64("process_id")?;
        let direction = self.u8("direction")?;
        let protocol = self.u8("protocol")?;
        let local_ip = self.array("local_ip")?;
        let remote_ip = self.array("remote_ip")?;
        let local_port = self.u16("local_port")?;
        let remote_port = self.u16("remote_port")?;
        let payload_layer = self.u8("payload_layer")?;
        let payload_len = self.u32("payload_len")? as usize;
        let payload = self.bytes(payload_len, "payload")?;

        Ok(Connection {
            id,
            process_id,
            direction,
            protocol,
            local_ip,
            remote_ip,
            local_port,
            remote_port,
            payload_layer,
            payload,
        })
    }

    fn connection_end<const N: usize>(&mut self) -> Result<ConnectionEnd<N>> {
        Ok(ConnectionEnd {
            process_id: self.u64("process_id")?,
            direction: self.u8("direction")?,
            protocol: self.u8("protocol")?,
            local_ip: self.array("local_ip")?,
            remote_ip: self.array("remote_ip")?,
            local_port: self.u16("local_port")?,
            remote_port: self.u16("remote_port")?,
            rx_bytes: self.u64("rx_bytes")?,
            rx_packets: self.u64("rx_packets")?,
            tx_bytes: self.u64("tx_bytes")?,
            tx_packets: self.u64("tx_packets")?,
        })
    }

    fn connection_update<const N: usize>(&mut self) -> Result<ConnectionUpdate<N>> {
        Ok(ConnectionUpdate {
            protocol: self.u8("protocol")?,
            local_ip: self.array("local_ip")?,
            remote_ip: self.array("remote_ip")?,
            local_port: self.u16("local_port")?,
            remote_port: self.u16("remote_port")?,
            rx_bytes: self.u64("rx_bytes")?,
            rx_packets: self.u64("rx_packets")?,
            tx_bytes: self.u64("tx_bytes")?,
            tx_packets: self.u64("tx_packets")?,
        })
    }

    fn bandwidth_stats<const N: usize>(&mut self) -> Result<BandwidthStats<N>> {
        let protocol = self.u8("protocol")?;
        let count = self.u32("count")? as usize;

        // Check the whole array up front so a bogus count cannot trigger a
        // huge allocation.
        let element_size = 2 * (N + 2) + 2 * 8;
        let total = count
            .checked_mul(element_size)
            .ok_or_else(|| KextError::malformed(self.info_type, "value count overflows"))?;
        self.need(total, "values")?;

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(BandwidthValue {
                local_ip: self.array("local_ip")?,
                local_port: self.u16("local_port")?,
                remote_ip: self.array("remote_ip")?,
                remote_port: self.u16("remote_port")?,
                transmitted_bytes: self.u64("transmitted_bytes")?,
                received_bytes: self.u64("received_bytes")?,
            });
        }

        Ok(BandwidthStats { protocol, values })
    }
}

fn put_connection<const N: usize, B: BufMut>(dst: &mut B, conn: &Connection<N>) {
    dst.put_u64_le(conn.id);
    dst.put_u64_le(conn.process_id);
    dst.put_u8(conn.direction);
    dst.put_u8(conn.protocol);
    dst.put_slice(&conn.local_ip);
    dst.put_slice(&conn.remote_ip);
    dst.put_u16_le(conn.local_port);
    dst.put_u16_le(conn.remote_port);
    dst.put_u8(conn.payload_layer);
    dst.put_u32_le(conn.payload.len() as u32);
    dst.put_slice(&conn.payload);
}

fn put_connection_end<const N: usize, B: BufMut>(dst: &mut B, end: &ConnectionEnd<N>) {
    dst.put_u64_le(end.process_id);
    dst.put_u8(end.direction);
    dst.put_u8(end.protocol);
    dst.put_slice(&end.local_ip);
    dst.put_slice(&end.remote_ip);
    dst.put_u16_le(end.local_port);
    dst.put_u16_le(end.remote_port);
    dst.put_u64_le(end.rx_bytes);
    dst.put_u64_le(end.rx_packets);
    dst.put_u64_le(end.tx_bytes);
    dst.put_u64_le(end.tx_packets);
}

fn put_connection_update<const N: usize, B: BufMut>(dst: &mut B, update: &ConnectionUpdate<N>) {
    dst.put_u8(update.protocol);
    dst.put_slice(&update.local_ip);
    dst.put_slice(&update.remote_ip);
    dst.put_u16_le(update.local_port);
    dst.put_u16_le(update.remote_port);
    dst.put_u64_le(update.rx_bytes);
    dst.put_u64_le(update.rx_packets);
    dst.put_u64_le(update.tx_bytes);
    dst.put_u64_le(update.tx_packets);
}

fn put_bandwidth_stats<const N: usize, B: BufMut>(dst: &mut B, stats: &BandwidthStats<N>) {
    dst.put_u8(stats.protocol);
    dst.put_u32_le(stats.values.len() as u32);
    for value in &stats.values {
        dst.put_slice(&value.local_ip);
        dst.put_u16_le(value.local_port);
        dst.put_slice(&value.remote_ip);
        dst.put_u16_le(value.remote_port);
        dst.put_u64_le(value.transmitted_bytes);
        dst.put_u64_le(value.received_bytes);
    }
}
