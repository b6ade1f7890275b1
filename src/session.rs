//! Session builder and read loop.
//!
//! The [`SessionBuilder`] provides a fluent API for configuring the session.
//! The [`Session`] manages the lifecycle:
//! 1. Split the device into a read half and a write half
//! 2. Spawn the blocking read loop (reassemble, decode, batch)
//! 3. Deliver [`Event`]s through a bounded channel
//! 4. Send commands from the caller's context
//!
//! # Example
//!
//! ```no_run
//! use kext_interface::protocol::{Info, Verdict};
//! use kext_interface::{Event, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = std::fs::OpenOptions::new()
//!         .read(true)
//!         .write(true)
//!         .open(r"\\.\PortmasterKext")?;
//!
//!     let mut session = Session::builder().batch_updates(true).start_file(device)?;
//!
//!     while let Some(event) = session.next_event().await {
//!         if let Event::Info(Info::ConnectionV4(conn)) = event {
//!             session.commands().verdict(conn.id, Verdict::Accept)?;
//!         }
//!     }
//!
//!     session.wait().await?;
//!     Ok(())
//! }
//! ```

use std::fs::File;
use std::io::{self, Read, Write};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::backpressure::{
    Delivery, DeliveryPolicy, DroppedCounter, EventSender, DEFAULT_CHANNEL_CAPACITY,
};
use crate::batch::{BatchRequests, BatchStep, UpdateBatch, UpdateBatchAssembler};
use crate::error::{KextError, Result};
use crate::protocol::{Frame, Info, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::reader::{FrameReader, DEFAULT_READ_CHUNK_SIZE};
use crate::writer::CommandWriter;

/// Session configuration.
///
/// Every field is optional when loading from JSON; missing fields take the
/// defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound of a single device read. Default: 64 KB.
    pub read_chunk_size: usize,
    /// Largest payload a frame header may declare. Default: 16 MB.
    pub max_payload_size: u32,
    /// Event channel bound. Default: 1024.
    pub channel_capacity: usize,
    /// Policy when the event channel is full. Default: `Block`.
    pub delivery: DeliveryPolicy,
    /// Group `GetConnectionsUpdate` replies into [`Event::Batch`].
    pub batch_updates: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            delivery: DeliveryPolicy::default(),
            batch_updates: false,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration from JSON.
    ///
    /// ```
    /// use kext_interface::SessionConfig;
    ///
    /// let config = SessionConfig::from_json(r#"{"delivery": "drop_newest"}"#).unwrap();
    /// assert_eq!(config.channel_capacity, 1024);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Something the read loop observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A decoded info, including [`Info::Unknown`] for unrecognized types.
    Info(Info),
    /// A complete `GetConnectionsUpdate` reply (only with `batch_updates`).
    Batch(UpdateBatch),
    /// A frame of a known type whose payload did not match its layout. The
    /// stream stays synchronized; the raw payload is kept for diagnostics.
    Malformed {
        info_type: u8,
        reason: String,
        payload: Bytes,
    },
    /// A connection update or sentinel arrived with no request outstanding.
    Violation { reason: &'static str, info: Info },
    /// Updates of a batch whose end marker never arrived before the read
    /// loop stopped.
    IncompleteBatch(UpdateBatch),
}

/// Builder for configuring and starting a [`Session`].
#[derive(Debug, Clone, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the device read size.
    ///
    /// Default: 64 KB
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.config.read_chunk_size = size;
        self
    }

    /// Set the maximum declared payload length.
    ///
    /// Default: 16 MB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Set the event channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Set the policy applied when the consumer falls behind.
    ///
    /// Default: `Block`
    pub fn delivery(mut self, policy: DeliveryPolicy) -> Self {
        self.config.delivery = policy;
        self
    }

    /// Enable grouping of connection updates into batches.
    pub fn batch_updates(mut self, enabled: bool) -> Self {
        self.config.batch_updates = enabled;
        self
    }

    /// Start a session over separate read and write halves.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start<R, W>(self, source: R, sink: W) -> Session<W>
    where
        R: Read + Send + 'static,
        W: Write,
    {
        Session::start(self.config, source, sink)
    }

    /// Start a session over a device file.
    ///
    /// The handle is duplicated so the read loop and the command writer use
    /// independent handles.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start_file(self, device: File) -> Result<Session<File>> {
        let source = device.try_clone()?;
        Ok(self.start(source, device))
    }
}

/// A running driver session.
///
/// Use [`next_event`](Self::next_event) to consume what the driver sends and
/// [`commands`](Self::commands) to answer it.
#[derive(Debug)]
pub struct Session<W> {
    writer: CommandWriter<W>,
    events: Option<mpsc::Receiver<Event>>,
    requests: BatchRequests,
    batch_updates: bool,
    dropped: DroppedCounter,
    read_task: JoinHandle<Result<()>>,
}

impl Session<File> {
    /// Create a new session builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }
}

impl<W: Write> Session<W> {
    fn start<R>(config: SessionConfig, source: R, sink: W) -> Self
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let events = EventSender::new(tx, config.delivery);
        let dropped = events.dropped();

        let requests = BatchRequests::new();
        let assembler = config
            .batch_updates
            .then(|| UpdateBatchAssembler::new(requests.clone()));

        let reader = FrameReader::with_limits(source, config.read_chunk_size, config.max_payload_size);

        info!(
            chunk = config.read_chunk_size,
            capacity = config.channel_capacity,
            delivery = ?config.delivery,
            batch_updates = config.batch_updates,
            "session started"
        );

        let read_task = tokio::task::spawn_blocking(move || {
            let result = read_loop(reader, events, assembler);
            match &result {
                Ok(()) => info!("read loop stopped"),
                Err(e) => error!("Read loop error: {}", e),
            }
            result
        });

        Self {
            writer: CommandWriter::new(sink),
            events: Some(rx),
            requests,
            batch_updates: config.batch_updates,
            dropped,
            read_task,
        }
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the read loop has stopped and every event has been
    /// consumed, or if the receiver was taken with
    /// [`take_events`](Self::take_events).
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.as_mut()?.recv().await
    }

    /// Take the event receiver, e.g. to consume it from another task.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.events.take()
    }

    /// Command writer for this session. Clone it to send from other tasks.
    pub fn commands(&self) -> &CommandWriter<W> {
        &self.writer
    }

    /// Request connection counters newer than `threshold`.
    ///
    /// With `batch_updates` the request is registered before the command is
    /// written, so the reply is delivered as one [`Event::Batch`]. If the
    /// write fails the registration is rolled back.
    pub fn get_connections_update(&self, threshold: u64) -> Result<()> {
        if !self.batch_updates {
            return self.writer.get_connections_update(threshold);
        }

        self.requests.register();
        self.writer.get_connections_update(threshold).map_err(|e| {
            self.requests.cancel();
            e
        })
    }

    /// `GetConnectionsUpdate` requests still awaiting their end marker.
    pub fn pending_batches(&self) -> usize {
        self.requests.pending()
    }

    /// Events discarded under [`DeliveryPolicy::DropNewest`].
    pub fn dropped_events(&self) -> u64 {
        self.dropped.get()
    }

    /// Shared handle on the drop counter, usable after the session is gone.
    pub fn dropped_counter(&self) -> DroppedCounter {
        self.dropped.clone()
    }

    /// Whether the read loop has stopped.
    pub fn is_finished(&self) -> bool {
        self.read_task.is_finished()
    }

    /// Wait for the read loop to stop.
    ///
    /// The loop stops when the driver closes the channel, when the event
    /// receiver is dropped, or on a terminal error, which is returned here.
    /// Sending `Shutdown` does not stop it by itself.
    pub async fn wait(self) -> Result<()> {
        drop(self.events);
        match self.read_task.await {
            Ok(result) => result,
            Err(e) => Err(KextError::Io(io::Error::other(e))),
        }
    }
}

/// Blocking read loop - reads frames, decodes them and delivers events.
///
/// Whatever way the loop ends, updates of a batch still open are delivered
/// as [`Event::IncompleteBatch`] before returning.
fn read_loop<R: Read>(
    mut reader: FrameReader<R>,
    events: EventSender<Event>,
    mut assembler: Option<UpdateBatchAssembler>,
) -> Result<()> {
    let result = pump(&mut reader, &events, assembler.as_mut());

    if let Some(batch) = assembler.as_mut().and_then(UpdateBatchAssembler::finish) {
        warn!(updates = batch.len(), "stream ended inside an update batch");
        if events.deliver(Event::IncompleteBatch(batch)) != Delivery::Delivered {
            warn!("incomplete update batch could not be delivered");
        }
    }

    result
}

fn pump<R: Read>(
    reader: &mut FrameReader<R>,
    events: &EventSender<Event>,
    mut assembler: Option<&mut UpdateBatchAssembler>,
) -> Result<()> {
    loop {
        let frame = match reader.next_frame() {
            Ok(frame) => frame,
            Err(KextError::ConnectionClosed) => {
                debug!("driver closed the channel");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let Some(event) = frame_to_event(frame, assembler.as_deref_mut())? else {
            continue;
        };

        if events.deliver(event) == Delivery::Closed {
            debug!("event receiver dropped");
            return Ok(());
        }
    }
}

/// Decode one frame and run it through the batch assembler.
///
/// Returns `None` when the frame was absorbed into an open batch.
fn frame_to_event(
    frame: Frame,
    assembler: Option<&mut UpdateBatchAssembler>,
) -> Result<Option<Event>> {
    let info = match Info::from_frame(&frame) {
        Ok(info) => info,
        Err(KextError::Malformed { info_type, reason }) => {
            warn!(info_type, len = frame.payload_len(), %reason, "malformed info frame");
            return Ok(Some(Event::Malformed {
                info_type,
                reason,
                payload: frame.payload,
            }));
        }
        Err(e) => return Err(e),
    };

    match &info {
        Info::Unknown { info_type, payload } => {
            warn!(info_type, len = payload.len(), "unknown info type");
        }
        _ => trace!(info_type = info.info_type(), len = frame.payload_len(), "info"),
    }

    let Some(assembler) = assembler else {
        return Ok(Some(Event::Info(info)));
    };

    Ok(match assembler.accept(info) {
        BatchStep::Passthrough(info) => Some(Event::Info(info)),
        BatchStep::Buffered => None,
        BatchStep::Complete(batch) => {
            debug!(updates = batch.len(), "update batch complete");
            Some(Event::Batch(batch))
        }
        BatchStep::Violation { reason, info } => {
            warn!(info_type = info.info_type(), reason, "batch sequence violation");
            Some(Event::Violation { reason, info })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, ConnectionUpdate, Header, LogLine, Severity};
    use std::io::Cursor;
    use std::sync::mpsc as std_mpsc;

    /// Source fed chunk by chunk from the test; closes when the sender drops.
    struct ChannelSource {
        rx: std_mpsc::Receiver<Vec<u8>>,
        pending: Cursor<Vec<u8>>,
    }

    impl ChannelSource {
        fn new() -> (std_mpsc::Sender<Vec<u8>>, Self) {
            let (tx, rx) = std_mpsc::channel();
            let source = Self {
                rx,
                pending: Cursor::new(Vec::new()),
            };
            (tx, source)
        }
    }

    impl Read for ChannelSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let n = self.pending.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                match self.rx.recv() {
                    Ok(chunk) => self.pending = Cursor::new(chunk),
                    Err(_) => return Ok(0),
                }
            }
        }
    }

    fn log_frame(text: &str) -> Vec<u8> {
        Info::LogLine(LogLine {
            severity: Severity::Info.to_u8(),
            line: text.to_string(),
        })
        .encode()
    }

    fn update_frame(port: u16) -> Vec<u8> {
        Info::ConnectionUpdateV4(ConnectionUpdate {
            protocol: 17,
            local_ip: [127, 0, 0, 1],
            remote_ip: [127, 0, 0, 1],
            local_port: port,
            remote_port: 53,
            rx_bytes: 10,
            rx_packets: 1,
            tx_bytes: 20,
            tx_packets: 2,
        })
        .encode()
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.read_chunk_size, 64 * 1024);
        assert_eq!(config.max_payload_size, 16 * 1024 * 1024);
        assert_eq!(config.channel_capacity, 1024);
        assert_eq!(config.delivery, DeliveryPolicy::Block);
        assert!(!config.batch_updates);
    }

    #[test]
    fn test_config_from_json() {
        let config = SessionConfig::from_json(
            r#"{"read_chunk_size": 512, "batch_updates": true, "delivery": "drop_newest"}"#,
        )
        .unwrap();
        assert_eq!(config.read_chunk_size, 512);
        assert!(config.batch_updates);
        assert_eq!(config.delivery, DeliveryPolicy::DropNewest);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);

        assert!(matches!(
            SessionConfig::from_json("{\"delivery\": \"sometimes\"}"),
            Err(KextError::Config(_))
        ));
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Session::builder()
            .read_chunk_size(16)
            .max_payload_size(4096)
            .channel_capacity(8)
            .delivery(DeliveryPolicy::DropNewest)
            .batch_updates(true);

        assert_eq!(builder.config.read_chunk_size, 16);
        assert_eq!(builder.config.max_payload_size, 4096);
        assert_eq!(builder.config.channel_capacity, 8);
        assert_eq!(builder.config.delivery, DeliveryPolicy::DropNewest);
        assert!(builder.config.batch_updates);
    }

    #[tokio::test]
    async fn test_events_in_order_then_close() {
        let mut bytes = log_frame("one");
        bytes.extend(build_frame(0xC8, b"??"));
        bytes.extend(log_frame("two"));

        let mut session = SessionBuilder::new()
            .read_chunk_size(3)
            .start(Cursor::new(bytes), Vec::new());

        let Some(Event::Info(Info::LogLine(first))) = session.next_event().await else {
            panic!("expected a log line");
        };
        assert_eq!(first.line, "one");
        assert!(matches!(
            session.next_event().await,
            Some(Event::Info(Info::Unknown { info_type: 0xC8, .. }))
        ));
        assert!(matches!(
            session.next_event().await,
            Some(Event::Info(Info::LogLine(ref l))) if l.line == "two"
        ));
        assert!(session.next_event().await.is_none());
        session.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_stop_loop() {
        let mut bytes = build_frame(1, &[1, 0xFF, 0xFE]);
        bytes.extend(build_frame(8, &[1, 2]));
        bytes.extend(log_frame("after"));

        let mut session = SessionBuilder::new().start(Cursor::new(bytes), Vec::new());

        assert!(matches!(
            session.next_event().await,
            Some(Event::Malformed { info_type: 1, .. })
        ));
        match session.next_event().await {
            Some(Event::Malformed {
                info_type, payload, ..
            }) => {
                assert_eq!(info_type, 8);
                assert_eq!(&payload[..], &[1, 2]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            session.next_event().await,
            Some(Event::Info(Info::LogLine(_)))
        ));
        session.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_round_trip() {
        let (feed, source) = ChannelSource::new();
        let mut session = SessionBuilder::new().batch_updates(true).start(source, Vec::new());

        session.get_connections_update(1234).unwrap();
        assert_eq!(session.pending_batches(), 1);
        session.commands().with_sink(|sink| {
            assert_eq!(sink[0], 9);
            assert_eq!(&sink[1..9], &1234u64.to_le_bytes());
        });

        feed.send(update_frame(1)).unwrap();
        feed.send(log_frame("interleaved")).unwrap();
        let mut tail = update_frame(2);
        tail.extend(Info::ConnectionUpdateEnd.encode());
        feed.send(tail).unwrap();

        assert!(matches!(
            session.next_event().await,
            Some(Event::Info(Info::LogLine(_)))
        ));
        let Some(Event::Batch(batch)) = session.next_event().await else {
            panic!("expected a batch");
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(session.pending_batches(), 0);

        // Stray sentinel with nothing outstanding.
        feed.send(Info::ConnectionUpdateEnd.encode()).unwrap();
        assert!(matches!(
            session.next_event().await,
            Some(Event::Violation {
                info: Info::ConnectionUpdateEnd,
                ..
            })
        ));

        drop(feed);
        assert!(session.next_event().await.is_none());
        session.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_batch_reported_when_stream_ends() {
        let (feed, source) = ChannelSource::new();
        let mut session = SessionBuilder::new().batch_updates(true).start(source, Vec::new());

        session.get_connections_update(0).unwrap();
        for port in 1..=3 {
            feed.send(update_frame(port)).unwrap();
        }
        drop(feed);

        let Some(Event::IncompleteBatch(batch)) = session.next_event().await else {
            panic!("expected the open batch to be reported");
        };
        let ports: Vec<u16> = batch.v4().map(|u| u.local_port).collect();
        assert_eq!(ports, [1, 2, 3]);

        assert!(session.next_event().await.is_none());
        session.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_batch_reported_on_fatal_error() {
        let (feed, source) = ChannelSource::new();
        let mut session = SessionBuilder::new()
            .batch_updates(true)
            .max_payload_size(1024)
            .start(source, Vec::new());

        session.get_connections_update(0).unwrap();
        let mut bytes = update_frame(9);
        bytes.extend(Header::new(2, 1 << 20).encode());
        feed.send(bytes).unwrap();

        assert!(matches!(
            session.next_event().await,
            Some(Event::IncompleteBatch(ref b)) if b.len() == 1
        ));
        assert!(session.next_event().await.is_none());
        assert!(matches!(
            session.wait().await,
            Err(KextError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_updates_pass_through_without_batching() {
        let mut bytes = update_frame(7);
        bytes.extend(Info::ConnectionUpdateEnd.encode());

        let mut session = SessionBuilder::new().start(Cursor::new(bytes), Vec::new());

        assert!(matches!(
            session.next_event().await,
            Some(Event::Info(Info::ConnectionUpdateV4(_)))
        ));
        assert_eq!(
            session.next_event().await,
            Some(Event::Info(Info::ConnectionUpdateEnd))
        );
    }

    #[tokio::test]
    async fn test_drop_newest_counts_overflow() {
        let mut bytes = Vec::new();
        for i in 0..5 {
            bytes.extend(log_frame(&format!("line {i}")));
        }

        let mut session = SessionBuilder::new()
            .channel_capacity(1)
            .delivery(DeliveryPolicy::DropNewest)
            .start(Cursor::new(bytes), Vec::new());

        let mut events = session.take_events().unwrap();
        let dropped = session.dropped_counter();
        assert!(session.next_event().await.is_none());

        // Nothing is consumed until the loop has finished.
        while !session.is_finished() {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert_eq!(dropped.get(), 4);
        assert_eq!(session.dropped_events(), 4);

        assert!(matches!(
            events.recv().await,
            Some(Event::Info(Info::LogLine(ref l))) if l.line == "line 0"
        ));
        assert!(events.recv().await.is_none());
        session.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_error_is_returned_by_wait() {
        let bytes = Header::new(2, 1 << 20).encode().to_vec();
        let mut session = SessionBuilder::new()
            .max_payload_size(1024)
            .start(Cursor::new(bytes), Vec::new());

        assert!(session.next_event().await.is_none());
        assert!(matches!(
            session.wait().await,
            Err(KextError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_loop() {
        let (feed, source) = ChannelSource::new();
        let mut session = SessionBuilder::new().start(source, Vec::new());
        drop(session.take_events());

        feed.send(log_frame("nobody listens")).unwrap();
        session.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_request_is_rolled_back() {
        struct Closed;

        impl Write for Closed {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let session = SessionBuilder::new()
            .batch_updates(true)
            .start(Cursor::new(Vec::new()), Closed);

        assert!(session.get_connections_update(0).is_err());
        assert_eq!(session.pending_batches(), 0);
    }

    #[tokio::test]
    async fn test_start_file() {
        let path = std::env::temp_dir().join(format!("kext-session-{}.bin", std::process::id()));
        let mut bytes = log_frame("from file");
        bytes.extend(Info::ConnectionUpdateEnd.encode());
        std::fs::write(&path, &bytes).unwrap();

        let device = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut session = Session::builder().start_file(device).unwrap();

        assert!(matches!(
            session.next_event().await,
            Some(Event::Info(Info::LogLine(ref l))) if l.line == "from file"
        ));
        assert_eq!(
            session.next_event().await,
            Some(Event::Info(Info::ConnectionUpdateEnd))
        );
        assert!(session.next_event().await.is_none());
        session.wait().await.unwrap();

        std::fs::remove_file(&path).unwrap();
    }
}
