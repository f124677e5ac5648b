//! Line transport
//!
//! Owns the byte stream to the stand. The write half stays with the caller;
//! the read half is moved into a background task that frames lines, decodes
//! them and hands the results over a single-producer/single-consumer channel.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{RawLine, StandLineCodec};
use super::serial::{clear_buffers, configure_port, open_port};
use super::{
    decode, Frame, FrameError, ProtocolError, StatusMessage, DEFAULT_ACK_TIMEOUT_MS,
    DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS, DEFAULT_SETTLE_MS, MAX_LINE_LENGTH,
};
use crate::telemetry::TelemetryLayout;

/// Inbound channel depth; the reader blocks rather than dropping lines
const INBOUND_CAPACITY: usize = 256;

/// Any async byte stream the stand can be reached over
pub trait StandStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> StandStream for T {}

type BoxedStream = Box<dyn StandStream>;

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Serial read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Delay after opening the port before traffic starts
    pub settle_ms: u64,
    /// Time to wait for a mode acknowledgement
    pub ack_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            settle_ms: DEFAULT_SETTLE_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
        }
    }
}

/// One item published by the reader task
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A decoded line
    Frame(Frame),
    /// A line that failed to decode; already discarded
    Malformed { line: String, error: FrameError },
    /// The stream ended or failed; nothing further will arrive
    Closed(String),
}

/// Newline-delimited transport to the stand
pub struct LineTransport {
    writer: FramedWrite<WriteHalf<BoxedStream>, LinesCodec>,
    inbound: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    tx_lines: u64,
    rx_items: u64,
}

impl LineTransport {
    /// Open and configure the serial port, then start the reader
    pub async fn open(
        config: &ConnectionConfig,
        layout: TelemetryLayout,
    ) -> Result<Self, ProtocolError> {
        let mut port = open_port(
            &config.port_name,
            config.baud_rate,
            Duration::from_millis(config.read_timeout_ms),
        )?;
        configure_port(&mut port)?;
        clear_buffers(&mut port)?;

        info!(
            port = %config.port_name,
            baud = config.baud_rate,
            settle_ms = config.settle_ms,
            "serial port open, waiting for stand to settle"
        );
        tokio::time::sleep(Duration::from_millis(config.settle_ms)).await;

        // Drop the boot banner and anything else sent during the reset
        clear_buffers(&mut port)?;

        Ok(Self::from_stream(port, layout))
    }

    /// Wrap an already-open stream. Must be called inside a Tokio runtime.
    pub fn from_stream<S: StandStream>(stream: S, layout: TelemetryLayout) -> Self {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);

        let lines = FramedRead::new(read_half, StandLineCodec::new(MAX_LINE_LENGTH));
        let writer = FramedWrite::new(write_half, LinesCodec::new());
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_loop(lines, layout, tx, cancel.clone()));

        Self {
            writer,
            inbound: rx,
            cancel,
            reader,
            tx_lines: 0,
            rx_items: 0,
        }
    }

    /// Write one line; the newline is appended and the sink flushed
    pub async fn write_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        debug!(line, "tx");
        self.writer.send(line).await.map_err(|e| match e {
            LinesCodecError::Io(e) => ProtocolError::IoError(e),
            other => ProtocolError::SerialError(other.to_string()),
        })?;
        self.tx_lines = self.tx_lines.saturating_add(1);
        Ok(())
    }

    /// Wait up to `timeout` for the next inbound item.
    ///
    /// Cancel-safe: dropping the future never loses an item.
    pub async fn recv(&mut self, timeout: Duration) -> Option<Inbound> {
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(Some(item)) => {
                self.rx_items = self.rx_items.saturating_add(1);
                Some(item)
            }
            Ok(None) => Some(Inbound::Closed("reader stopped".to_string())),
            Err(_) => None,
        }
    }

    /// Take the next item if one is already waiting
    pub fn try_recv(&mut self) -> Option<Inbound> {
        match self.inbound.try_recv() {
            Ok(item) => {
                self.rx_items = self.rx_items.saturating_add(1);
                Some(item)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Inbound::Closed("reader stopped".to_string())),
        }
    }

    /// Lines written and items received so far
    pub fn counters(&self) -> (u64, u64) {
        (self.tx_lines, self.rx_items)
    }

    /// Flush, stop the reader and release the stream
    pub async fn close(mut self) {
        let _ = SinkExt::<&str>::close(&mut self.writer).await;
        self.cancel.cancel();
        let _ = (&mut self.reader).await;
    }
}

impl Drop for LineTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reader task: frames lines, decodes them, and follows layout declarations
/// so the line after `FIELDS <n>` is already decoded with the new layout.
async fn read_loop(
    mut lines: FramedRead<ReadHalf<BoxedStream>, StandLineCodec>,
    mut layout: TelemetryLayout,
    tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("reader cancelled");
                return;
            }

            next = lines.next() => next,
        };

        let item = match next {
            Some(Ok(RawLine::Text(line))) => {
                if line.trim().is_empty() {
                    continue;
                }
                debug!(line = %line, "rx");
                match decode(&line, layout) {
                    Ok(frame) => {
                        if let Frame::Status(StatusMessage::LayoutDeclared(count)) = &frame {
                            if let Some(declared) = TelemetryLayout::from_field_count(*count) {
                                layout = declared;
                            }
                        }
                        Inbound::Frame(frame)
                    }
                    Err(error) => Inbound::Malformed { line, error },
                }
            }
            Some(Ok(RawLine::Binary(line))) => {
                warn!(line = %line.escape_debug(), "inbound line is not UTF-8, discarded");
                Inbound::Malformed {
                    line,
                    error: FrameError::NotText,
                }
            }
            Some(Ok(RawLine::TooLong)) => {
                warn!(max = MAX_LINE_LENGTH, "inbound line too long, discarded");
                Inbound::Malformed {
                    line: String::new(),
                    error: FrameError::TooLong(MAX_LINE_LENGTH),
                }
            }
            Some(Err(e)) => {
                let _ = tx.send(Inbound::Closed(e.to_string())).await;
                return;
            }
            None => {
                let _ = tx.send(Inbound::Closed("end of stream".to_string())).await;
                return;
            }
        };

        if tx.send(item).await.is_err() {
            return;
        }
    }
}
