//! Live snapshot source reading frames from a byte stream.
//!
//! Wire protocol: the server sends one [`FileHeader`] (its frame count is
//! ignored), then a sequence of messages:
//!
//! ```text
//! tag: u8   (0 = frame record, 1 = end of stream)
//! len: u64  (frame records only)
//! record: len bytes, same layout as a file frame record (never compressed)
//! ```

use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::format::{FileFlags, FileHeader, decode_frame, encode_frame};
use super::{FrameRequest, Snapshot, SnapshotSource, SourceError};

const TAG_FRAME: u8 = 0;
const TAG_END: u8 = 1;

/// Upper bound on a single frame message.
const MAX_MESSAGE_BYTES: u64 = 1 << 32;

/// Reconnect policy for live sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive failed attempts tolerated before the error surfaces.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Cap on the delay between retries.
    pub max_backoff_ms: u64,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Relative random spread applied to each delay (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        base.mul_f64(factor.max(0.0))
    }
}

/// Opens the underlying byte stream of a live source.
pub trait Connector: Send {
    type Stream: Read + Send;

    fn connect(&mut self) -> io::Result<Self::Stream>;

    fn describe(&self) -> String;
}

/// TCP connector (`host:port`).
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&mut self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.address)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

enum Message {
    Frame(Vec<u8>),
    End,
}

/// Snapshot source fed by a live connection.
///
/// Transient failures (connect errors, dropped connections) are retried
/// internally with exponential backoff; only when `max_retries` consecutive
/// attempts fail does the error reach the caller.
pub struct LiveSource<C: Connector> {
    connector: C,
    retry: RetryPolicy,
    stream: Option<BufReader<C::Stream>>,
    flags: FileFlags,
    ended: bool,
    frames_received: u64,
    reconnects: u64,
}

impl<C: Connector> LiveSource<C> {
    /// Connect and read the stream header, retrying per `retry`.
    pub fn connect(connector: C, retry: RetryPolicy) -> Result<Self, SourceError> {
        let mut source = Self {
            connector,
            retry,
            stream: None,
            flags: FileFlags::default(),
            ended: false,
            frames_received: 0,
            reconnects: 0,
        };
        source.with_retries(|s| s.establish())?;
        Ok(source)
    }

    /// Frames delivered so far.
    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Number of successful reconnections after the first connect.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    fn establish(&mut self) -> Result<(), SourceError> {
        let stream = self
            .connector
            .connect()
            .map_err(|e| SourceError::io(self.connector.describe(), e))?;
        let mut reader = BufReader::new(stream);
        let header = FileHeader::read_from(&mut reader).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData => SourceError::Format(e.to_string()),
            _ => lost(&self.connector, e),
        })?;
        if self.stream.is_none() && self.frames_received > 0 {
            self.reconnects += 1;
        }
        self.flags = header.flags;
        self.stream = Some(reader);
        log::debug!("Connected to {}", self.connector.describe());
        Ok(())
    }

    fn read_message(&mut self) -> Result<Message, SourceError> {
        if self.stream.is_none() {
            self.establish()?;
        }
        let Some(reader) = self.stream.as_mut() else {
            return Err(SourceError::ConnectionLost("no connection".into()));
        };

        let mut tag = [0u8; 1];
        reader
            .read_exact(&mut tag)
            .map_err(|e| lost(&self.connector, e))?;
        match tag[0] {
            TAG_FRAME => {
                let mut len = [0u8; 8];
                reader
                    .read_exact(&mut len)
                    .map_err(|e| lost(&self.connector, e))?;
                let len = u64::from_le_bytes(len);
                if len > MAX_MESSAGE_BYTES {
                    return Err(SourceError::Format(format!(
                        "frame message of {} bytes exceeds limit",
                        len
                    )));
                }
                let mut record = vec![0u8; len as usize];
                reader
                    .read_exact(&mut record)
                    .map_err(|e| lost(&self.connector, e))?;
                Ok(Message::Frame(record))
            }
            TAG_END => Ok(Message::End),
            other => Err(SourceError::Format(format!("unknown message tag {}", other))),
        }
    }

    /// Run `op` until it succeeds, a non-transient error occurs, or the
    /// retry budget is spent.
    fn with_retries<T>(
        &mut self,
        mut op: impl FnMut(&mut Self) -> Result<T, SourceError>,
    ) -> Result<T, SourceError> {
        let mut attempt = 0;
        loop {
            match op(self) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    self.stream = None;
                    let delay = self.retry.jittered_backoff(attempt);
                    log::warn!(
                        "{}: {} (retry {}/{} in {:?})",
                        self.connector.describe(),
                        err,
                        attempt,
                        self.retry.max_retries,
                        delay
                    );
                    thread::sleep(delay);
                }
                Err(err) => {
                    if err.is_transient() {
                        self.stream = None;
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl<C> SnapshotSource for LiveSource<C>
where
    C: Connector + 'static,
{
    fn next_frame(&mut self, request: &FrameRequest) -> Result<Snapshot, SourceError> {
        loop {
            if self.ended {
                return Err(SourceError::EndOfStream);
            }
            let record = match self.with_retries(|s| s.read_message())? {
                Message::Frame(record) => record,
                Message::End => {
                    log::info!("{} signalled end of stream", self.connector.describe());
                    self.ended = true;
                    self.stream = None;
                    return Err(SourceError::EndOfStream);
                }
            };

            let mut snapshot = decode_frame(&record, self.flags.has_velocities)?;
            snapshot.validate()?;
            self.frames_received += 1;

            if !request.time.matches(snapshot.time) {
                continue;
            }
            if !request.load_velocities {
                snapshot.velocities = None;
            }
            return Ok(snapshot);
        }
    }

    fn is_end_of_data(&self) -> bool {
        self.ended
    }

    fn describe(&self) -> String {
        self.connector.describe()
    }

    fn end_of_data_message(&self) -> String {
        format!("Server {} has no more snapshots", self.connector.describe())
    }
}

fn lost<C: Connector>(connector: &C, err: io::Error) -> SourceError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => {
            SourceError::ConnectionLost(format!("{}: {}", connector.describe(), err))
        }
        _ => SourceError::io(connector.describe(), err),
    }
}

/// Write the stream header a live server sends on connect.
pub fn write_stream_header<W: Write>(w: &mut W, has_velocities: bool) -> io::Result<()> {
    FileHeader {
        frame_count: 0,
        flags: FileFlags {
            has_velocities,
            ..Default::default()
        },
    }
    .write_to(w)
}

/// Write one frame message.
pub fn write_stream_frame<W: Write>(
    w: &mut W,
    snapshot: &Snapshot,
    has_velocities: bool,
) -> io::Result<()> {
    let record = encode_frame(snapshot, has_velocities);
    w.write_all(&[TAG_FRAME])?;
    w.write_all(&(record.len() as u64).to_le_bytes())?;
    w.write_all(&record)
}

/// Write the end-of-stream marker.
pub fn write_stream_end<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(&[TAG_END])
}
