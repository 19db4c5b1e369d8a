//! Snapshot sources: sequential providers of N-body timesteps.
//!
//! A source hands out one [`Snapshot`] per call to
//! [`SnapshotSource::next_frame`], strictly in order. File sources are
//! finite, live sources may never end, and neither can be rewound: a fresh
//! session comes from [`SourceOpener::open`].
//!
//! # File Format
//!
//! The `.nbsf` (N-body snapshot file) container stores frames with
//! optional compression:
//!
//! ```text
//! Header (32 bytes):
//!   Magic: "NBSF" (4 bytes)
//!   Version: u16
//!   Flags: u16 (compression, has-velocities)
//!   Frame count: u64
//!   Reserved: 16 bytes
//!
//! Frame records (variable):
//!   Time: f64, particle count: u64, component count: u32
//!   Components: name_len u16, name, kind u8, range or index list
//!   Positions: 3 * count * f32
//!   Velocities: 3 * count * f32 (if flagged)
//!   Optionally LZ4 compressed
//!
//! Frame index table (frame_count * 16 bytes):
//!   Offset: u64
//!   Stored size: u64
//! ```

mod file;
mod format;
mod live;
mod memory;
mod recorder;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use file::FileSource;
pub use format::{
    CompressionType, FileFlags, FileHeader, FrameIndex, SNAPSHOT_MAGIC, SNAPSHOT_VERSION,
    decode_frame, encode_frame,
};
pub use live::{
    Connector, LiveSource, RetryPolicy, TcpConnector, write_stream_end, write_stream_frame,
    write_stream_header,
};
pub use memory::{MemoryOpener, MemorySource};
pub use recorder::{RecordOutcome, RecorderConfig, RecordingStats, SnapshotRecorder};

/// Errors raised by snapshot sources.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Malformed frame: {0}")]
    Format(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("End of stream")]
    EndOfStream,
}

impl SourceError {
    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, err: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(err),
        }
    }

    /// Whether a live source should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::ConnectionLost(_))
    }
}

impl From<io::Error> for SourceError {
    fn from(err: io::Error) -> Self {
        Self::io("snapshot source", err)
    }
}

/// Indices covered by a named component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentIndices {
    /// `[start, start + len)`.
    Contiguous { start: usize, len: usize },
    /// Arbitrary snapshot indices, in declared order.
    Explicit(Vec<u32>),
}

/// A named sub-population of a snapshot ("halo", "disk", ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRange {
    pub name: String,
    pub indices: ComponentIndices,
}

impl ComponentRange {
    pub fn contiguous(name: impl Into<String>, start: usize, len: usize) -> Self {
        Self {
            name: name.into(),
            indices: ComponentIndices::Contiguous { start, len },
        }
    }

    pub fn explicit(name: impl Into<String>, indices: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            indices: ComponentIndices::Explicit(indices),
        }
    }

    /// Number of particles in the component.
    pub fn len(&self) -> usize {
        match &self.indices {
            ComponentIndices::Contiguous { len, .. } => *len,
            ComponentIndices::Explicit(indices) => indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot index of the component's `slot`-th particle.
    #[inline]
    pub fn index(&self, slot: usize) -> Option<usize> {
        match &self.indices {
            ComponentIndices::Contiguous { start, len } => {
                (slot < *len).then(|| start.checked_add(slot)).flatten()
            }
            ComponentIndices::Explicit(indices) => indices.get(slot).map(|&i| i as usize),
        }
    }

    /// Largest snapshot index referenced, if any. `None` also when a
    /// contiguous range runs past `usize::MAX`.
    pub fn max_index(&self) -> Option<usize> {
        match &self.indices {
            ComponentIndices::Contiguous { start, len } => {
                len.checked_sub(1).and_then(|last| start.checked_add(last))
            }
            ComponentIndices::Explicit(indices) => indices.iter().max().map(|&i| i as usize),
        }
    }
}

/// One timestep of particle state. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Simulation time of the frame.
    pub time: f64,
    /// Number of particles.
    pub particle_count: usize,
    /// Positions, `3 * particle_count` values (x, y, z interleaved).
    pub positions: Vec<f32>,
    /// Velocities with the same layout, when requested and available.
    pub velocities: Option<Vec<f32>>,
    /// Named components in declaration order.
    pub components: Vec<ComponentRange>,
}

impl Snapshot {
    /// Create a snapshot from interleaved positions.
    pub fn new(time: f64, positions: Vec<f32>) -> Self {
        Self {
            time,
            particle_count: positions.len() / 3,
            positions,
            velocities: None,
            components: Vec::new(),
        }
    }

    pub fn with_velocities(mut self, velocities: Vec<f32>) -> Self {
        self.velocities = Some(velocities);
        self
    }

    pub fn with_component(mut self, component: ComponentRange) -> Self {
        self.components.push(component);
        self
    }

    /// Check array shapes and component bounds against the particle count.
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.particle_count > u32::MAX as usize {
            return Err(SourceError::Format(format!(
                "particle count {} exceeds u32 index range",
                self.particle_count
            )));
        }
        if self.positions.len() != self.particle_count * 3 {
            return Err(SourceError::Format(format!(
                "expected {} position values, found {}",
                self.particle_count * 3,
                self.positions.len()
            )));
        }
        if let Some(velocities) = &self.velocities {
            if velocities.len() != self.particle_count * 3 {
                return Err(SourceError::Format(format!(
                    "expected {} velocity values, found {}",
                    self.particle_count * 3,
                    velocities.len()
                )));
            }
        }
        if let Some(component) = self.components.iter().find(|c| c.name.is_empty()) {
            return Err(SourceError::Format(format!(
                "component with {} particles has an empty name",
                component.len()
            )));
        }
        for component in &self.components {
            if component.is_empty() {
                continue;
            }
            match component.max_index() {
                Some(max) if max < self.particle_count => {}
                Some(max) => {
                    return Err(SourceError::Format(format!(
                        "component '{}' reaches index {} of {} particles",
                        component.name, max, self.particle_count
                    )));
                }
                None => {
                    return Err(SourceError::Format(format!(
                        "component '{}' range overflows",
                        component.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Position of particle `i`.
    #[inline]
    pub fn position(&self, i: usize) -> [f32; 3] {
        [
            self.positions[i * 3],
            self.positions[i * 3 + 1],
            self.positions[i * 3 + 2],
        ]
    }
}

/// Which snapshot times a session should deliver.
///
/// Serialized as its string form (`all`, `t`, `t0:t1`).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeSpec {
    /// Every frame.
    #[default]
    All,
    /// Frames at (approximately) this time.
    At(f64),
    /// Frames with `start <= time <= end`.
    Window { start: f64, end: f64 },
}

impl TimeSpec {
    /// Whether a frame at `time` is selected.
    pub fn matches(&self, time: f64) -> bool {
        match *self {
            TimeSpec::All => true,
            TimeSpec::At(t) => (time - t).abs() <= 1e-6 * t.abs().max(1.0),
            TimeSpec::Window { start, end } => time >= start && time <= end,
        }
    }
}

/// Invalid time selection string.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Invalid time selection '{spec}': {reason}")]
pub struct TimeSpecError {
    pub spec: String,
    pub reason: String,
}

impl FromStr for TimeSpec {
    type Err = TimeSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = s.trim();
        let fail = |reason: &str| TimeSpecError {
            spec: s.to_string(),
            reason: reason.to_string(),
        };
        if spec.is_empty() || spec.eq_ignore_ascii_case("all") {
            return Ok(TimeSpec::All);
        }
        let parse = |v: &str| {
            v.trim()
                .parse::<f64>()
                .ok()
                .filter(|t| t.is_finite())
                .ok_or_else(|| fail("expected a finite number"))
        };
        match spec.split_once(':') {
            None => Ok(TimeSpec::At(parse(spec)?)),
            Some((a, b)) => {
                let (start, end) = (parse(a)?, parse(b)?);
                if end < start {
                    return Err(fail("window end precedes start"));
                }
                Ok(TimeSpec::Window { start, end })
            }
        }
    }
}

impl TryFrom<String> for TimeSpec {
    type Error = TimeSpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeSpec> for String {
    fn from(spec: TimeSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSpec::All => write!(f, "all"),
            TimeSpec::At(t) => write!(f, "{}", t),
            TimeSpec::Window { start, end } => write!(f, "{}:{}", start, end),
        }
    }
}

/// Per-frame request passed to [`SnapshotSource::next_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameRequest {
    /// Deliver velocities along with positions.
    pub load_velocities: bool,
    /// Time selection.
    pub time: TimeSpec,
}

/// Sequential frame provider.
///
/// Exactly one caller drives a session at a time; the loader thread takes
/// ownership of the boxed session for the duration of a load.
pub trait SnapshotSource: Send {
    /// Read the next frame matching `request`.
    ///
    /// Returns [`SourceError::EndOfStream`] once the sequence is exhausted.
    fn next_frame(&mut self, request: &FrameRequest) -> Result<Snapshot, SourceError>;

    /// True once no further frame can be produced.
    fn is_end_of_data(&self) -> bool;

    /// Human-readable name of the session (file path, address).
    fn describe(&self) -> String;

    /// Notice shown to an interactive user when the data runs out.
    fn end_of_data_message(&self) -> String {
        format!("End of snapshot reached: {}", self.describe())
    }
}

/// Opens a fresh session from the first frame.
pub trait SourceOpener: Send {
    fn open(&self) -> Result<Box<dyn SnapshotSource>, SourceError>;
}

impl<F> SourceOpener for F
where
    F: Fn() -> Result<Box<dyn SnapshotSource>, SourceError> + Send,
{
    fn open(&self) -> Result<Box<dyn SnapshotSource>, SourceError> {
        self()
    }
}

/// Serializable description of where snapshots come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDescriptor {
    /// An `.nbsf` file on disk.
    File { path: PathBuf },
    /// A live TCP stream (`host:port`).
    Live {
        address: String,
        #[serde(default)]
        retry: RetryPolicy,
    },
}

impl SourceOpener for SourceDescriptor {
    fn open(&self) -> Result<Box<dyn SnapshotSource>, SourceError> {
        match self {
            SourceDescriptor::File { path } => Ok(Box::new(FileSource::open(path)?)),
            SourceDescriptor::Live { address, retry } => Ok(Box::new(LiveSource::connect(
                TcpConnector::new(address.clone()),
                retry.clone(),
            )?)),
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::File { path } => write!(f, "file {}", path.display()),
            SourceDescriptor::Live { address, .. } => write!(f, "live {}", address),
        }
    }
}

/// Open a session for `descriptor`.
pub fn open(descriptor: &SourceDescriptor) -> Result<Box<dyn SnapshotSource>, SourceError> {
    descriptor.open()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_spec_parse() {
        assert_eq!("all".parse::<TimeSpec>().unwrap(), TimeSpec::All);
        assert_eq!("".parse::<TimeSpec>().unwrap(), TimeSpec::All);
        assert_eq!("2.5".parse::<TimeSpec>().unwrap(), TimeSpec::At(2.5));
        assert_eq!(
            "1:3".parse::<TimeSpec>().unwrap(),
            TimeSpec::Window {
                start: 1.0,
                end: 3.0
            }
        );
        assert!("3:1".parse::<TimeSpec>().is_err());
        assert!("soon".parse::<TimeSpec>().is_err());
    }

    #[test]
    fn test_time_spec_json_is_string() {
        let spec: TimeSpec = serde_json::from_str(r#""0.5:1.5""#).unwrap();
        assert_eq!(
            spec,
            TimeSpec::Window {
                start: 0.5,
                end: 1.5
            }
        );
        assert_eq!(serde_json::to_string(&TimeSpec::All).unwrap(), r#""all""#);
        assert!(serde_json::from_str::<TimeSpec>(r#""later""#).is_err());
    }

    #[test]
    fn test_time_spec_matches() {
        let window = TimeSpec::Window {
            start: 1.0,
            end: 2.0,
        };
        assert!(window.matches(1.0));
        assert!(window.matches(2.0));
        assert!(!window.matches(2.01));
        assert!(TimeSpec::At(0.5).matches(0.5));
        assert!(!TimeSpec::At(0.5).matches(0.6));
    }

    #[test]
    fn test_snapshot_validate() {
        let snapshot = Snapshot::new(0.0, vec![0.0; 9]);
        assert_eq!(snapshot.particle_count, 3);
        assert!(snapshot.validate().is_ok());

        let bad = snapshot.clone().with_velocities(vec![0.0; 3]);
        assert!(matches!(bad.validate(), Err(SourceError::Format(_))));

        let unnamed = snapshot.clone().with_component(ComponentRange::contiguous("", 0, 1));
        assert!(unnamed.validate().is_err());

        let fits = snapshot
            .clone()
            .with_component(ComponentRange::contiguous("halo", 1, 2))
            .with_component(ComponentRange::contiguous("empty", 99, 0));
        assert!(fits.validate().is_ok());

        let past_end = snapshot
            .clone()
            .with_component(ComponentRange::contiguous("halo", 1, 3));
        assert!(matches!(past_end.validate(), Err(SourceError::Format(_))));

        let stray = snapshot
            .clone()
            .with_component(ComponentRange::explicit("stars", vec![0, 3]));
        assert!(matches!(stray.validate(), Err(SourceError::Format(_))));

        let wrapped =
            snapshot.with_component(ComponentRange::contiguous("halo", usize::MAX - 1, 5));
        match wrapped.validate() {
            Err(SourceError::Format(message)) => assert!(message.contains("overflows")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_component_index_lookup() {
        let halo = ComponentRange::contiguous("halo", 10, 5);
        assert_eq!(halo.index(0), Some(10));
        assert_eq!(halo.index(4), Some(14));
        assert_eq!(halo.index(5), None);
        assert_eq!(halo.max_index(), Some(14));
        assert_eq!(ComponentRange::contiguous("none", 3, 0).max_index(), None);

        let wrapped = ComponentRange::contiguous("wrapped", usize::MAX - 1, 5);
        assert_eq!(wrapped.max_index(), None);
        assert_eq!(wrapped.index(3), None);

        let stars = ComponentRange::explicit("stars", vec![7, 3, 9]);
        assert_eq!(stars.index(1), Some(3));
        assert_eq!(stars.max_index(), Some(9));
    }

    #[test]
    fn test_descriptor_json() {
        let json = r#"{"type":"file","path":"run/out.nbsf"}"#;
        let descriptor: SourceDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(
            descriptor,
            SourceDescriptor::File {
                path: PathBuf::from("run/out.nbsf")
            }
        );

        let live: SourceDescriptor =
            serde_json::from_str(r#"{"type":"live","address":"127.0.0.1:4000"}"#).unwrap();
        assert!(matches!(live, SourceDescriptor::Live { retry, .. } if retry == RetryPolicy::default()));
    }
}
