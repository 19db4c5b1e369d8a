//! Snapshot recorder writing `.nbsf` containers.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::format::{CompressionType, FileFlags, FileHeader, FrameIndex, encode_frame};
use super::{FrameRequest, Snapshot, SnapshotSource, SourceError, TimeSpec};

/// What gets written.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub compression: CompressionType,
    /// Store velocity arrays (zero-filled for snapshots that have none).
    pub with_velocities: bool,
    /// Keep one frame out of every `stride` offered (1 keeps all).
    pub stride: u32,
    /// Stop accepting frames after this many.
    pub max_frames: Option<u64>,
    /// Only frames whose time matches are considered.
    pub time: TimeSpec,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            compression: CompressionType::None,
            with_velocities: true,
            stride: 1,
            max_frames: None,
            time: TimeSpec::All,
        }
    }
}

/// Result of offering one snapshot to the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Stored as frame `index`, taking `bytes` on disk.
    Written { index: u64, bytes: u64 },
    /// Dropped by the stride or time filter.
    Skipped,
    /// `max_frames` reached; nothing more will be stored.
    Full,
}

/// Writes snapshots to a file readable by [`FileSource`](super::FileSource).
///
/// ```ignore
/// let mut recorder = SnapshotRecorder::new("run.nbsf", Default::default())?;
/// for snapshot in snapshots {
///     recorder.record_frame(&snapshot)?;
/// }
/// println!("{}", recorder.finalize()?);
/// ```
pub struct SnapshotRecorder {
    path: PathBuf,
    out: BufWriter<File>,
    flags: FileFlags,
    config: RecorderConfig,
    index: Vec<FrameIndex>,
    offered: u64,
}

impl SnapshotRecorder {
    /// Create `path` (truncating it) and reserve space for the header.
    pub fn new<P: AsRef<Path>>(path: P, config: RecorderConfig) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut out = BufWriter::new(File::create(&path)?);
        let flags = FileFlags {
            compression: config.compression,
            has_velocities: config.with_velocities,
        };
        // Frame count is patched in by `finalize`
        FileHeader {
            frame_count: 0,
            flags,
        }
        .write_to(&mut out)?;

        Ok(Self {
            path,
            out,
            flags,
            config,
            index: Vec::new(),
            offered: 0,
        })
    }

    /// Offer one snapshot. Inconsistent snapshots are rejected with
    /// `InvalidInput` and nothing is written.
    pub fn record_frame(&mut self, snapshot: &Snapshot) -> io::Result<RecordOutcome> {
        if self.is_full() {
            return Ok(RecordOutcome::Full);
        }
        if !self.config.time.matches(snapshot.time) {
            return Ok(RecordOutcome::Skipped);
        }
        self.offered += 1;
        if (self.offered - 1) % u64::from(self.config.stride.max(1)) != 0 {
            return Ok(RecordOutcome::Skipped);
        }

        snapshot
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let stored = self
            .flags
            .compression
            .pack(encode_frame(snapshot, self.flags.has_velocities));

        let offset = self.out.stream_position()?;
        self.out.write_all(&stored)?;
        let entry = FrameIndex {
            offset,
            size: stored.len() as u64,
        };
        self.index.push(entry);

        log::trace!("Recorded frame at t={} ({} bytes)", snapshot.time, entry.size);
        Ok(RecordOutcome::Written {
            index: self.index.len() as u64 - 1,
            bytes: entry.size,
        })
    }

    /// Record every remaining frame of `source`.
    ///
    /// Returns the number of frames written. Stops early once the recorder
    /// is full.
    pub fn record_source(
        &mut self,
        source: &mut dyn SnapshotSource,
        request: &FrameRequest,
    ) -> Result<u64, SourceError> {
        let mut written = 0;
        while !source.is_end_of_data() && !self.is_full() {
            let snapshot = match source.next_frame(request) {
                Ok(snapshot) => snapshot,
                Err(SourceError::EndOfStream) => break,
                Err(err) => return Err(err),
            };
            let outcome = self
                .record_frame(&snapshot)
                .map_err(|e| SourceError::io(self.path.display().to_string(), e))?;
            if matches!(outcome, RecordOutcome::Written { .. }) {
                written += 1;
            }
        }
        Ok(written)
    }

    fn is_full(&self) -> bool {
        self.config
            .max_frames
            .is_some_and(|max| self.index.len() as u64 >= max)
    }

    /// Frames stored so far.
    pub fn frames_written(&self) -> u64 {
        self.index.len() as u64
    }

    /// Append the frame index and patch the header.
    pub fn finalize(mut self) -> io::Result<RecordingStats> {
        let frame_bytes = self.out.stream_position()? - FileHeader::SIZE as u64;
        for entry in &self.index {
            entry.write_to(&mut self.out)?;
        }
        let total_bytes = self.out.stream_position()?;

        self.out.seek(SeekFrom::Start(0))?;
        FileHeader {
            frame_count: self.index.len() as u64,
            flags: self.flags,
        }
        .write_to(&mut self.out)?;
        self.out.flush()?;

        let stats = RecordingStats {
            frames: self.index.len() as u64,
            total_bytes,
            mean_frame_bytes: frame_bytes.checked_div(self.index.len() as u64).unwrap_or(0),
            compression: self.flags.compression,
        };
        log::info!("Finalized {}: {}", self.path.display(), stats);
        Ok(stats)
    }
}

/// Summary of a finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingStats {
    pub frames: u64,
    /// File size including header and index.
    pub total_bytes: u64,
    /// Mean stored size of one frame record.
    pub mean_frame_bytes: u64,
    pub compression: CompressionType,
}

impl std::fmt::Display for RecordingStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} frames in {} bytes (~{} bytes/frame, {:?})",
            self.frames, self.total_bytes, self.mean_frame_bytes, self.compression
        )
    }
}
