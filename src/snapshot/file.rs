//! File-backed snapshot source reading `.nbsf` containers.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::format::{FileHeader, FrameIndex, decode_frame};
use super::{FrameRequest, Snapshot, SnapshotSource, SourceError};

/// Sequential reader over a recorded snapshot file.
///
/// Usage:
/// ```ignore
/// let mut source = FileSource::open("run.nbsf")?;
/// println!("{} frames", source.frame_count());
///
/// while !source.is_end_of_data() {
///     let snapshot = source.next_frame(&FrameRequest::default())?;
///     // Use snapshot...
/// }
/// ```
pub struct FileSource {
    path: PathBuf,
    reader: BufReader<File>,
    header: FileHeader,
    frame_indices: Vec<FrameIndex>,
    /// Next frame to read.
    cursor: u64,
    /// Reused read buffer.
    read_buffer: Vec<u8>,
}

impl FileSource {
    /// Open a snapshot file and read its frame index.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| SourceError::io(path.display().to_string(), e))?;
        let mut reader = BufReader::new(file);

        let header = FileHeader::read_from(&mut reader).map_err(|e| format_or_io(&path, e))?;

        // Index table sits at the end of the file
        let table_size = header
            .frame_count
            .checked_mul(FrameIndex::SIZE as u64)
            .ok_or_else(|| SourceError::Format("frame count overflows index table".into()))?;
        let file_len = reader
            .seek(SeekFrom::End(0))
            .map_err(|e| SourceError::io(path.display().to_string(), e))?;
        let index_start = file_len
            .checked_sub(table_size)
            .filter(|&start| start >= FileHeader::SIZE as u64)
            .ok_or_else(|| SourceError::Format("file too short for its frame index".into()))?;

        reader
            .seek(SeekFrom::Start(index_start))
            .map_err(|e| SourceError::io(path.display().to_string(), e))?;

        let mut frame_indices = Vec::with_capacity(header.frame_count as usize);
        for _ in 0..header.frame_count {
            let index = FrameIndex::read_from(&mut reader).map_err(|e| format_or_io(&path, e))?;
            if index.offset.saturating_add(index.size) > index_start {
                return Err(SourceError::Format(format!(
                    "frame at offset {} overruns the index table",
                    index.offset
                )));
            }
            frame_indices.push(index);
        }

        log::debug!(
            "Opened {} ({} frames, {:?} compression)",
            path.display(),
            header.frame_count,
            header.flags.compression
        );

        Ok(Self {
            path,
            reader,
            header,
            frame_indices,
            cursor: 0,
            read_buffer: Vec::new(),
        })
    }

    /// Get file header.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Get total number of frames.
    pub fn frame_count(&self) -> u64 {
        self.header.frame_count
    }

    /// Whether frames carry velocities.
    pub fn has_velocities(&self) -> bool {
        self.header.flags.has_velocities
    }

    /// Index of the next frame `next_frame` will consider.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Read a specific frame by index, ignoring the cursor.
    pub fn read_frame(&mut self, frame_index: u64) -> Result<Snapshot, SourceError> {
        let Some(&index) = self.frame_indices.get(frame_index as usize) else {
            return Err(SourceError::io(
                self.path.display().to_string(),
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "Frame index {} out of range ({} frames)",
                        frame_index, self.header.frame_count
                    ),
                ),
            ));
        };

        self.reader
            .seek(SeekFrom::Start(index.offset))
            .map_err(|e| SourceError::io(self.path.display().to_string(), e))?;

        self.read_buffer.resize(index.size as usize, 0);
        self.reader
            .read_exact(&mut self.read_buffer)
            .map_err(|e| format_or_io(&self.path, e))?;

        let flags = self.header.flags;
        let record = flags.compression.unpack(&self.read_buffer)?;
        let snapshot = decode_frame(&record, flags.has_velocities)?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

impl SnapshotSource for FileSource {
    fn next_frame(&mut self, request: &FrameRequest) -> Result<Snapshot, SourceError> {
        while self.cursor < self.header.frame_count {
            let frame_index = self.cursor;
            // Advance first: a malformed frame is skipped by the next load
            self.cursor += 1;

            let mut snapshot = self.read_frame(frame_index)?;
            if !request.time.matches(snapshot.time) {
                log::trace!(
                    "Skipping frame {} at t={} (time selection {})",
                    frame_index,
                    snapshot.time,
                    request.time
                );
                continue;
            }
            if !request.load_velocities {
                snapshot.velocities = None;
            }
            return Ok(snapshot);
        }
        Err(SourceError::EndOfStream)
    }

    fn is_end_of_data(&self) -> bool {
        self.cursor >= self.header.frame_count
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Truncation and bad headers are format problems; everything else is I/O.
fn format_or_io(path: &Path, err: io::Error) -> SourceError {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            SourceError::Format(format!("{}: {}", path.display(), err))
        }
        _ => SourceError::io(path.display().to_string(), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ComponentRange, RecorderConfig, SnapshotRecorder, TimeSpec};
    use tempfile::tempdir;

    fn frame(time: f64, n: usize) -> Snapshot {
        let positions = (0..n * 3).map(|i| (i as f64 * time) as f32).collect();
        let velocities = (0..n * 3).map(|i| i as f32).collect();
        Snapshot::new(time, positions)
            .with_velocities(velocities)
            .with_component(ComponentRange::contiguous("halo", 0, n / 2))
            .with_component(ComponentRange::contiguous("disk", n / 2, n - n / 2))
    }

    fn record(path: &Path, frames: &[Snapshot], config: RecorderConfig) {
        let mut recorder = SnapshotRecorder::new(path, config).unwrap();
        for snapshot in frames {
            recorder.record_frame(snapshot).unwrap();
        }
        recorder.finalize().unwrap();
    }

    #[test]
    fn test_file_source_sequential_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq.nbsf");
        let frames: Vec<_> = (0..3).map(|i| frame(i as f64, 10)).collect();
        record(&path, &frames, RecorderConfig::default());

        let mut source = FileSource::open(&path).unwrap();
        assert_eq!(source.frame_count(), 3);
        assert!(source.has_velocities());

        let request = FrameRequest {
            load_velocities: true,
            ..Default::default()
        };
        for expected in &frames {
            assert!(!source.is_end_of_data());
            let loaded = source.next_frame(&request).unwrap();
            assert_eq!(&loaded, expected);
        }
        assert!(source.is_end_of_data());
        assert!(matches!(
            source.next_frame(&request),
            Err(SourceError::EndOfStream)
        ));
    }

    #[test]
    fn test_file_source_drops_unrequested_velocities() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vel.nbsf");
        record(&path, &[frame(0.0, 4)], RecorderConfig::default());

        let mut source = FileSource::open(&path).unwrap();
        let loaded = source.next_frame(&FrameRequest::default()).unwrap();
        assert!(loaded.velocities.is_none());
    }

    #[test]
    fn test_file_source_time_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("window.nbsf");
        let frames: Vec<_> = (0..6).map(|i| frame(i as f64 * 0.5, 4)).collect();
        record(&path, &frames, RecorderConfig::default());

        let mut source = FileSource::open(&path).unwrap();
        let request = FrameRequest {
            load_velocities: false,
            time: TimeSpec::Window {
                start: 1.0,
                end: 2.0,
            },
        };
        let times: Vec<f64> = std::iter::from_fn(|| source.next_frame(&request).ok())
            .map(|s| s.time)
            .collect();
        assert_eq!(times, vec![1.0, 1.5, 2.0]);
        assert!(source.is_end_of_data());
    }

    #[test]
    fn test_file_source_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.nbsf");
        std::fs::write(&path, b"definitely not a snapshot file at all").unwrap();

        assert!(matches!(
            FileSource::open(&path),
            Err(SourceError::Format(_))
        ));
    }

    #[test]
    fn test_file_source_missing_file_is_io() {
        let dir = tempdir().unwrap();
        let err = FileSource::open(dir.path().join("absent.nbsf")).err().unwrap();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[test]
    fn test_file_source_compressed_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lz4.nbsf");
        let frames: Vec<_> = (0..2).map(|i| frame(i as f64, 16)).collect();
        record(
            &path,
            &frames,
            RecorderConfig {
                compression: crate::snapshot::CompressionType::Lz4,
                ..Default::default()
            },
        );

        let mut source = FileSource::open(&path).unwrap();
        let request = FrameRequest {
            load_velocities: true,
            ..Default::default()
        };
        assert_eq!(source.next_frame(&request).unwrap(), frames[0]);
        assert_eq!(source.next_frame(&request).unwrap(), frames[1]);
    }
}
