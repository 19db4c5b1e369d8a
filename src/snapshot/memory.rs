//! In-memory snapshot source.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{FrameRequest, Snapshot, SnapshotSource, SourceError, SourceOpener};

/// Snapshot source replaying a scripted sequence of frames and errors.
///
/// Useful for embedding pre-computed runs and for exercising the pipeline
/// against slow or failing sources.
pub struct MemorySource {
    name: String,
    items: VecDeque<Result<Snapshot, SourceError>>,
    latency: Duration,
}

impl MemorySource {
    pub fn new(frames: impl IntoIterator<Item = Snapshot>) -> Self {
        Self::scripted(frames.into_iter().map(Ok))
    }

    /// Source yielding `items` in order; errors are returned in place of a frame.
    pub fn scripted(items: impl IntoIterator<Item = Result<Snapshot, SourceError>>) -> Self {
        Self {
            name: "memory".to_string(),
            items: items.into_iter().collect(),
            latency: Duration::ZERO,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sleep this long inside every `next_frame` call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Frames (and errors) not yet delivered.
    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

impl SnapshotSource for MemorySource {
    fn next_frame(&mut self, request: &FrameRequest) -> Result<Snapshot, SourceError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        while let Some(item) = self.items.pop_front() {
            let mut snapshot = item?;
            if !request.time.matches(snapshot.time) {
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
        self.items.is_empty()
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Opens a fresh [`MemorySource`] over a shared script on every call.
#[derive(Clone)]
pub struct MemoryOpener {
    items: Arc<Vec<Result<Snapshot, SourceError>>>,
    latency: Duration,
}

impl MemoryOpener {
    pub fn new(frames: impl IntoIterator<Item = Snapshot>) -> Self {
        Self::scripted(frames.into_iter().map(Ok))
    }

    pub fn scripted(items: impl IntoIterator<Item = Result<Snapshot, SourceError>>) -> Self {
        Self {
            items: Arc::new(items.into_iter().collect()),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl SourceOpener for MemoryOpener {
    fn open(&self) -> Result<Box<dyn SnapshotSource>, SourceError> {
        Ok(Box::new(
            MemorySource::scripted(self.items.iter().cloned()).with_latency(self.latency),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_order_and_end() {
        let mut source = MemorySource::new((0..3).map(|i| Snapshot::new(i as f64, vec![0.0; 3])));
        let request = FrameRequest::default();
        for i in 0..3 {
            assert!(!source.is_end_of_data());
            assert_eq!(source.next_frame(&request).unwrap().time, i as f64);
        }
        assert!(source.is_end_of_data());
        assert!(matches!(
            source.next_frame(&request),
            Err(SourceError::EndOfStream)
        ));
    }

    #[test]
    fn test_memory_source_scripted_error_consumes_slot() {
        let mut source = MemorySource::scripted(vec![
            Err(SourceError::Format("bad".into())),
            Ok(Snapshot::new(1.0, vec![0.0; 3])),
        ]);
        let request = FrameRequest::default();
        assert!(matches!(
            source.next_frame(&request),
            Err(SourceError::Format(_))
        ));
        assert_eq!(source.next_frame(&request).unwrap().time, 1.0);
    }

    #[test]
    fn test_opener_restarts_from_first_frame() {
        let opener = MemoryOpener::new((0..2).map(|i| Snapshot::new(i as f64, vec![0.0; 3])));
        let request = FrameRequest::default();

        let mut first = opener.open().unwrap();
        first.next_frame(&request).unwrap();
        first.next_frame(&request).unwrap();
        assert!(first.is_end_of_data());

        let mut second = opener.open().unwrap();
        assert_eq!(second.next_frame(&request).unwrap().time, 0.0);
    }
}
