//! Pipeline error type.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::snapshot::SourceError;

use super::selection::SelectionError;

/// Identifier of one load task, unique per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(pub(crate) u64);

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "load#{}", self.0)
    }
}

/// Errors surfaced by the streaming pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    /// A load was requested while another task is outstanding.
    #[error("Load requested while {running} is still outstanding")]
    ConcurrencyViolation { running: TaskHandle },
    #[error("No snapshot source is open")]
    NoSource,
    #[error("Unknown load task {0}")]
    UnknownTask(TaskHandle),
    #[error("Loader thread panicked: {0}")]
    LoaderPanicked(String),
    #[error("Failed to spawn loader thread: {0}")]
    Spawn(Arc<io::Error>),
}

impl StreamError {
    /// Errors after which the active generation is still valid.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StreamError::Source(SourceError::Format(_)) | StreamError::Selection(_)
        )
    }
}
