//! Background loading of one generation.
//!
//! A [`LoadTask`] owns a thread that takes the snapshot session, reads the
//! next frame, resolves the selection and stages the result. The control
//! thread only ever checks [`LoadTask::poll`], which never blocks.

use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::snapshot::{FrameRequest, SnapshotSource, SourceError};

use super::buffer::DoubleBuffer;
use super::error::{StreamError, TaskHandle};
use super::objects::{DisplayProperties, ObjectVector, ParticleData};
use super::selection::Selection;

/// How a finished load ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// A generation was staged.
    Valid { frame_index: u64, time: f64 },
    /// The source has no further frames.
    EndOfData { notice: String },
}

/// Observable state of a load task.
#[derive(Debug, Clone)]
pub enum LoadStatus {
    Pending,
    Done(Completion),
    Failed(StreamError),
}

impl LoadStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, LoadStatus::Pending)
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, LoadStatus::Done(Completion::Valid { .. }))
    }

    pub fn is_end_of_data(&self) -> bool {
        matches!(self, LoadStatus::Done(Completion::EndOfData { .. }))
    }
}

/// Everything a loader thread needs for one frame.
pub struct LoadJob {
    pub source: Box<dyn SnapshotSource>,
    pub selection: Selection,
    pub request: FrameRequest,
    /// Keep whole snapshot arrays instead of only selected particles.
    pub keep_all: bool,
    pub defaults: DisplayProperties,
    /// Index assigned to the frame if one is read.
    pub frame_index: u64,
    pub buffer: Arc<DoubleBuffer>,
}

struct LoadOutcome {
    source: Box<dyn SnapshotSource>,
    result: Result<Completion, StreamError>,
}

/// Handle to one in-flight (or finished, unconsumed) load.
pub struct LoadTask {
    handle: TaskHandle,
    join: Option<JoinHandle<LoadOutcome>>,
    status: LoadStatus,
    source: Option<Box<dyn SnapshotSource>>,
    started: Instant,
}

impl LoadTask {
    /// Start loading on a new `snapshot-loader` thread.
    pub fn spawn(handle: TaskHandle, job: LoadJob) -> Result<Self, StreamError> {
        let join = thread::Builder::new()
            .name("snapshot-loader".to_string())
            .spawn(move || run_job(job))
            .map_err(|e| StreamError::Spawn(Arc::new(e)))?;

        log::debug!("Started {}", handle);
        Ok(Self {
            handle,
            join: Some(join),
            status: LoadStatus::Pending,
            source: None,
            started: Instant::now(),
        })
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    /// Current status without blocking.
    pub fn poll(&mut self) -> LoadStatus {
        let finished = self.join.as_ref().is_some_and(JoinHandle::is_finished);
        if finished {
            if let Some(join) = self.join.take() {
                self.settle(join);
            }
        }
        self.status.clone()
    }

    fn settle(&mut self, join: JoinHandle<LoadOutcome>) {
        self.status = match join.join() {
            Ok(LoadOutcome { source, result }) => {
                self.source = Some(source);
                match result {
                    Ok(completion) => LoadStatus::Done(completion),
                    Err(err) => LoadStatus::Failed(err),
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("{} panicked: {}", self.handle, message);
                LoadStatus::Failed(StreamError::LoaderPanicked(message))
            }
        };
        log::debug!(
            "{} settled after {:.1}ms",
            self.handle,
            self.started.elapsed().as_secs_f64() * 1000.0
        );
    }

    /// Poll until the task settles or `timeout` elapses.
    pub fn wait_bounded(&mut self, timeout: Duration, interval: Duration) -> LoadStatus {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.poll();
            if !status.is_pending() || Instant::now() >= deadline {
                return status;
            }
            thread::sleep(interval);
        }
    }

    /// Take back the snapshot session once the task has settled.
    pub fn take_source(&mut self) -> Option<Box<dyn SnapshotSource>> {
        self.source.take()
    }

    /// Give up on a task that has not settled; the thread runs on unobserved.
    pub fn detach(mut self) {
        if self.join.take().is_some() {
            log::warn!(
                "Detaching {} after {:.1}s; its snapshot session is released when it finishes",
                self.handle,
                self.started.elapsed().as_secs_f64()
            );
        }
    }
}

fn run_job(job: LoadJob) -> LoadOutcome {
    let LoadJob {
        mut source,
        selection,
        request,
        keep_all,
        defaults,
        frame_index,
        buffer,
    } = job;

    let result = load_frame(
        source.as_mut(),
        &selection,
        &request,
        keep_all,
        &defaults,
        frame_index,
    )
    .map(|loaded| match loaded {
        Some(vector) => {
            let completion = Completion::Valid {
                frame_index,
                time: vector.time(),
            };
            if buffer.stage(vector).is_some() {
                log::warn!(
                    "Replaced an unpublished generation while staging frame {}",
                    frame_index
                );
            }
            completion
        }
        None => Completion::EndOfData {
            notice: source.end_of_data_message(),
        },
    });

    LoadOutcome { source, result }
}

/// Read and resolve one frame. `None` at end of data.
///
/// Runs without holding the buffer lock.
fn load_frame(
    source: &mut dyn SnapshotSource,
    selection: &Selection,
    request: &FrameRequest,
    keep_all: bool,
    defaults: &DisplayProperties,
    frame_index: u64,
) -> Result<Option<ObjectVector>, StreamError> {
    if source.is_end_of_data() {
        return Ok(None);
    }

    let snapshot = match source.next_frame(request) {
        Ok(snapshot) => snapshot,
        Err(SourceError::EndOfStream) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    snapshot.validate()?;

    let mut objects = selection.resolve(snapshot.particle_count, &snapshot.components, defaults)?;
    let particle_count = snapshot.particle_count;
    let data = if keep_all {
        ParticleData::whole(frame_index, snapshot)
    } else {
        ParticleData::compacted(frame_index, snapshot, &mut objects)
    };

    log::debug!(
        "Loaded frame {} (t={}, {} of {} particles, {} objects) from {}",
        frame_index,
        data.time,
        data.particle_count,
        particle_count,
        objects.len(),
        source.describe()
    );

    Ok(Some(ObjectVector::new(data, objects)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
