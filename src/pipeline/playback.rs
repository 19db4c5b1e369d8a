//! Playback state machine.
//!
//! [`PlaybackController`] is driven by periodic [`tick`](PlaybackController::tick)
//! calls from the control thread. Each tick either starts a load, checks the
//! outstanding one, or publishes a finished generation. At most one load is
//! outstanding at any time, so a slow source throttles playback instead of
//! queueing frames.
//!
//! ```text
//!            play                  tick (no task)
//! Stopped ─────────► Playing ─────────────────────► Loading
//!    ▲                  ▲                             │
//!    │ stop             │ tick (valid, no gesture)    │ tick (end of data)
//!    │                  └─────────────────────────────┤
//!    └────────────────────────────────────────────────┤
//!                                                     ▼
//!                                                 EndOfData
//! ```

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::schema::PlaybackConfig;
use crate::snapshot::{SnapshotSource, SourceOpener};

use super::buffer::{DoubleBuffer, SwapOptions, SwapReport};
use super::error::{StreamError, TaskHandle};
use super::loader::{Completion, LoadJob, LoadStatus, LoadTask};
use super::objects::{DisplayProperties, ObjectVector, PropertyBackup};
use super::selection::Selection;

/// Playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Loading,
    EndOfData,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Playing => "playing",
            PlaybackState::Loading => "loading",
            PlaybackState::EndOfData => "end of data",
        };
        f.write_str(name)
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing to do in the current state.
    Idle,
    /// A load was started.
    LoadStarted(TaskHandle),
    /// The outstanding load has not finished.
    Waiting,
    /// A finished load is held back by an active gesture.
    Deferred,
    /// A new generation was published and the consumer updated.
    Swapped(SwapReport),
    /// The source ran out of frames; `notice` is for the user.
    EndOfData { notice: String },
    /// End of data in headless mode; the controller has shut down.
    Shutdown,
}

/// View parameters passed along with every published generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayOptions {
    pub frame_index: u64,
    pub time: f64,
    /// Translation applied to the scene (minus the center of mass when
    /// auto-centering, zero otherwise).
    pub translation: [f64; 3],
    /// Set when the generation was just published.
    pub new_frame: bool,
}

/// Receiver of published generations, typically a renderer.
pub trait RenderingConsumer {
    fn update(&mut self, active: &ObjectVector, options: &DisplayOptions);
}

/// Consumer that discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullConsumer;

impl RenderingConsumer for NullConsumer {
    fn update(&mut self, _active: &ObjectVector, _options: &DisplayOptions) {}
}

/// Which swap options the next publication uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextSwap {
    /// First generation after `open`: defaults only.
    Initial,
    /// First generation after `reload`: backup over carryover.
    Reload,
    Playback,
}

/// Drives loading and publication of generations.
pub struct PlaybackController<R: RenderingConsumer = NullConsumer> {
    config: PlaybackConfig,
    defaults: DisplayProperties,
    selection: Selection,
    consumer: R,
    buffer: Arc<DoubleBuffer>,

    state: PlaybackState,
    /// Keep loading after each swap (play) rather than stopping (step, reload).
    continuous: bool,

    opener: Option<Box<dyn SourceOpener>>,
    /// Session, when no loader holds it.
    source: Option<Box<dyn SnapshotSource>>,
    /// The single outstanding load.
    task: Option<LoadTask>,
    /// Last task that settled without a swap, with its final status.
    settled: Option<(TaskHandle, LoadStatus)>,
    next_handle: u64,

    frames_loaded: u64,
    next_swap: NextSwap,
    reload_backup: Option<PropertyBackup>,
    end_notice: Option<String>,
    translation: [f64; 3],
}

impl<R: RenderingConsumer> PlaybackController<R> {
    /// Create a controller with no open source.
    pub fn new(config: PlaybackConfig, consumer: R) -> Result<Self, StreamError> {
        let selection = config.parsed_selection()?;
        let defaults = config.display.properties();
        Ok(Self {
            config,
            defaults,
            selection,
            consumer,
            buffer: Arc::new(DoubleBuffer::new()),
            state: PlaybackState::Stopped,
            continuous: false,
            opener: None,
            source: None,
            task: None,
            settled: None,
            next_handle: 1,
            frames_loaded: 0,
            next_swap: NextSwap::Initial,
            reload_backup: None,
            end_notice: None,
            translation: [0.0; 3],
        })
    }

    /// Create a controller and open the configured source, if any.
    pub fn from_config(config: PlaybackConfig, consumer: R) -> Result<Self, StreamError> {
        let descriptor = config.source.clone();
        let mut controller = Self::new(config, consumer)?;
        if let Some(descriptor) = descriptor {
            controller.open(descriptor)?;
        }
        Ok(controller)
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn buffer(&self) -> &Arc<DoubleBuffer> {
        &self.buffer
    }

    /// The published generation.
    pub fn active(&self) -> Option<Arc<ObjectVector>> {
        self.buffer.active()
    }

    pub fn consumer(&self) -> &R {
        &self.consumer
    }

    pub fn consumer_mut(&mut self) -> &mut R {
        &mut self.consumer
    }

    /// The outstanding load, if any.
    pub fn current_task(&self) -> Option<TaskHandle> {
        self.task.as_ref().map(LoadTask::handle)
    }

    /// Number of generations published since the session was opened.
    pub fn frames_loaded(&self) -> u64 {
        self.frames_loaded
    }

    /// End-of-data notice, once the source is exhausted.
    pub fn end_of_data_notice(&self) -> Option<&str> {
        self.end_notice.as_deref()
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some() || self.task.is_some()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.config.tick_interval_ms)
    }

    /// State to rest in when no load is outstanding.
    fn resting_state(&self) -> PlaybackState {
        if self.end_notice.is_some() {
            PlaybackState::EndOfData
        } else if self.continuous {
            PlaybackState::Playing
        } else {
            PlaybackState::Stopped
        }
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            log::debug!("Playback {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn allocate_handle(&mut self) -> TaskHandle {
        let handle = TaskHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Start loading the next frame into staging.
    ///
    /// Fails with [`StreamError::ConcurrencyViolation`] while another task is
    /// outstanding, including a finished one whose generation has not been
    /// published yet. Once the source is exhausted the returned task is
    /// already settled at end of data.
    pub fn start_load(&mut self) -> Result<TaskHandle, StreamError> {
        if let Some(task) = &self.task {
            let err = StreamError::ConcurrencyViolation {
                running: task.handle(),
            };
            log::error!("{}", err);
            return Err(err);
        }

        let handle = self.allocate_handle();
        if let Some(notice) = &self.end_notice {
            let status = LoadStatus::Done(Completion::EndOfData {
                notice: notice.clone(),
            });
            self.settled = Some((handle, status));
            self.set_state(PlaybackState::EndOfData);
            return Ok(handle);
        }

        let source = self.source.take().ok_or(StreamError::NoSource)?;
        let job = LoadJob {
            source,
            selection: self.selection.clone(),
            request: self.config.frame_request(),
            keep_all: self.config.keep_all,
            defaults: self.defaults.clone(),
            frame_index: self.frames_loaded,
            buffer: Arc::clone(&self.buffer),
        };
        let task = LoadTask::spawn(handle, job).inspect_err(|e| {
            log::error!("{}; the snapshot session is lost", e);
        })?;

        self.task = Some(task);
        self.set_state(PlaybackState::Loading);
        Ok(handle)
    }

    /// Status of a load task, without blocking.
    ///
    /// Observing end of data or a failure retires the task and returns the
    /// session to the controller; the final status stays available for that
    /// handle. An exhausted source keeps answering end of data until a new
    /// source is opened.
    pub fn poll_completion(&mut self, handle: TaskHandle) -> LoadStatus {
        let Some(task) = self.task.as_mut().filter(|t| t.handle() == handle) else {
            return match &self.settled {
                Some((settled, status)) if *settled == handle => status.clone(),
                _ => LoadStatus::Failed(StreamError::UnknownTask(handle)),
            };
        };

        let status = task.poll();
        if status.is_pending() {
            return status;
        }
        if let Some(source) = task.take_source() {
            self.source = Some(source);
        }

        match &status {
            LoadStatus::Pending | LoadStatus::Done(Completion::Valid { .. }) => {}
            LoadStatus::Done(Completion::EndOfData { notice }) => {
                log::info!("{}", notice);
                self.end_notice = Some(notice.clone());
                self.retire(handle, status.clone());
                self.set_state(PlaybackState::EndOfData);
            }
            LoadStatus::Failed(err) => {
                log::warn!("{} failed: {}", handle, err);
                self.retire(handle, status.clone());
                self.continuous = false;
                self.set_state(PlaybackState::Stopped);
            }
        }
        status
    }

    fn retire(&mut self, handle: TaskHandle, status: LoadStatus) {
        self.task = None;
        self.settled = Some((handle, status));
    }

    /// Publish the generation of a finished load unless a gesture is active.
    ///
    /// Returns whether a swap happened. A deferred swap stays staged for a
    /// later call.
    pub fn swap_if_ready(&mut self, handle: TaskHandle, gesture_active: bool) -> bool {
        self.try_swap(handle, gesture_active).is_some()
    }

    fn try_swap(&mut self, handle: TaskHandle, gesture_active: bool) -> Option<SwapReport> {
        if !self.poll_completion(handle).is_valid() {
            return None;
        }
        if gesture_active {
            log::debug!("Swap of {} deferred by active gesture", handle);
            return None;
        }

        let options = match self.next_swap {
            NextSwap::Initial => SwapOptions::initial(),
            NextSwap::Reload => SwapOptions::reload(self.reload_backup.clone()),
            NextSwap::Playback => SwapOptions::playback(),
        };
        let Some(report) = self.buffer.swap(&options) else {
            // Staging was emptied under us; the backup waits for the next swap
            log::warn!("{} finished but nothing was staged", handle);
            let status = self.poll_completion(handle);
            self.retire(handle, status);
            return None;
        };

        self.task = None;
        self.reload_backup = None;
        self.next_swap = NextSwap::Playback;
        self.frames_loaded += 1;
        self.set_state(self.resting_state());

        log::debug!(
            "Published frame {} ({} carried, {} restored, {} defaulted)",
            report.frame_index,
            report.carried,
            report.restored,
            report.defaulted
        );
        self.notify_consumer();
        Some(report)
    }

    fn notify_consumer(&mut self) {
        let Some(active) = self.buffer.active() else {
            return;
        };
        if self.config.auto_center {
            if let Some(com) = self.buffer.center_of_mass(true) {
                self.translation = [-com[0], -com[1], -com[2]];
            }
        }
        let options = DisplayOptions {
            frame_index: active.frame_index(),
            time: active.time(),
            translation: self.translation,
            new_frame: true,
        };
        self.consumer.update(&active, &options);
    }

    /// Begin continuous playback.
    pub fn play(&mut self) -> Result<(), StreamError> {
        if self.state == PlaybackState::EndOfData {
            log::info!("No more frames; reload or open a source to play again");
            return Ok(());
        }
        if !self.has_source() {
            return Err(StreamError::NoSource);
        }
        self.continuous = true;
        if self.state == PlaybackState::Stopped {
            let next = if self.task.is_some() {
                PlaybackState::Loading
            } else {
                PlaybackState::Playing
            };
            self.set_state(next);
        }
        log::info!("Playback started");
        Ok(())
    }

    /// Stop ticking without waiting for the loader.
    ///
    /// An outstanding load is kept and published after the next `play`.
    pub fn pause(&mut self) {
        self.continuous = false;
        if matches!(self.state, PlaybackState::Playing | PlaybackState::Loading) {
            self.set_state(PlaybackState::Stopped);
            log::info!("Playback paused");
        }
    }

    /// Switch between playing and paused.
    pub fn toggle_play(&mut self) -> Result<(), StreamError> {
        match self.state {
            PlaybackState::Playing | PlaybackState::Loading => {
                self.pause();
                Ok(())
            }
            PlaybackState::Stopped | PlaybackState::EndOfData => self.play(),
        }
    }

    /// Load and publish a single frame.
    pub fn step(&mut self) -> Result<TaskHandle, StreamError> {
        self.continuous = false;
        if let Some(task) = &self.task {
            let handle = task.handle();
            self.set_state(PlaybackState::Loading);
            return Ok(handle);
        }
        self.start_load()
    }

    /// Wait (bounded) for the outstanding load to settle.
    ///
    /// Returns `true` when no load is left running.
    fn await_loader(&mut self) -> bool {
        let Some(task) = self.task.as_mut() else {
            return true;
        };
        let handle = task.handle();
        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        let interval = Duration::from_millis(self.config.shutdown_poll_ms);

        if task.wait_bounded(timeout, interval).is_pending() {
            log::warn!(
                "{} still running after {}ms shutdown bound",
                handle,
                self.config.shutdown_timeout_ms
            );
            return false;
        }
        // Settled; let the controller reclaim the session
        self.poll_completion(handle);
        true
    }

    /// Stop playback, waiting (bounded) for an outstanding load.
    ///
    /// A load that finished with a valid frame stays staged and is published
    /// when playback resumes.
    pub fn stop(&mut self) {
        self.continuous = false;
        self.await_loader();
        self.set_state(PlaybackState::Stopped);
        log::info!("Playback stopped");
    }

    /// Stop and release the snapshot session.
    ///
    /// A loader that outlives the shutdown bound is detached.
    pub fn shutdown(&mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            task.detach();
        }
        self.buffer.discard_staged();
        self.source = None;
        self.opener = None;
        log::info!("Snapshot session released");
    }

    /// Replace the session with a fresh one from `opener`.
    ///
    /// The previous session is released only if the new one opens. The
    /// first generation of the new session starts from default properties.
    pub fn open(&mut self, opener: impl SourceOpener + 'static) -> Result<(), StreamError> {
        let source = opener.open()?;
        log::info!("Opened {}", source.describe());

        self.continuous = false;
        if !self.await_loader() {
            if let Some(task) = self.task.take() {
                task.detach();
            }
        }
        self.task = None;
        self.buffer.discard_staged();

        self.opener = Some(Box::new(opener));
        self.install_session(source);
        self.next_swap = NextSwap::Initial;
        self.reload_backup = None;
        self.set_state(PlaybackState::Stopped);
        Ok(())
    }

    fn install_session(&mut self, source: Box<dyn SnapshotSource>) {
        self.source = Some(source);
        self.settled = None;
        self.end_notice = None;
        self.frames_loaded = 0;
    }

    /// Reopen the session from its first frame, optionally with a new
    /// selection, keeping the display properties of the current objects.
    ///
    /// Syntax errors in `selection` and failures to reopen leave everything
    /// unchanged.
    pub fn reload(&mut self, selection: Option<&str>) -> Result<TaskHandle, StreamError> {
        let selection = selection.map(Selection::parse).transpose()?;
        let opener = self.opener.as_ref().ok_or(StreamError::NoSource)?;
        let source = opener.open()?;
        log::info!("Reloading {}", source.describe());

        self.continuous = false;
        if !self.await_loader() {
            if let Some(task) = self.task.take() {
                task.detach();
            }
        }
        self.task = None;
        self.buffer.discard_staged();

        self.reload_backup = self
            .buffer
            .active()
            .map(|active| PropertyBackup::capture(&active));
        if let Some(selection) = selection {
            self.selection = selection;
        }
        self.install_session(source);
        self.next_swap = NextSwap::Reload;
        self.start_load()
    }

    /// Change the selection; effective from the next load.
    pub fn select(&mut self, expression: &str) -> Result<(), StreamError> {
        self.selection = Selection::parse(expression)?;
        log::info!("Selection set to '{}'", self.selection);
        Ok(())
    }

    /// Advance the state machine by one tick.
    pub fn tick(&mut self, gesture_active: bool) -> Result<TickOutcome, StreamError> {
        match self.state {
            PlaybackState::Stopped | PlaybackState::EndOfData => Ok(TickOutcome::Idle),
            PlaybackState::Playing => match self.current_task() {
                // Resumed with a load still outstanding
                Some(_) => {
                    self.set_state(PlaybackState::Loading);
                    self.tick_loading(gesture_active)
                }
                None => self.start_load().map(TickOutcome::LoadStarted),
            },
            PlaybackState::Loading => self.tick_loading(gesture_active),
        }
    }

    fn tick_loading(&mut self, gesture_active: bool) -> Result<TickOutcome, StreamError> {
        let Some(handle) = self.current_task() else {
            self.set_state(self.resting_state());
            return Ok(TickOutcome::Idle);
        };

        match self.poll_completion(handle) {
            LoadStatus::Pending => Ok(TickOutcome::Waiting),
            LoadStatus::Done(Completion::Valid { .. }) => {
                match self.try_swap(handle, gesture_active) {
                    Some(report) => Ok(TickOutcome::Swapped(report)),
                    None if gesture_active => Ok(TickOutcome::Deferred),
                    None => {
                        // Staged generation vanished; nothing to publish
                        self.set_state(self.resting_state());
                        Ok(TickOutcome::Idle)
                    }
                }
            }
            LoadStatus::Done(Completion::EndOfData { notice }) => {
                if self.config.interactive {
                    Ok(TickOutcome::EndOfData { notice })
                } else {
                    log::info!("End of data in headless mode, shutting down");
                    self.shutdown();
                    Ok(TickOutcome::Shutdown)
                }
            }
            LoadStatus::Failed(err) => Err(err),
        }
    }

    /// Play until the source is exhausted, ticking every tick interval.
    ///
    /// Returns the number of generations published.
    pub fn run_to_end(&mut self) -> Result<u64, StreamError> {
        self.play()?;
        let interval = self.tick_interval();
        let mut published = 0;
        loop {
            match self.tick(false)? {
                TickOutcome::Swapped(_) => published += 1,
                TickOutcome::EndOfData { .. } | TickOutcome::Shutdown => break,
                TickOutcome::Idle if self.state != PlaybackState::Playing => break,
                TickOutcome::Waiting => thread::sleep(interval),
                _ => {}
            }
        }
        Ok(published)
    }
}

impl<R: RenderingConsumer> Drop for PlaybackController<R> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.detach();
        }
    }
}
