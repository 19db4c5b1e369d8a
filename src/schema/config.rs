//! Configuration types for snapshot playback.

use serde::{Deserialize, Serialize};

use crate::pipeline::{ColorMode, DisplayProperties, OrbitTrace, Selection, SelectionError};
use crate::snapshot::{FrameRequest, SourceDescriptor, TimeSpec};

fn default_selection() -> String {
    "all".to_string()
}

fn default_true() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    20
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_shutdown_poll_ms() -> u64 {
    10
}

/// Top-level playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Where snapshots come from. May be left out when a source is opened
    /// programmatically.
    #[serde(default)]
    pub source: Option<SourceDescriptor>,
    /// Selection expression, e.g. `"halo,disk[0:99]"`.
    #[serde(default = "default_selection")]
    pub selection: String,
    /// Request velocities along with positions.
    #[serde(default)]
    pub load_velocities: bool,
    /// Snapshot times to deliver.
    #[serde(default)]
    pub time_spec: TimeSpec,
    /// Keep every particle of a snapshot in memory, not only the selected ones.
    #[serde(default = "default_true")]
    pub keep_all: bool,
    /// Show a notice at end of data instead of shutting down.
    #[serde(default = "default_true")]
    pub interactive: bool,
    /// Playback tick period.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Upper bound on waiting for the loader when stopping.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Poll period while waiting for the loader.
    #[serde(default = "default_shutdown_poll_ms")]
    pub shutdown_poll_ms: u64,
    /// Translate the view so the visible center of mass sits at the origin.
    #[serde(default)]
    pub auto_center: bool,
    /// Properties given to objects with no carried-over state.
    #[serde(default)]
    pub display: DisplayDefaults,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            source: None,
            selection: default_selection(),
            load_velocities: false,
            time_spec: TimeSpec::All,
            keep_all: true,
            interactive: true,
            tick_interval_ms: default_tick_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            shutdown_poll_ms: default_shutdown_poll_ms(),
            auto_center: false,
            display: DisplayDefaults::default(),
        }
    }
}

impl PlaybackConfig {
    /// Parse the selection expression.
    pub fn parsed_selection(&self) -> Result<Selection, SelectionError> {
        Selection::parse(&self.selection)
    }

    /// Per-frame request derived from the velocity flag and time selection.
    pub fn frame_request(&self) -> FrameRequest {
        FrameRequest {
            load_velocities: self.load_velocities,
            time: self.time_spec,
        }
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_selection()?;
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidTickInterval);
        }
        if self.shutdown_poll_ms == 0 || self.shutdown_poll_ms > self.shutdown_timeout_ms {
            return Err(ConfigError::InvalidShutdownPoll {
                poll_ms: self.shutdown_poll_ms,
                timeout_ms: self.shutdown_timeout_ms,
            });
        }
        self.display.validate()
    }
}

/// Display properties for objects without carried-over state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayDefaults {
    pub visible: bool,
    pub show_points: bool,
    pub point_size: f32,
    pub show_texture: bool,
    pub texture_size: f32,
    pub texture_alpha: f32,
    pub color: [f32; 3],
    pub color_mode: ColorMode,
    /// Record a center-of-mass trace for every new object.
    pub orbit_trace: bool,
    pub orbit_max_points: usize,
}

impl Default for DisplayDefaults {
    fn default() -> Self {
        let base = DisplayProperties::default();
        Self {
            visible: base.visible,
            show_points: base.show_points,
            point_size: base.point_size,
            show_texture: base.show_texture,
            texture_size: base.texture_size,
            texture_alpha: base.texture_alpha,
            color: base.color,
            color_mode: base.color_mode,
            orbit_trace: base.orbit.enabled,
            orbit_max_points: base.orbit.max_points,
        }
    }
}

impl DisplayDefaults {
    /// Properties a freshly resolved object starts with.
    pub fn properties(&self) -> DisplayProperties {
        DisplayProperties {
            visible: self.visible,
            show_points: self.show_points,
            point_size: self.point_size,
            show_texture: self.show_texture,
            texture_size: self.texture_size,
            texture_alpha: self.texture_alpha,
            color: self.color,
            color_mode: self.color_mode,
            orbit: OrbitTrace {
                enabled: self.orbit_trace,
                max_points: self.orbit_max_points,
                ..Default::default()
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.point_size > 0.0) || !(self.texture_size > 0.0) {
            return Err(ConfigError::InvalidDisplay("sizes must be positive"));
        }
        if !(0.0..=1.0).contains(&self.texture_alpha) {
            return Err(ConfigError::InvalidDisplay("texture alpha must lie in [0, 1]"));
        }
        if self.color.iter().any(|c| !(0.0..=1.0).contains(c)) {
            return Err(ConfigError::InvalidDisplay("color channels must lie in [0, 1]"));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid selection: {0}")]
    InvalidSelection(#[from] SelectionError),
    #[error("Tick interval must be non-zero")]
    InvalidTickInterval,
    #[error("Shutdown poll period {poll_ms}ms must be non-zero and within the {timeout_ms}ms timeout")]
    InvalidShutdownPoll { poll_ms: u64, timeout_ms: u64 },
    #[error("Invalid display defaults: {0}")]
    InvalidDisplay(&'static str),
}
