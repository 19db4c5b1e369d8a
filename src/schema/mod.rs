//! Schema module - Configuration types for snapshot playback.

mod config;

pub use config::*;
