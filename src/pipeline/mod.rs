//! Streaming pipeline - selection, loading, double buffering and playback.

mod buffer;
mod error;
mod loader;
mod objects;
mod playback;
mod selection;

pub use buffer::*;
pub use error::*;
pub use loader::*;
pub use objects::*;
pub use playback::*;
pub use selection::*;
