//! Particle Stream - asynchronous snapshot streaming for N-body playback.
//!
//! Plays back time series of particle snapshots while the next frame is read
//! on a background thread, publishing each fully resolved frame atomically
//! to a renderer.
//!
//! # Architecture
//!
//! - `snapshot`: Snapshot sources (`.nbsf` files, live streams, memory) and
//!   the recorder that writes `.nbsf` files
//! - `pipeline`: Selection resolution, background loading, the active/staging
//!   double buffer and the playback state machine
//! - `schema`: Playback configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use particle_stream::{
//!     pipeline::{NullConsumer, PlaybackController, TickOutcome},
//!     schema::PlaybackConfig,
//!     snapshot::SourceDescriptor,
//! };
//!
//! let config = PlaybackConfig {
//!     source: Some(SourceDescriptor::File { path: "run.nbsf".into() }),
//!     selection: "halo,disk".into(),
//!     ..Default::default()
//! };
//! let mut controller = PlaybackController::from_config(config, NullConsumer)?;
//! controller.play()?;
//!
//! loop {
//!     match controller.tick(false)? {
//!         TickOutcome::Swapped(report) => println!("frame {}", report.frame_index),
//!         TickOutcome::EndOfData { notice } => {
//!             println!("{}", notice);
//!             break;
//!         }
//!         _ => std::thread::sleep(controller.tick_interval()),
//!     }
//! }
//! # Ok::<(), particle_stream::pipeline::StreamError>(())
//! ```

pub mod pipeline;
pub mod schema;
pub mod snapshot;

// Re-export commonly used types
pub use pipeline::{PlaybackController, PlaybackState, Selection, StreamError, TickOutcome};
pub use schema::PlaybackConfig;
pub use snapshot::{Snapshot, SnapshotSource, SourceDescriptor};
