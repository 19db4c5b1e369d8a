//! Particle Stream CLI - Play snapshot sequences from JSON configuration.

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::f32::consts::TAU;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use rand::Rng;

use particle_stream::{
    pipeline::{DisplayOptions, ObjectVector, PlaybackController, RenderingConsumer},
    schema::PlaybackConfig,
    snapshot::{ComponentRange, RecorderConfig, Snapshot, SnapshotRecorder, SourceDescriptor},
};

/// Prints a summary line for every published frame.
struct FrameLogger {
    started: Instant,
    frames: u64,
}

impl RenderingConsumer for FrameLogger {
    fn update(&mut self, active: &ObjectVector, options: &DisplayOptions) {
        self.frames += 1;
        let com = active.center_of_mass(true).unwrap_or([0.0; 3]);
        println!(
            "  Frame {:>4}: t={:<8.4} objects={} particles={} com=({:.3}, {:.3}, {:.3}) [{:.1}s]",
            options.frame_index,
            options.time,
            active.len(),
            active.selected_particles(),
            com[0],
            com[1],
            com[2],
            self.started.elapsed().as_secs_f32()
        );
    }
}

fn main() {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json>", args[0]);
        eprintln!("       {} --write-demo <out.nbsf> [frames] [particles]", args[0]);
        eprintln!();
        eprintln!("Play an N-body snapshot sequence headlessly from JSON configuration.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json  Path to playback configuration file");
        eprintln!("  frames       Demo frames to write (default: 50)");
        eprintln!("  particles    Demo particles per frame (default: 10000)");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    match args[1].as_str() {
        "--example" => {
            print_example_config();
            return;
        }
        "--write-demo" => {
            let Some(path) = args.get(2) else {
                eprintln!("--write-demo needs an output path");
                std::process::exit(1);
            };
            let frames: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(50);
            let particles: usize = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(10_000);
            if let Err(e) = write_demo(Path::new(path), frames, particles) {
                eprintln!("Error writing demo file: {}", e);
                std::process::exit(1);
            }
            return;
        }
        _ => {}
    }

    let config_path = PathBuf::from(&args[1]);

    // Load configuration
    let config_str = fs::read_to_string(&config_path).unwrap_or_else(|e| {
        eprintln!("Error reading config file: {}", e);
        std::process::exit(1);
    });

    let mut config: PlaybackConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = config.validate() {
        eprintln!("Invalid config: {}", e);
        std::process::exit(1);
    }

    let Some(source) = config.source.clone() else {
        eprintln!("Config has no source");
        std::process::exit(1);
    };

    // No user to show a notice to
    config.interactive = false;

    println!("Particle Stream Playback");
    println!("========================");
    println!("Source: {}", source);
    println!("Selection: {}", config.selection);
    println!("Times: {}", config.time_spec);
    println!(
        "Velocities: {}, keep all: {}",
        config.load_velocities, config.keep_all
    );
    println!();

    let consumer = FrameLogger {
        started: Instant::now(),
        frames: 0,
    };
    let mut controller = PlaybackController::from_config(config, consumer).unwrap_or_else(|e| {
        eprintln!("Error opening source: {}", e);
        std::process::exit(1);
    });

    let start = Instant::now();
    let published = match controller.run_to_end() {
        Ok(published) => published,
        Err(e) => {
            eprintln!("Playback failed: {}", e);
            controller.shutdown();
            std::process::exit(1);
        }
    };

    let elapsed = start.elapsed();
    println!();
    println!(
        "Played {} frames in {:.2}s ({:.1} frames/s)",
        published,
        elapsed.as_secs_f32(),
        controller.consumer().frames as f32 / elapsed.as_secs_f32().max(f32::EPSILON)
    );
}

/// Write a rotating disk inside a static halo.
fn write_demo(path: &Path, frames: usize, particles: usize) -> std::io::Result<()> {
    let mut rng = rand::thread_rng();
    let halo_count = particles / 2;
    let disk_count = particles - halo_count;

    let halo: Vec<[f32; 3]> = (0..halo_count)
        .map(|_| {
            // Uniform in a sphere of radius 10
            let r = 10.0 * rng.gen_range(0.0f32..1.0).cbrt();
            let cos_theta = rng.gen_range(-1.0f32..1.0);
            let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
            let phi = rng.gen_range(0.0..TAU);
            [r * sin_theta * phi.cos(), r * sin_theta * phi.sin(), r * cos_theta]
        })
        .collect();
    let disk: Vec<(f32, f32)> = (0..disk_count)
        .map(|_| (rng.gen_range(1.0f32..8.0), rng.gen_range(0.0..TAU)))
        .collect();

    let mut recorder = SnapshotRecorder::new(path, RecorderConfig::default())?;
    let dt = 0.1f32;
    for frame in 0..frames {
        let t = frame as f32 * dt;
        let mut positions = Vec::with_capacity(particles * 3);
        let mut velocities = Vec::with_capacity(particles * 3);

        for p in &halo {
            positions.extend_from_slice(p);
            velocities.extend_from_slice(&[0.0; 3]);
        }
        for &(radius, phase) in &disk {
            // Keplerian angular velocity
            let omega = radius.powf(-1.5);
            let angle = phase + omega * t;
            positions.extend_from_slice(&[radius * angle.cos(), radius * angle.sin(), 0.0]);
            velocities.extend_from_slice(&[
                -radius * omega * angle.sin(),
                radius * omega * angle.cos(),
                0.0,
            ]);
        }

        let snapshot = Snapshot::new(t as f64, positions)
            .with_velocities(velocities)
            .with_component(ComponentRange::contiguous("halo", 0, halo_count))
            .with_component(ComponentRange::contiguous("disk", halo_count, disk_count));
        recorder.record_frame(&snapshot)?;
    }

    let stats = recorder.finalize()?;
    println!("Wrote {}: {}", path.display(), stats);
    Ok(())
}

fn print_example_config() {
    let config = PlaybackConfig {
        source: Some(SourceDescriptor::File {
            path: PathBuf::from("demo.nbsf"),
        }),
        selection: "halo,disk[0:999]".to_string(),
        ..Default::default()
    };

    println!("Example configuration (config.json):");
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing example config: {}", e),
    }
}
