//! End-to-end playback through the public API.

use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use particle_stream::{
    pipeline::{
        DisplayOptions, ObjectIdentity, ObjectVector, PlaybackController, PlaybackState,
        RenderingConsumer, StreamError, TickOutcome,
    },
    schema::PlaybackConfig,
    snapshot::{
        ComponentRange, MemoryOpener, RecorderConfig, RetryPolicy, Snapshot, SnapshotRecorder,
        SourceDescriptor, SourceError, TimeSpec, write_stream_end, write_stream_frame,
        write_stream_header,
    },
};
use tempfile::tempdir;

#[derive(Default)]
struct Updates {
    received: Vec<(u64, f64, Vec<usize>)>,
}

impl RenderingConsumer for Updates {
    fn update(&mut self, active: &ObjectVector, options: &DisplayOptions) {
        let sizes = active.iter().map(|o| o.npart()).collect();
        self.received.push((options.frame_index, options.time, sizes));
    }
}

/// Frame `t`: particle i at (i, t, 0), halo = [0, 50), disk = [50, n).
fn galaxy_frame(t: usize, particles: usize) -> Snapshot {
    let positions = (0..particles)
        .flat_map(|i| [i as f32, t as f32, 0.0])
        .collect();
    Snapshot::new(t as f64, positions)
        .with_component(ComponentRange::contiguous("halo", 0, 50))
        .with_component(ComponentRange::contiguous("disk", 50, particles - 50))
}

fn plain_frame(t: usize, particles: usize) -> Snapshot {
    Snapshot::new(t as f64, vec![t as f32; particles * 3])
}

fn fast_config() -> PlaybackConfig {
    PlaybackConfig {
        tick_interval_ms: 1,
        shutdown_poll_ms: 1,
        ..Default::default()
    }
}

fn tick_until_settled(
    controller: &mut PlaybackController<Updates>,
    gesture: bool,
) -> Result<TickOutcome, StreamError> {
    for _ in 0..10_000 {
        match controller.tick(gesture)? {
            TickOutcome::Waiting => thread::sleep(Duration::from_millis(1)),
            other => return Ok(other),
        }
    }
    panic!("load never settled");
}

#[test]
fn three_frames_then_end_of_data() {
    let mut controller = PlaybackController::new(fast_config(), Updates::default()).unwrap();
    controller
        .open(MemoryOpener::new((0..3).map(|t| plain_frame(t, 100))))
        .unwrap();
    controller.play().unwrap();

    let mut loads = 0;
    let notice = loop {
        match tick_until_settled(&mut controller, false).unwrap() {
            TickOutcome::LoadStarted(_) => loads += 1,
            TickOutcome::Swapped(_) => {}
            TickOutcome::EndOfData { notice } => break notice,
            other => panic!("unexpected outcome {:?}", other),
        }
    };

    assert_eq!(loads, 4);
    assert!(!notice.is_empty());
    assert_eq!(controller.state(), PlaybackState::EndOfData);

    let received = &controller.consumer().received;
    assert_eq!(received.len(), 3);
    for (expected, (frame_index, time, sizes)) in received.iter().enumerate() {
        assert_eq!(*frame_index, expected as u64);
        assert_eq!(*time, expected as f64);
        assert_eq!(sizes, &vec![100]);
    }
}

#[test]
fn components_resolve_in_declared_order() {
    let config = PlaybackConfig {
        selection: "disk,halo".into(),
        ..fast_config()
    };
    let mut controller = PlaybackController::new(config, Updates::default()).unwrap();
    controller
        .open(MemoryOpener::new(vec![galaxy_frame(0, 80)]))
        .unwrap();
    controller.play().unwrap();
    tick_until_settled(&mut controller, false).unwrap();
    tick_until_settled(&mut controller, false).unwrap();

    let active = controller.active().unwrap();
    let identities: Vec<_> = active.iter().map(|o| o.identity.clone()).collect();
    assert_eq!(
        identities,
        vec![
            ObjectIdentity::Component("halo".into()),
            ObjectIdentity::Component("disk".into())
        ]
    );
    assert_eq!(controller.consumer().received[0].2, vec![50, 30]);
}

#[test]
fn gesture_defers_without_skipping_frames() {
    let mut controller = PlaybackController::new(fast_config(), Updates::default()).unwrap();
    controller
        .open(MemoryOpener::new((0..3).map(|t| galaxy_frame(t, 80))))
        .unwrap();
    controller.play().unwrap();

    // Frame 0 published normally
    tick_until_settled(&mut controller, false).unwrap();
    assert!(matches!(
        tick_until_settled(&mut controller, false).unwrap(),
        TickOutcome::Swapped(_)
    ));

    // Frame 1 completes while the user drags the view
    tick_until_settled(&mut controller, true).unwrap();
    assert_eq!(
        tick_until_settled(&mut controller, true).unwrap(),
        TickOutcome::Deferred
    );
    assert_eq!(
        tick_until_settled(&mut controller, true).unwrap(),
        TickOutcome::Deferred
    );
    assert_eq!(controller.consumer().received.len(), 1);

    match tick_until_settled(&mut controller, false).unwrap() {
        TickOutcome::Swapped(report) => assert_eq!(report.frame_index, 1),
        other => panic!("unexpected outcome {:?}", other),
    }

    // Remaining frames follow in order
    while !matches!(
        tick_until_settled(&mut controller, false).unwrap(),
        TickOutcome::EndOfData { .. }
    ) {}
    let frames: Vec<u64> = controller
        .consumer()
        .received
        .iter()
        .map(|r| r.0)
        .collect();
    assert_eq!(frames, vec![0, 1, 2]);
}

#[test]
fn readers_never_observe_mixed_generations() {
    let config = PlaybackConfig {
        selection: "halo,disk[0:9],60:69".into(),
        keep_all: false,
        ..fast_config()
    };
    let mut controller = PlaybackController::new(config, Updates::default()).unwrap();
    controller
        .open(MemoryOpener::new((0..40).map(|t| galaxy_frame(t, 200))))
        .unwrap();
    let buffer = Arc::clone(controller.buffer());

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut last_frame = 0;
            let mut observed = 0;
            while !done.load(Ordering::Acquire) {
                let Some(active) = buffer.active() else {
                    continue;
                };
                let frame = active.frame_index();
                assert!(frame >= last_frame, "generations went backwards");
                last_frame = frame;
                for object in active.iter() {
                    for &slot in &object.index_table {
                        let p = active.data.position(slot as usize);
                        assert_eq!(p[1], frame as f32, "object from another generation");
                    }
                }
                assert_eq!(buffer.selected_particles() % 10, 0);
                observed += 1;
            }
            observed
        })
    };

    let published = controller.run_to_end().unwrap();
    done.store(true, Ordering::Release);
    let observed = reader.join().unwrap();

    assert_eq!(published, 40);
    assert!(observed > 0);
}

#[test]
fn unchanged_selection_keeps_properties() {
    let mut controller = PlaybackController::new(fast_config(), Updates::default()).unwrap();
    controller
        .open(MemoryOpener::new((0..3).map(|t| galaxy_frame(t, 80))))
        .unwrap();
    controller.play().unwrap();
    tick_until_settled(&mut controller, false).unwrap();
    tick_until_settled(&mut controller, false).unwrap();

    controller.buffer().modify_active(|active| {
        active.objects[0].properties.point_size = 6.0;
        active.objects[0].properties.color = [1.0, 0.0, 0.0];
        active.objects[1].properties.show_texture = true;
    });
    let before: Vec<_> = controller
        .active()
        .unwrap()
        .iter()
        .map(|o| o.properties.clone())
        .collect();

    for _ in 0..2 {
        tick_until_settled(&mut controller, false).unwrap();
        match tick_until_settled(&mut controller, false).unwrap() {
            TickOutcome::Swapped(report) => assert_eq!(report.carried, 2),
            other => panic!("unexpected outcome {:?}", other),
        }
        let after: Vec<_> = controller
            .active()
            .unwrap()
            .iter()
            .map(|o| o.properties.clone())
            .collect();
        assert_eq!(before, after);
    }
}

#[test]
fn format_error_leaves_active_generation() {
    let script = vec![
        Ok(galaxy_frame(0, 80)),
        Err(SourceError::Format("checksum mismatch".into())),
    ];
    let mut controller = PlaybackController::new(fast_config(), Updates::default()).unwrap();
    controller.open(MemoryOpener::scripted(script)).unwrap();
    controller.play().unwrap();

    tick_until_settled(&mut controller, false).unwrap();
    tick_until_settled(&mut controller, false).unwrap();
    let before = controller.active().unwrap();

    tick_until_settled(&mut controller, false).unwrap();
    let err = tick_until_settled(&mut controller, false).unwrap_err();
    assert!(matches!(err, StreamError::Source(SourceError::Format(_))));

    let after = controller.active().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(controller.state(), PlaybackState::Stopped);
    assert_eq!(controller.consumer().received.len(), 1);
}

#[test]
fn recorded_file_plays_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.nbsf");

    let mut recorder = SnapshotRecorder::new(&path, RecorderConfig::default()).unwrap();
    for t in 0..6 {
        let frame = galaxy_frame(t, 80).with_velocities(vec![0.5; 240]);
        recorder.record_frame(&frame).unwrap();
    }
    recorder.finalize().unwrap();

    let config = PlaybackConfig {
        source: Some(SourceDescriptor::File { path }),
        selection: "disk[0:9]".into(),
        load_velocities: true,
        time_spec: TimeSpec::Window {
            start: 2.0,
            end: 4.0,
        },
        keep_all: false,
        interactive: false,
        ..fast_config()
    };
    let mut controller = PlaybackController::from_config(config, Updates::default()).unwrap();
    let published = controller.run_to_end().unwrap();

    assert_eq!(published, 3);
    let times: Vec<f64> = controller
        .consumer()
        .received
        .iter()
        .map(|r| r.1)
        .collect();
    assert_eq!(times, vec![2.0, 3.0, 4.0]);
    assert!(controller.consumer().received.iter().all(|r| r.2 == vec![10]));
    assert_eq!(controller.state(), PlaybackState::Stopped);
}

#[test]
fn live_stream_plays_until_end_tag() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        write_stream_header(&mut stream, false).unwrap();
        for t in 0..4 {
            write_stream_frame(&mut stream, &galaxy_frame(t, 80), false).unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        write_stream_end(&mut stream).unwrap();
        stream.flush().unwrap();
    });

    let config = PlaybackConfig {
        source: Some(SourceDescriptor::Live {
            address,
            retry: RetryPolicy::none(),
        }),
        selection: "halo".into(),
        ..fast_config()
    };
    let mut controller = PlaybackController::from_config(config, Updates::default()).unwrap();
    let published = controller.run_to_end().unwrap();
    server.join().unwrap();

    assert_eq!(published, 4);
    assert_eq!(controller.state(), PlaybackState::EndOfData);
    assert!(controller.consumer().received.iter().all(|r| r.2 == vec![50]));
}

#[test]
fn reload_prefers_backup_over_defaults() {
    let config = PlaybackConfig {
        selection: "halo".into(),
        ..fast_config()
    };
    let mut controller = PlaybackController::new(config, Updates::default()).unwrap();
    controller
        .open(MemoryOpener::new((0..2).map(|t| galaxy_frame(t, 80))))
        .unwrap();
    controller.play().unwrap();
    tick_until_settled(&mut controller, false).unwrap();
    tick_until_settled(&mut controller, false).unwrap();
    controller.pause();

    controller
        .buffer()
        .modify_active(|active| active.objects[0].properties.texture_alpha = 0.9);

    // New selection adds disk; halo keeps its state, disk gets defaults
    let handle = controller.reload(Some("halo,disk")).unwrap();
    while controller.poll_completion(handle).is_pending() {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(controller.swap_if_ready(handle, false));

    let active = controller.active().unwrap();
    assert_eq!(active.frame_index(), 0);
    assert_eq!(active.objects[0].properties.texture_alpha, 0.9);
    assert_eq!(active.objects[1].properties.texture_alpha, 0.5);
}
