use field_core::kernel::{self, Integrator};
use field_core::{BoundingBox, ColorMode, Transform};
use field_simulation::settings::keys;
use field_simulation::{
    DeviceError, FrameOutcome, MemorySettings, ReferenceDevice, RenderDevice, Rgba, Scene,
    SceneBus, SceneConfig, SceneEvent, SettingsStore, VectorLinesRequest,
};
use glam::Vec2;
use serde_json::json;

const ROTATION: &str = "v.x = -p.y;\nv.y = p.x;";

fn rotation(p: Vec2) -> Vec2 {
    Vec2::new(-p.y, p.x)
}

fn config(particle_count: u32) -> SceneConfig {
    SceneConfig {
        particle_count,
        vector_field: ROTATION.to_string(),
        drop_probability: 0.0,
        compensate_time_step: false,
        seed: Some(42),
        ..Default::default()
    }
}

fn scene_with(settings: MemorySettings, particle_count: u32) -> (Scene<ReferenceDevice>, SceneBus) {
    let bus = SceneBus::new();
    let scene = Scene::new(
        ReferenceDevice::new(rotation),
        config(particle_count),
        Box::new(settings),
        &bus,
    )
    .unwrap();
    (scene, bus)
}

fn scene(particle_count: u32) -> (Scene<ReferenceDevice>, SceneBus) {
    scene_with(MemorySettings::new(), particle_count)
}

fn positions(scene: &Scene<ReferenceDevice>) -> Vec<Vec2> {
    let (x, y) = scene.current_state().unwrap().bind_for_read().unwrap();
    let xs = scene.device().values(x).unwrap();
    let ys = scene.device().values(y).unwrap();
    xs.into_iter().zip(ys).map(|(x, y)| Vec2::new(x, y)).collect()
}

#[test]
fn test_particle_count_sets_resolution() {
    let (scene, _bus) = scene(10_000);
    assert_eq!(scene.context().particle_state_resolution, 100);
    assert_eq!(scene.current_state().unwrap().resolution(), 100);
}

#[test]
fn test_resizing_does_not_leak() {
    let (mut scene, _bus) = scene(100);
    let live = scene.device().live_resources();

    for count in [1, 500, 10_000, 3, 100] {
        assert_eq!(scene.set_particle_count(count), Ok(true));
        assert_eq!(scene.device().live_resources(), live);
    }
    assert_eq!(scene.context().particle_state_resolution, 10);
}

#[test]
fn test_step_swaps_read_and_write() {
    let (mut scene, _bus) = scene(64);
    let first = scene.current_state().unwrap().clone();

    assert_eq!(scene.frame(), Ok(FrameOutcome::Stepped));
    let second = scene.current_state().unwrap().clone();
    assert!(first.handles().all(|h| second.handles().all(|g| g != h)));

    assert_eq!(scene.frame(), Ok(FrameOutcome::Stepped));
    assert_eq!(scene.current_state().unwrap(), &first);
}

#[test]
fn test_frame_advects_particles() {
    let (mut scene, _bus) = scene(49);
    let before = positions(&scene);

    scene.frame().unwrap();

    let after = positions(&scene);
    for (p, q) in before.iter().zip(&after) {
        assert_eq!(*q, kernel::advance(*p, 0.01, Integrator::Euler, rotation));
    }
    assert_eq!(scene.context().frame, 1);
    assert_eq!(scene.device().readback_count(), 0);
}

#[test]
fn test_compile_error_keeps_previous_program() {
    let (mut scene, _bus) = scene(16);
    let handle = scene.program().unwrap().handle();
    let live = scene.device().live_resources();

    let err = scene.set_vector_field("v.x = ;").unwrap_err();
    assert!(!err.diagnostic.is_empty());
    assert_eq!(scene.vector_field(), ROTATION);
    assert_eq!(scene.program().unwrap().handle(), handle);
    assert_eq!(scene.device().live_resources(), live);
    assert_eq!(scene.frame(), Ok(FrameOutcome::Stepped));
}

#[test]
fn test_vector_field_change_resets_frame_counter() {
    let (mut scene, _bus) = scene(16);
    let live = scene.device().live_resources();
    scene.frame().unwrap();
    scene.frame().unwrap();
    assert_eq!(scene.context().frame, 2);

    scene.set_vector_field("v.x = p.x;\nv.y = 0.0;").unwrap();
    assert_eq!(scene.context().frame, 0);
    assert_eq!(scene.vector_field(), "v.x = p.x;\nv.y = 0.0;");
    assert_eq!(scene.device().live_resources(), live);
}

#[test]
fn test_full_drop_relocates_every_particle() {
    let (mut scene, _bus) = scene(100);
    assert!(scene.set_drop_probability(1.0));
    let before = positions(&scene);

    scene.frame().unwrap();

    let bbox = scene.bbox();
    for (p, q) in before.iter().zip(positions(&scene)) {
        assert_ne!(q, kernel::advance(*p, 0.01, Integrator::Euler, rotation));
        assert!(bbox.contains(q), "{q} outside {bbox:?}");
    }
}

#[test]
fn test_sample_request_returns_velocities() {
    let (mut scene, bus) = scene(16);
    let events = bus.events.subscribe();
    let x: Vec<f32> = (0..256).map(|i| i as f32 * 0.25).collect();
    let y: Vec<f32> = (0..256).map(|i| 3.0 - i as f32 * 0.5).collect();

    scene.request_vector_lines(VectorLinesRequest {
        resolution: 16,
        x: x.clone(),
        y: y.clone(),
    });
    scene.frame().unwrap();

    let result = events
        .drain()
        .into_iter()
        .find_map(|event| match event {
            SceneEvent::VectorLineReady(result) => Some(result),
            _ => None,
        })
        .expect("sample result");

    assert_eq!(result.decoded_velocity_x.len(), 256);
    assert_eq!(result.decoded_velocity_y.len(), 256);
    for i in 0..256 {
        let expected = rotation(Vec2::new(x[i], y[i]));
        assert_eq!(result.decoded_velocity_x[i], expected.x);
        assert_eq!(result.decoded_velocity_y[i], expected.y);
    }
    assert_eq!(result.x_stats.count, 256);
    assert_eq!(result.y_stats.max, x[255]);
}

#[test]
fn test_newer_sample_request_replaces_pending_one() {
    let (mut scene, bus) = scene(16);
    let events = bus.events.subscribe();

    assert!(!scene.request_vector_lines(VectorLinesRequest {
        resolution: 4,
        x: vec![1.0],
        y: vec![1.0],
    }));
    assert!(scene.request_vector_lines(VectorLinesRequest {
        resolution: 2,
        x: vec![1.0],
        y: vec![1.0],
    }));
    scene.frame().unwrap();
    scene.frame().unwrap();

    let results: Vec<_> = events
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            SceneEvent::VectorLineReady(result) => Some(result.resolution),
            _ => None,
        })
        .collect();
    assert_eq!(results, vec![2]);
}

#[test]
fn test_sample_request_from_another_thread() {
    let (mut scene, bus) = scene(16);
    let events = bus.events.subscribe();
    let mailbox = bus.samples.clone();

    std::thread::spawn(move || {
        mailbox.enqueue(VectorLinesRequest {
            resolution: 1,
            x: vec![2.0],
            y: vec![5.0],
        });
    })
    .join()
    .unwrap();
    scene.frame().unwrap();

    let result = events.drain().into_iter().find_map(|event| match event {
        SceneEvent::VectorLineReady(result) => Some(result),
        _ => None,
    });
    let result = result.expect("sample result");
    assert_eq!(result.decoded_velocity_x, vec![-5.0]);
    assert_eq!(result.decoded_velocity_y, vec![2.0]);
}

#[test]
fn test_draw_failure_keeps_last_complete_state() {
    let (mut scene, _bus) = scene(16);
    let read = scene.current_state().unwrap().clone();
    scene.device_mut().fail_draw_after(1);

    assert!(matches!(scene.frame(), Err(DeviceError::Draw(_))));
    assert_eq!(scene.current_state().unwrap(), &read);
    assert_eq!(scene.context().frame, 0);

    assert_eq!(scene.frame(), Ok(FrameOutcome::Stepped));
    assert_eq!(scene.context().frame, 1);
}

#[test]
fn test_allocation_failure_restores_previous_state() {
    let (mut scene, _bus) = scene(100);
    let live = scene.device().live_resources();
    scene.device_mut().fail_allocation_after(0);

    assert!(matches!(
        scene.set_particle_count(400),
        Err(DeviceError::Allocation(_))
    ));
    assert_eq!(scene.particle_count(), 100);
    assert_eq!(scene.current_state().unwrap().resolution(), 10);
    assert_eq!(scene.device().live_resources(), live);
}

#[test]
fn test_dispose_releases_everything() {
    let (mut scene, bus) = scene(100);
    scene.set_aux_signal(&[1.0, 2.0]).unwrap();
    assert_eq!(bus.transforms.subscriber_count(), 1);

    scene.dispose();

    assert_eq!(scene.device().live_resources(), 0);
    assert_eq!(bus.transforms.subscriber_count(), 0);
    assert_eq!(scene.frame(), Ok(FrameOutcome::Skipped));
    assert!(!scene.wants_frame());

    scene.dispose();
    assert!(scene.is_disposed());
}

#[test]
fn test_invalid_values_are_ignored() {
    let (mut scene, _bus) = scene(100);
    let before = scene.snapshot();

    assert!(!scene.set_drop_probability(f32::NAN));
    assert!(!scene.set_drop_probability(1.5));
    assert!(!scene.set_fade_out(-0.1));
    assert!(!scene.set_integration_time_step(f32::INFINITY));
    assert!(!scene.set_color_aux(0.0));
    assert!(!scene.set_background_color(Rgba::new(2.0, 0.0, 0.0, 1.0)));
    assert_eq!(scene.set_particle_count(0), Ok(false));
    assert_eq!(scene.set_color_mode_index(7), Ok(false));

    assert_eq!(scene.snapshot(), before);
}

#[test]
fn test_transform_updates_bbox_before_step() {
    let (mut scene, bus) = scene(16);
    let events = bus.events.subscribe();

    bus.transforms.publish(Transform {
        scale: 100.0,
        x: 0.0,
        y: 0.0,
    });
    scene.frame().unwrap();

    let expected = BoundingBox::new(-4.0, -3.0, 4.0, 3.0);
    assert_eq!(scene.bbox(), expected);
    assert_eq!(scene.program().unwrap().uniforms().bbox, expected.to_array());
    assert!(events
        .drain()
        .contains(&SceneEvent::BboxChange(expected)));
    assert_eq!(
        scene.settings().get(keys::BBOX),
        Some(json!({"minX": -4.0, "minY": -3.0, "maxX": 4.0, "maxY": 3.0}))
    );
}

#[test]
fn test_invalid_transform_keeps_bbox_but_notifies() {
    let (mut scene, bus) = scene(16);
    let before = scene.bbox();
    let events = bus.events.subscribe();

    bus.transforms.publish(Transform {
        scale: 0.0,
        x: 0.0,
        y: 0.0,
    });
    scene.frame().unwrap();

    assert_eq!(scene.bbox(), before);
    assert_eq!(events.drain(), vec![SceneEvent::BboxChange(before)]);
}

#[test]
fn test_time_step_changes_are_published() {
    let (mut scene, bus) = scene(16);
    let events = bus.events.subscribe();

    assert!(scene.set_integration_time_step(0.02));
    assert!(scene.set_integration_speed(3.0));

    assert_eq!(
        events.drain(),
        vec![
            SceneEvent::IntegrationTimestepChanged(0.02),
            SceneEvent::IntegrationTimestepChanged(0.01 * 3.0),
        ]
    );
    assert_eq!(scene.context().integration_time_step, 0.01 * 3.0);
}

#[test]
fn test_scene_ready_is_published_on_creation() {
    let bus = SceneBus::new();
    let events = bus.events.subscribe();
    let _scene = Scene::new(
        ReferenceDevice::new(rotation),
        config(25),
        Box::new(MemorySettings::new()),
        &bus,
    )
    .unwrap();

    match events.try_next() {
        Some(SceneEvent::SceneReady(snapshot)) => {
            assert_eq!(snapshot.particle_count, 25);
            assert_eq!(snapshot.particle_state_resolution, 5);
            assert_eq!(snapshot.vector_field, ROTATION);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_pause_lets_in_flight_frame_finish() {
    let (mut scene, _bus) = scene(16);
    assert!(scene.wants_frame());

    scene.set_paused(true);
    assert_eq!(scene.frame(), Ok(FrameOutcome::Stepped));
    assert!(!scene.wants_frame());
    assert_eq!(scene.frame(), Ok(FrameOutcome::Skipped));

    scene.set_paused(false);
    assert!(scene.wants_frame());
    assert_eq!(scene.frame(), Ok(FrameOutcome::Stepped));
}

#[test]
fn test_saved_settings_are_restored() {
    let mut settings = MemorySettings::new();
    settings.set(keys::PARTICLE_COUNT, json!(400));
    settings.set(keys::FADE_OUT, json!(0.5));
    settings.set(keys::COLOR_MODE, json!(2));
    settings.set(keys::VECTOR_FIELD, json!("v.x = 1.0;\nv.y = 0.0;"));
    settings.set(
        keys::BBOX,
        json!({"minX": -4.0, "minY": -3.0, "maxX": 4.0, "maxY": 3.0}),
    );

    let (scene, _bus) = scene_with(settings, 100);

    assert_eq!(scene.particle_count(), 400);
    assert_eq!(scene.context().fade_out, 0.5);
    assert_eq!(scene.context().color_mode, ColorMode::Velocity);
    assert_eq!(scene.vector_field(), "v.x = 1.0;\nv.y = 0.0;");
    assert_eq!(scene.bbox(), BoundingBox::new(-4.0, -3.0, 4.0, 3.0));
}

#[test]
fn test_broken_saved_field_falls_back_to_configured_one() {
    let mut settings = MemorySettings::new();
    settings.set(keys::VECTOR_FIELD, json!("v.x = ;"));
    settings.set(keys::DROP_PROBABILITY, json!("high"));

    let (scene, _bus) = scene_with(settings, 16);

    assert_eq!(scene.vector_field(), ROTATION);
    assert_eq!(scene.context().drop_probability, 0.0);
}

#[test]
fn test_accepted_values_are_persisted() {
    let (mut scene, _bus) = scene(16);
    scene.set_fade_out(0.25);
    scene.set_particle_count(81).unwrap();
    scene.set_color_mode(ColorMode::Angle).unwrap();

    assert_eq!(scene.settings().get(keys::FADE_OUT), Some(json!(0.25)));
    assert_eq!(scene.settings().get(keys::PARTICLE_COUNT), Some(json!(81)));
    assert_eq!(scene.settings().get(keys::COLOR_MODE), Some(json!(3)));
}

#[test]
fn test_color_mode_adds_color_pass() {
    let (mut scene, _bus) = scene(16);
    scene.frame().unwrap();
    assert_eq!(scene.device().draw_count(), 2);

    scene.set_color_mode(ColorMode::Velocity).unwrap();
    scene.frame().unwrap();
    assert_eq!(scene.device().draw_count(), 5);
    assert_eq!(scene.program().unwrap().color_mode(), ColorMode::Velocity);
}

#[test]
fn test_aux_signal_is_bound_to_passes() {
    let (mut scene, _bus) = scene(16);
    let live = scene.device().live_resources();

    scene.set_aux_signal(&[1.0, 2.0, 3.0]).unwrap();
    assert_eq!(scene.context().aux_signal_len, 3);
    assert_eq!(scene.device().live_resources(), live + 1);
    scene.frame().unwrap();
    assert_eq!(scene.device().last_aux_signal(), &[1.0, 2.0, 3.0]);

    scene.set_aux_signal(&[]).unwrap();
    assert_eq!(scene.device().live_resources(), live);
    assert_eq!(scene.context().aux_signal_len, 0);
}

#[test]
fn test_custom_uniforms() {
    let (mut scene, _bus) = scene(16);
    scene
        .set_vector_field("v.x = u_speed * p.y;\nv.y = u_gain;")
        .unwrap();

    assert!(scene.set_uniform("speed", 2.0));
    assert!(scene.set_uniform("u_gain", -1.0));
    assert!(!scene.set_uniform("frame", 3.0));
    assert!(!scene.set_uniform("missing", 1.0));
    assert!(scene.set_uniform("h", 0.05));
    assert_eq!(scene.context().integration_time_step, 0.05);

    scene.set_color_mode(ColorMode::Angle).unwrap();
    let program = scene.program().unwrap();
    assert_eq!(program.uniform_scalar("speed"), Some(2.0));
    assert_eq!(program.uniform_scalar("gain"), Some(-1.0));
}
