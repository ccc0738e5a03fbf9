mod common;

use common::{BufferSpec, Fixture, TestBuffer};
use hwcomposer::{
    capture::dump::DisplayKind,
    config::SessionConfig,
    engine::{EngineError, LayerComposition, StackFlags, StackLayerFlags},
    layer::{Composition, GeometryChanges},
    notify::Notification,
    session::{LayerRequestKind, SessionError, VsyncPeriodChangeConstraints, VsyncPeriodChangeTimeline},
    sync::SyncPoint,
    utils::{Clock, DisplayId},
};

#[test]
fn same_buffer_does_not_flag_buffer_geometry() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(1);
    let id = fx.add_layer(&buffer, BufferSpec::default());
    assert!(fx
        .session
        .layer(id)
        .unwrap()
        .geometry_changes()
        .contains(GeometryChanges::BUFFER_GEOMETRY));

    fx.frame().unwrap();

    fx.session
        .set_layer_buffer(id, Some(buffer.handle()), SyncPoint::signaled())
        .unwrap();
    fx.set_client_target();
    fx.session.validate().unwrap();

    let layer = fx.session.layer(id).unwrap();
    assert!(!layer.geometry_changes().contains(GeometryChanges::BUFFER_GEOMETRY));
    let script = fx.engine.script();
    let stack = script.last_stack.as_ref().unwrap();
    let entry = stack.layer(id).unwrap();
    assert_eq!(entry.geometry_changes & GeometryChanges::BUFFER_GEOMETRY.bits(), 0);
    assert!(!stack.flags.contains(StackFlags::GEOMETRY_CHANGED));
}

#[test]
fn resized_buffer_flags_buffer_geometry() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(1);
    let id = fx.add_layer(&buffer, BufferSpec::default());
    fx.frame().unwrap();

    let bigger = TestBuffer::new(2);
    fx.provider.insert(
        bigger.id,
        BufferSpec {
            width: 200,
            ..Default::default()
        },
    );
    fx.session
        .set_layer_buffer(id, Some(bigger.handle()), SyncPoint::signaled())
        .unwrap();
    fx.set_client_target();
    fx.session.validate().unwrap();

    let script = fx.engine.script();
    let stack = script.last_stack.as_ref().unwrap();
    assert!(stack.flags.contains(StackFlags::GEOMETRY_CHANGED));
    assert_ne!(
        stack.layer(id).unwrap().geometry_changes & GeometryChanges::BUFFER_GEOMETRY.bits(),
        0
    );
}

#[test]
fn engine_decisions_become_changes_and_requests() {
    let mut fx = Fixture::new();
    fx.power_on();
    let (first, second) = (TestBuffer::new(1), TestBuffer::new(2));
    let hardware = fx.add_layer(&first, BufferSpec::default());
    let client = fx.add_layer(&second, BufferSpec::default());
    fx.engine.script().hardware.insert(hardware);

    fx.set_client_target();
    let result = fx.session.validate().unwrap();
    assert_eq!(result.changed_types, 1);
    assert_eq!(result.requests, 1);
    assert!(result.has_changes);

    assert_eq!(
        fx.session.changed_composition_types().unwrap(),
        vec![(client, Composition::Client)]
    );
    let (_, requests) = fx.session.display_requests().unwrap();
    assert_eq!(requests, vec![(hardware, LayerRequestKind::ClearClientTarget)]);

    fx.session.accept_changes().unwrap();
    assert_eq!(fx.session.layer(client).unwrap().requested_composition(), Composition::Client);
    assert_eq!(fx.composition(hardware), Composition::Device);

    assert!(fx.session.present().unwrap().is_some());
    let fences = fx.session.release_fences();
    assert_eq!(fences.len(), 2);
    assert!(fx.session.release_fences().is_empty());
}

#[test]
fn client_target_is_appended_last() {
    let mut fx = Fixture::new();
    fx.power_on();
    let (first, second) = (TestBuffer::new(1), TestBuffer::new(2));
    let bottom = fx.add_layer(&first, BufferSpec::default());
    let top = fx.add_layer(&second, BufferSpec::default());
    fx.session.set_layer_z_order(bottom, 5).unwrap();
    fx.session.set_layer_z_order(top, 1).unwrap();

    fx.set_client_target();
    fx.session.validate().unwrap();

    let script = fx.engine.script();
    let stack = script.last_stack.as_ref().unwrap();
    let ids: Vec<_> = stack.layers.iter().map(|entry| entry.id).collect();
    assert_eq!(ids, vec![Some(top), Some(bottom), None]);
    assert_eq!(stack.client_target().unwrap().composition, LayerComposition::GpuTarget);
    assert_eq!(fx.session.layers(), vec![top, bottom]);
}

#[test]
fn only_the_top_layer_can_be_a_cursor() {
    let mut fx = Fixture::new();
    fx.power_on();
    let (first, second) = (TestBuffer::new(1), TestBuffer::new(2));
    let below = fx.add_layer(&first, BufferSpec::default());
    let above = fx.add_layer(&second, BufferSpec::default());
    for (id, z) in [(below, 1), (above, 2)] {
        fx.session.set_layer_z_order(id, z).unwrap();
        fx.session
            .layer_mut(id)
            .unwrap()
            .set_composition_type(Composition::Cursor)
            .unwrap();
    }

    fx.set_client_target();
    fx.session.validate().unwrap();

    let script = fx.engine.script();
    let stack = script.last_stack.as_ref().unwrap();
    assert!(stack.layer(above).unwrap().flags.contains(StackLayerFlags::CURSOR));
    assert!(!stack.layer(below).unwrap().flags.contains(StackLayerFlags::CURSOR));
    assert!(stack.flags.contains(StackFlags::CURSOR_PRESENT));
}

#[test]
fn layers_without_client_target_are_left_to_the_client() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(1);
    let id = fx.add_layer(&buffer, BufferSpec::default());
    fx.engine.script().hardware.insert(id);

    let result = fx.session.validate().unwrap();
    assert_eq!(result.changed_types, 1);
    assert_eq!(fx.composition(id), Composition::Client);
    let script = fx.engine.script();
    let stack = script.last_stack.as_ref().unwrap();
    assert!(stack.layer(id).unwrap().flags.contains(StackLayerFlags::SKIP));
    assert!(stack.flags.contains(StackFlags::SKIP_PRESENT));
}

#[test]
fn unchanged_client_composed_frame_skips_the_engine() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(1);
    let id = fx.add_layer(&buffer, BufferSpec::default());

    fx.session.validate().unwrap();
    assert_eq!(fx.engine.script().prepares, 1);

    let result = fx.session.validate().unwrap();
    assert_eq!(fx.engine.script().prepares, 1);
    assert_eq!(result.changed_types, 1);
    assert_eq!(
        fx.session.changed_composition_types().unwrap(),
        vec![(id, Composition::Client)]
    );

    // a client composition request invalidates the cached decision
    fx.session
        .layer_mut(id)
        .unwrap()
        .set_composition_type(Composition::Client)
        .unwrap();
    fx.session.validate().unwrap();
    assert_eq!(fx.engine.script().prepares, 2);
}

#[test]
fn skipped_validate_commits_the_new_buffer() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(1);
    let id = fx.add_layer(&buffer, BufferSpec::default());
    fx.session
        .layer_mut(id)
        .unwrap()
        .set_composition_type(Composition::Client)
        .unwrap();
    fx.set_client_target();
    fx.session.validate().unwrap();
    fx.session.accept_changes().unwrap();

    let next = TestBuffer::new(2);
    fx.provider.insert(next.id, BufferSpec::default());
    fx.session
        .set_layer_buffer(id, Some(next.handle()), SyncPoint::signaled())
        .unwrap();
    fx.session.validate().unwrap();
    fx.session.present().unwrap();

    let script = fx.engine.script();
    assert_eq!(script.prepares, 1);
    assert_eq!(script.commits, 1);
    let stack = script.committed_stack.as_ref().unwrap();
    assert_eq!(stack.layer(id).unwrap().buffer.id, next.id);
}

#[test]
fn client_target_set_after_validate_is_committed() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(1);
    fx.add_layer(&buffer, BufferSpec::default());
    fx.frame().unwrap();
    assert_eq!(
        fx.engine
            .script()
            .committed_stack
            .as_ref()
            .and_then(|stack| stack.client_target())
            .map(|target| target.buffer.id),
        Some(fx.client_target.id)
    );

    fx.session.validate().unwrap();
    fx.session.accept_changes().unwrap();
    let rendered = TestBuffer::new(0xc001);
    fx.provider.insert(rendered.id, BufferSpec::default());
    fx.session
        .set_client_target(
            Some(rendered.handle()),
            SyncPoint::signaled(),
            hwcomposer::color::Dataspace::UNKNOWN,
            &[],
        )
        .unwrap();
    fx.session.present().unwrap();

    let script = fx.engine.script();
    assert_eq!(script.commits, 2);
    let target = script.committed_stack.as_ref().unwrap().client_target().unwrap();
    assert_eq!(target.id, None);
    assert_eq!(target.composition, LayerComposition::GpuTarget);
    assert_eq!(target.buffer.id, rendered.id);
}

#[test]
fn present_requires_validate() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(1);
    fx.add_layer(&buffer, BufferSpec::default());
    fx.set_client_target();

    assert!(matches!(fx.session.accept_changes(), Err(SessionError::NotValidated)));
    assert!(matches!(fx.session.present(), Err(SessionError::NotValidated)));
    assert_eq!(fx.engine.script().commits, 0);
}

#[test]
fn permission_denied_falls_back_to_client_composition() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(1);
    let id = fx.add_layer(&buffer, BufferSpec::default());
    fx.engine.script().hardware.insert(id);
    fx.frame().unwrap();
    assert_eq!(fx.composition(id), Composition::Device);

    fx.session.set_layer_z_order(id, 3).unwrap();
    fx.engine.script().prepare_results.push_back(EngineError::Permission);
    fx.sink.take();
    fx.set_client_target();
    let result = fx.session.validate().unwrap();
    assert_eq!(result.changed_types, 1);
    assert_eq!(fx.composition(id), Composition::Client);
    assert!(fx.sink.take().contains(&Notification::Refresh));
    fx.session.accept_changes().unwrap();
    fx.session.present().unwrap();

    // the geometry change of the refused frame is replayed once
    fx.set_client_target();
    fx.session.validate().unwrap();
    assert!(fx
        .engine
        .script()
        .last_stack
        .as_ref()
        .unwrap()
        .flags
        .contains(StackFlags::GEOMETRY_CHANGED));
    fx.session.accept_changes().unwrap();
    fx.session.present().unwrap();

    fx.set_client_target();
    fx.session.validate().unwrap();
    assert!(!fx
        .engine
        .script()
        .last_stack
        .as_ref()
        .unwrap()
        .flags
        .contains(StackFlags::GEOMETRY_CHANGED));
}

#[test]
fn prepare_failures_are_reported_with_a_refresh() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(1);
    fx.add_layer(&buffer, BufferSpec::default());
    fx.set_client_target();

    fx.engine.script().prepare_results.push_back(EngineError::Resources);
    assert!(matches!(fx.session.validate(), Err(SessionError::NoResources)));
    assert_eq!(fx.sink.refreshes(), 1);

    fx.engine.script().prepare_results.push_back(EngineError::Undefined);
    assert!(matches!(
        fx.session.validate(),
        Err(SessionError::Engine(EngineError::Undefined))
    ));
    assert_eq!(fx.sink.refreshes(), 2);
    assert!(!fx.session.is_shutdown());
}

#[test]
fn shutdown_turns_every_call_into_a_no_op() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(1);
    let id = fx.add_layer(&buffer, BufferSpec::default());
    fx.set_client_target();

    fx.engine.script().prepare_results.push_back(EngineError::Shutdown);
    fx.session.validate().unwrap();
    assert!(fx.session.is_shutdown());

    assert!(fx.session.present().unwrap().is_none());
    assert_eq!(fx.session.validate().unwrap().changed_types, 0);
    fx.session
        .set_power_mode(hwcomposer::engine::PowerMode::Off, false)
        .unwrap();
    fx.session.destroy_layer(id).unwrap();
    assert!(fx.session.layer(id).is_some());
    fx.session.set_active_config(1).unwrap();
    let timeline = fx
        .session
        .set_active_config_with_constraints(
            2,
            VsyncPeriodChangeConstraints {
                desired_time: fx.clock.now(),
                seamless_required: false,
            },
        )
        .unwrap();
    assert_eq!(timeline, VsyncPeriodChangeTimeline::default());
    assert_eq!(fx.session.active_config(), 0);
    assert!(fx.engine.script().mode_switches.is_empty());
    assert_eq!(fx.engine.script().prepares, 1);
    assert_eq!(fx.engine.script().commits, 0);
    assert_eq!(fx.sink.refreshes(), 0);
}

#[test]
fn failed_commit_flushes_and_drops_release_fences() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(1);
    fx.add_layer(&buffer, BufferSpec::default());
    fx.frame().unwrap();
    assert_eq!(fx.session.release_fences().len(), 1);

    fx.engine.script().commit_results.push_back(EngineError::Undefined);
    fx.set_client_target();
    fx.session.validate().unwrap();
    fx.session.accept_changes().unwrap();
    assert!(matches!(
        fx.session.present(),
        Err(SessionError::Engine(EngineError::Undefined))
    ));
    assert_eq!(fx.engine.script().flushes, 1);
    assert!(fx.session.release_fences().is_empty());

    fx.frame().unwrap();
    assert_eq!(fx.engine.script().flushes, 1);
    assert_eq!(fx.session.release_fences().len(), 1);
}

#[test]
fn destroyed_layers_leave_the_stack() {
    let mut fx = Fixture::new();
    fx.power_on();
    let (first, second) = (TestBuffer::new(1), TestBuffer::new(2));
    let kept = fx.add_layer(&first, BufferSpec::default());
    let gone = fx.add_layer(&second, BufferSpec::default());
    fx.frame().unwrap();

    fx.session.destroy_layer(gone).unwrap();
    assert!(matches!(
        fx.session.destroy_layer(gone),
        Err(SessionError::BadLayer(id)) if id == gone
    ));
    assert!(matches!(fx.session.is_layer_updating(gone), Err(SessionError::BadLayer(_))));

    fx.set_client_target();
    fx.session.validate().unwrap();
    let script = fx.engine.script();
    let stack = script.last_stack.as_ref().unwrap();
    assert!(stack.layer(gone).is_none());
    assert!(stack.layer(kept).is_some());
    assert!(stack.flags.contains(StackFlags::GEOMETRY_CHANGED));
}

#[test]
fn commit_or_validate_commits_hardware_only_frames() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(1);
    let id = fx.add_layer(&buffer, BufferSpec::default());
    fx.engine.script().hardware.insert(id);
    fx.set_client_target();

    let outcome = fx.session.commit_or_validate(false).unwrap();
    assert!(outcome.committed);
    assert!(outcome.retire_fence.is_some());
    assert_eq!(fx.engine.script().commits, 1);

    let other = TestBuffer::new(2);
    fx.add_layer(&other, BufferSpec::default());
    fx.set_client_target();
    let outcome = fx.session.commit_or_validate(false).unwrap();
    assert!(!outcome.committed);
    assert_eq!(outcome.validation.changed_types, 1);
    fx.session.accept_changes().unwrap();
    fx.session.present().unwrap();
    assert_eq!(fx.engine.script().commits, 2);
}

#[test]
fn zero_swap_interval_hands_out_no_fences() {
    let config = SessionConfig {
        zero_swap_interval: true,
        ..SessionConfig::new(DisplayId(3), DisplayKind::Builtin)
    };
    let mut fx = Fixture::with_config(config);
    fx.power_on();
    let buffer = TestBuffer::new(1);
    fx.add_layer(&buffer, BufferSpec::default());

    assert!(fx.frame().is_none());
    assert!(fx.session.retire_fence().is_none());
    assert!(fx.session.release_fences().is_empty());
}

#[test]
fn front_buffer_layers_are_always_updating() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(1);
    let id = fx.add_layer(
        &buffer,
        BufferSpec {
            front_buffer: true,
            ..Default::default()
        },
    );
    fx.frame().unwrap();

    fx.set_client_target();
    fx.session.validate().unwrap();
    assert!(fx.session.is_layer_updating(id).unwrap());
    let script = fx.engine.script();
    assert!(script
        .last_stack
        .as_ref()
        .unwrap()
        .flags
        .contains(StackFlags::FRONT_BUFFER_PRESENT));
}
