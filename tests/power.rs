mod common;

use common::{BufferSpec, Fixture, TestBuffer};
use hwcomposer::{
    capture::dump::DisplayKind,
    config::SessionConfig,
    engine::{DisplayEvent, EngineError, PowerMode},
    notify::Notification,
    session::SessionError,
    utils::DisplayId,
};

#[test]
fn restricted_resources_keep_pluggable_displays_off() {
    let mut fx = Fixture::with_config(SessionConfig::new(DisplayId(1), DisplayKind::Pluggable));
    fx.session.restricted_resource_event(true);
    assert_eq!(fx.sink.refreshes(), 1);

    fx.session.set_power_mode(PowerMode::On, false).unwrap();
    assert_eq!(fx.session.power_mode(), PowerMode::Off);
    assert!(fx.engine.script().power_states.is_empty());

    fx.session.restricted_resource_event(false);
    fx.session.set_power_mode(PowerMode::On, false).unwrap();
    assert_eq!(fx.session.power_mode(), PowerMode::On);
}

#[test]
fn restricted_resources_leave_the_builtin_display_alone() {
    let mut fx = Fixture::new();
    fx.session.restricted_resource_event(true);
    fx.power_on();
    assert_eq!(fx.session.power_mode(), PowerMode::On);
    assert_eq!(fx.engine.script().power_states, vec![PowerMode::On]);
}

#[test]
fn power_transition_fence_releases_every_layer() {
    let mut fx = Fixture::new();
    let (first, second) = (TestBuffer::new(1), TestBuffer::new(2));
    let a = fx.add_layer(&first, BufferSpec::default());
    let b = fx.add_layer(&second, BufferSpec::default());

    fx.power_on();
    let mut released: Vec<_> = fx.session.release_fences().into_iter().map(|(id, _)| id).collect();
    released.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(released, expected);
    assert!(fx.session.release_fences().is_empty());
}

#[test]
fn failed_power_change_keeps_the_state() {
    let mut fx = Fixture::new();
    fx.engine.script().power_error = Some(EngineError::Undefined);
    assert!(matches!(
        fx.session.set_power_mode(PowerMode::On, false),
        Err(SessionError::Engine(EngineError::Undefined))
    ));
    assert_eq!(fx.session.power_mode(), PowerMode::Off);
}

#[test]
fn shutdown_during_a_power_change() {
    let mut fx = Fixture::new();
    fx.engine.script().power_error = Some(EngineError::Shutdown);
    fx.session.set_power_mode(PowerMode::On, false).unwrap();
    assert!(fx.session.is_shutdown());
    assert_eq!(fx.session.power_mode(), PowerMode::Off);

    fx.session.set_power_mode(PowerMode::On, false).unwrap();
    assert!(fx.engine.script().power_states.is_empty());
}

#[test]
fn doze_suspend_and_back() {
    let mut fx = Fixture::new();
    fx.power_on();
    fx.session.set_power_mode(PowerMode::DozeSuspend, false).unwrap();
    fx.session.set_power_mode(PowerMode::Doze, false).unwrap();
    fx.session.set_power_mode(PowerMode::Off, true).unwrap();
    assert_eq!(
        fx.engine.script().power_states,
        vec![PowerMode::On, PowerMode::DozeSuspend, PowerMode::Doze, PowerMode::Off]
    );
}

#[test]
fn vsync_can_be_toggled() {
    let mut fx = Fixture::new();
    assert!(!fx.session.is_vsync_enabled());
    fx.session.set_vsync_enabled(true).unwrap();
    assert!(fx.session.is_vsync_enabled());
    fx.session.set_vsync_enabled(false).unwrap();
    assert!(!fx.session.is_vsync_enabled());
}

#[test]
fn display_events_reach_the_client() {
    let mut fx = Fixture::new();
    fx.power_on();

    fx.session.handle_event(DisplayEvent::PanelDead);
    fx.session.handle_qsync_state(true, 120, 60);
    let events = fx.sink.take();
    assert!(events.contains(&Notification::PowerReset));
    assert!(events.contains(&Notification::QsyncChanged {
        enabled: true,
        refresh_rate: 120,
        qsync_refresh_rate: 60,
    }));

    fx.session.handle_event(DisplayEvent::PostIdleTimeout);
    assert!(fx.session.is_idle());
    // video mode panels do not report idleness
    assert!(!fx.sink.take().contains(&Notification::Idle(true)));
    let buffer = TestBuffer::new(1);
    fx.add_layer(&buffer, BufferSpec::default());
    fx.frame();
    assert!(!fx.session.is_idle());
}
