//! End-to-end polling scenarios against simulated devices.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use buspoll_hal::{FaultPlan, ReadLog, Registry, SimConnector, Waveform, Widget};
use buspoll_middleware::{EventBus, Topic};
use buspoll_runtime::{
    Orchestrator, OrchestratorConfig, PortScheduler, RestartPolicy, SchedulerConfig,
    SupervisionAction,
};
use buspoll_types::{ErrorClass, EventPayload, PollError, PortState, WidgetMeta};

fn meta(name: &str, port: &str) -> WidgetMeta {
    WidgetMeta {
        device_type: "sim".to_string(),
        name: name.to_string(),
        port_name: port.to_string(),
        ..WidgetMeta::default()
    }
}

fn logged(log: &ReadLog) -> SimConnector {
    SimConnector::new(Waveform::Ramp {
        start: 20.0,
        step: 0.5,
    })
    .with_log(log.clone())
}

fn config(period: Duration) -> OrchestratorConfig {
    OrchestratorConfig {
        scheduler: SchedulerConfig {
            sampling_period: period,
            ..SchedulerConfig::default()
        },
        restart_policy: RestartPolicy::Never,
        shutdown_timeout: Duration::from_secs(2),
    }
}

fn attach(registry: &mut Registry, name: &str, port: &str, connector: SimConnector) {
    registry
        .register_and_attach(Widget::new(meta(name, port), Arc::new(connector)))
        .unwrap();
}

#[test]
fn two_ports_sample_every_widget_in_attach_order() {
    let log = ReadLog::new();
    let mut registry = Registry::new();
    attach(&mut registry, "w1", "A", logged(&log));
    attach(&mut registry, "w2", "A", logged(&log));
    attach(&mut registry, "w3", "B", logged(&log));

    let period = Duration::from_millis(100);
    let mut orch = Orchestrator::new(registry, EventBus::default(), config(period));
    orch.initialize_all();
    assert_eq!(orch.start_schedulers().unwrap(), 2);

    thread::sleep(period);
    let report = orch.shutdown(Duration::from_secs(2));
    assert!(report.is_clean());

    for name in ["w1", "w2", "w3"] {
        assert!(log.successes(name) >= 1, "{name} was never sampled");
    }
    // Cancellation is only observed between cycles, so every A cycle is whole.
    let on_a = log.names_on_port("A");
    assert_eq!(on_a.len() % 2, 0);
    for cycle in on_a.chunks(2) {
        assert_eq!(cycle, ["w1", "w2"]);
    }
}

#[test]
fn always_failing_widget_does_not_starve_its_neighbour() {
    let log = ReadLog::new();
    let mut registry = Registry::new();
    attach(&mut registry, "w1", "A", logged(&log));
    attach(
        &mut registry,
        "w2",
        "A",
        logged(&log).with_faults(FaultPlan::Always(ErrorClass::Transient)),
    );
    registry.broadcast(buspoll_hal::WidgetCommand::InitializeSlave);

    let status = Arc::new(buspoll_kernel::StatusBoard::new());
    let mut scheduler = PortScheduler::new(
        "A",
        &registry,
        EventBus::default(),
        status.clone(),
        SchedulerConfig::default(),
    );

    let started = Instant::now();
    for _ in 0..3 {
        scheduler.run_cycle(started).unwrap();
    }

    assert_eq!(log.successes("w1"), 3);
    assert_eq!(log.successes("w2"), 0);
    assert_eq!(log.attempts("w2"), 3);
    assert!(status.is_alive("A"));
    assert_eq!(status.cycles("A"), 3);

    let snapshot = status.snapshot();
    let w2 = snapshot.widgets.iter().find(|w| w.name == "w2").unwrap();
    assert!(!w2.healthy);
    assert_eq!(w2.consecutive_failures, 3);
}

#[test]
fn always_failing_widget_keeps_threaded_scheduler_alive() {
    let log = ReadLog::new();
    let mut registry = Registry::new();
    attach(&mut registry, "w1", "A", logged(&log));
    attach(
        &mut registry,
        "w2",
        "A",
        logged(&log).with_faults(FaultPlan::Always(ErrorClass::Transient)),
    );

    let mut orch = Orchestrator::new(
        registry,
        EventBus::default(),
        config(Duration::from_millis(10)),
    );
    orch.initialize_all();
    orch.start_schedulers().unwrap();

    let status = orch.status();
    let deadline = Instant::now() + Duration::from_secs(5);
    while status.cycles("A") < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    assert!(status.cycles("A") >= 3);
    assert_eq!(orch.running_ports(), ["A"]);
    assert_eq!(log.successes("w2"), 0);
    assert_eq!(status.port_state("A"), Some(PortState::Degraded));
    assert_eq!(orch.status_snapshot().headline(), "degraded(A)");
    orch.shutdown(Duration::from_secs(2));
}

#[test]
fn slow_port_does_not_delay_fast_port() {
    let log = ReadLog::new();
    let mut registry = Registry::new();
    attach(
        &mut registry,
        "slow",
        "A",
        logged(&log).with_latency(Duration::from_millis(300)),
    );
    attach(&mut registry, "fast", "B", logged(&log));

    let mut orch = Orchestrator::new(
        registry,
        EventBus::default(),
        config(Duration::from_millis(50)),
    );
    orch.initialize_all();
    orch.start_schedulers().unwrap();
    thread::sleep(Duration::from_millis(500));

    let status = orch.status();
    let slow_cycles = status.cycles("A");
    let fast_cycles = status.cycles("B");
    orch.shutdown(Duration::from_secs(2));

    assert!(slow_cycles <= 2, "slow port ran {slow_cycles} cycles");
    assert!(fast_cycles >= 4, "fast port only ran {fast_cycles} cycles");
}

#[test]
fn repeated_setup_broadcast_opens_each_connection_once() {
    let c1 = Arc::new(SimConnector::new(Waveform::Constant(1.0)));
    let c2 = Arc::new(SimConnector::new(Waveform::Constant(2.0)));
    let mut registry = Registry::new();
    registry
        .register_and_attach(Widget::new(meta("w1", "A"), c1.clone()))
        .unwrap();
    registry
        .register_and_attach(Widget::new(meta("w2", "B"), c2.clone()))
        .unwrap();

    registry.broadcast(buspoll_hal::WidgetCommand::InitializeSlave);
    let mut orch = Orchestrator::new(registry, EventBus::default(), config(Duration::from_millis(50)));
    let report = orch.initialize_all();
    orch.initialize_all();

    assert_eq!(report.opened, 0, "connections were already open");
    assert_eq!(c1.open_count(), 1);
    assert_eq!(c2.open_count(), 1);
}

#[test]
fn widget_without_connection_is_never_read() {
    let log = ReadLog::new();
    let mut registry = Registry::new();
    attach(&mut registry, "ok", "A", logged(&log));
    attach(
        &mut registry,
        "unplugged",
        "A",
        logged(&log).failing_open("no such device"),
    );

    let mut orch = Orchestrator::new(
        registry,
        EventBus::default(),
        config(Duration::from_millis(10)),
    );
    let report = orch.initialize_all();
    assert_eq!(report.opened, 1);
    assert!(matches!(
        report.failed.as_slice(),
        [(_, PollError::Connection { .. })]
    ));

    orch.start_schedulers().unwrap();
    thread::sleep(Duration::from_millis(80));
    orch.shutdown(Duration::from_secs(2));

    assert!(log.successes("ok") >= 2);
    assert_eq!(log.attempts("unplugged"), 0);
}

#[test]
fn fatal_port_fails_alone_and_is_restarted() {
    let log = ReadLog::new();
    let mut registry = Registry::new();
    attach(
        &mut registry,
        "doomed",
        "A",
        logged(&log).with_faults(FaultPlan::FirstN(1, ErrorClass::Fatal)),
    );
    attach(&mut registry, "steady", "B", logged(&log));

    let mut cfg = config(Duration::from_millis(10));
    cfg.restart_policy = RestartPolicy::OnFailure { max_restarts: 2 };
    let mut orch = Orchestrator::new(registry, EventBus::default(), cfg);
    let mut lifecycle = orch.bus().subscribe_to(Topic::Lifecycle);
    orch.initialize_all();
    orch.start_schedulers().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while orch.running_ports() != ["B"] && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(orch.running_ports(), ["B"]);

    let actions = orch.supervise();
    assert!(actions.contains(&SupervisionAction::Restarted {
        port: "A".to_string(),
        attempt: 1
    }));
    assert_eq!(orch.running_ports(), ["A", "B"]);

    // The connection survives the restart; the fault plan has run its course.
    thread::sleep(Duration::from_millis(50));
    let report = orch.shutdown(Duration::from_secs(2));
    assert!(report.is_clean());
    assert!(log.successes("doomed") >= 1);
    assert!(log.successes("steady") >= 3);

    let mut exits = Vec::new();
    while let Ok(event) = lifecycle.try_recv() {
        if let EventPayload::SchedulerExited { port, reason } = event.payload {
            exits.push((port, reason));
        }
    }
    assert!(
        exits
            .iter()
            .any(|(port, reason)| port == "A" && reason.contains("device loss"))
    );
}

#[test]
fn shutdown_interrupts_long_pacing_waits() {
    let log = ReadLog::new();
    let mut registry = Registry::new();
    attach(&mut registry, "w1", "A", logged(&log));
    attach(&mut registry, "w2", "B", logged(&log));

    let mut orch = Orchestrator::new(registry, EventBus::default(), config(Duration::from_secs(30)));
    orch.initialize_all();
    orch.start_schedulers().unwrap();
    thread::sleep(Duration::from_millis(50));

    let asked = Instant::now();
    let report = orch.shutdown(Duration::from_secs(2));
    assert!(asked.elapsed() < Duration::from_secs(1));
    assert_eq!(report.stopped, ["A", "B"]);

    let snapshot = orch.status_snapshot();
    assert!(
        snapshot
            .ports
            .iter()
            .all(|p| p.state == PortState::Stopped)
    );
}

#[test]
fn shutdown_detaches_workers_stuck_in_a_read() {
    let log = ReadLog::new();
    let mut registry = Registry::new();
    attach(
        &mut registry,
        "stuck",
        "A",
        logged(&log).with_latency(Duration::from_millis(800)),
    );

    let mut orch = Orchestrator::new(registry, EventBus::default(), config(Duration::from_millis(10)));
    orch.initialize_all();
    orch.start_schedulers().unwrap();
    thread::sleep(Duration::from_millis(50));

    let report = orch.shutdown(Duration::from_millis(50));
    assert_eq!(report.timed_out, ["A"]);
    assert!(!report.is_clean());
}

#[test]
fn samples_reach_bus_subscribers() {
    let log = ReadLog::new();
    let mut registry = Registry::new();
    attach(&mut registry, "w1", "A", logged(&log));

    let bus = EventBus::default();
    let mut samples = bus.subscribe_to(Topic::Samples);
    let mut orch = Orchestrator::new(registry, bus, config(Duration::from_millis(10)));
    orch.initialize_all();
    orch.start_schedulers().unwrap();
    thread::sleep(Duration::from_millis(60));
    orch.shutdown(Duration::from_secs(2));

    let mut values = Vec::new();
    while let Ok(event) = samples.try_recv() {
        if let EventPayload::Sample(sample) = event.payload {
            assert_eq!(sample.port, "A");
            assert_eq!(sample.unit, "[C]");
            values.push(sample.value);
        }
    }
    assert!(values.len() >= 2);
    assert!((values[0] - 20.0).abs() < f64::EPSILON);
    assert!((values[1] - 20.5).abs() < f64::EPSILON);
}
