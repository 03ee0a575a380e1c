//! `buspoll` – polls every configured widget, one thread per port, and
//! prints the readings until Ctrl-C.
//!
//! Usage: `buspoll [CONFIG]` (falls back to `$BUSPOLL_CONFIG`, then
//! `./buspoll.toml`, then built-in bench defaults).

mod config;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use colored::Colorize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use buspoll_middleware::EventBus;
use buspoll_runtime::{Orchestrator, SupervisionAction, init_tracing};
use buspoll_types::{Event, EventPayload, PortState};

use config::{Config, OutputMode};

/// How often the main thread runs supervision.
const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);
/// Granularity at which the main thread notices Ctrl-C.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

fn main() -> ExitCode {
    let path = config::config_path(std::env::args().nth(1));
    let cfg = match config::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(cfg.log_format);
    print_banner(&path, &cfg);

    let registry = match cfg.build_registry() {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "could not build widget registry");
            return ExitCode::FAILURE;
        }
    };

    for (port, ids) in registry.ports() {
        println!("  {} {} ({} widget(s))", "port:".dimmed(), port.cyan(), ids.len());
    }
    println!();

    let bus = EventBus::default();
    let printer = spawn_printer(&bus, cfg.output);
    let mut orch = Orchestrator::new(registry, bus, cfg.orchestrator_config());

    let init = orch.initialize_all();
    println!(
        "  {} {} connection(s) opened",
        "✓".green(),
        init.opened.to_string().bold()
    );
    for (widget, e) in &init.failed {
        println!("  {} widget {}: {}", "✗".red(), widget, e);
    }

    match orch.start_schedulers() {
        Ok(started) => println!(
            "  {} {} port scheduler(s) running: {}",
            "✓".green(),
            started.to_string().bold(),
            orch.running_ports().join(", ")
        ),
        Err(e) => {
            error!(error = %e, "could not start schedulers");
            orch.shutdown_default();
            return ExitCode::FAILURE;
        }
    }
    println!("  Press {} to stop.", "Ctrl-C".bold());
    println!();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping schedulers …".yellow().bold());
        shutdown_flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop the process externally");
    }

    supervise_until(&mut orch, &shutdown);

    let report = orch.shutdown_default();
    println!();
    println!("  {} stopped: {}", "•".cyan(), report.stopped.join(", "));
    for (port, reason) in &report.failed {
        println!("  {} failed: {} ({})", "•".red(), port, reason);
    }
    for port in &report.timed_out {
        println!("  {} detached (blocked in a read): {}", "•".yellow(), port);
    }
    println!(
        "  {} final status: {}",
        "•".cyan(),
        orch.status_snapshot().headline().bold()
    );

    // Detached workers still hold bus senders, so the printer would never
    // see the channel close.
    let clean = report.is_clean();
    drop(orch);
    if clean && printer.join().is_err() {
        warn!("event printer panicked");
    }

    if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Run supervision once per [`SUPERVISE_INTERVAL`] until Ctrl-C or until no
/// scheduler is left.
fn supervise_until(orch: &mut Orchestrator, shutdown: &AtomicBool) {
    let mut next = Instant::now() + SUPERVISE_INTERVAL;
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(SHUTDOWN_POLL);
        if Instant::now() < next {
            continue;
        }
        next = Instant::now() + SUPERVISE_INTERVAL;

        for action in orch.supervise() {
            match action {
                SupervisionAction::Restarted { port, attempt } => {
                    println!("  {} restarted {} (attempt {})", "↻".yellow(), port, attempt);
                }
                SupervisionAction::GaveUp { port, reason } => {
                    println!("  {} gave up on {}: {}", "✗".red(), port, reason);
                }
                SupervisionAction::Exited { port } => info!(port = %port, "scheduler exited"),
                SupervisionAction::Stalled { .. } => {}
            }
        }
        if orch.running_ports().is_empty() {
            warn!("no port scheduler left running");
            break;
        }
    }
}

/// Print every bus event on a plain thread until the bus closes.
fn spawn_printer(bus: &EventBus, output: OutputMode) -> thread::JoinHandle<()> {
    let mut rx = bus.subscribe();
    thread::spawn(move || {
        loop {
            match rx.blocking_recv() {
                Ok(event) => print_event(&event, output),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(dropped = n, "printer fell behind; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(event: &Event, output: OutputMode) {
    if output == OutputMode::Json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to serialise event"),
        }
        return;
    }

    let time = event.timestamp.format("%H:%M:%S%.3f").to_string().dimmed();
    match &event.payload {
        EventPayload::Sample(s) => println!(
            "{} {:<14} {:<10} {:>10.3} {}  (t+{:.1}s)",
            time,
            s.port.cyan(),
            s.name.bold(),
            s.value,
            s.unit,
            s.elapsed_secs
        ),
        EventPayload::SampleFailed {
            port,
            class,
            message,
            ..
        } => println!(
            "{} {:<14} {} {}",
            time,
            port.cyan(),
            format!("[{class}]").yellow(),
            message
        ),
        EventPayload::HandlerFailed {
            port,
            handler,
            message,
            ..
        } => println!(
            "{} {:<14} {} {}",
            time,
            port.cyan(),
            format!("[handler #{handler}]").yellow(),
            message
        ),
        EventPayload::WidgetDegraded {
            widget,
            port,
            consecutive_failures,
        } => println!(
            "{} {:<14} {} widget {} after {} failures",
            time,
            port.cyan(),
            "[escalated]".red().bold(),
            widget,
            consecutive_failures
        ),
        EventPayload::PortStateChanged { port, state } => {
            let label = state.to_string();
            let label = match state {
                PortState::Failed => label.red().bold(),
                PortState::Degraded => label.yellow().bold(),
                PortState::Sampling => label.green().bold(),
                PortState::Idle | PortState::Stopped => label.normal(),
            };
            println!("{} {:<14} port {}", time, port.cyan(), label);
        }
        EventPayload::SchedulerExited { port, reason } => println!(
            "{} {:<14} scheduler exited: {}",
            time,
            port.cyan(),
            reason
        ),
    }
}

fn print_banner(path: &Path, cfg: &Config) {
    println!();
    println!("{}", r#"   __                        ____"#.bold().cyan());
    println!("{}", r#"  / /  __ _____ ___  ___  / / /"#.bold().cyan());
    println!("{}", r#" / _ \/ // (_-</ _ \/ _ \/ / / "#.bold().cyan());
    println!("{}", r#"/_.__/\_,_/___/ .__/\___/_/_/  "#.bold().cyan());
    println!("{}", r#"             /_/               "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "buspoll".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    let source = if cfg.widgets.is_empty() {
        "bench defaults".to_string()
    } else {
        path.display().to_string()
    };
    println!("  {} {}", "config:".dimmed(), source);
    println!(
        "  {} {} ms, {} widget(s)",
        "period:".dimmed(),
        cfg.sampling_period_ms,
        cfg.effective_widgets().len()
    );
}
