//! Field calculation agent
//!
//! Loads the configuration, connects the register bus and runs the
//! calculation cycle until SIGINT or SIGTERM. SIGHUP reloads the
//! configuration from disk.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use fieldcalc::admin::AdminService;
use fieldcalc::calc::CalculationScheduler;
use fieldcalc::config::{config_path, YamlConfigStore};
use fieldcalc::console::ConsoleLog;
use fieldcalc::error::AgentError;
use fieldcalc::guard::{GuardTiming, SharedState, Workspace};
use fieldcalc::modbus::open_store;
use fieldcalc::shutdown::{ShutdownCoordinator, ShutdownSignal, SHUTDOWN_TIMEOUT_SECS};

/// Main entry point with a runtime sized for small controllers
///
/// - Two workers: one drives the scheduler and signals, one is spare
/// - Blocking pool runs cycles and administrative requests
/// - Stack size leaves room for nested expression evaluation
fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .max_blocking_threads(4)
        .thread_stack_size(256 * 1024)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => fatal(AgentError::Runtime(e)),
    };

    if let Err(e) = runtime.block_on(async_main()) {
        fatal(e);
    }
}

fn fatal(e: AgentError) -> ! {
    // tracing may not be initialized yet
    #[allow(clippy::print_stderr)]
    {
        eprintln!("Fatal error: {}", e);
    }
    std::process::exit(1);
}

async fn async_main() -> Result<(), AgentError> {
    let files = YamlConfigStore::new(config_path());
    let config = files.load_or_default().map_err(AgentError::Config)?;

    init_logging(&config.logging.level);

    info!("======================================");
    info!("  Field Calculation Agent v{}", env!("CARGO_PKG_VERSION"));
    info!("======================================");
    info!("Configuration: {}", files.path().display());
    info!(
        "  {} devices, {} registers, period {} ms, engine {}",
        config.devices.len(),
        config.register_count(),
        config.calculation.period_ms,
        if config.calculation.enabled { "enabled" } else { "disabled" }
    );

    let store = open_store(&config.bus).await.map_err(AgentError::Bus)?;

    let timing = GuardTiming::from(&config.guard);
    let manual_read_timeout = Duration::from_millis(config.guard.manual_read_timeout_ms);
    let period_ms = config.calculation.period_ms;

    let shared = Arc::new(SharedState::new(Workspace::new(config, store), timing));
    let console = Arc::new(ConsoleLog::new());
    let admin = Arc::new(AdminService::new(
        shared.clone(),
        Arc::new(files),
        console.clone(),
        manual_read_timeout,
    ));

    let (shutdown, reload) = setup_signal_handlers()?;

    let mut coordinator =
        ShutdownCoordinator::new(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS));

    let scheduler = CalculationScheduler::new(shared, console, period_ms);
    let stats = scheduler.stats();
    coordinator.spawn("calculation", scheduler.run());
    coordinator.spawn("reload", admin.serve_reload_requests(reload));

    info!("Agent running with {} tasks", coordinator.task_count());

    let mut shutdown = ShutdownSignal::new(shutdown);
    shutdown.wait().await;

    let summary = coordinator.shutdown().await;
    let stats = stats.lock().clone();
    info!(
        cycles = stats.total_cycles,
        max_cycle_ms = stats.max_cycle_ms,
        avg_cycle_ms = stats.avg_cycle_ms,
        overruns = stats.overrun_count,
        skipped = stats.skipped_cycles,
        statement_errors = stats.statement_errors,
        "Calculation statistics"
    );
    if summary.aborted > 0 || summary.panicked > 0 {
        warn!(
            aborted = summary.aborted,
            panicked = summary.panicked,
            "Some tasks did not stop cleanly"
        );
    }

    info!("Agent shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
///
/// `RUST_LOG` overrides the configured level.
fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Setup signal handlers
///
/// # Platform Support
/// - All platforms: Ctrl+C (SIGINT) shuts down
/// - Unix only: SIGTERM shuts down, SIGHUP reloads the configuration
fn setup_signal_handlers() -> Result<(watch::Receiver<bool>, mpsc::Receiver<()>), AgentError> {
    let (tx, rx) = watch::channel(false);
    let (reload_tx, reload_rx) = mpsc::channel(1);

    let tx_ctrlc = tx.clone();
    ctrlc::set_handler(move || {
        info!("SIGINT (Ctrl+C) received, initiating graceful shutdown...");
        let _ = tx_ctrlc.send(true);
    })
    .map_err(|e| AgentError::Signal(format!("failed to set Ctrl-C handler: {}", e)))?;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, initiating graceful shutdown...");
                        let _ = tx.send(true);
                        break;
                    }
                    _ = sighup.recv() => {
                        info!("SIGHUP received, reloading configuration");
                        if reload_tx.try_send(()).is_err() {
                            warn!("Reload already pending");
                        }
                    }
                }
            }
        });

        info!("Signal handlers registered: SIGINT, SIGTERM, SIGHUP");
    }

    #[cfg(not(unix))]
    {
        drop(reload_tx);
        warn!("Configuration reload on signal is not supported on this platform");
        info!("Signal handlers registered: SIGINT (Ctrl+C)");
    }

    Ok((rx, reload_rx))
}
