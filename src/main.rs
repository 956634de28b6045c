use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use usbgadgetd::cable::{self, CableObserver};
use usbgadgetd::config::{DaemonConfig, ModeRegistry};
use usbgadgetd::control::{self, run_control_loop, ModeController};
use usbgadgetd::events::SignalBus;
use usbgadgetd::gadget::GadgetBackend;
use usbgadgetd::policy::DevicePolicy;
use usbgadgetd::system::HostSystem;

/// Log level for the daemon
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// usbgadgetd command line arguments
#[derive(Parser, Debug)]
#[command(name = "usbgadgetd")]
#[command(version, about = "USB gadget mode supervisor", long_about = None)]
struct CliArgs {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", default_value = "/etc/usbgadgetd/config.json")]
    config: PathBuf,

    /// Mode descriptor directory (overrides config)
    #[arg(short = 'm', long, value_name = "DIR")]
    modes_dir: Option<PathBuf>,

    /// Force developer mode regardless of configuration
    #[arg(short = 'r', long)]
    rescue: bool,

    /// Diagnostic boot: enter the first configured mode
    #[arg(short = 'D', long)]
    diag: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting usbgadgetd v{}", env!("CARGO_PKG_VERSION"));

    // Configuration; a missing file means defaults
    let config = match DaemonConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                "could not load {} ({}), using built-in defaults",
                args.config.display(),
                e
            );
            DaemonConfig::default()
        }
    };

    let modes_dir = args.modes_dir.unwrap_or_else(|| config.modes_dir.clone());
    let registry = Arc::new(ModeRegistry::from_dir(&modes_dir)?);
    tracing::info!(
        "loaded {} mode descriptors from {}",
        registry.len(),
        modes_dir.display()
    );

    let policy = DevicePolicy {
        rescue_mode: args.rescue,
        diag_mode: args.diag,
        // Export is permitted until the device-lock tracker reports otherwise
        device_unlocked: true,
        acting_dead: false,
        keep_developer_mode: config.policy.keep_developer_mode,
    };

    let system = Arc::new(HostSystem::new());

    // Backend selection is one-shot; no gadget support is fatal
    let backend = Arc::new(GadgetBackend::probe(&config.gadget, system.clone())?);
    if let Err(e) = backend.init_values() {
        tracing::warn!("gadget setup incomplete: {}", e);
    }

    // Power-supply discovery is required for operation
    let device = cable::discover(
        std::path::Path::new(cable::POWER_SUPPLY_CLASS),
        config.cable.device_path.as_deref(),
    )?;

    let signals = Arc::new(SignalBus::new());
    spawn_signal_logger(signals.clone());

    let (worker, completions, _worker_join) = control::worker::spawn(backend, registry.clone())?;

    let controller = ModeController::new(
        registry,
        config.settings.clone(),
        policy,
        config.policy.fallback_external.clone(),
        worker,
        signals.clone(),
    );
    controller.publish_configuration();

    let (event_tx, event_rx) = mpsc::channel(16);
    let (cable_tx, cable_rx) = mpsc::channel(16);
    // Held by the bus bridge; dropping it shuts the control loop down
    let (_request_tx, request_rx) = mpsc::channel::<control::ControlRequest>(16);

    // Seed the observer with the initial device state before live events
    event_tx
        .send(device.props.clone())
        .await
        .expect("observer channel open at startup");

    let _monitor_join = cable::monitor::spawn(
        config.cable.subsystem.clone(),
        device.name.clone(),
        event_tx,
        system,
    )?;

    tokio::spawn(CableObserver::new(cable_tx).run(event_rx));

    let control_loop = run_control_loop(controller, cable_rx, request_rx, completions);
    tokio::pin!(control_loop);

    tokio::select! {
        result = &mut control_loop => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    tracing::info!("usbgadgetd shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "usbgadgetd=error",
        LogLevel::Warn => "usbgadgetd=warn",
        LogLevel::Info => "usbgadgetd=info",
        LogLevel::Debug => "usbgadgetd=debug",
        LogLevel::Trace => "usbgadgetd=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Log every published signal; stands in for the bus bridge during
/// development and keeps the journal readable in production.
fn spawn_signal_logger(signals: Arc<SignalBus>) {
    let mut rx = signals.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(signal) => tracing::info!("signal {}: {:?}", signal.signal_name(), signal),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("signal logger lagged by {} signals", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
