/*!
# KStat Backend

Measurement orchestration for the KStat electrochemical analyzer. Watches the
shared state document written by the control surface, drives the purge valve,
stirrer and profiler stage, and runs voltammetry measurements on the
potentiostat over its serial link.

## Usage

### Run against the instrument
```bash
kstat_backend --config kstat.toml
```

### Run against the simulated instrument
```bash
kstat_backend run --simulate
```

### Write a default configuration file
```bash
kstat_backend config --output kstat.toml
```
*/

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::sim::SimulatedDevice;
use shared::{Codec, DeviceLink, SerialLink};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod hardware;
mod orchestrator;
mod results;
mod scheduler;
mod state;
mod technique;

use config::{AppConfig, StateBackend};
use hardware::{LoggingMotorDriver, NullPositioner, Profiler};
use orchestrator::{JobContext, Orchestrator, OrchestratorSettings};
use scheduler::SystemClock;
use state::{Document, FileStore, MemoryStore, StateChannel, StateStore};

#[derive(Parser)]
#[command(name = "kstat_backend")]
#[command(about = "Measurement orchestration for the KStat electrochemical analyzer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "kstat.toml")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop
    Run {
        /// Use the simulated instrument and an in-memory state document
        #[arg(long)]
        simulate: bool,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "kstat.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Config { output }) => generate_config_file(&output),
        Some(Commands::Run { simulate }) => run(&cli.config, simulate),
        None => run(&cli.config, false),
    }
}

fn load_config(path: &Path) -> AppConfig {
    if !path.exists() {
        info!("No config at {}, using defaults", path.display());
        return AppConfig::new();
    }
    AppConfig::load_from_file(path).unwrap_or_else(|e| {
        warn!("⚠️ Failed to load config ({:#}), using defaults", e);
        AppConfig::new()
    })
}

fn open_store(config: &AppConfig, simulate: bool) -> Result<Arc<dyn StateStore>> {
    let seed = Document::with_defaults();
    if simulate || config.state.backend == StateBackend::Memory {
        info!("🗒️ Using in-memory state document");
        return Ok(Arc::new(MemoryStore::new(seed)));
    }

    let store = FileStore::open(&config.state.path, &seed)
        .with_context(|| format!("Failed to open state document: {}", config.state.path))?;
    info!("🗒️ State document: {}", store.path().display());
    Ok(Arc::new(store))
}

fn open_link(config: &AppConfig, simulate: bool) -> Result<Box<dyn DeviceLink>> {
    if simulate {
        info!("🧪 Using simulated KStat");
        return Ok(Box::new(SimulatedDevice::new().with_scans(1, 200)));
    }

    let device = &config.device;
    let port = if device.port.is_empty() {
        SerialLink::find_port("DStat")
            .context("Failed to list serial ports")?
            .context("No KStat board found; set device.port in the config")?
    } else {
        device.port.clone()
    };

    let link = SerialLink::open(&port, device.baud_rate, device.read_timeout())
        .with_context(|| format!("Failed to open serial port {}", port))?;
    info!("🔌 Connected to KStat on {} ({} baud)", port, device.baud_rate);
    Ok(Box::new(link))
}

fn run(config_path: &Path, simulate: bool) -> Result<()> {
    let config = load_config(config_path);
    info!("🚀 Starting KStat backend{}", if simulate { " (simulated)" } else { "" });

    let channel = StateChannel::new(open_store(&config, simulate)?, config.state.write_backoff());
    let link = open_link(&config, simulate)?;

    // No stage driver is built in; profiles run against a stage that only
    // tracks the commanded position
    let profiler = Profiler::new(Box::new(NullPositioner::new()), config.hardware.steps_per_mm);
    let ctx = JobContext {
        channel,
        codec: Codec::new(config.device.retry_policy()),
        clock: Arc::new(SystemClock::new()),
        profiler: Arc::new(Mutex::new(profiler)),
        working_directory: PathBuf::from(&config.storage.working_directory),
        slice: config.state.poll_interval(),
    };

    // Stand-in for the GPIO motor driver: purge and stir commands are logged
    // and remembered, nothing is switched
    if !simulate {
        warn!("⚠️ No motor driver available, purge valve and stirrer commands are only logged");
    }
    let motor = Arc::new(LoggingMotorDriver::new());

    let mut orchestrator = Orchestrator::new(ctx, OrchestratorSettings::from_config(&config), link, motor);
    if let Err(e) = orchestrator.initialize() {
        warn!("⚠️ Instrument initialization failed: {}", e);
    }

    // Set up Ctrl+C handler
    let running = orchestrator.get_running_flag();
    ctrlc::set_handler(move || {
        info!("🛑 Received Ctrl+C, shutting down gracefully...");
        running.store(false, Ordering::SeqCst);
    })?;

    orchestrator.run();

    info!("✅ KStat backend stopped");
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: &Path) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(output_path)?;

    info!("✅ Generated configuration file: {}", output_path.display());
    info!("📝 Edit the file to customize settings, then run:");
    info!("   kstat_backend --config {}", output_path.display());

    Ok(())
}
