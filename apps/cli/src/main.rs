use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fota_core::transport::{PeripheralBehavior, SimulatedConnector, SimulatedPeripheral};
use fota_core::{FirmwareImage, FirmwareUpdater, SessionConfig, UpdateOutcome};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "BLE FOTA update client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push a firmware image to the simulated peripheral
    Update(UpdateArgs),
    /// Print the default session configuration as TOML
    Config {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct UpdateArgs {
    /// Path to the firmware image
    image: PathBuf,

    /// Session configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Advertised name of the target device
    #[arg(long)]
    device_name: Option<String>,

    /// Payload bytes per fragment
    #[arg(long)]
    fragment_size: Option<usize>,

    /// Use short timeouts and no pacing
    #[arg(long)]
    fast: bool,

    /// Peripheral asserts XOFF after this packet
    #[arg(long)]
    xoff_after: Option<u32>,

    /// Peripheral loses this packet once
    #[arg(long)]
    drop_packet: Option<u32>,

    /// Revision the peripheral reports after the update
    #[arg(long, default_value = "1.1.0")]
    new_revision: String,
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = match cli.command {
        Command::Update(args) => update(args),
        Command::Config { output } => dump_config(output),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn session_config(args: &UpdateArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None if args.fast => SessionConfig::fast(),
        None => SessionConfig::default(),
    };
    if let Some(name) = &args.device_name {
        config.device_name = name.clone();
    }
    if let Some(size) = args.fragment_size {
        config.fragment_size = size;
    }
    config.validate()?;
    Ok(config)
}

fn update(args: UpdateArgs) -> Result<()> {
    let config = session_config(&args)?;
    let image = FirmwareImage::load(&args.image)
        .with_context(|| format!("reading {}", args.image.display()))?;

    let behavior = PeripheralBehavior {
        name: config.device_name.clone(),
        fragment_size: config.fragment_size,
        updated_revision: args.new_revision.clone(),
        xoff_after: args.xoff_after,
        pause: Duration::from_millis(config.status_timeout_ms.min(500)),
        drop_packet: args.drop_packet,
        ..PeripheralBehavior::default()
    };
    info!(device = %behavior.name, "Starting FOTA against simulated peripheral");

    let connector = SimulatedConnector::new(SimulatedPeripheral::new(behavior));
    let mut updater = FirmwareUpdater::new(connector, config);
    let report = updater.run(&image)?;

    match &report.outcome {
        UpdateOutcome::Applied { before, after } => {
            println!("Update successful: {before} -> {after} ({} bytes)", report.bytes);
        }
        UpdateOutcome::Unchanged(identity) => {
            println!("Update unsuccessful: firmware still at {identity}");
        }
    }
    Ok(())
}

fn dump_config(output: Option<PathBuf>) -> Result<()> {
    let config = SessionConfig::default();
    match output {
        Some(path) => {
            config.save_to_file(&path)?;
            info!(path = %path.display(), "Configuration written");
        }
        None => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}
