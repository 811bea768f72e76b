use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the workspace tests
    Test,
    /// Push a generated image through the simulated peripheral
    Demo {
        /// Image size in bytes
        #[arg(long, default_value_t = 40_000)]
        size: usize,
        /// Peripheral asserts XOFF after this packet
        #[arg(long)]
        xoff_after: Option<u32>,
        /// Peripheral loses this packet once
        #[arg(long)]
        drop_packet: Option<u32>,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build"], "Build")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Tests")?;
        }
        Commands::Demo {
            size,
            xoff_after,
            drop_packet,
        } => {
            let image = PathBuf::from("target").join("demo_image.bin");
            std::fs::create_dir_all("target")?;
            let data: Vec<u8> = (0..*size).map(|i| (i % 251) as u8).collect();
            std::fs::write(&image, data)
                .with_context(|| format!("writing {}", image.display()))?;
            println!("Running demo with {} byte image...", size);

            let image = image.to_string_lossy().into_owned();
            let mut args = vec!["run", "-p", "fota-cli", "--", "update", image.as_str(), "--fast"];
            let xoff = xoff_after.map(|p| p.to_string());
            if let Some(p) = &xoff {
                args.extend(["--xoff-after", p.as_str()]);
            }
            let drop = drop_packet.map(|p| p.to_string());
            if let Some(p) = &drop {
                args.extend(["--drop-packet", p.as_str()]);
            }
            cargo(&args, "Demo")?;
        }
    }

    Ok(())
}
