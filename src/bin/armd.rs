//! Arm daemon
//!
//! Connects to the arm, then executes commands from stdin:
//! - `@method args` lines are dispatch calls (`@help` lists them)
//! - every other line is sent as G-code
//! - results are printed as JSON lines on stdout, logs go to stderr

use armctl::{json_output, ArmConfig, ArmService, CommandRequest, CommandStream, ServerContext};
use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "armd")]
#[command(about = "G-code arm daemon - command stream with JSON results")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Serial device, overrides the configured one
    #[arg(short, long)]
    device: Option<String>,

    /// Start without connecting; send `@connect` later
    #[arg(long)]
    no_connect: bool,

    /// Log exchanges with the device
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("ARMD_CONFIG").ok())
            .unwrap_or_else(|| "config/default_config.yaml".to_string())
    }
}

fn load_config(args: &Args, path: &str) -> Result<ArmConfig> {
    let mut config = if std::path::Path::new(path).exists() {
        ArmConfig::load_from_path(path).with_context(|| format!("Failed to load configuration from {}", path))?
    } else {
        info!("No configuration at {}, using defaults", path);
        ArmConfig::default()
    };
    if let Some(device) = &args.device {
        config.serial.device = device.clone();
        config.serial.fallback_device = None;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.get_config_path();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    info!("G-code arm daemon");
    info!("{}", "=".repeat(50));
    info!("Using config: {}", config_path);

    let config = load_config(&args, &config_path)?;
    let service = ArmService::new(config).context("Failed to create arm service")?;
    let mut stream = CommandStream::new(ServerContext::new(service));

    if !args.no_connect {
        let response = stream.context_mut().handle(CommandRequest::new("connect", Value::Null)).await;
        json_output::output::response(&response);
        if !response.success {
            error!("Arm connection failed: {}", response.message);
            error!("Make sure:");
            error!("   - The arm controller is powered and plugged in");
            error!("   - The serial device path is correct (see --device)");
            error!("   - No other program holds the port");
            anyhow::bail!("connect failed: {}", response.message);
        }
        info!("Arm ready for commands!");
    }
    json_output::output::ready("accepting commands on stdin");

    if let Err(e) = stream.run().await {
        error!("Command stream error: {}", e);
    }

    info!("Performing graceful shutdown");
    stream.shutdown().await.context("Failed during shutdown")?;
    info!("Shutdown complete");
    Ok(())
}
