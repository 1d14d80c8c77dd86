//! Arm command client
//!
//! One-shot operations: inspect the workspace, validate G-code files offline,
//! manage the trajectory store, and replay or home on the real arm.

use armctl::{check_program, ArmConfig, ArmService, GCodeParser, MotionController, WorkMode, WorkspaceLimits};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

#[derive(Parser)]
#[command(name = "arm-command")]
#[command(about = "Offline checks and one-shot operations for the G-code arm")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Show timing information
    #[arg(long, global = true)]
    timing: bool,

    /// Output format: text, json
    #[arg(long, default_value = "text", global = true)]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the reachable workspace
    Workspace,
    /// Validate a G-code file without connecting to the arm
    Check {
        file: PathBuf,
    },
    /// List stored trajectories
    Trajectories,
    /// Validate a G-code file and add it to the trajectory store
    Import {
        file: PathBuf,
        /// Store name, defaults to the file name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Connect, switch to automatic mode and replay a stored trajectory
    Run {
        name: String,
    },
    /// Connect and return to the home position
    Home,
}

impl Args {
    fn json(&self) -> bool {
        self.format == "json"
    }

    fn load_config(&self) -> Result<ArmConfig> {
        let path = self
            .config
            .clone()
            .or_else(|| std::env::var("ARMD_CONFIG").ok())
            .unwrap_or_else(|| "config/default_config.yaml".to_string());
        if Path::new(&path).exists() {
            ArmConfig::load_from_path(&path).with_context(|| format!("Failed to load configuration from {}", path))
        } else {
            Ok(ArmConfig::default())
        }
    }
}

fn print<T: Serialize>(args: &Args, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    if args.json() {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(if args.verbose { tracing::Level::DEBUG } else { tracing::Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    let config = args.load_config()?;
    let start = Instant::now();

    match &args.command {
        Commands::Workspace => execute_workspace_command(&args, &config)?,
        Commands::Check { file } => execute_check_command(&args, &config, file)?,
        Commands::Trajectories => execute_trajectories_command(&args, &config)?,
        Commands::Import { file, name } => execute_import_command(&args, &config, file, name.as_deref())?,
        Commands::Run { name } => execute_run_command(&args, config, name).await?,
        Commands::Home => execute_home_command(&args, config).await?,
    }

    if args.timing {
        eprintln!("Completed in {}ms", start.elapsed().as_millis());
    }
    Ok(())
}

fn execute_workspace_command(args: &Args, config: &ArmConfig) -> Result<()> {
    let limits = WorkspaceLimits::from_geometry(&config.workspace);
    print(args, &limits, |l| {
        println!("Radial reach: {:.3} .. {:.3} mm", l.r_min, l.r_max);
        println!("Height:       {:.3} .. {:.3} mm", l.z_min, l.z_max);
    })
}

fn execute_check_command(args: &Args, config: &ArmConfig, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let parser = GCodeParser::new()?;
    let limits = WorkspaceLimits::from_geometry(&config.workspace);
    let report = check_program(&text, &parser, &limits);

    print(args, &report, |r| {
        println!("{}: {} commands, {} moves", file.display(), r.commands, r.moves);
        for issue in &r.issues {
            println!("  line {}: {} ({})", issue.line, issue.text, issue.reason);
        }
        if r.is_clean() {
            println!("OK");
        }
    })?;

    if !report.is_clean() {
        anyhow::bail!("{} problem(s) found in {}", report.issues.len(), file.display());
    }
    Ok(())
}

fn execute_trajectories_command(args: &Args, config: &ArmConfig) -> Result<()> {
    let controller = MotionController::new(config.clone())?;
    let names = controller.store().list()?;
    print(args, &names, |names| {
        if names.is_empty() {
            println!("No trajectories in {}", controller.store().dir().display());
        }
        for name in names {
            println!("{}", name);
        }
    })
}

fn execute_import_command(args: &Args, config: &ArmConfig, file: &Path, name: Option<&str>) -> Result<()> {
    let controller = MotionController::new(config.clone())?;
    let name = match name {
        Some(name) => name.to_string(),
        None => file
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .context("Cannot derive a trajectory name from the file name, use --name")?,
    };
    let trajectory = controller.store().import(file, &name, controller.parser())?;
    info!("Imported {} as '{}'", file.display(), name);
    print(args, &serde_json::json!({ "name": name, "steps": trajectory.len() }), |_| {
        println!("Imported '{}' ({} steps)", name, trajectory.len());
    })
}

async fn execute_run_command(args: &Args, config: ArmConfig, name: &str) -> Result<()> {
    let service = ArmService::new(config)?;
    service.connect().await.context("Failed to connect to the arm")?;

    let trajectory = name.to_string();
    let result = service
        .run(move |c| {
            c.set_work_mode(WorkMode::Automatic)?;
            c.run_stored(&trajectory)
        })
        .await;
    service.disconnect().await.context("Failed to disconnect")?;

    let report = result.with_context(|| format!("Trajectory '{}' failed", name))?;
    print(args, &report, |r| {
        println!(
            "'{}': {} of {} commands executed, {} skipped",
            name, r.executed, r.total, r.skipped
        );
    })
}

async fn execute_home_command(args: &Args, config: ArmConfig) -> Result<()> {
    let service = ArmService::new(config)?;
    service.connect().await.context("Failed to connect to the arm")?;
    let result = service.run(|c| c.go_home()).await;
    let status = service.status().await;
    service.disconnect().await.context("Failed to disconnect")?;

    result.context("Homing failed")?;
    print(args, &status, |s| {
        println!("Arm homed at {}", s.state.current_position);
    })
}
