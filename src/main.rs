use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

mod config;
mod engine;
mod platform;

use config::EngineConfig;
use engine::usage::format_hours_minutes;
use engine::{Engine, EngineEvent};
use platform::{DesktopSurface, FileStatusMirror};

/// Kid Guard agent
///
/// Enforces parent-configured screen-time limits, sleep and quiet-time
/// schedules, app blocking and idle timeouts while child mode is active.
#[derive(Parser, Debug)]
#[command(name = "kid-guard")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent in the foreground
    Start,
    /// Show usage counters and the current settings snapshot
    Status,
    /// Write an example configuration file
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Start => cmd_start(args.config, args.verbose),
        Commands::Status => cmd_status(args.config),
        Commands::Init { force } => cmd_init(args.config, force),
    }
}

/// Initialize logging
fn init_logging(level: &str, verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { level };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => config::get_config_path(),
    }
}

fn load_or_default_config(explicit: Option<PathBuf>) -> Result<EngineConfig> {
    let path = resolve_config_path(explicit)?;
    if path.exists() {
        config::load_config(&path)
    } else {
        Ok(EngineConfig::default())
    }
}

/// Run the agent in the foreground
fn cmd_start(config_path: Option<PathBuf>, verbose: bool) -> Result<()> {
    let cfg = load_or_default_config(config_path)?;
    init_logging(&cfg.logging.level, verbose);

    tracing::info!("Kid Guard agent v{}", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let surface = Arc::new(DesktopSurface::new(cfg.paths.overlay_path()?));
        let mirror = Arc::new(FileStatusMirror::new(cfg.paths.status_path()?));
        let engine = Engine::new(cfg, surface, mirror)?;

        let (tx, rx) = mpsc::channel(64);

        // Host integrations deliver events as lines on stdin.
        tokio::spawn(read_events(tx.clone()));

        let shutdown_tx = tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(EngineEvent::Shutdown).await;
            }
        });

        engine.run(rx).await
    })
}

/// Parse the line protocol from stdin into engine events.
///
/// Recognized lines:
///   foreground <package>   foreground app changed
///   interaction            user touched the device
///   unlock                 local unlock escape hatch
///   settings               settings file changed, poll it now
///   quit                   stop the agent
async fn read_events(tx: mpsc::Sender<EngineEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Some(event) = parse_event_line(&line) else {
            if !line.trim().is_empty() {
                tracing::warn!("Ignoring unrecognized event line: {}", line.trim());
            }
            continue;
        };

        let stop = matches!(event, EngineEvent::Shutdown);
        if tx.send(event).await.is_err() || stop {
            break;
        }
    }
}

fn parse_event_line(line: &str) -> Option<EngineEvent> {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        Some(("foreground", package)) if !package.trim().is_empty() => {
            Some(EngineEvent::ForegroundApp(package.trim().to_string()))
        }
        None if line == "interaction" => Some(EngineEvent::UserInteraction),
        None if line == "unlock" => Some(EngineEvent::UnlockRequested),
        None if line == "settings" => Some(EngineEvent::SettingsChanged),
        None if line == "quit" => Some(EngineEvent::Shutdown),
        _ => None,
    }
}

/// Show usage counters and the current settings snapshot
fn cmd_status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = load_or_default_config(config_path)?;

    println!("Kid Guard Agent Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let settings = engine::settings::load_settings(&cfg.paths.settings_path()?)
        .context("Failed to load settings")?;

    println!(
        "Child mode:    {}",
        if settings.is_child_mode_active { "active" } else { "inactive" }
    );

    if settings.daily_time_limit > 0 {
        println!(
            "Daily limit:   {}",
            format_hours_minutes(settings.daily_time_limit)
        );
    } else {
        println!("Daily limit:   none");
    }

    if settings.sleep_schedule_enabled {
        println!(
            "Sleep window:  {:02}:{:02} - {:02}:{:02}",
            settings.bedtime_hour, settings.bedtime_minute, settings.wake_hour, settings.wake_minute
        );
    } else {
        println!("Sleep window:  disabled");
    }

    let enabled_quiet = settings.quiet_times.iter().filter(|p| p.enabled).count();
    println!(
        "Quiet times:   {} enabled ({} total)",
        enabled_quiet,
        settings.quiet_times.len()
    );

    if settings.screen_timeout_minutes > 0 {
        println!("Idle timeout:  {} minutes", settings.screen_timeout_minutes);
    } else {
        println!("Idle timeout:  disabled");
    }

    let blocklist = engine::blocklist::load_blocklist(&cfg.paths.blocklist_path()?)
        .unwrap_or_default();
    println!("Blocked apps:  {}", blocklist.len());

    let usage = engine::usage::UsageAccumulator::load(&cfg.paths.usage_path()?);
    let snapshot = usage.snapshot();
    println!();
    println!(
        "Screen time today: {}",
        format_hours_minutes(snapshot.screen_time_seconds)
    );
    if settings.daily_time_limit > 0 {
        let remaining = (settings.daily_time_limit - snapshot.limit_used_seconds).max(0);
        println!(
            "Used against limit: {} ({} remaining)",
            format_hours_minutes(snapshot.limit_used_seconds),
            format_hours_minutes(remaining)
        );
    }
    println!("Last reset:    {}", snapshot.last_reset_date);
    println!("Device id:     {}", snapshot.device_id);

    Ok(())
}

/// Write an example configuration file
fn cmd_init(config_path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = resolve_config_path(config_path)?;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }

    platform::common::atomic_write(&path, config::EXAMPLE_CONFIG.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    println!("✓ Configuration written to: {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Review and adjust the configuration");
    println!("  2. Start the agent:");
    println!("     kid-guard start");

    Ok(())
}
