//! Portico CLI - launch the endpoints declared in a TOML file
//!
//! Validate endpoint files, list the available handlers and run every
//! declared server, client, UDP handler and MQTT instance until Ctrl+C.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use portico_engine::{builtin, Endpoint, EndpointRegistry, EndpointsConfig, LifecycleState};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portico - declarative TCP, UDP and MQTT endpoints
#[derive(Parser)]
#[command(name = "portico")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Endpoint file path
    #[arg(
        short,
        long,
        global = true,
        env = "PORTICO_CONFIG",
        default_value = "endpoints.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the endpoints and run until Ctrl+C
    Run {
        /// Only launch these endpoint ids
        #[arg(long)]
        only: Vec<String>,

        /// Exit with an error if any endpoint is broken or rejected
        #[arg(long)]
        strict: bool,
    },

    /// Parse and validate the endpoint file without touching the network
    Check,

    /// List the handler identities endpoints can refer to
    Handlers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs)?;

    match cli.command {
        Commands::Run { only, strict } => run(&cli.config, &only, strict).await?,
        Commands::Check => check(&cli.config)?,
        Commands::Handlers => print_handlers(),
    }

    Ok(())
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to parse log level")?;

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact())
            .init();
    }

    Ok(())
}

fn load(path: &Path) -> Result<EndpointsConfig> {
    EndpointsConfig::from_file(path)
        .with_context(|| format!("Failed to load endpoint file {}", path.display()))
}

/// Keep only the endpoints named in `only`; an empty list keeps everything
fn restrict(config: &mut EndpointsConfig, only: &[String]) -> Result<()> {
    if only.is_empty() {
        return Ok(());
    }

    let wanted: BTreeSet<&str> = only.iter().map(String::as_str).collect();
    let mut found = BTreeSet::new();
    config.servers.retain(|id, _| keep(&wanted, &mut found, id));
    config.clients.retain(|id, _| keep(&wanted, &mut found, id));
    config.udp_handlers.retain(|id, _| keep(&wanted, &mut found, id));
    config.mqtt.retain(|id, _| keep(&wanted, &mut found, id));

    let missing: Vec<&str> = wanted.difference(&found).copied().collect();
    if !missing.is_empty() {
        bail!("Unknown endpoint id(s): {}", missing.join(", "));
    }
    Ok(())
}

fn keep<'a>(wanted: &BTreeSet<&'a str>, found: &mut BTreeSet<&'a str>, id: &str) -> bool {
    match wanted.get(id) {
        Some(w) => {
            found.insert(*w);
            true
        }
        None => false,
    }
}

async fn run(path: &Path, only: &[String], strict: bool) -> Result<()> {
    let mut config = load(path)?;
    restrict(&mut config, only)?;
    if config.is_empty() {
        println!("{}", "No endpoints declared".yellow());
        return Ok(());
    }

    let registry = EndpointRegistry::new(Arc::new(builtin::catalog()));
    registry.register_config(config)?;

    println!(
        "{} Launching endpoints from {}",
        "PORTICO".cyan().bold(),
        path.display()
    );
    let report = registry.launch_all().await;

    for endpoint in registry.endpoints() {
        let state = match endpoint.state() {
            LifecycleState::Running => "RUNNING".green().bold(),
            LifecycleState::Broken => "BROKEN".red().bold(),
            other => other.to_string().as_str().yellow(),
        };
        println!("  {:<8} {}:{}", state, endpoint.kind(), endpoint.id());
    }
    for label in &report.rejected {
        println!("  {:<8} {}", "REJECTED".red(), label);
    }
    println!("{} {}", "OK".green().bold(), report);

    if strict && !report.is_clean() {
        registry.shutdown_all().await;
        bail!("{} endpoint(s) failed to launch", report.broken.len() + report.rejected.len());
    }

    println!("  Press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;
    info!("Received shutdown signal");

    registry.shutdown_all().await;
    println!("{}", "Endpoints stopped".yellow());

    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let config = load(path)?;
    let registry = EndpointRegistry::new(Arc::new(builtin::catalog()));

    let counts = [
        ("server", config.servers.len()),
        ("client", config.clients.len()),
        ("udp", config.udp_handlers.len()),
        ("mqtt", config.mqtt.len()),
    ];
    registry
        .register_config(config)
        .with_context(|| format!("{} is invalid", path.display()))?;

    println!("{} {} is valid", "OK".green().bold(), path.display());
    for (kind, count) in counts {
        println!("  {:<7} {}", kind, count);
    }

    Ok(())
}

fn print_handlers() {
    println!("{}", "Available handlers".cyan().bold());
    for identity in builtin::catalog().identities() {
        println!("  {}", identity.as_str().green());
    }
}
