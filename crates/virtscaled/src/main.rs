use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use virtscale_fleet::{Config, FleetSnapshot, LifecycleState};
use virtscale_hypervisor::VirshHypervisor;
use virtscaled::client::ControlClient;
use virtscaled::{daemon, pidfile};

/// Config file consulted when `--config` is not given.
const DEFAULT_CONFIG_PATH: &str = "/etc/virtscale/config.toml";

#[derive(Parser)]
#[command(
    name = "virtscaled",
    about = "virtscale — VM fleet scaling daemon",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground: rebuild the fleet from the
    /// hypervisor and enter the reconciliation loop.
    Start,
    /// Signal the running daemon to shut down and wait for it to exit.
    Stop {
        /// Longest time to wait for the daemon to exit.
        #[arg(long, default_value = "30")]
        wait_secs: u64,
    },
    /// Set the desired replica count.
    Scale {
        /// Target number of instances.
        #[arg(allow_negative_numbers = true)]
        count: i64,
    },
    /// Print the fleet snapshot.
    State {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,virtscale=debug,virtscaled=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Start => {
            let hv = Arc::new(VirshHypervisor::new(config.hypervisor.uri.clone()));
            daemon::run(hv, config).await
        }
        Commands::Stop { wait_secs } => stop(&config, wait_secs).await,
        Commands::Scale { count } => {
            let count = u32::try_from(count).map_err(|_| {
                anyhow::anyhow!("invalid argument: replica count must be >= 0, got {count}")
            })?;
            let client = ControlClient::new(config.control.listen)?;
            client.scale(count).await?;
            println!("desired count set to {count}");
            Ok(())
        }
        Commands::State { format } => state(&config, &format).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("failed to load {}", path.display()))
        }
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Config::load(default)
                    .with_context(|| format!("failed to load {DEFAULT_CONFIG_PATH}"))
            } else {
                Ok(Config::default())
            }
        }
    }
}

async fn stop(config: &Config, wait_secs: u64) -> anyhow::Result<()> {
    let pid_path = pidfile::path(&config.workdir);
    let Some(pid) = pidfile::read(&pid_path)? else {
        println!("daemon is not running");
        return Ok(());
    };
    if !pidfile::process_alive(pid) {
        println!("daemon is not running (stale pidfile)");
        pidfile::remove(&pid_path);
        return Ok(());
    }

    pidfile::send_sigterm(pid).with_context(|| format!("failed to signal pid {pid}"))?;

    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    while Instant::now() < deadline {
        if !pidfile::process_alive(pid) {
            println!("daemon stopped");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    // Bounded wait elapsed; shutdown continues in the background.
    println!("daemon (pid {pid}) is still shutting down after {wait_secs}s");
    Ok(())
}

async fn state(config: &Config, format: &str) -> anyhow::Result<()> {
    let client = ControlClient::new(config.control.listen)?;
    let snapshot = client.state().await?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        "text" => print_snapshot(&snapshot),
        other => anyhow::bail!("invalid argument: unknown format {other:?} (expected text or json)"),
    }
    Ok(())
}

fn print_snapshot(snapshot: &FleetSnapshot) {
    println!("desired: {}", snapshot.desired);
    println!("instances: {}", snapshot.instances.len());
    if snapshot.instances.is_empty() {
        return;
    }
    println!("{:<16} {:<16} {:<13} {}", "ID", "IP", "STATE", "FAILURES");
    for inst in &snapshot.instances {
        println!(
            "{:<16} {:<16} {:<13} {}",
            inst.id,
            inst.ip_address,
            state_label(inst.lifecycle_state),
            inst.consecutive_failures
        );
    }
}

fn state_label(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::Provisioning => "provisioning",
        LifecycleState::Running => "running",
        LifecycleState::Healthy => "healthy",
        LifecycleState::Unhealthy => "unhealthy",
        LifecycleState::Terminating => "terminating",
        LifecycleState::Terminated => "terminated",
    }
}
