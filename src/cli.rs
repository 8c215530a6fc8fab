// CLI module - command-line argument parsing and handlers
//
// Provides subcommands for configuration management:
// - config --show: Display effective configuration
// - config --path: Show config file path

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};

/// Tunneldeck - control plane for tunnel-forwarding agents
#[derive(Parser)]
#[command(name = "tunneldeck")]
#[command(version = VERSION)]
#[command(about = "Control plane and observability aggregator for tunnel agents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle CLI commands. Returns true if a command was handled (exit after).
pub fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { show, path }) => {
            if path {
                handle_config_path();
            } else if show {
                handle_config_show();
            } else {
                println!("Usage: tunneldeck config [--show|--path]");
                println!();
                println!("Options:");
                println!("  --show    Display effective configuration");
                println!("  --path    Show config file path");
            }
            true
        }
        None => false, // No subcommand, run the server
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => {
            eprintln!("Error: Could not determine config path");
            std::process::exit(1);
        }
    }
}

fn handle_config_show() {
    let config = Config::from_env();

    println!("# Effective configuration (env > file > defaults)");
    println!();
    println!("bind_addr = {:?}", config.bind_addr.to_string());
    println!("db_path = {:?}", config.db_path.display().to_string());
    println!();
    println!("[logging]");
    println!("level = {:?}", config.logging.level);
    println!();
    println!("[auth]");
    println!("enabled = {}", config.auth.enabled);
    println!("username = {:?}", config.auth.username);
    println!();
    println!("[filelog]");
    println!("enabled = {}", config.filelog.enabled);
    println!("base_dir = {:?}", config.filelog.base_dir.display().to_string());
    println!("retention_days = {}", config.filelog.retention_days);
    println!(
        "cleanup_interval_hours = {}",
        config.filelog.cleanup_interval.as_secs() / 3600
    );
    println!("max_records_per_day = {}", config.filelog.max_records_per_day);
    println!();
    println!("[events]");
    println!("retention_days = {}", config.events.retention_days);
    println!("max_per_day = {}", config.events.max_per_day);
    println!();
    println!("[supervisor]");
    println!(
        "health_timeout_secs = {}",
        config.supervisor.health_timeout.as_secs()
    );
    println!(
        "backoff_base_ms = {}",
        config.supervisor.backoff_base.as_millis()
    );
    println!(
        "backoff_cap_secs = {}",
        config.supervisor.backoff_cap.as_secs()
    );
    println!("queue_capacity = {}", config.supervisor.queue_capacity);
    println!();
    println!("[hub]");
    println!("buffer_capacity = {}", config.hub.buffer_capacity);
    println!("heartbeat_secs = {}", config.hub.heartbeat.as_secs());

    println!();
    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("# Source: {}", path.display());
        } else {
            println!("# Source: defaults (no config file)");
        }
    }
}
