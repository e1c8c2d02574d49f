//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `start` (default) -- start the fleet server
//! - `config show|path` -- inspect configuration
//! - `status` -- query a running instance for health info
//! - `version` -- print build/version info

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::config;

/// Device registry and command dispatcher for remote agents.
#[derive(Parser, Debug)]
#[command(
    name = "fleetlink",
    version = env!("CARGO_PKG_VERSION"),
    about = "fleetlink: partitioned device registry and command dispatcher"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the server (default when no subcommand is given).
    Start,

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Query a running instance for health/status information.
    Status {
        /// Port of the running instance (default: from config or 8787).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host of the running instance.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Print version, build date, and git commit information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the fully loaded configuration as JSON.
    Show,

    /// Print the resolved configuration file path.
    Path,
}

/// Run the `config show` subcommand.
pub fn handle_config_show() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

/// Run the `config path` subcommand.
pub fn handle_config_path() {
    println!("{}", config::get_config_path().display());
}

/// Run the `status` subcommand against a running instance's `/health`.
pub async fn handle_status(
    host: &str,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let port = resolve_port(port);
    let url = format!("http://{}:{}/health", host, port);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Could not connect to fleetlink at {}:{}", host, port);
            eprintln!("  Error: {}", e);
            eprintln!();
            eprintln!("Is the server running? Start it with: fleetlink start");
            std::process::exit(1);
        }
    };

    if !response.status().is_success() {
        eprintln!(
            "Health endpoint returned HTTP {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        );
        std::process::exit(1);
    }

    let body: Value = response.json().await?;
    for line in status_lines(&body, host, port) {
        println!("{}", line);
    }
    Ok(())
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("fleetlink {}", env!("CARGO_PKG_VERSION"));
    println!("  Build date: {}", env!("FLEETLINK_BUILD_DATE"));
    println!("  Git commit: {}", env!("FLEETLINK_GIT_HASH"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

fn status_lines(body: &Value, host: &str, port: u16) -> Vec<String> {
    let mut lines = vec![
        "fleetlink status".to_string(),
        "================".to_string(),
    ];
    if let Some(version) = body.get("version").and_then(Value::as_str) {
        lines.push(format!("  Version:  {}", version));
    }
    if let Some(uptime) = body.get("uptimeSeconds").and_then(Value::as_u64) {
        lines.push(format!("  Uptime:   {}", format_duration(uptime)));
    }
    lines.push(format!("  Address:  {}:{}", host, port));
    if let Some(status) = body.get("status").and_then(Value::as_str) {
        lines.push(format!("  Status:   {}", status));
    }
    if let Some(online) = body.get("devicesOnline").and_then(Value::as_u64) {
        lines.push(format!("  Devices:  {} online", online));
    }
    lines
}

/// Explicit flag, then the config file, then the default port.
fn resolve_port(explicit: Option<u16>) -> u16 {
    explicit.unwrap_or_else(|| {
        config::load_config()
            .map(|cfg| cfg.server.port)
            .unwrap_or(config::DEFAULT_PORT)
    })
}

fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
