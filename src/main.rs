use clap::Parser;

use fleetlink::cli::{self, Cli, Command, ConfigCommand};
use fleetlink::{config, logging, server};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command.unwrap_or(Command::Start) {
        Command::Start => run_start().await,
        Command::Config(ConfigCommand::Show) => cli::handle_config_show(),
        Command::Config(ConfigCommand::Path) => {
            cli::handle_config_path();
            Ok(())
        }
        Command::Status { host, port } => cli::handle_status(&host, port).await,
        Command::Version => {
            cli::handle_version();
            Ok(())
        }
    };
    if let Err(err) = result {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

async fn run_start() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    logging::init_logging(&cfg.logging)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.server.port,
        "starting fleetlink"
    );
    server::http::run_server(&cfg).await?;
    Ok(())
}
