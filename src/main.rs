use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fleet_gateway::identity::DeviceIdentity;
use fleet_gateway::{Config, Daemon};

/// Fleet - device registry, access gate and command bus
#[derive(Parser)]
#[command(name = "fleet", version, about)]
struct Cli {
    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Also run a device agent for this host
    #[arg(long)]
    local_agent: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default)
    Serve,
    /// Print this host's device id, creating it if needed
    DeviceId,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,fleet_gateway=info",
        1 => "info,fleet_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.api_server.port = port;
    }
    config.local_agent |= cli.local_agent;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!(
                port = config.api_server.port,
                local_agent = config.local_agent,
                "starting fleet gateway"
            );
            tracing::debug!(?config, "loaded configuration");
            Daemon::new(config).run().await?;
        }
        Command::DeviceId => {
            let identity = DeviceIdentity::load_or_create(&config.identity_path())?;
            println!("{}", identity.device_id);
        }
    }

    Ok(())
}
