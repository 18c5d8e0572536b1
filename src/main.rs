use clap::Parser;
use std::process;
use tracing::info;
use tracing_subscriber::EnvFilter;
use xdpcap::cli::{commands, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting xdpcap v{}", xdpcap::VERSION);

    let result = match cli.command {
        Some(command) => commands::handle_command(command, cli.config.as_deref()).await,
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
