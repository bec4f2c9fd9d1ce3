//! raiden-server - serve data from multi-electrode arrays or recorded
//! files to remote clients.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raiden::config::ServerConfig;
use raiden::server::Server;

#[derive(Parser)]
#[command(
    name = "raiden-server",
    version,
    about = "Serve data from multi-electrode arrays or recorded files to remote clients"
)]
struct Cli {
    /// Write logging information to a log file rather than the default
    /// standard output.
    #[arg(long)]
    quiet: bool,
}

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_logging(quiet: bool) {
    if quiet {
        let path = std::env::temp_dir().join(format!(
            "{}.{}.log",
            env!("CARGO_BIN_NAME"),
            std::process::id()
        ));
        match std::fs::File::create(&path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(log_filter())
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .init();
                return;
            }
            Err(_) => {
                eprintln!(
                    "Could not open {} for logging. Falling back to standard output.",
                    path.display()
                );
            }
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    let config = ServerConfig::load();
    let server = Server::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    server.shutdown().await;
    Ok(())
}
