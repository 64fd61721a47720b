use boardsync::{Config, DirectoryServer};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Directory of shared whiteboards", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Address to listen on (overrides [directory].addr)
    #[arg(short, long)]
    addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(addr) = args.addr {
        config.directory.addr = addr;
    }

    let listener = TcpListener::bind(&config.directory.addr).await?;
    info!("Starting directory on {}", config.directory.addr);

    let server = Arc::new(DirectoryServer::new(config.replication.max_frame_bytes));
    tokio::select! {
        _ = server.run(listener) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down directory"),
    }

    Ok(())
}
