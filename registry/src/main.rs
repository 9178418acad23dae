use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use common::logger;
use log::LevelFilter;
use registry::{BeatPolicy, RegistryServer};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Configure {
    /// The address the registry listens on for naming clients.
    #[arg(long, default_value = "0.0.0.0:8848")]
    bind: SocketAddr,
    /// off, error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
    /// Also write date based log files into this directory.
    #[arg(long)]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let configure = Configure::parse();

    logger::init_logger(configure.log_level, configure.log_dir.as_deref())?;
    logger::enable_panic_logger();

    let server = RegistryServer::bind(configure.bind, BeatPolicy::default()).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown requested, closing connections");

    drop(server);
    Ok(())
}
