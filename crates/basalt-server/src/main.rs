//! BasaltDB production server.
//!
//! Opens the configured engine backend, builds one Flight service with
//! one session pool, and serves until SIGINT.
//!
//! ```bash
//! # Development: in-process defaults, port 38709
//! cargo run --bin basalt-server
//!
//! # Custom config and port
//! cargo run --bin basalt-server -- --config /etc/basalt/config.json -p 4000
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use basalt_engine::{Engine, LsmEngine, MemEngine};
use basalt_flight::{BasaltServer, SessionConfig};

mod config;
use config::ServerConfig;

#[derive(Debug, Parser)]
#[command(name = "basalt-server", about = "BasaltDB Arrow Flight server", version)]
struct Args {
    /// Configuration file path.
    #[arg(long, default_value = "/var/lib/basalt/config.json")]
    config: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 38709)]
    port: u16,

    /// Silence all output below the error level.
    #[arg(short, long)]
    quiet: bool,
}

fn open_engine(config: &ServerConfig) -> anyhow::Result<Arc<dyn Engine>> {
    match config.backend() {
        "memory" => Ok(Arc::new(MemEngine::new())),
        "lsm" => Ok(Arc::new(LsmEngine::open(Path::new(&config.directory))?)),
        other => anyhow::bail!("unknown engine backend '{other}'"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.quiet { "error" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    fmt().with_env_filter(filter).compact().init();

    let config = ServerConfig::load(&args.config)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = config.backend(),
        directory = %config.directory,
        port = args.port,
        "basalt starting"
    );

    let engine = open_engine(&config)?;
    let server = BasaltServer::new(engine, SessionConfig::default());
    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;

    tokio::select! {
        result = server.serve(addr) => {
            if let Err(e) = result {
                error!(error = %e, "flight server error");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
    }

    info!("basalt shutdown complete");
    Ok(())
}
