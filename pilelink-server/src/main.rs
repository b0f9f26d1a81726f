//! pilelink gateway entry point.
//!
//! ```text
//! pilelink-server                   Run in the foreground
//! pilelink-server --config <path>   Load a custom config TOML
//! pilelink-server --listen <addr>   Override the listen address
//! pilelink-server --gen-config      Write default config to stdout
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pilelink_server::config::ServerConfig;
use pilelink_server::service::GatewayService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "pilelink-server", about = "Charging-pile TCP gateway")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, env = "PILELINK_CONFIG", default_value = "pilelink.toml")]
    config: PathBuf,

    /// Address to accept device connections on.
    #[arg(short, long, env = "PILELINK_LISTEN")]
    listen: Option<SocketAddr>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config, CLI wins.
    let mut config = ServerConfig::load(&cli.config);
    if let Some(addr) = cli.listen {
        config.network.listen_addr = addr;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.logging.ansi)
        .init();

    info!("pilelink-server v{}", env!("CARGO_PKG_VERSION"));
    info!("listen address: {}", config.network.listen_addr);
    info!("heartbeat timeout: {}s", config.session.heartbeat_timeout_secs);
    info!("command retries: {}", config.commands.max_retries);

    let service = GatewayService::new(config.to_gateway_config())?;
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("ctrl-c received, shutting down");
        stop.cancel();
    });

    service.run().await?;

    Ok(())
}
