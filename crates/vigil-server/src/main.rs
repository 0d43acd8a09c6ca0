//! vigil - alert rule evaluation and notification server.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use vigil_server::{ServerConfig, VigilServer};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Alert rule evaluation and notification server")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Run {
        /// Path to config file
        #[arg(short, long, env = "VIGIL_CONFIG")]
        config: Option<PathBuf>,

        /// Address to listen on, overriding the config file
        #[arg(short, long, env = "VIGIL_BIND")]
        bind: Option<SocketAddr>,

        /// Peer name of this replica, overriding the config file
        #[arg(long, env = "VIGIL_PEER_NAME")]
        peer_name: Option<String>,
    },

    /// Write a config file with every default filled in
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "vigil.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Run {
            config,
            bind,
            peer_name,
        } => run(config, bind, peer_name).await,
        Commands::InitConfig { output } => init_config(&output),
    }
}

async fn run(
    config_path: Option<PathBuf>,
    bind: Option<SocketAddr>,
    peer_name: Option<String>,
) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => {
            info!(config = %path.display(), "loading config");
            ServerConfig::from_file(path)?
        }
        None => ServerConfig::default(),
    };
    if let Some(addr) = bind {
        config = config.with_bind_addr(addr);
    }
    if let Some(name) = peer_name {
        config = config.with_peer_name(name);
    }
    config.validate()?;

    let addr = config.bind_addr;
    info!(
        addr = %addr,
        peer = %config.ha.peer_name,
        external_url = %config.external_url,
        "starting vigil"
    );

    let server = VigilServer::new(config)?;
    server
        .serve_with_shutdown(addr, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
        })
        .await?;
    Ok(())
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&ServerConfig::default())?;
    std::fs::write(output, json)?;
    info!(path = %output.display(), "config written");
    Ok(())
}
