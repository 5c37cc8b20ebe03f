//! Moto daemon: weak-network TCP proxy and overlay accelerator.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use moto::config::{init_logging, Config};
use moto::relay::{self, Services};
use moto::transport::{QuicDialer, TcpDialer, TransportKind, TunnelDialer};
use moto::tunnel::{Adaptation, Role, TunnelClient, TunnelServer};

#[derive(Parser)]
#[command(
    name = "moto",
    version = moto::VERSION,
    about = "Weak-network TCP proxy and overlay accelerator"
)]
struct Cli {
    /// Path to the JSON settings file. Falls back to $MOTO_CONFIG, then
    /// ./setting.json.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli
        .config
        .or_else(|| std::env::var_os("MOTO_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("setting.json"));

    let config = Config::load(&path)?;
    init_logging(&config.log)?;
    info!(version = moto::VERSION, config = %path.display(), "moto starting");

    let adapt = Adaptation::new(config.adaptation.clone(), config.accelerator.frame_size);

    // The accelerator manager is a process-lifetime object handed to the
    // listeners by reference; nothing initializes implicitly.
    let mut tunnel = None;
    let mut shutdown_tokens = Vec::new();
    if config.accelerator.enabled {
        match config.accelerator.role {
            Role::Server => {
                let server = TunnelServer::new(Arc::clone(&adapt));
                shutdown_tokens.push(server.shutdown_token());
                let cfg = config.accelerator.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.run(cfg).await {
                        error!(error = %e, "accelerator relay failed");
                    }
                });
            }
            Role::Client => {
                let client = TunnelClient::new(Arc::clone(&adapt));
                shutdown_tokens.push(client.shutdown_token());
                let dialer: Arc<dyn TunnelDialer> = match config.accelerator.transport {
                    TransportKind::Tcp => Arc::new(TcpDialer),
                    TransportKind::Quic => Arc::new(QuicDialer::new()?),
                };
                client.start(&config.accelerator, dialer, config.adaptation.enabled);
                tunnel = Some(client);
            }
        }
    }

    let services = Services::new(tunnel);
    if config.rules.is_empty() {
        info!("no rules configured");
    }
    for rule in &config.rules {
        let rule = Arc::new(rule.clone());
        let services = Arc::clone(&services);
        tokio::spawn(async move {
            let name = rule.name.clone();
            if let Err(e) = relay::run_rule(rule, services).await {
                error!(rule = %name, error = %e, "listener failed");
            }
        });
    }

    signal::ctrl_c().await?;
    for token in shutdown_tokens {
        token.cancel();
    }
    info!("moto shutting down");
    Ok(())
}
