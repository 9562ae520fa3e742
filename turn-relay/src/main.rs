//! garlic-turn binary entry point.
//!
//! Usage:
//! ```bash
//! garlic-turn --config relay.toml
//! garlic-turn --help
//! ```

use anyhow::Context;
use clap::Parser;
use garlic_turn_relay::auth::{MemoryRoomRegistry, RoomRegistry};
use garlic_turn_relay::config::Config;
use garlic_turn_relay::http::build_router;
use garlic_turn_relay::overlay::{
    DatagramSession, SamConfig, SamProvider, TransportProvider, UdpSession,
};
use garlic_turn_relay::{ServerParts, TurnServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// TURN/STUN relay over I2P.
#[derive(Debug, Parser)]
#[command(name = "garlic-turn", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Authentication realm.
    #[arg(long)]
    realm: Option<String>,

    /// Public address advertised in turn:/stun: URLs.
    #[arg(long)]
    public_address: Option<String>,

    /// Listening port.
    #[arg(long)]
    port: Option<u16>,

    /// SAM bridge TCP address.
    #[arg(long)]
    sam_address: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(realm) = &self.realm {
            config.server.realm = realm.clone();
        }
        if let Some(address) = &self.public_address {
            config.server.public_address = address.clone();
        }
        if let Some(port) = self.port {
            config.server.listen_port = port;
        }
        if let Some(sam) = &self.sam_address {
            config.overlay.sam_address = sam.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };
    cli.apply(&mut config);
    config.validate()?;

    let rooms: Arc<dyn RoomRegistry> = Arc::new(MemoryRoomRegistry::from_config(&config.rooms));
    let provider: Arc<dyn TransportProvider> =
        Arc::new(SamProvider::new(SamConfig::from(&config.overlay)));

    let conventional: Option<Arc<dyn DatagramSession>> = if config.server.conventional_listener {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.listen_port));
        let session = UdpSession::bind(addr)
            .await
            .with_context(|| format!("binding conventional listener on {addr}"))?;
        Some(Arc::new(session))
    } else {
        None
    };

    let http = config.http.clone();
    tracing::info!(turn = %config.server.turn_url(), stun = %config.server.stun_url(), "client URLs");

    let server = TurnServer::start(ServerParts {
        config,
        provider,
        rooms,
        conventional,
    })
    .await
    .context("starting relay")?;

    let http_stop = CancellationToken::new();
    let http_task = if http.enabled {
        let listener = tokio::net::TcpListener::bind(&http.bind_address)
            .await
            .with_context(|| format!("binding HTTP on {}", http.bind_address))?;
        tracing::info!(address = %http.bind_address, "HTTP endpoints listening");
        let app = build_router(server.clone());
        let stopping = http_stop.clone();
        Some(tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stopping.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "HTTP server error");
            }
        }))
    } else {
        None
    };

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    server.shutdown().await;
    http_stop.cancel();
    if let Some(task) = http_task {
        let _ = task.await;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
