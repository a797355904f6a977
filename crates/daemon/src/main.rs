//! Meshgate daemon
//!
//! Serves the HTTP gateway and the gRPC device stream, and owns the root
//! authority used to sign device certificates.

use anyhow::Context;
use clap::Parser;
use meshgate_common::authority::NebulaCertSigner;
use meshgate_common::{Database, DeviceRegistry, SqliteRegistry, TrustAuthority};
use meshgate_web::auth::random_secret;
use meshgate_web::{AppState, OAuthClient, TokenIssuer, WebServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod grpc;

pub mod generated {
    #![allow(clippy::all)]
    include!("generated/meshgate.v1.rs");
}

use config::GatewayConfig;

#[derive(Parser)]
#[command(name = "meshgated")]
#[command(about = "Meshgate daemon - device trust issuance and signaling relay")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// gRPC listen address
    #[arg(short, long)]
    grpc_listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Meshgate daemon v{}", meshgate_common::VERSION);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(meshgate_common::default_config_path);
    let mut config = GatewayConfig::load(&config_path)?;
    config.apply_env();
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.http_listen = listen;
    }
    if let Some(grpc_listen) = cli.grpc_listen {
        config.grpc_listen = grpc_listen;
    }

    let http_addr: SocketAddr = config
        .http_listen
        .parse()
        .with_context(|| format!("invalid HTTP listen address {}", config.http_listen))?;
    let grpc_addr: SocketAddr = config
        .grpc_listen
        .parse()
        .with_context(|| format!("invalid gRPC listen address {}", config.grpc_listen))?;

    // Ensure store directory exists
    tokio::fs::create_dir_all(&config.store_path).await?;

    let db = Database::open(config.db_path())?;
    let registry: Arc<dyn DeviceRegistry> = Arc::new(SqliteRegistry::new(db));
    let broker = config.relay.broker().await?;
    info!("Signaling broker: {:?}", config.relay.backend);

    let signer = NebulaCertSigner::new(&config.pki.tool, config.pki_dir(), &config.pki.ca_name)
        .with_timeout(config.signing_timeout())
        .with_cert_duration(config.cert_duration());
    let authority = Arc::new(TrustAuthority::new(
        registry.clone(),
        Arc::new(signer),
        config.overlay.allocator()?,
        config.overlay.site.clone(),
        &config.pki.cert_domain,
    ));
    authority
        .bootstrap()
        .await
        .context("failed to prepare root authority")?;

    let secret = match config.auth.secret.clone() {
        Some(secret) => secret,
        None => {
            warn!("No auth secret configured; using a random secret, tokens will not survive a restart");
            random_secret()
        }
    };
    let tokens = TokenIssuer::new(secret.as_bytes(), config.access_ttl(), config.refresh_ttl());

    let mut state = AppState::new(
        registry.clone(),
        broker,
        authority,
        tokens.clone(),
        config.relay.probe_interval(),
    );
    match config.oauth.clone() {
        Some(oauth) => state = state.with_oauth(OAuthClient::new(oauth)),
        None => warn!("No identity provider configured; browser login is disabled"),
    }

    let web_handle = tokio::spawn(WebServer::new(state).serve(http_addr));
    let grpc_handle = tokio::spawn(grpc::serve(grpc_addr, registry, Arc::new(tokens)));

    info!("Overlay network {}", config.overlay.network);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = web_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("HTTP server error: {}", e),
                Err(e) => tracing::error!("HTTP server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = grpc_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("gRPC server error: {}", e),
                Err(e) => tracing::error!("gRPC server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
