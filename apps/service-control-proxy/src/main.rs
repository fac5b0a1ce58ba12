//! Service control front proxy.
//!
//! Authorizes every inbound request with a service control Check, forwards
//! the allowed ones to `backend_url` and Reports usage once they complete.
//!
//! Configuration comes from an optional YAML file (`--config`) overlaid with
//! `SCP_*` environment variables. `RUST_LOG` overrides `logging.level`.

mod config;
mod forward;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use service_control::{
    FilterConfig, HyperHttpCallClient, ServiceControlState, StaticTokenFetcher, TokenCache,
    service_control_middleware,
};
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, LoggingConfig};
use crate::forward::{Forwarder, forward};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_router(cfg: &AppConfig) -> Result<(Router, Arc<FilterConfig>)> {
    let tokens = TokenCache::new(
        Arc::new(StaticTokenFetcher::from_config(&cfg.service_control)),
        &cfg.service_control.token_cache,
    );
    let client = HyperHttpCallClient::new(&cfg.service_control.http_call)
        .context("failed to build service control client")?;
    let filter_config = Arc::new(
        FilterConfig::from_config(&cfg.service_control, Arc::new(tokens), Arc::new(client))
            .context("invalid service control configuration")?,
    );
    let forwarder = Forwarder::new(&cfg.backend_url).context("invalid backend_url")?;

    let router = Router::new()
        .fallback(forward)
        .with_state(forwarder)
        .layer(axum::middleware::from_fn_with_state(
            ServiceControlState::new(Arc::clone(&filter_config)),
            service_control_middleware,
        ));
    Ok((router, filter_config))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down gracefully");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(args.config.as_deref()).context("failed to load configuration")?;

    if args.print_config {
        println!("{cfg:#?}");
        return Ok(());
    }

    init_tracing(&cfg.logging);
    tracing::info!(
        config = ?args.config,
        backend_url = %cfg.backend_url,
        "Starting service control proxy"
    );

    let (router, filter_config) = build_router(&cfg)?;

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind_addr))?;
    tracing::info!(addr = %cfg.bind_addr, "Listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    let stats = filter_config.stats();
    tracing::info!(
        allowed = stats.allowed(),
        denied = stats.denied(),
        "Service control proxy stopped"
    );
    Ok(())
}
