// Crate-level lint configuration
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! snigate - SNI-routing TLS-terminating reverse proxy
//!
//! A reverse proxy that:
//! - Terminates TLS on the public frontend port and routes by SNI to TCP backends
//! - Redirects plaintext HTTP to the equivalent HTTPS URL
//! - Provisions and renews certificates via DNS-validated ACME orders
//! - Persists the routing table crash-safely on a small block device
//! - Accepts live reconfiguration over an HMAC-authenticated control channel

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use snigate::certs::CertManager;
use snigate::config::ProxyConfig;
use snigate::control::run_control_listener;
use snigate::issuer::{DnsAcmeIssuer, DnsUpdateKey};
use snigate::proxy::{run_redirect_listener, run_tls_listener};
use snigate::state::SharedState;

/// snigate - SNI-routing TLS-terminating reverse proxy
#[derive(Parser, Debug)]
#[command(name = "snigate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "/etc/snigate/config.toml",
        env = "SNIGATE_CONFIG"
    )]
    config: PathBuf,

    /// Override the public TLS port
    #[arg(long, env = "SNIGATE_FRONTEND_PORT")]
    frontend_port: Option<u16>,

    /// Override the control channel port
    #[arg(long, env = "SNIGATE_CONTROL_PORT")]
    configuration_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SNIGATE_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "SNIGATE_JSON_LOGS")]
    json_logs: bool,

    /// Run configuration validation only (don't start the proxy)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the rustls CryptoProvider before any TLS operations.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();

    let mut config = ProxyConfig::load(&args.config)?;

    if let Some(port) = args.frontend_port {
        config.server.frontend_port = port;
    }
    if let Some(port) = args.configuration_port {
        config.control.configuration_port = port;
    }

    init_logging(&args.log_level, &config, args.json_logs)?;

    info!("Starting snigate v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {:?}", args.config);

    config.validate()?;
    info!("Configuration validated successfully");

    if args.validate {
        info!("Configuration validation successful, exiting");
        return Ok(());
    }

    // Authoritative routing table from the state device.
    let state = Arc::new(SharedState::load(&config.store.device_path)?);

    // First certificate provision is fatal on failure: the proxy never
    // starts without a complete bundle.
    let issuer = DnsAcmeIssuer::new(
        config.issuance.acme_directory.clone(),
        config.issuance.contact.clone(),
        config.issuance.dns_addr()?,
        DnsUpdateKey::parse(&config.issuance.dns_key)?,
    );
    let manager = CertManager::new(
        issuer,
        config.issuance.domains.clone(),
        config.issuance.key_seed.clone(),
    );

    info!(
        domains = ?config.issuance.domains,
        "Provisioning initial certificate bundle"
    );
    let (tls_config, earliest_expiry) = manager.provision().await?;
    let tls_config = Arc::new(ArcSwap::from_pointee(tls_config));

    // Bind all listeners before serving; a port conflict is fatal.
    let redirect_listener = TcpListener::bind(config.server.redirect_addr()?).await?;
    let frontend_listener = TcpListener::bind(config.server.frontend_addr()?).await?;
    let control_listener = TcpListener::bind(config.control.socket_addr()?).await?;

    let handshake_timeout = Duration::from_secs(config.server.handshake_timeout_secs);
    let control_key = Arc::new(config.control.key.clone().into_bytes());

    tokio::spawn({
        async move {
            if let Err(e) = run_redirect_listener(redirect_listener).await {
                error!("Redirect listener error: {}", e);
            }
        }
    });

    tokio::spawn({
        let tls_config = tls_config.clone();
        let state = state.clone();
        async move {
            if let Err(e) =
                run_tls_listener(frontend_listener, tls_config, state, handshake_timeout).await
            {
                error!("TLS listener error: {}", e);
            }
        }
    });

    tokio::spawn({
        let state = state.clone();
        async move {
            if let Err(e) = run_control_listener(control_listener, control_key, state).await {
                error!("Control listener error: {}", e);
            }
        }
    });

    print_startup_summary(&config);

    // The renewal loop runs in the foreground: a failed renewal is fatal
    // and hands the restart to the supervisor.
    tokio::select! {
        result = manager.run(tls_config, earliest_expiry) => {
            error!("Certificate renewal failed, shutting down");
            result?;
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, shutting down");
        }
    }

    info!("snigate shutdown complete");
    Ok(())
}

/// Initialize logging
fn init_logging(cli_level: &str, config: &ProxyConfig, json: bool) -> anyhow::Result<()> {
    let level = if cli_level != "info" {
        cli_level
    } else {
        &config.logging.level
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    sigterm.recv().await;
    info!("Received SIGTERM");
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}

/// Print startup summary
fn print_startup_summary(config: &ProxyConfig) {
    info!("═══════════════════════════════════════════════════════════════");
    info!("  🚀 snigate v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    info!(
        "  🔒 TLS frontend:   {}:{}",
        config.server.bind_address, config.server.frontend_port
    );
    info!(
        "  🔀 HTTP redirect:  {}:{}",
        config.server.bind_address, config.server.redirect_port
    );
    info!(
        "  Control:        {}:{}",
        config.control.bind_address, config.control.configuration_port
    );
    info!("  State device:   {}", config.store.device_path.display());
    info!("  Domains:        {}", config.issuance.domains.join(", "));
    info!("═══════════════════════════════════════════════════════════════");
}
