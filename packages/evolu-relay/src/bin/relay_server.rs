//! Relay server binary entrypoint.

use std::path::PathBuf;

use clap::Parser;
use evolu_relay::network::{ConnectionConfig, NetworkConfig, TlsConfig};
use evolu_relay::NetworkModule;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Evolu relay server.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Address to bind the relay to.
    #[clap(long, env = "EVOLU_RELAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[clap(long, env = "EVOLU_RELAY_PORT", default_value_t = 8080)]
    port: u16,

    /// Path to a TLS certificate. Requires `--tls-key`.
    #[clap(long, env = "EVOLU_RELAY_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// Path to a TLS private key. Requires `--tls-cert`.
    #[clap(long, env = "EVOLU_RELAY_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Maximum WebSocket frame / HTTP sync payload size in bytes.
    #[clap(long, env = "EVOLU_RELAY_MAX_PAYLOAD_BYTES", default_value_t = 1_048_576)]
    max_payload_bytes: usize,

    /// Maximum messages returned in a single sync response.
    #[clap(long, env = "EVOLU_RELAY_BATCH_LIMIT", default_value_t = 1000)]
    batch_limit: usize,

    /// Maximum messages accepted per owner. Unset means unlimited.
    #[clap(long, env = "EVOLU_RELAY_QUOTA_PER_OWNER")]
    quota_per_owner: Option<usize>,

    /// Comma-separated list of allowed CORS origins. `*` allows all.
    #[clap(long, env = "EVOLU_RELAY_CORS_ORIGINS", default_value = "*")]
    cors_origins: String,

    /// Enable verbose logging (can be specified multiple times).
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "evolu_relay=info,tower_http=info".into()),
        1 => tracing_subscriber::EnvFilter::new("debug"),
        _ => tracing_subscriber::EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let tls = match (cli.tls_cert, cli.tls_key) {
        (Some(cert_path), Some(key_path)) => Some(TlsConfig {
            cert_path,
            key_path,
            ca_cert_path: None,
        }),
        (None, None) => None,
        _ => anyhow::bail!("--tls-cert and --tls-key must both be provided or both be omitted"),
    };

    let config = NetworkConfig {
        host: cli.host,
        port: cli.port,
        tls,
        connection: ConnectionConfig::default(),
        cors_origins: cli
            .cors_origins
            .split(',')
            .map(str::trim)
            .map(str::to_string)
            .collect(),
        max_payload_bytes: cli.max_payload_bytes,
        default_batch_limit: cli.batch_limit,
        quota_messages_per_owner: cli.quota_per_owner,
        ..NetworkConfig::default()
    };

    let mut module = NetworkModule::new(config);
    let port = module.start().await?;
    info!("evolu relay listening on port {port}");

    module.serve(shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("shutdown signal received");
}
