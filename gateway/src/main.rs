use std::fmt::Display;
use std::io::ErrorKind;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use mimalloc::MiMalloc;
use tokio::signal;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use keypool_core::config::Config;
use keypool_core::db::postgres::PostgresConnectionInfo;
use keypool_core::db::valkey::ValkeyConnectionInfo;
use keypool_core::endpoints;
use keypool_core::endpoints::status::KEYPOOL_VERSION;
use keypool_core::observability;
use keypool_core::utils::gateway::GatewayHandle;

mod cli;
use cli::GatewayArgs;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let args = GatewayArgs::parse();
    // Set up logs and metrics immediately, so that we can use `tracing`.
    let delayed_log_config =
        observability::setup_observability(args.log_format).expect_pretty("Failed to set up logs");

    if args.config_file.is_some() && args.default_config {
        tracing::error!("Cannot specify both `--config-file` and `--default-config`");
        std::process::exit(1);
    }

    let config = if let Some(path) = &args.config_file {
        Arc::new(
            Config::load_from_path(path)
                .ok() // Don't print the error here, since it was already printed when it was constructed
                .expect_pretty(&format!(
                    "Failed to load config file `{}`",
                    path.display()
                )),
        )
    } else {
        if !args.default_config {
            tracing::warn!(
                "No config file provided, so the built-in defaults will be used. Use `--config-file path/to/keypool.toml` to specify a config file, or `--default-config` to silence this warning."
            );
        }
        Arc::new(Config::default())
    };

    if args.early_exit_commands.check_config {
        tracing::info!("Config file is valid");
        return;
    }

    if config.gateway.debug {
        delayed_log_config
            .delayed_debug_logs
            .enable_debug()
            .expect_pretty("Failed to enable debug logs");
    }

    tracing::info!("Starting keypool gateway {KEYPOOL_VERSION}");

    let metrics_handle = observability::setup_metrics().expect_pretty("Failed to set up metrics");

    let gateway_handle = GatewayHandle::new(config.clone())
        .await
        .expect_pretty("Failed to initialize AppState");

    let bucket_store_pretty = match &gateway_handle.app_state.valkey_connection_info {
        ValkeyConnectionInfo::Enabled { .. } => format!(
            "valkey (prefix: `{}`, timeout: {}ms)",
            config.bucket_store.key_prefix, config.bucket_store.timeout_ms
        ),
        ValkeyConnectionInfo::Disabled => "in-process memory".to_string(),
    };
    let key_records_pretty = match &gateway_handle.app_state.postgres_connection_info {
        PostgresConnectionInfo::Enabled { .. } => "postgres",
        PostgresConnectionInfo::Disabled => "disabled",
    };

    let router = Router::new()
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler))
        .route(
            "/metrics",
            get(move || std::future::ready(metrics_handle.render())),
        )
        .nest("/admin", endpoints::admin::admin_routes())
        .fallback(endpoints::fallback::handle_404)
        // We log failed requests messages at 'DEBUG', since we already have our own error-logging code,
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .with_state(gateway_handle.app_state.clone());

    let bind_address = config.gateway.bind_address();
    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to socket address {bind_address}: {e}. Tip: Ensure no other process is using port {} or try a different port.",
                bind_address.port()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to bind to socket address {bind_address}: {e}");
            std::process::exit(1);
        }
    };

    // This will give us the chosen port if the user specified a port of 0
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get bind address from listener");

    tracing::info!("keypool gateway is listening on {actual_bind_address}");
    match &args.config_file {
        Some(path) => tracing::info!("├ Configuration: {}", path.display()),
        None => tracing::info!("├ Configuration: default"),
    }
    tracing::info!("├ Bucket Store: {bucket_store_pretty}");
    tracing::info!("├ Key Records: {key_records_pretty}");
    if config.token_bucket.enabled {
        tracing::info!(
            "├ Token Buckets: enabled (random fallback: {})",
            config.token_bucket.fallback_to_random
        );
    } else {
        tracing::info!("├ Token Buckets: disabled (uniform-random selection)");
    }
    tracing::info!(
        "└ Eviction: every {}s (idle after {}s, max {} buckets)",
        config.token_bucket.eviction.interval_s,
        config.token_bucket.eviction.idle_ttl_s,
        config.token_bucket.eviction.max_buckets
    );

    // Start the server
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Failed to start server");

    tracing::info!("Stopping background tasks");
    gateway_handle.shutdown().await;
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let hangup = async {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .expect_pretty("Failed to install SIGHUP handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
        () = hangup => {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            tracing::info!("Received SIGHUP signal");
        }
    };
}

/// ┌──────────────────────────────────────────────────────────────────────────┐
/// │                           MAIN.RS ESCAPE HATCH                           │
/// └──────────────────────────────────────────────────────────────────────────┘
///
/// We don't allow panic, escape, unwrap, or similar methods in the codebase,
/// except for the private `expect_pretty` method, which is to be used only in
/// main.rs during initialization. After initialization, we expect all code to
/// handle errors gracefully.
///
/// We use `expect_pretty` for better DX when handling errors in main.rs.
/// `expect_pretty` will print an error message and exit with a status code of 1.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}
