//! Quire server binary.
//!
//! Brings up structured logging and the database layer, refusing to start
//! against an unreachable or unmigrated store, then runs until SIGTERM/SIGINT
//! and shuts the database down in order.

mod config;

use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("QUIRE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() -> ExitCode {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = match config::load_config(selected_config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration, the server cannot start: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // The database layer blocks, and drives PostgreSQL on its own runtime.
    let db_source = config.database.source();
    let update_schema = config.database.update_schema;
    tracing::info!(source = %db_source, update_schema, "initializing database");

    match tokio::task::spawn_blocking(move || quire_db::initialize_from(&db_source, update_schema))
        .await
    {
        Ok(Ok(())) => tracing::info!("database ready"),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "database initialization failed, refusing to start");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            tracing::error!(error = %e, "database initialization task failed");
            return ExitCode::FAILURE;
        }
    }

    shutdown_signal().await;

    if let Err(e) = tokio::task::spawn_blocking(quire_db::shutdown).await {
        tracing::warn!(error = %e, "database shutdown task failed");
    }

    tracing::info!("quire server shut down");
    ExitCode::SUCCESS
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, shutting down"); }
        () = terminate => { tracing::info!("received SIGTERM, shutting down"); }
    }
}
