// SPDX-License-Identifier: MIT OR Apache-2.0
use anyhow::{Context, Result, bail};
use clap::Parser;
use folio_cancel::CancellationToken;
use folio_config::{FolioConfig, load_config, redact_uri, validate_config};
use folio_daemon::{AppState, build_app, install_panic_hook};
use folio_db::{ConnectionManager, InMemoryDriver, StorageDriver};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "folio", version, about = "Folio backend daemon")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address, overriding the config file.
    #[arg(long)]
    bind: Option<String>,

    /// Verbose logging and debug error payloads.
    #[arg(long)]
    debug: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Use the in-process storage driver instead of the configured URI.
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref()).context("load config")?;
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if args.in_memory {
        config.database.uri = "memory://folio".into();
    }
    if args.debug {
        config.server.debug_errors = true;
    }

    init_tracing(args.debug, args.log_json, config.log_level.as_deref());
    install_panic_hook();

    for warning in validate_config(&config).context("validate config")? {
        warn!(target: "folio.daemon", %warning, "config warning");
    }

    run(config).await
}

async fn run(config: FolioConfig) -> Result<()> {
    let driver = driver_for(&config.database.uri)?;
    let db = ConnectionManager::from_config(driver, &config.database);
    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!(target: "folio.daemon", "shutdown requested"),
                Err(e) => error!(target: "folio.daemon", error = %e, "ctrl-c handler failed"),
            }
            shutdown.cancel();
        }
    });

    // Failing to reach storage at startup is fatal.
    db.connect(&shutdown)
        .await
        .with_context(|| format!("connect to {}", redact_uri(&config.database.uri)))?;

    let monitor = config
        .database
        .monitor_interval()
        .map(|interval| db.spawn_monitor(interval, shutdown.clone()));

    let state = Arc::new(AppState::new(db.clone(), config.server.clone()));
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("bind {}", config.server.bind))?;
    info!(
        target: "folio.daemon",
        bind = %config.server.bind,
        database = %redact_uri(&config.database.uri),
        "folio listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await
        .context("serve")?;

    shutdown.cancel();
    if let Some(handle) = monitor
        && let Err(e) = handle.await
    {
        warn!(target: "folio.daemon", error = %e, "monitor task ended abnormally");
    }
    db.disconnect().await;
    info!(target: "folio.daemon", "shutdown complete");
    Ok(())
}

fn driver_for(uri: &str) -> Result<Arc<dyn StorageDriver>> {
    if uri.starts_with("memory://") {
        return Ok(Arc::new(InMemoryDriver::new()));
    }
    bail!(
        "no storage driver is linked for {}; use a memory:// target or --in-memory",
        redact_uri(uri)
    )
}

fn init_tracing(debug: bool, json: bool, level: Option<&str>) {
    let filter = if debug {
        EnvFilter::new("folio=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("folio={}", level.unwrap_or("info"))))
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
