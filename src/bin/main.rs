//! Vitals enricher service binary.
//!
//! Polls raw health streams from InfluxDB and writes enriched streams back,
//! forever, until interrupted.
//!
//! # Configuration
//!
//! Configuration can be provided through multiple sources, in order of precedence:
//!
//! 1. Command-line arguments and their flat environment variables (highest precedence)
//! 2. Environment variables prefixed with `ENRICHER_`
//! 3. User-specified configuration file (via `--config`)
//! 4. `config/local.toml`
//! 5. Default configuration (embedded in binary)
//!
//! `.env` and `override-default-vars.env` in the working directory are
//! loaded into the environment first.
//!
//! ## Command-line Options
//!
//! ```text
//! Options:
//!   -c, --config <FILE>              Path to configuration file
//!       --host <HOST>                Store host [env: INFLUXDB_HOST]
//!       --port <PORT>                Store port [env: INFLUXDB_PORT]
//!       --username <USER>            InfluxDB 1.x user [env: INFLUXDB_USERNAME]
//!       --password <PASS>            InfluxDB 1.x password [env: INFLUXDB_PASSWORD]
//!       --token <TOKEN>              InfluxDB 3.x token [env: INFLUXDB_V3_ACCESS_TOKEN]
//!       --database <DB>              Raw database [env: INFLUXDB_DATABASE]
//!       --output-database <DB>       Enriched database [env: INFLUXDB_ENRICHED_DATABASE]
//!       --endpoint-is-http <BOOL>    Use plain HTTP [env: INFLUXDB_ENDPOINT_IS_HTTP]
//!       --poll-interval <SECS>       Seconds between cycles [env: ENRICH_CHECK_INTERVAL_SECONDS]
//!       --lookback-days <DAYS>       First-run lookback [env: ENRICH_INITIAL_LOOKBACK_DAYS]
//!       --sex <SEX>                  Reference grid selector [env: GENDER]
//!       --log-level <LEVEL>          Log verbosity [env: LOG_LEVEL]
//! ```
//!
//! # Examples
//!
//! ```bash
//! # Run against a local InfluxDB 1.x
//! INFLUXDB_HOST=localhost INFLUXDB_PORT=8086 INFLUXDB_ENDPOINT_IS_HTTP=true vitals-enricher
//!
//! # Poll every minute with debug logs
//! vitals-enricher --poll-interval 60 --log-level debug
//! ```

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vitals_enricher::{
    config::load_environment, default_catalog, CliArgs, EnricherError, EnrichmentRegistry,
    InfluxStore, PollingEngine, PollingOptions, Settings, TimeSeriesStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let override_loaded = load_environment()?;
    let cli_args = CliArgs::parse();

    // Load settings from config files, environment and CLI args
    let settings = Settings::new(&cli_args)?;

    // RUST_LOG takes precedence over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if override_loaded {
        warn!("override-default-vars.env applied over the process environment");
    }

    if settings.engine.startup_delay_secs > 0 {
        info!(secs = settings.engine.startup_delay_secs, "delaying startup");
        tokio::time::sleep(Duration::from_secs(settings.engine.startup_delay_secs)).await;
    }

    // Connect to the store; unreachable at startup is fatal
    let store = Arc::new(InfluxStore::new(&settings.store)?);
    if let Err(e) = store.ping().await {
        error!(url = %settings.store.base_url(), error = %e, "store unreachable");
        return Err(EnricherError::from(e).into());
    }
    info!(
        url = %settings.store.base_url(),
        database = %settings.store.database,
        output_database = %settings.store.output_database(),
        "connected to store"
    );

    if settings.store.create_output_database {
        if let Err(e) = store.ensure_output_database().await {
            warn!(error = %e, "could not create output database");
        }
    }

    let registry = EnrichmentRegistry::from_calculators(default_catalog(&settings));
    let engine = PollingEngine::new(registry, store, PollingOptions::from(&settings.engine))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    engine.run(shutdown_rx).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM; Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
