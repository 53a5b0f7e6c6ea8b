//! Vitals Enricher: incremental enrichment of health time-series data
//!
//! This library polls raw health streams (sleep summaries, VO2 max readings,
//! daily stats) from a time-series store, derives secondary metrics from each
//! new record, and writes them to enriched output streams. Progress is never
//! cached: the resume point of every stream is read back from its output on
//! each cycle.
//!
//! # Example
//!
//! ```rust,no_run
//! use vitals_enricher::{
//!     default_catalog, CliArgs, EnrichmentRegistry, InfluxStore, PollingEngine, PollingOptions,
//!     Settings, TimeSeriesStore,
//! };
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load settings from config files and environment
//!     let settings = Settings::new(&CliArgs::default())?;
//!
//!     // Connect to the store
//!     let store = Arc::new(InfluxStore::new(&settings.store)?);
//!     store.ping().await?;
//!
//!     // Register the calculators
//!     let registry = EnrichmentRegistry::from_calculators(default_catalog(&settings));
//!
//!     // Poll until shutdown
//!     let engine = PollingEngine::new(registry, store, PollingOptions::from(&settings.engine))?;
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     engine.run(shutdown_rx).await;
//!
//!     Ok(())
//! }
//! ```

pub mod calculators;
pub mod config;
pub mod engine;
pub mod error;
pub mod interpolation;
pub mod record;
pub mod reference;
pub mod registry;
pub mod sink;
pub mod store;
pub mod tests;
pub mod watermark;

pub use calculators::{default_catalog, Calculator, EnrichContext};
pub use config::{CliArgs, Settings};
pub use engine::{CycleReport, EngineState, PollingEngine, PollingOptions, StreamReport};
pub use error::{
    CalculatorError, EnricherError, ReferenceError, RegistryError, StoreError,
};
pub use record::{EnrichedRecord, FieldMap, FieldValue, RawRecord, TagMap};
pub use registry::EnrichmentRegistry;
pub use sink::{BatchSink, WriteOutcome};
pub use store::{InMemoryStore, InfluxStore, TimeSeriesStore};
pub use watermark::WatermarkAccessor;
