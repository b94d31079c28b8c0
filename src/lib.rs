//! Harrier Monitor Library
//!
//! Liquidation proximity monitor for perp DEX positions.
//! This library exposes core modules for testing.

pub mod alerts;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod monitoring;
pub mod registry;
pub mod thresholds;
pub mod upstream;

// Re-export commonly used types for tests
pub use alerts::{AlertContext, AlertKind, Alerter, DryRunSink, MessageSink, TelegramSink};
pub use config::AppConfig;
pub use db::{CacheWriterHandle, DbPool, StoredPosition};
pub use error::{MonitorError, MonitorResult};
pub use models::{Exchange, MarginType, Position, PositionKey, Side, WalletRecord};
pub use monitoring::cache::{CachedPosition, PositionCache, Tier};
pub use monitoring::detector::{classify_update, PrevState, TransitionKind};
pub use monitoring::pipeline::Pipeline;
pub use registry::{RegistryPolicy, WalletRegistry};
pub use thresholds::NotionalThresholds;
pub use upstream::Fetcher;
