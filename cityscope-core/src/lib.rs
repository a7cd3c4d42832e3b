//! Core library for the `cityscope` dashboard.
//!
//! This crate defines:
//! - Provider adapters for traffic, air quality and weather backends
//! - City resolution against a catalogue and a remote geocoder
//! - Freshness-aware caching and per-provider rate limiting
//! - The aggregator that merges all of it into one snapshot per city
//!
//! It is used by `cityscope-cli`, but can also be reused by other binaries or services.

pub mod aggregator;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod geocode;
pub mod model;
pub mod provider;
pub mod rate_limit;
pub mod refresh;

pub use aggregator::{Aggregator, AggregatorBuilder, ProviderPolicy, RetryPolicy};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{FailureKind, ProviderError, RateLimitExceeded, ResolutionError};
pub use model::{City, Completeness, ProviderKind, ProviderRecord, RecordData, Snapshot};
pub use provider::{Backend, ProviderAdapter};
pub use refresh::{RefreshReport, SnapshotStore};
