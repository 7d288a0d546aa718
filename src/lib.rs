//! Shortlink Relay Library
//!
//! Client components for a self-hosted link-shortening service: a request
//! relay reached over an in-process bridge, settings-driven server selection
//! and a short-lived statistics cache.

pub mod api;
pub mod cache;
pub mod client;
pub mod coalesce;
pub mod config;
pub mod errors;
pub mod handoff;
pub mod profile;
pub mod relay;
pub mod selector;
pub mod settings;

pub use api::{ApiFailure, ApiResponse};
pub use cache::{CachedStats, QueryKind, StatsCache};
pub use client::{ConnectionReport, ShortenResult, ShortenerClient, StatsReport};
pub use config::Config;
pub use errors::{RelayError, Result};
pub use handoff::{Handoff, HandoffStore};
pub use profile::{ServerKey, ServerProfile};
pub use relay::{HttpRelay, InstrumentedRelay, Relay, RelayHandle, RelayOutcome, RelayRequest, spawn_relay};
pub use settings::{FileSettingsStore, MemorySettingsStore, Settings, SettingsStore};
