//! WaG Core - Headless Tile Orchestration for a Corpus Dashboard
//!
//! A dashboard is a set of independent tiles (concordance, frequency
//! distribution, similar words, time distribution) that answer one submitted
//! word query. Some tiles need another tile's result first: a frequency
//! distribution is computed from the concordance a concordance tile created.
//! This crate coordinates those tiles without any UI framework.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         Dashboard                               │
//! │   submit(query) ──► SubmitQuery                                 │
//! │                         │                                       │
//! │                  ┌──────┴───────┐                               │
//! │                  │  ActionBus   │  one ordered queue            │
//! │                  └──────┬───────┘                               │
//! │        ┌────────────────┼────────────────┬──────────────┐       │
//! │  ┌─────┴─────┐   ┌──────┴──────┐  ┌──────┴─────┐  ┌─────┴────┐  │
//! │  │Concordance│   │FreqDistrib  │  │ WordSim    │  │TimeDistr.│  │
//! │  │  reduce   │   │ suspended on│  │            │  │          │  │
//! │  │  effects  │   │ conc tile   │  │            │  │          │  │
//! │  └─────┬─────┘   └──────┬──────┘  └──────┬─────┘  └─────┬────┘  │
//! │        └──── PrioritySource (weighted fallback) ─────────┘      │
//! │                         │                                       │
//! │                  ApiProvider (KonText HTTP / scripted)          │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ActionBus`]: ordered, synchronous delivery of [`Action`]s to tiles
//! - [`TileModel`]: pure reducer plus a separate effect phase
//! - [`DependencyWait`]: per-cycle wait for upstream tiles
//! - [`PrioritySource`]: weighted API instances with fallback
//! - [`Dashboard`]: a configured layout driven query by query
//!
//! # Module Overview
//!
//! - [`actions`]: actions, payloads and tile errors
//! - [`bus`]: the action bus
//! - [`model`]: tile model contract, suspension and the runner
//! - [`dependency`]: dependency waits
//! - [`source`]: prioritized API instances
//! - [`query`]: query matches, frequency bands and merging
//! - [`api`]: upstream API traits and providers
//! - [`tiles`]: concrete tiles
//! - [`config`]: TOML configuration
//! - [`dashboard`]: layout construction and query cycles

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod actions;
pub mod api;
pub mod bus;
pub mod config;
pub mod dashboard;
pub mod dependency;
pub mod model;
pub mod query;
pub mod source;
pub mod tiles;

// Re-exports for convenience
pub use actions::{Action, Query, TileError, TileId, TilePayload};
pub use bus::{ActionBus, Dispatcher, Subscription};
pub use dashboard::{Dashboard, DashboardError, TileSnapshot};
pub use dependency::{AwaitUpstream, DependencyWait, UpstreamData, WaitOutcome};
pub use model::{
    CoordinationError, EffectContext, Effects, ModelRunner, Step, Suspension, TileHandle,
    TileModel, TileState, TileStatus,
};
pub use query::{FreqBand, PosTag, QueryError, QueryMatch, QueryType};
pub use source::{FallbackError, PrioritySource, Selected, SourceError};
pub use tiles::{Dependencies, TileServices, TileType};

// API exports
pub use api::{ApiError, ApiProvider};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, parse_config_str, ConfigError,
    ConfigOverrides, ConfigSource, DashboardConfig, TileConfig,
};
