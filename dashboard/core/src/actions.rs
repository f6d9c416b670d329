//! Dashboard Actions
//!
//! Everything that happens on the dashboard is expressed as an [`Action`]
//! travelling over the shared [`ActionBus`](crate::bus::ActionBus). Every
//! registered tile model observes every action, in the same order, and
//! filters by tag and [`TileId`] itself.
//!
//! # Routing
//!
//! Actions that concern a single tile carry its `tile_id`, which lets many
//! tiles multiplex one bus. A tile recognizes its own `TileDataLoaded` by
//! comparing ids, while a dependent tile recognizes its upstream's
//! `TileDataLoaded` the same way.
//!
//! # Cycles
//!
//! Every `SubmitQuery` starts a new query cycle, numbered by the bus from 1.
//! `TileDataLoaded` carries the cycle its request was issued in; a load
//! arriving after the next `SubmitQuery` is stale and ignored both by the
//! producing tile and by tiles waiting on it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{ConcResponse, FreqRow, SimilarWord, TimeDataPoint};
use crate::query::{find_current_match, QueryMatch, QueryType};

/// Identifier of a tile within one dashboard layout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileId(pub u32);

impl TileId {
    /// Raw numeric value
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tile#{}", self.0)
    }
}

/// A submitted dashboard query
///
/// `matches` holds, for each submitted word, the lemma variants recognized
/// by the lexical frequency database. Exactly one variant per word is
/// expected to be flagged `is_current`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Query mode
    pub query_type: QueryType,
    /// Primary language code
    pub lang1: String,
    /// Second language (translation mode only)
    pub lang2: Option<String>,
    /// Recognized lemma variants per submitted word
    pub matches: Vec<Vec<QueryMatch>>,
}

impl Query {
    /// Create a single-word query from its recognized variants
    pub fn single(lang: impl Into<String>, variants: Vec<QueryMatch>) -> Self {
        Self {
            query_type: QueryType::Single,
            lang1: lang.into(),
            lang2: None,
            matches: vec![variants],
        }
    }

    /// Set the query type
    #[must_use]
    pub fn with_query_type(mut self, query_type: QueryType) -> Self {
        self.query_type = query_type;
        self
    }

    /// Currently selected variant of the `idx`-th submitted word
    #[must_use]
    pub fn current_match(&self, idx: usize) -> Option<&QueryMatch> {
        self.matches.get(idx).and_then(|v| find_current_match(v))
    }
}

/// Messages on the shared action bus
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// The user submitted a query; every tile starts a new cycle
    SubmitQuery {
        /// The submitted query
        query: Query,
    },

    /// A tile finished loading (successfully or not)
    TileDataLoaded {
        /// Tile which produced the data
        tile_id: TileId,
        /// Query cycle the request was issued in
        cycle: u64,
        /// Loaded data (`Empty` on error)
        payload: TilePayload,
        /// Failure, if the load failed
        error: Option<TileError>,
    },

    /// Switch the visible data block of a multi-block tile
    SetActiveBlock {
        /// Target tile
        tile_id: TileId,
        /// Block index
        idx: usize,
    },

    /// A tile's dependency wait ran out of time
    WaitTimeout {
        /// Waiting tile
        tile_id: TileId,
        /// Submit cycle the timer was started for
        cycle: u64,
    },
}

impl Action {
    /// Successful load for a tile in query cycle `cycle`
    #[must_use]
    pub fn loaded(tile_id: TileId, cycle: u64, payload: TilePayload) -> Self {
        Self::TileDataLoaded {
            tile_id,
            cycle,
            payload,
            error: None,
        }
    }

    /// Failed load for a tile in query cycle `cycle`
    #[must_use]
    pub fn failed(tile_id: TileId, cycle: u64, error: TileError) -> Self {
        Self::TileDataLoaded {
            tile_id,
            cycle,
            payload: TilePayload::Empty,
            error: Some(error),
        }
    }

    /// Action tag, used for logging
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubmitQuery { .. } => "SubmitQuery",
            Self::TileDataLoaded { .. } => "TileDataLoaded",
            Self::SetActiveBlock { .. } => "SetActiveBlock",
            Self::WaitTimeout { .. } => "WaitTimeout",
        }
    }

    /// Tile this action is addressed to or produced by, if any
    #[must_use]
    pub fn tile_id(&self) -> Option<TileId> {
        match self {
            Self::SubmitQuery { .. } => None,
            Self::TileDataLoaded { tile_id, .. }
            | Self::SetActiveBlock { tile_id, .. }
            | Self::WaitTimeout { tile_id, .. } => Some(*tile_id),
        }
    }

    /// Whether this is a failed `TileDataLoaded`
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::TileDataLoaded { error: Some(_), .. })
    }
}

/// Data carried by `TileDataLoaded`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum TilePayload {
    /// Nothing (errors, disabled tiles)
    #[default]
    Empty,
    /// A concordance
    Concordance(ConcResponse),
    /// One block of a multi-criterion frequency distribution
    FreqBlock {
        /// Criterion index the block belongs to
        crit_idx: usize,
        /// Number of blocks the tile loads per cycle
        block_count: usize,
        /// Concordance the frequencies were computed from
        conc_id: Option<String>,
        /// Rows, sorted by ipm descending
        rows: Vec<FreqRow>,
    },
    /// Similar words
    WordSim(Vec<SimilarWord>),
    /// Time distribution data points
    TimeDistrib {
        /// Concordance the distribution was computed from
        conc_id: Option<String>,
        /// Data points ordered by time
        points: Vec<TimeDataPoint>,
    },
}

impl TilePayload {
    /// Concordance persistence id, if the payload refers to one
    ///
    /// Downstream tiles use this to build their own requests on top of an
    /// upstream concordance.
    #[must_use]
    pub fn conc_id(&self) -> Option<&str> {
        match self {
            Self::Concordance(resp) => Some(resp.conc_id.as_str()),
            Self::FreqBlock { conc_id, .. } | Self::TimeDistrib { conc_id, .. } => {
                conc_id.as_deref()
            }
            Self::Empty | Self::WordSim(_) => None,
        }
    }

    /// Whether more loads of the same cycle follow this one
    ///
    /// Only a multi-criterion frequency distribution loads in parts; tiles
    /// waiting on it count it as delivered with its last block.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::FreqBlock { crit_idx, block_count, .. } if crit_idx + 1 < *block_count)
    }

    /// Whether the payload carries no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Concordance(resp) => resp.lines.is_empty(),
            Self::FreqBlock { rows, .. } => rows.is_empty(),
            Self::WordSim(words) => words.is_empty(),
            Self::TimeDistrib { points, .. } => points.is_empty(),
        }
    }
}

/// Tile-level failure, broadcast on the bus and stored in tile state
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileError {
    /// A required upstream tile failed
    #[error("failed to obtain required data from {upstream}: {reason}")]
    Upstream {
        /// Failed upstream tile
        upstream: TileId,
        /// Upstream failure description
        reason: String,
    },

    /// Upstream data arrived but lacks what this tile needs
    #[error("upstream {upstream} provided no concordance")]
    MissingUpstreamData {
        /// Upstream tile
        upstream: TileId,
    },

    /// Dependency wait exceeded its time limit
    #[error("timed out after {secs}s waiting for upstream tiles")]
    Timeout {
        /// Configured limit in seconds
        secs: u64,
    },

    /// The backend call failed
    #[error("API call failed: {0}")]
    Api(String),

    /// The query lacks data the tile needs
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The effect task itself crashed
    #[error("effect aborted: {0}")]
    Effect(String),
}
