//! Dashboard Tiles
//!
//! Concrete [`TileModel`](crate::model::TileModel)s. Every tile follows the
//! same cycle:
//!
//! ```text
//! SubmitQuery -> reduce: is_busy = true, error = None
//!             -> effects: no upstream -> fetch now
//!                         upstream    -> suspend on DependencyWait, fetch on ready
//! fetch       -> PrioritySource::call_with_fallback -> TileDataLoaded (own id)
//! ```

pub mod concordance;
pub mod freq_distrib;
pub mod time_distrib;
pub mod word_sim;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::actions::{TileError, TileId};
use crate::api::ApiProvider;
use crate::dependency::{AwaitUpstream, DependencyWait, UpstreamData};
use crate::model::{CoordinationError, EffectContext, Effects, TileState};
use crate::query::QueryType;

pub use concordance::{ConcordanceConf, ConcordanceModel, ConcordanceState};
pub use freq_distrib::{FreqBlock, FreqDistribConf, FreqDistribModel, FreqDistribState};
pub use time_distrib::{TimeDistribBackend, TimeDistribConf, TimeDistribModel, TimeDistribState};
pub use word_sim::{WordSimConf, WordSimModel, WordSimState};

/// Kind of tile, as named in layout configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileType {
    /// Concordance lines
    Concordance,
    /// Multi-criterion frequency distribution
    FreqDistrib,
    /// Similar words
    WordSim,
    /// Frequency over time
    TimeDistrib,
}

impl TileType {
    /// Query types a tile of this kind handles unless configured otherwise
    #[must_use]
    pub fn default_query_types(self) -> &'static [QueryType] {
        match self {
            Self::Concordance => &[QueryType::Single, QueryType::Cmp, QueryType::Translat],
            Self::FreqDistrib => &[QueryType::Single, QueryType::Translat],
            Self::WordSim | Self::TimeDistrib => &[QueryType::Single],
        }
    }

    /// Whether the tile cannot work without an upstream tile
    #[must_use]
    pub fn requires_upstream(self) -> bool {
        matches!(self, Self::FreqDistrib)
    }
}

impl fmt::Display for TileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Concordance => "concordance",
            Self::FreqDistrib => "freq_distrib",
            Self::WordSim => "word_sim",
            Self::TimeDistrib => "time_distrib",
        };
        f.write_str(name)
    }
}

/// Run-wide collaborators injected into every tile at construction
#[derive(Clone, Copy)]
pub struct TileServices<'a> {
    /// Builds API clients for configured URLs
    pub provider: &'a dyn ApiProvider,
    /// Limit for dependency waits
    pub wait_timeout: Option<Duration>,
}

impl TileServices<'_> {
    /// Dependencies on `upstream` using the run-wide wait limit
    #[must_use]
    pub fn dependencies(&self, upstream: Vec<TileId>) -> Dependencies {
        Dependencies::new(upstream, self.wait_timeout)
    }
}

/// Upstream tiles of one tile
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dependencies {
    upstream: Vec<TileId>,
    wait_timeout: Option<Duration>,
}

impl Dependencies {
    /// Wait for `upstream` with an optional time limit
    #[must_use]
    pub fn new(upstream: Vec<TileId>, wait_timeout: Option<Duration>) -> Self {
        Self {
            upstream,
            wait_timeout,
        }
    }

    /// No upstream tiles
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Upstream tile ids
    #[must_use]
    pub fn upstream(&self) -> &[TileId] {
        &self.upstream
    }

    /// Whether the tile can fetch right away
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }

    /// Suspend the tile until every upstream tile loaded
    ///
    /// A `WaitTimeout` is scheduled when a time limit is configured.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::AlreadySuspended`]
    pub fn suspend<S, R, F>(
        &self,
        ctx: &mut EffectContext<'_, S>,
        on_ready: R,
        on_failure: F,
    ) -> Result<(), CoordinationError>
    where
        S: TileState,
        R: FnOnce(Vec<UpstreamData>, &Effects) -> Option<S> + Send + 'static,
        F: FnOnce(&TileError) -> S + Send + 'static,
    {
        let mut wait = DependencyWait::new(ctx.tile_id(), &self.upstream, ctx.cycle());
        if let Some(limit) = self.wait_timeout {
            wait = wait.with_timeout(limit.as_secs());
        }
        ctx.suspend(AwaitUpstream::new(wait, on_ready, on_failure))?;
        if let Some(limit) = self.wait_timeout {
            ctx.schedule_timeout(limit);
        }
        Ok(())
    }
}

/// Concordance id from the first upstream tile providing one
///
/// # Errors
///
/// [`TileError::MissingUpstreamData`] naming the first upstream tile.
pub fn upstream_conc_id(data: &[UpstreamData]) -> Result<String, TileError> {
    data.iter()
        .find_map(|d| d.payload.conc_id().map(str::to_string))
        .ok_or(TileError::MissingUpstreamData {
            upstream: data.first().map_or(TileId(0), |d| d.tile_id),
        })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::TilePayload;

    #[test]
    fn test_upstream_conc_id() {
        let data = vec![
            UpstreamData {
                tile_id: TileId(2),
                payload: TilePayload::WordSim(Vec::new()),
            },
            UpstreamData {
                tile_id: TileId(3),
                payload: TilePayload::Concordance(test_support::conc("c9", 1)),
            },
        ];
        assert_eq!(upstream_conc_id(&data), Ok("c9".to_string()));
        assert_eq!(
            upstream_conc_id(&data[..1]),
            Err(TileError::MissingUpstreamData { upstream: TileId(2) })
        );
    }

    #[test]
    fn test_tile_type_names() {
        assert_eq!(TileType::FreqDistrib.to_string(), "freq_distrib");
        let parsed: TileType = serde_json::from_str("\"time_distrib\"").unwrap();
        assert_eq!(parsed, TileType::TimeDistrib);
        assert!(TileType::FreqDistrib.requires_upstream());
        assert!(!TileType::WordSim.default_query_types().contains(&QueryType::Cmp));
    }
}
