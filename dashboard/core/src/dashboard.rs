//! Dashboard
//!
//! Builds the tiles of a configured layout, registers them on one
//! [`ActionBus`] and drives query cycles:
//!
//! ```text
//! DashboardConfig --from_config--> [tile 0, tile 1, ...] on one ActionBus
//! submit(query)   --> enable/disable per query type and upstream --> SubmitQuery
//! run_until_settled --> step the bus until no enabled tile is busy
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::actions::{Action, Query, TileId};
use crate::api::ApiProvider;
use crate::bus::{ActionBus, Subscription};
use crate::config::{ConfigError, DashboardConfig, TileConfig};
use crate::model::{CoordinationError, TileModel, TileStatus};
use crate::query::QueryType;
use crate::source::{PrioritySource, SourceError};
use crate::tiles::{
    time_distrib::DEFAULT_TIME_FCRIT, ConcordanceConf, ConcordanceModel, Dependencies,
    FreqDistribConf, FreqDistribModel, TileServices, TileType, TimeDistribBackend, TimeDistribConf,
    TimeDistribModel, WordSimConf, WordSimModel,
};

/// Errors raised while building or running a dashboard
#[derive(Debug, Error)]
pub enum DashboardError {
    /// Invalid layout
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Misuse of the coordination layer
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// Invalid API instance list
    #[error(transparent)]
    Source(#[from] SourceError),

    /// No tile with this name
    #[error("unknown tile '{0}'")]
    UnknownTile(String),

    /// Tiles still busy when the time limit expired
    #[error("dashboard not settled after {limit:?}, busy tiles: {busy:?}")]
    Timeout {
        /// The limit
        limit: Duration,
        /// Names of tiles still busy
        busy: Vec<String>,
    },
}

/// Final view of one tile
#[derive(Clone, Debug, Serialize)]
pub struct TileSnapshot {
    /// Configured name
    pub name: String,
    /// Tile kind
    pub tile_type: TileType,
    /// Coordination status
    pub status: TileStatus,
    /// Serialized tile state
    pub state: serde_json::Value,
}

struct TileEntry {
    name: String,
    tile_type: TileType,
    upstream: Vec<TileId>,
}

/// A running dashboard layout
pub struct Dashboard {
    bus: ActionBus,
    tiles: Vec<TileEntry>,
    ids: HashMap<String, TileId>,
}

impl Dashboard {
    /// Build every configured tile and register it on a fresh bus
    ///
    /// Tile ids follow layout order.
    ///
    /// # Errors
    ///
    /// Unknown `wait_for` names, invalid priority lists or registration
    /// failures.
    pub fn from_config(
        config: &DashboardConfig,
        provider: &dyn ApiProvider,
    ) -> Result<Self, DashboardError> {
        let mut ids = HashMap::new();
        for (i, tile) in config.tiles.iter().enumerate() {
            let id = u32::try_from(i)
                .map(TileId)
                .map_err(|_| ConfigError::Validation("too many tiles".to_string()))?;
            ids.insert(tile.name.clone(), id);
        }

        let services = TileServices {
            provider,
            wait_timeout: config.wait_for_timeout,
        };
        let mut bus = ActionBus::new();
        let mut tiles = Vec::with_capacity(config.tiles.len());
        for tile in &config.tiles {
            let tile_id = ids[&tile.name];
            let upstream = tile
                .wait_for
                .iter()
                .map(|name| {
                    ids.get(name).copied().ok_or_else(|| {
                        ConfigError::Validation(format!(
                            "tile '{}' waits for unknown tile '{name}'",
                            tile.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let deps = services.dependencies(upstream.clone());

            register_tile(&mut bus, tile_id, tile, deps, &services)?;
            tracing::debug!(%tile_id, name = %tile.name, tile_type = %tile.tile_type, "tile registered");
            tiles.push(TileEntry {
                name: tile.name.clone(),
                tile_type: tile.tile_type,
                upstream,
            });
        }

        tracing::info!(tiles = tiles.len(), "dashboard ready");
        Ok(Self { bus, tiles, ids })
    }

    /// Id of a tile by name
    ///
    /// # Errors
    ///
    /// [`DashboardError::UnknownTile`]
    pub fn tile_id(&self, name: &str) -> Result<TileId, DashboardError> {
        self.ids
            .get(name)
            .copied()
            .ok_or_else(|| DashboardError::UnknownTile(name.to_string()))
    }

    /// Start a query cycle
    ///
    /// Tiles not supporting the query type are disabled for the cycle and
    /// keep their previous state, and so is every tile waiting on a disabled
    /// tile, directly or through other tiles. The others are enabled again.
    ///
    /// # Errors
    ///
    /// Coordination errors from enabling or disabling tiles.
    pub fn submit(&mut self, query: Query) -> Result<(), DashboardError> {
        let disabled = self.disabled_for(query.query_type)?;
        for tile_id in self.bus.tile_ids() {
            if disabled.contains(&tile_id) {
                self.bus.disable(tile_id)?;
            } else {
                self.bus.enable(tile_id)?;
            }
        }
        tracing::info!(query_type = %query.query_type, matches = query.matches.len(), "submitting query");
        self.bus.dispatch(Action::SubmitQuery { query });
        Ok(())
    }

    /// Tiles that cannot take part in a cycle of `query_type`
    fn disabled_for(&self, query_type: QueryType) -> Result<HashSet<TileId>, DashboardError> {
        let mut disabled = HashSet::new();
        for tile_id in self.bus.tile_ids() {
            if !self.bus.supports_query_type(tile_id, query_type)? {
                tracing::debug!(%tile_id, %query_type, "query type not supported, tile disabled");
                disabled.insert(tile_id);
            }
        }

        // wait_for may point forward in layout order
        let mut changed = true;
        while changed {
            changed = false;
            for (tile_id, entry) in self.bus.tile_ids().into_iter().zip(&self.tiles) {
                if !disabled.contains(&tile_id) && entry.upstream.iter().any(|up| disabled.contains(up)) {
                    tracing::debug!(%tile_id, name = %entry.name, "upstream disabled, tile disabled");
                    disabled.insert(tile_id);
                    changed = true;
                }
            }
        }
        Ok(disabled)
    }

    /// Show another block of a multi-block tile
    ///
    /// # Errors
    ///
    /// [`DashboardError::UnknownTile`]
    pub fn set_active_block(&self, name: &str, idx: usize) -> Result<(), DashboardError> {
        let tile_id = self.tile_id(name)?;
        self.bus.dispatch(Action::SetActiveBlock { tile_id, idx });
        Ok(())
    }

    /// Deliver actions until the queue is empty and no enabled tile is busy
    ///
    /// # Errors
    ///
    /// [`DashboardError::Timeout`] naming the busy tiles when `limit`
    /// expires, or coordination errors raised while delivering.
    pub async fn run_until_settled(&mut self, limit: Duration) -> Result<(), DashboardError> {
        match tokio::time::timeout(limit, self.settle()).await {
            Ok(result) => result,
            Err(_) => {
                let busy = self.busy_tiles();
                tracing::warn!(?busy, "dashboard did not settle in time");
                Err(DashboardError::Timeout { limit, busy })
            }
        }
    }

    async fn settle(&mut self) -> Result<(), DashboardError> {
        loop {
            self.bus.drain()?;
            if self.bus.is_idle() && self.busy_tiles().is_empty() {
                return Ok(());
            }
            self.bus.step().await?;
        }
    }

    fn busy_tiles(&self) -> Vec<String> {
        self.bus
            .statuses()
            .iter()
            .zip(&self.tiles)
            .filter(|(status, _)| status.is_busy && !status.disabled)
            .map(|(_, entry)| entry.name.clone())
            .collect()
    }

    /// Status of every tile, in layout order
    #[must_use]
    pub fn statuses(&self) -> Vec<TileStatus> {
        self.bus.statuses()
    }

    /// Name, status and serialized state of every tile, in layout order
    #[must_use]
    pub fn snapshot(&self) -> Vec<TileSnapshot> {
        self.bus
            .snapshots()
            .into_iter()
            .zip(self.bus.statuses())
            .zip(&self.tiles)
            .map(|(((_, state), status), entry)| TileSnapshot {
                name: entry.name.clone(),
                tile_type: entry.tile_type,
                status,
                state,
            })
            .collect()
    }

    /// Observe every delivered action
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Action) + Send + Sync + 'static,
    {
        self.bus.subscribe(listener)
    }

    /// The underlying bus
    pub fn bus_mut(&mut self) -> &mut ActionBus {
        &mut self.bus
    }
}

impl std::fmt::Debug for Dashboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.tiles.iter().map(|t| t.name.as_str()).collect();
        f.debug_struct("Dashboard").field("tiles", &names).finish_non_exhaustive()
    }
}

/// One instance per `api_url`, weighted by `api_priority`
fn priority_source<T>(
    tile: &TileConfig,
    mut make: impl FnMut(usize, &str) -> T,
) -> Result<PrioritySource<T>, SourceError> {
    let mut source = PrioritySource::new(tile.api_priority.clone());
    for (index, url) in tile.api_urls.iter().enumerate() {
        source.add_instance(index, make(index, url))?;
    }
    Ok(source)
}

fn register<M: TileModel>(
    bus: &mut ActionBus,
    model: M,
    initial: M::State,
) -> Result<(), DashboardError> {
    bus.register(model, initial)?;
    Ok(())
}

fn register_tile(
    bus: &mut ActionBus,
    tile_id: TileId,
    tile: &TileConfig,
    deps: Dependencies,
    services: &TileServices<'_>,
) -> Result<(), DashboardError> {
    let provider = services.provider;
    let query_types = tile.query_types.clone();
    match tile.tile_type {
        TileType::Concordance => {
            let defaults = ConcordanceConf::default();
            let conf = ConcordanceConf {
                corpname: tile.corpname.clone(),
                subcname: tile.subcnames.first().cloned(),
                max_lines: tile.max_lines.unwrap_or(defaults.max_lines),
                query_types,
            };
            let source = priority_source(tile, |_, url| provider.concordance(url))?;
            let model = ConcordanceModel::new(tile_id, conf, deps, source);
            let initial = model.initial_state();
            register(bus, model, initial)
        }
        TileType::FreqDistrib => {
            let defaults = FreqDistribConf::default();
            let conf = FreqDistribConf {
                corpname: tile.corpname.clone(),
                subcname: tile.subcnames.first().cloned(),
                fcrit: tile.fcrit.clone(),
                crit_labels: tile.crit_labels.clone(),
                max_num_categories: tile.max_num_categories.unwrap_or(defaults.max_num_categories),
                flimit: tile.flimit.unwrap_or(defaults.flimit),
                query_types,
            };
            let source = priority_source(tile, |_, url| provider.freq_distrib(url))?;
            let model = FreqDistribModel::new(tile_id, conf, deps, source);
            let initial = model.initial_state();
            register(bus, model, initial)
        }
        TileType::WordSim => {
            let defaults = WordSimConf::default();
            let conf = WordSimConf {
                max_result_items: tile.max_result_items.unwrap_or(defaults.max_result_items),
                min_score: tile.min_score.unwrap_or(defaults.min_score),
                corpname: (!tile.corpname.is_empty()).then(|| tile.corpname.clone()),
                query_types,
            };
            let source = priority_source(tile, |_, url| provider.word_sim(url))?;
            let model = WordSimModel::new(tile_id, conf, deps, source);
            let initial = model.initial_state();
            register(bus, model, initial)
        }
        TileType::TimeDistrib => {
            let conf = TimeDistribConf {
                corpname: tile.corpname.clone(),
                subcnames: tile.subcnames.clone(),
                fcrit: tile
                    .fcrit
                    .first()
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_TIME_FCRIT.to_string()),
                query_types,
            };
            let source = priority_source(tile, |index, url| {
                let conc_url = tile.conc_api_urls.get(index).map_or(url, String::as_str);
                TimeDistribBackend {
                    conc: provider.concordance(conc_url),
                    time: provider.time_distrib(url),
                }
            })?;
            let model = TimeDistribModel::new(tile_id, conf, deps, source);
            let initial = model.initial_state();
            register(bus, model, initial)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::api::scripted::{ScriptedApi, ScriptedProvider};
    use crate::config::parse_config_str;
    use crate::query::QueryMatch;
    use pretty_assertions::assert_eq;

    const LAYOUT: &str = r#"
[[tiles]]
name = "conc"
tile_type = "concordance"
api_url = "scripted://conc"
corpname = "syn2020"

[[tiles]]
name = "similar"
tile_type = "word_sim"
api_url = "scripted://sim"
"#;

    fn query(word: &str, query_type: QueryType) -> Query {
        Query::single("cs", vec![QueryMatch::new(word, word, "N").current()])
            .with_query_type(query_type)
    }

    #[test]
    fn test_tile_ids_follow_layout_order() {
        let config = parse_config_str(LAYOUT).unwrap();
        let dashboard = Dashboard::from_config(&config, &ScriptedProvider::sample()).unwrap();
        assert_eq!(dashboard.tile_id("conc").unwrap(), TileId(0));
        assert_eq!(dashboard.tile_id("similar").unwrap(), TileId(1));
        assert!(matches!(
            dashboard.tile_id("nope"),
            Err(DashboardError::UnknownTile(_))
        ));
    }

    #[tokio::test]
    async fn test_settles_after_query() {
        let config = parse_config_str(LAYOUT).unwrap();
        let mut dashboard = Dashboard::from_config(&config, &ScriptedProvider::sample()).unwrap();

        dashboard.submit(query("dům", QueryType::Single)).unwrap();
        dashboard
            .run_until_settled(Duration::from_secs(5))
            .await
            .unwrap();

        let snapshot = dashboard.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|t| !t.status.is_busy && t.status.error.is_none()));
        assert_eq!(snapshot[0].name, "conc");
        assert_eq!(snapshot[0].state["corpname"], "syn2020");
    }

    #[tokio::test]
    async fn test_unsupported_tiles_disabled() {
        let config = parse_config_str(LAYOUT).unwrap();
        let mut dashboard = Dashboard::from_config(&config, &ScriptedProvider::sample()).unwrap();

        dashboard.submit(query("dům", QueryType::Cmp)).unwrap();
        dashboard
            .run_until_settled(Duration::from_secs(5))
            .await
            .unwrap();

        let statuses = dashboard.statuses();
        assert!(!statuses[0].disabled);
        assert!(statuses[1].disabled);

        dashboard.submit(query("dům", QueryType::Single)).unwrap();
        assert!(!dashboard.statuses()[1].disabled);
    }

    #[tokio::test]
    async fn test_dependents_of_disabled_tiles_are_disabled() {
        let layout = r#"
[dashboard]
wait_for_timeout_secs = 0

[[tiles]]
name = "similar"
tile_type = "word_sim"
wait_for = ["freq"]
api_url = "scripted://sim"
query_types = ["single", "translat"]

[[tiles]]
name = "conc"
tile_type = "concordance"
api_url = "scripted://conc"
corpname = "syn2020"
query_types = ["single"]

[[tiles]]
name = "freq"
tile_type = "freq_distrib"
wait_for = ["conc"]
api_url = "scripted://freq"
fcrit = "doc.genre 0"
"#;
        let config = parse_config_str(layout).unwrap();
        let mut dashboard = Dashboard::from_config(&config, &ScriptedProvider::sample()).unwrap();

        let translat = Query {
            lang2: Some("en".to_string()),
            ..query("dům", QueryType::Translat)
        };
        dashboard.submit(translat).unwrap();
        dashboard
            .run_until_settled(Duration::from_secs(2))
            .await
            .unwrap();

        let statuses = dashboard.statuses();
        assert!(statuses.iter().all(|s| s.disabled), "{statuses:?}");

        dashboard.submit(query("dům", QueryType::Single)).unwrap();
        dashboard
            .run_until_settled(Duration::from_secs(2))
            .await
            .unwrap();
        let statuses = dashboard.statuses();
        assert!(statuses.iter().all(|s| !s.disabled && s.error.is_none()), "{statuses:?}");
    }

    #[tokio::test]
    async fn test_timeout_names_busy_tiles() {
        let config = parse_config_str(LAYOUT).unwrap();
        let slow = Arc::new(ScriptedApi::sample().with_delay(Duration::from_secs(30)));
        let provider = ScriptedProvider::sample().with_api("scripted://sim", slow);
        let mut dashboard = Dashboard::from_config(&config, &provider).unwrap();

        dashboard.submit(query("dům", QueryType::Single)).unwrap();
        let result = dashboard.run_until_settled(Duration::from_millis(200)).await;
        match result {
            Err(DashboardError::Timeout { busy, .. }) => assert_eq!(busy, vec!["similar"]),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
