//! Time distribution tile
//!
//! Frequency of the queried lemma over time. Each configured API URL
//! provides a pair of backends (concordance, time distribution) ranked by a
//! [`PrioritySource`]. The tile works in one of two modes:
//!
//! - **dependent** (`wait_for` set): reuses the upstream concordance and
//!   only asks for its time distribution, within the first subcorpus
//! - **independent**: creates its own concordance in every configured
//!   subcorpus and merges the distributions
//!
//! In independent mode the concordance call picks the instance (with
//! fallback) and the time distribution call is pinned to the same instance,
//! since a `conc_id` is only meaningful to the server that created it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::actions::{Action, Query, TileError, TileId, TilePayload};
use crate::api::{
    lemma_cql, ConcArgs, ConcordanceApi, TimeDataPoint, TimeDistribApi, TimeDistribArgs,
};
use crate::model::{CoordinationError, EffectContext, Effects, TileModel, TileState};
use crate::query::QueryType;
use crate::source::PrioritySource;

use super::{upstream_conc_id, Dependencies, TileType};

/// Default time criterion
pub const DEFAULT_TIME_FCRIT: &str = "doc.pubyear 0";

/// Backends served by one API URL
#[derive(Clone)]
pub struct TimeDistribBackend {
    /// Creates concordances
    pub conc: Arc<dyn ConcordanceApi>,
    /// Computes their time distributions
    pub time: Arc<dyn TimeDistribApi>,
}

/// Time distribution tile settings
#[derive(Clone, Debug, PartialEq)]
pub struct TimeDistribConf {
    /// Corpus
    pub corpname: String,
    /// Subcorpora (none means the whole corpus)
    pub subcnames: Vec<String>,
    /// Time criterion
    pub fcrit: String,
    /// Handled query types
    pub query_types: Vec<QueryType>,
}

impl Default for TimeDistribConf {
    fn default() -> Self {
        Self {
            corpname: String::new(),
            subcnames: Vec::new(),
            fcrit: DEFAULT_TIME_FCRIT.to_string(),
            query_types: TileType::TimeDistrib.default_query_types().to_vec(),
        }
    }
}

/// Time distribution tile state
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TimeDistribState {
    /// Loading or waiting
    pub is_busy: bool,
    /// Failure of the last cycle
    pub error: Option<String>,
    /// Word the data belong to
    pub word: Option<String>,
    /// Concordance the data were computed from (single concordance only)
    pub conc_id: Option<String>,
    /// Data points ordered by time
    pub points: Vec<TimeDataPoint>,
}

impl TileState for TimeDistribState {
    fn is_busy(&self) -> bool {
        self.is_busy
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

type Backends = Arc<PrioritySource<TimeDistribBackend>>;

/// Time distribution tile model
pub struct TimeDistribModel {
    tile_id: TileId,
    conf: Arc<TimeDistribConf>,
    deps: Dependencies,
    source: Backends,
}

impl TimeDistribModel {
    /// Create the model
    #[must_use]
    pub fn new(
        tile_id: TileId,
        conf: TimeDistribConf,
        deps: Dependencies,
        source: PrioritySource<TimeDistribBackend>,
    ) -> Self {
        if deps.upstream().len() > 1 {
            tracing::warn!(%tile_id, "time distribution uses only its first upstream tile");
        }
        Self {
            tile_id,
            conf: Arc::new(conf),
            deps,
            source: Arc::new(source),
        }
    }

    /// State before the first query
    #[must_use]
    pub fn initial_state(&self) -> TimeDistribState {
        TimeDistribState::default()
    }

    fn lemma_query(query: &Query) -> Result<String, TileError> {
        query
            .current_match(0)
            .map(lemma_cql)
            .ok_or_else(|| TileError::InvalidQuery("no query word submitted".to_string()))
    }
}

/// Sum frequencies of equal periods; output ordered by period
fn merge_points(series: impl IntoIterator<Item = Vec<TimeDataPoint>>) -> Vec<TimeDataPoint> {
    let mut merged: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    for point in series.into_iter().flatten() {
        let entry = merged.entry(point.datetime).or_default();
        entry.0 += point.freq;
        entry.1 += point.norm;
    }
    merged
        .into_iter()
        .map(|(datetime, (freq, norm))| TimeDataPoint {
            datetime,
            freq,
            norm,
        })
        .collect()
}

/// Dependent mode: distribution of an existing concordance
fn load_for_conc(effects: &Effects, conf: Arc<TimeDistribConf>, source: Backends, conc_id: String) {
    effects.spawn_load(async move {
        let args = TimeDistribArgs {
            corpname: conf.corpname.clone(),
            subcname: conf.subcnames.first().cloned(),
            conc_id: conc_id.clone(),
            fcrit: conf.fcrit.clone(),
        };
        let selected = source
            .call_with_fallback(|backend| {
                let args = args.clone();
                async move { backend.time.call(&args).await }
            })
            .await?;
        Ok::<_, TileError>(TilePayload::TimeDistrib {
            conc_id: Some(conc_id),
            points: merge_points([selected.value.points]),
        })
    });
}

/// Independent mode: own concordance per subcorpus, merged distribution
fn load_independent(effects: &Effects, conf: Arc<TimeDistribConf>, source: Backends, cql: String) {
    let tile_id = effects.tile_id();
    effects.spawn_load(async move {
        let subcnames: Vec<Option<String>> = if conf.subcnames.is_empty() {
            vec![None]
        } else {
            conf.subcnames.iter().cloned().map(Some).collect()
        };

        let mut series = Vec::with_capacity(subcnames.len());
        let mut conc_ids = Vec::with_capacity(subcnames.len());
        for subcname in subcnames {
            let conc_args = ConcArgs {
                corpname: conf.corpname.clone(),
                subcname: subcname.clone(),
                query: cql.clone(),
                max_lines: 0,
            };
            let conc = source
                .call_with_fallback(|backend| {
                    let args = conc_args.clone();
                    async move { backend.conc.call(&args).await }
                })
                .await?;
            if conc.value.concsize == 0 {
                tracing::debug!(%tile_id, subcname = ?subcname, "empty concordance, no time data");
                continue;
            }

            let time_args = TimeDistribArgs {
                corpname: conf.corpname.clone(),
                subcname,
                conc_id: conc.value.conc_id.clone(),
                fcrit: conf.fcrit.clone(),
            };
            let resp = source
                .call_pinned(conc.index, |backend| async move {
                    backend.time.call(&time_args).await
                })
                .await?;
            conc_ids.push(conc.value.conc_id);
            series.push(resp.points);
        }

        let conc_id = match conc_ids.as_slice() {
            [single] => Some(single.clone()),
            _ => None,
        };
        Ok::<_, TileError>(TilePayload::TimeDistrib {
            conc_id,
            points: merge_points(series),
        })
    });
}

impl TileModel for TimeDistribModel {
    type State = TimeDistribState;

    fn tile_id(&self) -> TileId {
        self.tile_id
    }

    fn supports_query_type(&self, query_type: QueryType) -> bool {
        self.conf.query_types.contains(&query_type)
    }

    fn reduce(&self, state: &Arc<TimeDistribState>, action: &Action) -> Arc<TimeDistribState> {
        match action {
            Action::SubmitQuery { query } => Arc::new(TimeDistribState {
                is_busy: true,
                word: query.current_match(0).map(|m| m.word.clone()),
                ..Default::default()
            }),
            Action::TileDataLoaded {
                tile_id,
                payload,
                error,
                ..
            } if *tile_id == self.tile_id => {
                let mut next = TimeDistribState {
                    is_busy: false,
                    error: error.as_ref().map(ToString::to_string),
                    word: state.word.clone(),
                    ..Default::default()
                };
                if let (None, TilePayload::TimeDistrib { conc_id, points }) = (error, payload) {
                    next.conc_id = conc_id.clone();
                    next.points = points.clone();
                }
                Arc::new(next)
            }
            _ => state.clone(),
        }
    }

    fn run_effects(
        &mut self,
        state: &Arc<TimeDistribState>,
        action: &Action,
        ctx: &mut EffectContext<'_, TimeDistribState>,
    ) -> Result<(), CoordinationError> {
        let Action::SubmitQuery { query } = action else {
            return Ok(());
        };

        let conf = self.conf.clone();
        let source = self.source.clone();

        if self.deps.is_empty() {
            match Self::lemma_query(query) {
                Ok(cql) => load_independent(ctx, conf, source, cql),
                Err(err) => ctx.fail(err),
            }
            return Ok(());
        }

        let waiting = (**state).clone();
        self.deps.suspend(
            ctx,
            move |data, effects: &Effects| {
                // only the first upstream tile is consulted
                match upstream_conc_id(&data[..data.len().min(1)]) {
                    Ok(conc_id) => load_for_conc(effects, conf, source, conc_id),
                    Err(err) => effects.fail(err),
                }
                None
            },
            move |err| TimeDistribState {
                is_busy: false,
                error: Some(err.to_string()),
                ..waiting
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::scripted::{ScriptedApi, ScriptedCall};
    use crate::bus::ActionBus;
    use crate::tiles::test_support::{conc, submit};
    use pretty_assertions::assert_eq;

    fn point(year: &str, freq: u64) -> TimeDataPoint {
        TimeDataPoint {
            datetime: year.to_string(),
            freq,
            norm: 100,
        }
    }

    fn backend(api: &Arc<ScriptedApi>) -> TimeDistribBackend {
        TimeDistribBackend {
            conc: api.clone(),
            time: api.clone(),
        }
    }

    #[test]
    fn test_merge_points() {
        let merged = merge_points([
            vec![point("2020", 3), point("2019", 1)],
            vec![point("2020", 2), point("2021", 7)],
        ]);
        assert_eq!(
            merged,
            vec![
                point("2019", 1),
                TimeDataPoint {
                    datetime: "2020".to_string(),
                    freq: 5,
                    norm: 200
                },
                point("2021", 7),
            ]
        );
    }

    #[tokio::test]
    async fn test_independent_mode_pins_time_call_to_conc_instance() {
        // instance 0 is preferred but its concordance call fails
        let broken = Arc::new(ScriptedApi::new().failing("conc down"));
        let working = Arc::new(
            ScriptedApi::new()
                .with_concordance(conc("w1", 5))
                .with_time_points(vec![point("2019", 2), point("2020", 4)]),
        );
        let mut source = PrioritySource::new(vec![2.0, 1.0]);
        source.add_instance(0, backend(&broken)).unwrap();
        source.add_instance(1, backend(&working)).unwrap();

        let model = TimeDistribModel::new(
            TileId(4),
            TimeDistribConf {
                corpname: "syn2020".to_string(),
                subcnames: vec!["fiction".to_string(), "news".to_string()],
                ..Default::default()
            },
            Dependencies::none(),
            source,
        );
        let initial = model.initial_state();
        let mut bus = ActionBus::new();
        let handle = bus.register(model, initial).unwrap();

        bus.dispatch(submit("house"));
        bus.step().await.unwrap();
        bus.step().await.unwrap();

        let state = handle.state();
        assert!(!state.is_busy, "{state:?}");
        assert_eq!(state.error, None);
        assert_eq!(state.conc_id, None);
        assert_eq!(
            state.points,
            vec![
                TimeDataPoint {
                    datetime: "2019".to_string(),
                    freq: 4,
                    norm: 200
                },
                TimeDataPoint {
                    datetime: "2020".to_string(),
                    freq: 8,
                    norm: 200
                },
            ]
        );

        // the broken instance never saw a time distribution request
        assert!(broken
            .calls()
            .iter()
            .all(|c| matches!(c, ScriptedCall::Concordance(_))));
        let time_calls = working
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ScriptedCall::TimeDistrib(_)))
            .count();
        assert_eq!(time_calls, 2);
    }

    #[tokio::test]
    async fn test_dependent_mode_reuses_upstream_conc() {
        let api = Arc::new(ScriptedApi::new().with_time_points(vec![point("2020", 1)]));
        let mut source = PrioritySource::default();
        source.add_instance(0, backend(&api)).unwrap();
        let model = TimeDistribModel::new(
            TileId(4),
            TimeDistribConf::default(),
            Dependencies::new(vec![TileId(0)], None),
            source,
        );
        let initial = model.initial_state();
        let mut bus = ActionBus::new();
        let handle = bus.register(model, initial).unwrap();

        bus.dispatch(submit("house"));
        bus.dispatch(Action::loaded(TileId(0), 1, TilePayload::Concordance(conc("up1", 9))));
        for _ in 0..3 {
            bus.step().await.unwrap();
        }

        let state = handle.state();
        assert_eq!(state.conc_id.as_deref(), Some("up1"));
        assert_eq!(state.points, vec![point("2020", 1)]);
        match &api.calls()[..] {
            [ScriptedCall::TimeDistrib(args)] => {
                assert_eq!(args.conc_id, "up1");
                assert_eq!(args.fcrit, DEFAULT_TIME_FCRIT);
            }
            other => panic!("unexpected calls: {other:?}"),
        }
    }
}
