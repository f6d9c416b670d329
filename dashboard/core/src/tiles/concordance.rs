//! Concordance tile
//!
//! Creates a concordance for the current lemma of the first submitted word.
//! Its `conc_id` is what dependent tiles (frequency and time distributions)
//! build their own requests on. A concordance with no hits is a valid,
//! ready result.

use std::sync::Arc;

use serde::Serialize;

use crate::actions::{Action, Query, TileError, TileId, TilePayload};
use crate::api::{lemma_cql, ConcArgs, ConcLine, ConcordanceApi};
use crate::model::{CoordinationError, EffectContext, Effects, TileModel, TileState};
use crate::query::QueryType;
use crate::source::PrioritySource;

use super::{Dependencies, TileType};

/// Concordance tile settings
#[derive(Clone, Debug, PartialEq)]
pub struct ConcordanceConf {
    /// Corpus
    pub corpname: String,
    /// Subcorpus
    pub subcname: Option<String>,
    /// Lines to fetch
    pub max_lines: usize,
    /// Handled query types
    pub query_types: Vec<QueryType>,
}

impl Default for ConcordanceConf {
    fn default() -> Self {
        Self {
            corpname: String::new(),
            subcname: None,
            max_lines: 10,
            query_types: TileType::Concordance.default_query_types().to_vec(),
        }
    }
}

/// Concordance tile state
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConcordanceState {
    /// Loading or waiting
    pub is_busy: bool,
    /// Failure of the last cycle
    pub error: Option<String>,
    /// Corpus
    pub corpname: String,
    /// CQL of the current cycle
    pub query: Option<String>,
    /// Persistence id of the loaded concordance
    pub conc_id: Option<String>,
    /// Number of hits
    pub concsize: u64,
    /// Average reduced frequency
    pub arf: f64,
    /// Instances per million
    pub ipm: f64,
    /// Loaded lines
    pub lines: Vec<ConcLine>,
}

impl ConcordanceState {
    /// Loaded without hits
    #[must_use]
    pub fn is_empty_result(&self) -> bool {
        !self.is_busy && self.error.is_none() && self.conc_id.is_some() && self.concsize == 0
    }
}

impl TileState for ConcordanceState {
    fn is_busy(&self) -> bool {
        self.is_busy
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Concordance tile model
pub struct ConcordanceModel {
    tile_id: TileId,
    conf: ConcordanceConf,
    deps: Dependencies,
    source: Arc<PrioritySource<Arc<dyn ConcordanceApi>>>,
}

impl ConcordanceModel {
    /// Create the model
    #[must_use]
    pub fn new(
        tile_id: TileId,
        conf: ConcordanceConf,
        deps: Dependencies,
        source: PrioritySource<Arc<dyn ConcordanceApi>>,
    ) -> Self {
        Self {
            tile_id,
            conf,
            deps,
            source: Arc::new(source),
        }
    }

    /// State before the first query
    #[must_use]
    pub fn initial_state(&self) -> ConcordanceState {
        ConcordanceState {
            corpname: self.conf.corpname.clone(),
            ..Default::default()
        }
    }

    fn args(&self, query: &Query) -> Result<ConcArgs, TileError> {
        let current = query
            .current_match(0)
            .ok_or_else(|| TileError::InvalidQuery("no query word submitted".to_string()))?;
        Ok(ConcArgs {
            corpname: self.conf.corpname.clone(),
            subcname: self.conf.subcname.clone(),
            query: lemma_cql(current),
            max_lines: self.conf.max_lines,
        })
    }
}

fn fetch(effects: &Effects, source: Arc<PrioritySource<Arc<dyn ConcordanceApi>>>, args: ConcArgs) {
    effects.spawn_load(async move {
        let selected = source
            .call_with_fallback(|api| {
                let args = args.clone();
                async move { api.call(&args).await }
            })
            .await?;
        tracing::debug!(instance = selected.index, conc_id = %selected.value.conc_id, "concordance loaded");
        Ok::<_, TileError>(TilePayload::Concordance(selected.value))
    });
}

impl TileModel for ConcordanceModel {
    type State = ConcordanceState;

    fn tile_id(&self) -> TileId {
        self.tile_id
    }

    fn supports_query_type(&self, query_type: QueryType) -> bool {
        self.conf.query_types.contains(&query_type)
    }

    fn reduce(&self, state: &Arc<ConcordanceState>, action: &Action) -> Arc<ConcordanceState> {
        match action {
            Action::SubmitQuery { query } => Arc::new(ConcordanceState {
                is_busy: true,
                query: query.current_match(0).map(lemma_cql),
                corpname: state.corpname.clone(),
                ..Default::default()
            }),
            Action::TileDataLoaded {
                tile_id,
                payload,
                error,
                ..
            } if *tile_id == self.tile_id => {
                let mut next = ConcordanceState {
                    is_busy: false,
                    corpname: state.corpname.clone(),
                    query: state.query.clone(),
                    ..Default::default()
                };
                if let Some(err) = error {
                    next.error = Some(err.to_string());
                } else if let TilePayload::Concordance(resp) = payload {
                    next.conc_id = Some(resp.conc_id.clone());
                    next.concsize = resp.concsize;
                    next.arf = resp.arf;
                    next.ipm = resp.ipm;
                    next.lines = resp.lines.clone();
                }
                Arc::new(next)
            }
            _ => state.clone(),
        }
    }

    fn run_effects(
        &mut self,
        state: &Arc<ConcordanceState>,
        action: &Action,
        ctx: &mut EffectContext<'_, ConcordanceState>,
    ) -> Result<(), CoordinationError> {
        let Action::SubmitQuery { query } = action else {
            return Ok(());
        };

        let args = match self.args(query) {
            Ok(args) => args,
            Err(err) => {
                ctx.fail(err);
                return Ok(());
            }
        };
        let source = self.source.clone();
        if self.deps.is_empty() {
            fetch(ctx, source, args);
            return Ok(());
        }

        let waiting = (**state).clone();
        self.deps.suspend(
            ctx,
            move |_, effects| {
                fetch(effects, source, args);
                None
            },
            move |err| ConcordanceState {
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
    use crate::tiles::test_support::{conc, same, submit};
    use pretty_assertions::assert_eq;

    fn source_of(apis: &[Arc<ScriptedApi>], weights: Vec<f64>) -> PrioritySource<Arc<dyn ConcordanceApi>> {
        let mut source = PrioritySource::new(weights);
        for (i, api) in apis.iter().enumerate() {
            let api: Arc<dyn ConcordanceApi> = api.clone();
            source.add_instance(i, api).unwrap();
        }
        source
    }

    fn model(source: PrioritySource<Arc<dyn ConcordanceApi>>) -> ConcordanceModel {
        ConcordanceModel::new(
            TileId(0),
            ConcordanceConf {
                corpname: "syn2020".to_string(),
                ..Default::default()
            },
            Dependencies::none(),
            source,
        )
    }

    #[tokio::test]
    async fn test_loads_concordance() {
        let api = Arc::new(ScriptedApi::new().with_concordance(conc("c1", 120)));
        let model = model(source_of(&[api.clone()], Vec::new()));
        let initial = model.initial_state();
        let mut bus = ActionBus::new();
        let handle = bus.register(model, initial).unwrap();

        bus.dispatch(submit("house"));
        bus.step().await.unwrap();
        assert!(handle.state().is_busy);
        assert_eq!(handle.state().query.as_deref(), Some("[lemma=\"house\"]"));
        assert!(!bus.status(TileId(0)).unwrap().suspended);

        bus.step().await.unwrap();
        let state = handle.state();
        assert!(!state.is_busy);
        assert_eq!(state.error, None);
        assert_eq!(state.conc_id.as_deref(), Some("c1"));
        assert_eq!(state.concsize, 120);

        match &api.calls()[..] {
            [ScriptedCall::Concordance(args)] => assert_eq!(args.corpname, "syn2020"),
            other => panic!("unexpected calls: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_concordance_is_ready() {
        let api = Arc::new(ScriptedApi::new().with_concordance(conc("c0", 0)));
        let model = model(source_of(&[api], Vec::new()));
        let initial = model.initial_state();
        let mut bus = ActionBus::new();
        let handle = bus.register(model, initial).unwrap();

        bus.dispatch(submit("xyzzy"));
        bus.step().await.unwrap();
        bus.step().await.unwrap();

        assert!(handle.state().is_empty_result());
    }

    #[tokio::test]
    async fn test_falls_back_to_next_instance() {
        let primary = Arc::new(ScriptedApi::new().failing("503"));
        let secondary = Arc::new(ScriptedApi::new().with_concordance(conc("c2", 3)));
        let model = model(source_of(&[primary.clone(), secondary.clone()], vec![2.0, 1.0]));
        let initial = model.initial_state();
        let mut bus = ActionBus::new();
        let handle = bus.register(model, initial).unwrap();

        bus.dispatch(submit("house"));
        bus.step().await.unwrap();
        bus.step().await.unwrap();

        assert_eq!(handle.state().conc_id.as_deref(), Some("c2"));
        assert_eq!(primary.calls().len(), 1);
        assert_eq!(secondary.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_reduce_ignores_other_tiles() {
        let model = model(PrioritySource::default());
        let state = Arc::new(model.initial_state());
        let other = Action::loaded(TileId(5), 1, TilePayload::Concordance(conc("x", 1)));
        assert!(same(&state, &model.reduce(&state, &other)));

        let own_error = Action::failed(TileId(0), 1, TileError::Api("down".to_string()));
        let next = model.reduce(&state, &own_error);
        assert_eq!(next.error.as_deref(), Some("API call failed: down"));
        assert!(!next.is_busy);
    }
}
