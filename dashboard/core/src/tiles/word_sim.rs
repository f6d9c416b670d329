//! Word similarity tile
//!
//! Looks up words similar to the selected variant of the submitted word.
//! Results below `min_score` are dropped and at most `max_result_items` are
//! kept.

use std::sync::Arc;

use serde::Serialize;

use crate::actions::{Action, Query, TileError, TileId, TilePayload};
use crate::api::{SimilarWord, WordSimApi, WordSimArgs};
use crate::model::{CoordinationError, EffectContext, Effects, TileModel, TileState};
use crate::query::QueryType;
use crate::source::PrioritySource;

use super::{Dependencies, TileType};

/// Word similarity tile settings
#[derive(Clone, Debug, PartialEq)]
pub struct WordSimConf {
    /// Results kept
    pub max_result_items: usize,
    /// Lowest accepted score
    pub min_score: f64,
    /// Corpus the similarity model was built from
    pub corpname: Option<String>,
    /// Handled query types
    pub query_types: Vec<QueryType>,
}

impl Default for WordSimConf {
    fn default() -> Self {
        Self {
            max_result_items: 20,
            min_score: 0.0,
            corpname: None,
            query_types: TileType::WordSim.default_query_types().to_vec(),
        }
    }
}

/// Word similarity tile state
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WordSimState {
    /// Loading or waiting
    pub is_busy: bool,
    /// Failure of the last cycle
    pub error: Option<String>,
    /// Word the results belong to
    pub word: Option<String>,
    /// Similar words, best first
    pub words: Vec<SimilarWord>,
}

impl TileState for WordSimState {
    fn is_busy(&self) -> bool {
        self.is_busy
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Word similarity tile model
pub struct WordSimModel {
    tile_id: TileId,
    conf: WordSimConf,
    deps: Dependencies,
    source: Arc<PrioritySource<Arc<dyn WordSimApi>>>,
}

impl WordSimModel {
    /// Create the model
    #[must_use]
    pub fn new(
        tile_id: TileId,
        conf: WordSimConf,
        deps: Dependencies,
        source: PrioritySource<Arc<dyn WordSimApi>>,
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
    pub fn initial_state(&self) -> WordSimState {
        WordSimState::default()
    }

    fn args(&self, query: &Query) -> Result<WordSimArgs, TileError> {
        let current = query
            .current_match(0)
            .ok_or_else(|| TileError::InvalidQuery("no query word submitted".to_string()))?;
        Ok(WordSimArgs {
            word: current.word.clone(),
            max_items: self.conf.max_result_items,
            corpname: self.conf.corpname.clone(),
        })
    }
}

/// Drop low scores, order best first, truncate
fn select_words(mut words: Vec<SimilarWord>, min_score: f64, max_items: usize) -> Vec<SimilarWord> {
    words.retain(|w| w.score >= min_score);
    words.sort_by(|a, b| b.score.total_cmp(&a.score));
    words.truncate(max_items);
    words
}

fn fetch(
    effects: &Effects,
    source: Arc<PrioritySource<Arc<dyn WordSimApi>>>,
    args: WordSimArgs,
    min_score: f64,
) {
    effects.spawn_load(async move {
        let selected = source
            .call_with_fallback(|api| {
                let args = args.clone();
                async move { api.call(&args).await }
            })
            .await?;
        let words = select_words(selected.value, min_score, args.max_items);
        Ok::<_, TileError>(TilePayload::WordSim(words))
    });
}

impl TileModel for WordSimModel {
    type State = WordSimState;

    fn tile_id(&self) -> TileId {
        self.tile_id
    }

    fn supports_query_type(&self, query_type: QueryType) -> bool {
        self.conf.query_types.contains(&query_type)
    }

    fn reduce(&self, state: &Arc<WordSimState>, action: &Action) -> Arc<WordSimState> {
        match action {
            Action::SubmitQuery { query } => Arc::new(WordSimState {
                is_busy: true,
                error: None,
                word: query.current_match(0).map(|m| m.word.clone()),
                words: Vec::new(),
            }),
            Action::TileDataLoaded {
                tile_id,
                payload,
                error,
                ..
            } if *tile_id == self.tile_id => {
                let words = match (error, payload) {
                    (None, TilePayload::WordSim(words)) => words.clone(),
                    _ => Vec::new(),
                };
                Arc::new(WordSimState {
                    is_busy: false,
                    error: error.as_ref().map(ToString::to_string),
                    word: state.word.clone(),
                    words,
                })
            }
            _ => state.clone(),
        }
    }

    fn run_effects(
        &mut self,
        state: &Arc<WordSimState>,
        action: &Action,
        ctx: &mut EffectContext<'_, WordSimState>,
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
        let min_score = self.conf.min_score;
        if self.deps.is_empty() {
            fetch(ctx, source, args, min_score);
            return Ok(());
        }

        let waiting = (**state).clone();
        self.deps.suspend(
            ctx,
            move |_, effects| {
                fetch(effects, source, args, min_score);
                None
            },
            move |err| WordSimState {
                is_busy: false,
                error: Some(err.to_string()),
                ..waiting
            },
        )
    }
}
