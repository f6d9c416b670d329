//! Frequency distribution tile
//!
//! Computes one or more frequency distributions (one per criterion in
//! `fcrit`, e.g. genre and medium) of an upstream concordance. Criteria are
//! requested one after another; each block arrives as a separate
//! `TileDataLoaded` and the tile stays busy until every block is ready.

use std::sync::Arc;

use serde::Serialize;

use crate::actions::{Action, TileError, TileId, TilePayload};
use crate::api::{FreqArgs, FreqDistribApi, FreqRow};
use crate::model::{CoordinationError, EffectContext, Effects, TileModel, TileState};
use crate::query::QueryType;
use crate::source::PrioritySource;

use super::{upstream_conc_id, Dependencies, TileType};

/// Frequency distribution tile settings
#[derive(Clone, Debug, PartialEq)]
pub struct FreqDistribConf {
    /// Corpus
    pub corpname: String,
    /// Subcorpus
    pub subcname: Option<String>,
    /// Criteria, one block each
    pub fcrit: Vec<String>,
    /// Block labels, parallel to `fcrit`
    pub crit_labels: Vec<String>,
    /// Rows kept per block
    pub max_num_categories: usize,
    /// Minimum frequency
    pub flimit: u64,
    /// Handled query types
    pub query_types: Vec<QueryType>,
}

impl Default for FreqDistribConf {
    fn default() -> Self {
        Self {
            corpname: String::new(),
            subcname: None,
            fcrit: Vec::new(),
            crit_labels: Vec::new(),
            max_num_categories: 10,
            flimit: 1,
            query_types: TileType::FreqDistrib.default_query_types().to_vec(),
        }
    }
}

/// Distribution for one criterion
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FreqBlock {
    /// Block label
    pub label: String,
    /// Rows, by ipm descending
    pub rows: Vec<FreqRow>,
    /// Loaded in the current cycle
    pub is_ready: bool,
}

/// Frequency distribution tile state
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FreqDistribState {
    /// Loading or waiting
    pub is_busy: bool,
    /// Failure of the last cycle
    pub error: Option<String>,
    /// Visible block
    pub active_block: usize,
    /// One block per criterion
    pub blocks: Vec<FreqBlock>,
    /// Concordance the blocks were computed from
    pub conc_id: Option<String>,
}

impl TileState for FreqDistribState {
    fn is_busy(&self) -> bool {
        self.is_busy
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Frequency distribution tile model
pub struct FreqDistribModel {
    tile_id: TileId,
    conf: Arc<FreqDistribConf>,
    deps: Dependencies,
    source: Arc<PrioritySource<Arc<dyn FreqDistribApi>>>,
}

impl FreqDistribModel {
    /// Create the model
    #[must_use]
    pub fn new(
        tile_id: TileId,
        conf: FreqDistribConf,
        deps: Dependencies,
        source: PrioritySource<Arc<dyn FreqDistribApi>>,
    ) -> Self {
        Self {
            tile_id,
            conf: Arc::new(conf),
            deps,
            source: Arc::new(source),
        }
    }

    fn empty_blocks(&self, is_ready: bool) -> Vec<FreqBlock> {
        (0..self.conf.fcrit.len())
            .map(|i| FreqBlock {
                label: self
                    .conf
                    .crit_labels
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| self.conf.fcrit[i].clone()),
                rows: Vec::new(),
                is_ready,
            })
            .collect()
    }

    /// State before the first query
    #[must_use]
    pub fn initial_state(&self) -> FreqDistribState {
        FreqDistribState {
            blocks: self.empty_blocks(false),
            ..Default::default()
        }
    }
}

/// Request every criterion in order, stopping at the first failure
async fn load_blocks(
    effects: Effects,
    conf: Arc<FreqDistribConf>,
    source: Arc<PrioritySource<Arc<dyn FreqDistribApi>>>,
    conc_id: String,
) {
    let tile_id = effects.tile_id();
    let cycle = effects.cycle();
    let block_count = conf.fcrit.len();
    if block_count == 0 {
        effects.fail(TileError::InvalidQuery("no frequency criteria configured".to_string()));
        return;
    }
    for (crit_idx, fcrit) in conf.fcrit.iter().enumerate() {
        let args = FreqArgs {
            corpname: conf.corpname.clone(),
            subcname: conf.subcname.clone(),
            conc_id: conc_id.clone(),
            fcrit: fcrit.clone(),
            flimit: conf.flimit,
        };
        let result = source
            .call_with_fallback(|api| {
                let args = args.clone();
                async move { api.call(&args).await }
            })
            .await;
        match result {
            Ok(selected) => {
                let mut rows = selected.value.rows;
                rows.sort_by(|a, b| b.ipm.total_cmp(&a.ipm));
                rows.truncate(conf.max_num_categories);
                tracing::debug!(%tile_id, crit_idx, instance = selected.index, "frequency block loaded");
                effects.dispatch(Action::loaded(
                    tile_id,
                    cycle,
                    TilePayload::FreqBlock {
                        crit_idx,
                        block_count,
                        conc_id: Some(selected.value.conc_id),
                        rows,
                    },
                ));
            }
            Err(err) => {
                effects.fail(err.into());
                return;
            }
        }
    }
}

impl TileModel for FreqDistribModel {
    type State = FreqDistribState;

    fn tile_id(&self) -> TileId {
        self.tile_id
    }

    fn supports_query_type(&self, query_type: QueryType) -> bool {
        self.conf.query_types.contains(&query_type)
    }

    fn reduce(&self, state: &Arc<FreqDistribState>, action: &Action) -> Arc<FreqDistribState> {
        match action {
            Action::SubmitQuery { .. } => Arc::new(FreqDistribState {
                is_busy: true,
                error: None,
                active_block: state.active_block,
                blocks: self.empty_blocks(false),
                conc_id: None,
            }),
            Action::SetActiveBlock { tile_id, idx }
                if *tile_id == self.tile_id && *idx < state.blocks.len() =>
            {
                Arc::new(FreqDistribState {
                    active_block: *idx,
                    ..(**state).clone()
                })
            }
            Action::TileDataLoaded {
                tile_id,
                payload,
                error,
                ..
            } if *tile_id == self.tile_id => {
                if let Some(err) = error {
                    return Arc::new(FreqDistribState {
                        is_busy: false,
                        error: Some(err.to_string()),
                        active_block: state.active_block,
                        blocks: self.empty_blocks(true),
                        conc_id: None,
                    });
                }
                let TilePayload::FreqBlock {
                    crit_idx,
                    conc_id,
                    rows,
                    ..
                } = payload
                else {
                    return state.clone();
                };
                let mut next = (**state).clone();
                if let Some(block) = next.blocks.get_mut(*crit_idx) {
                    block.rows = rows.clone();
                    block.is_ready = true;
                }
                next.is_busy = next.blocks.iter().any(|b| !b.is_ready);
                next.conc_id = conc_id.clone();
                Arc::new(next)
            }
            _ => state.clone(),
        }
    }

    fn run_effects(
        &mut self,
        state: &Arc<FreqDistribState>,
        action: &Action,
        ctx: &mut EffectContext<'_, FreqDistribState>,
    ) -> Result<(), CoordinationError> {
        if !matches!(action, Action::SubmitQuery { .. }) {
            return Ok(());
        }

        if self.deps.is_empty() {
            ctx.fail(TileError::InvalidQuery(
                "no upstream concordance tile configured".to_string(),
            ));
            return Ok(());
        }

        let conf = self.conf.clone();
        let source = self.source.clone();
        let waiting = (**state).clone();
        let failed_blocks = self.empty_blocks(true);
        self.deps.suspend(
            ctx,
            move |data, effects: &Effects| {
                match upstream_conc_id(&data) {
                    Ok(conc_id) => {
                        let owner = effects.clone();
                        effects.spawn(move |_| load_blocks(owner, conf, source, conc_id));
                    }
                    Err(err) => effects.fail(err),
                }
                None
            },
            move |err| FreqDistribState {
                is_busy: false,
                error: Some(err.to_string()),
                blocks: failed_blocks,
                ..waiting
            },
        )
    }
}
