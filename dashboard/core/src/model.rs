//! Tile Coordination Model
//!
//! Every tile is a stateless model: a pure [`TileModel::reduce`] producing a
//! new state per action and a separate [`TileModel::run_effects`] phase for
//! side effects. Effects never touch state; their results come back as
//! actions.
//!
//! # Suspension
//!
//! A tile that must wait for other tiles installs a [`Suspension`] from its
//! effect phase. While suspended, the runner stops reducing and feeds every
//! action to the suspension instead:
//!
//! ```text
//!             SubmitQuery
//! reduce ------------------> run_effects --suspend()--> [suspended]
//!   ^                                                       |
//!   |                 observe(action) -> Step { done }      |
//!   +------------- next action after done <-----------------+
//! ```
//!
//! The last `derived_state` reported by the suspension is committed at the
//! completing action. Only one suspension can be active per tile.
//!
//! # Cycles
//!
//! The runner counts `SubmitQuery` actions. Loads spawned through
//! [`Effects`] are stamped with the cycle current at spawn time, and the
//! runner drops its tile's own `TileDataLoaded` from any other cycle before
//! the reducer sees it.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::actions::{Action, TileError, TileId, TilePayload};
use crate::bus::Dispatcher;
use crate::query::QueryType;

// ============================================================================
// Errors
// ============================================================================

/// Usage errors in the coordination layer
///
/// These are programming errors, not data failures; data failures travel on
/// the bus as [`TileError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// A tile requested a suspension while one was already active
    #[error("{tile_id} requested a suspension while already suspended")]
    AlreadySuspended {
        /// Offending tile
        tile_id: TileId,
    },

    /// No tile with this id is registered
    #[error("unknown tile {0}")]
    UnknownTile(TileId),

    /// A tile with this id is already registered
    #[error("tile {0} registered twice")]
    DuplicateTile(TileId),

    /// All senders of the bus were dropped
    #[error("action bus closed")]
    BusClosed,
}

// ============================================================================
// State & Suspension Contracts
// ============================================================================

/// State owned by a single tile model
pub trait TileState: Clone + fmt::Debug + Send + Sync + Serialize + 'static {
    /// Whether the tile is loading or waiting
    fn is_busy(&self) -> bool;

    /// Error message of the last cycle, if it failed
    fn error(&self) -> Option<&str>;
}

/// Result of feeding one action to a suspension
#[derive(Debug, Clone, PartialEq)]
pub struct Step<S> {
    /// Leave the suspended mode after this action
    pub done: bool,
    /// State to commit when the suspension completes
    pub derived_state: Option<S>,
}

impl<S> Step<S> {
    /// Keep waiting
    #[must_use]
    pub fn pending() -> Self {
        Self {
            done: false,
            derived_state: None,
        }
    }

    /// Resume without changing state
    #[must_use]
    pub fn done() -> Self {
        Self {
            done: true,
            derived_state: None,
        }
    }

    /// Resume and commit `state`
    #[must_use]
    pub fn done_with(state: S) -> Self {
        Self {
            done: true,
            derived_state: Some(state),
        }
    }
}

/// Action filter installed while a tile waits for something
pub trait Suspension<S>: Send {
    /// Inspect an action; `effects` may be used to issue follow-up work
    fn observe(&mut self, action: &Action, effects: &Effects) -> Step<S>;
}

impl<S, F> Suspension<S> for F
where
    F: FnMut(&Action, &Effects) -> Step<S> + Send,
{
    fn observe(&mut self, action: &Action, effects: &Effects) -> Step<S> {
        self(action, effects)
    }
}

/// A tile's reducer and effect logic
pub trait TileModel: Send + 'static {
    /// State type
    type State: TileState;

    /// Id of the tile this model belongs to
    fn tile_id(&self) -> TileId;

    /// Whether the tile can handle a query of the given type
    fn supports_query_type(&self, _query_type: QueryType) -> bool {
        true
    }

    /// Produce the next state
    ///
    /// Must be pure. Actions not concerning the tile return `state` itself
    /// (the same `Arc`).
    fn reduce(&self, state: &Arc<Self::State>, action: &Action) -> Arc<Self::State>;

    /// Side effects for an action, run after `reduce` with the new state
    ///
    /// # Errors
    ///
    /// Usage errors such as a second [`EffectContext::suspend`].
    fn run_effects(
        &mut self,
        state: &Arc<Self::State>,
        action: &Action,
        ctx: &mut EffectContext<'_, Self::State>,
    ) -> Result<(), CoordinationError>;
}

// ============================================================================
// Effects
// ============================================================================

/// Handle through which a tile issues side effects
///
/// Every spawned future is guarded: a panic inside it becomes the tile's own
/// failed `TileDataLoaded`.
#[derive(Clone, Debug)]
pub struct Effects {
    tile_id: TileId,
    cycle: u64,
    dispatcher: Dispatcher,
}

impl Effects {
    /// Create effects for a tile
    #[must_use]
    pub fn new(tile_id: TileId, dispatcher: Dispatcher) -> Self {
        Self {
            tile_id,
            cycle: 0,
            dispatcher,
        }
    }

    /// Effects issuing work for query cycle `cycle`
    #[must_use]
    pub fn in_cycle(mut self, cycle: u64) -> Self {
        self.cycle = cycle;
        self
    }

    /// Tile the effects belong to
    #[must_use]
    pub fn tile_id(&self) -> TileId {
        self.tile_id
    }

    /// Query cycle loads are stamped with
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Dispatcher of the bus
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Enqueue an action on the bus
    pub fn dispatch(&self, action: Action) {
        self.dispatcher.dispatch(action);
    }

    /// Dispatch a failed `TileDataLoaded` of this tile for the current cycle
    pub fn fail(&self, error: TileError) {
        self.dispatch(Action::failed(self.tile_id, self.cycle, error));
    }

    /// Run a load and dispatch its result as this tile's `TileDataLoaded`
    pub fn spawn_load<F>(&self, load: F)
    where
        F: Future<Output = Result<TilePayload, TileError>> + Send + 'static,
    {
        let tile_id = self.tile_id;
        let cycle = self.cycle;
        self.spawn(move |dispatcher| async move {
            let action = match load.await {
                Ok(payload) => Action::loaded(tile_id, cycle, payload),
                Err(err) => Action::failed(tile_id, cycle, err),
            };
            dispatcher.dispatch(action);
        });
    }

    /// Run an arbitrary task which dispatches its own actions
    pub fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(Dispatcher) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tile_id = self.tile_id;
        let cycle = self.cycle;
        let dispatcher = self.dispatcher.clone();
        let fut = task(dispatcher.clone());
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                let reason = panic_message(panic.as_ref());
                tracing::error!(%tile_id, cycle, %reason, "tile effect panicked");
                dispatcher.dispatch(Action::failed(tile_id, cycle, TileError::Effect(reason)));
            }
        });
    }

    /// Dispatch `WaitTimeout` for this tile and the current cycle after `after`
    pub fn schedule_timeout(&self, after: Duration) {
        let tile_id = self.tile_id;
        let cycle = self.cycle;
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            dispatcher.dispatch(Action::WaitTimeout { tile_id, cycle });
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Effect-phase context: [`Effects`] plus the ability to suspend
pub struct EffectContext<'a, S> {
    effects: &'a Effects,
    suspension: &'a mut Option<Box<dyn Suspension<S>>>,
}

impl<'a, S> EffectContext<'a, S> {
    /// Install a suspension
    ///
    /// # Errors
    ///
    /// [`CoordinationError::AlreadySuspended`] if one is active.
    pub fn suspend(&mut self, suspension: impl Suspension<S> + 'static) -> Result<(), CoordinationError> {
        if self.suspension.is_some() {
            let tile_id = self.effects.tile_id();
            tracing::error!(%tile_id, "suspension requested while already suspended");
            return Err(CoordinationError::AlreadySuspended { tile_id });
        }
        tracing::debug!(tile_id = %self.effects.tile_id(), "tile suspended");
        *self.suspension = Some(Box::new(suspension));
        Ok(())
    }

    /// Whether a suspension is active
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspension.is_some()
    }
}

impl<S> std::ops::Deref for EffectContext<'_, S> {
    type Target = Effects;

    fn deref(&self) -> &Effects {
        self.effects
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Read-only view of a tile's state
#[derive(Clone, Debug)]
pub struct TileHandle<S> {
    tile_id: TileId,
    rx: watch::Receiver<Arc<S>>,
}

impl<S> TileHandle<S> {
    /// Tile id
    #[must_use]
    pub fn tile_id(&self) -> TileId {
        self.tile_id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> Arc<S> {
        self.rx.borrow().clone()
    }

    /// Wait for the next published state
    ///
    /// # Errors
    ///
    /// [`CoordinationError::BusClosed`] if the bus was dropped.
    pub async fn changed(&mut self) -> Result<Arc<S>, CoordinationError> {
        self.rx
            .changed()
            .await
            .map_err(|_| CoordinationError::BusClosed)?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

/// Summary of a tile's state
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TileStatus {
    /// Tile id
    pub tile_id: TileId,
    /// Loading or waiting
    pub is_busy: bool,
    /// Last error
    pub error: Option<String>,
    /// A suspension is active
    pub suspended: bool,
    /// Frozen by `disable`
    pub disabled: bool,
}

/// Type-erased runner, as stored by the bus
pub(crate) trait RegisteredTile: Send {
    fn tile_id(&self) -> TileId;
    fn deliver(&mut self, action: &Action) -> Result<(), CoordinationError>;
    fn status(&self) -> TileStatus;
    fn snapshot(&self) -> Result<serde_json::Value, serde_json::Error>;
    fn supports_query_type(&self, query_type: QueryType) -> bool;
    fn disable(&mut self);
    fn enable(&mut self);
}

/// Owns a model, its current state and its suspension
pub struct ModelRunner<M: TileModel> {
    model: M,
    state: Arc<M::State>,
    suspension: Option<Box<dyn Suspension<M::State>>>,
    pending: Option<M::State>,
    effects: Effects,
    publisher: watch::Sender<Arc<M::State>>,
    disabled: bool,
    cycle: u64,
}

impl<M: TileModel> ModelRunner<M> {
    /// Create a runner and a handle observing its state
    pub fn new(model: M, initial: M::State, dispatcher: Dispatcher) -> (Self, TileHandle<M::State>) {
        let tile_id = model.tile_id();
        let state = Arc::new(initial);
        let (publisher, rx) = watch::channel(state.clone());
        let runner = Self {
            model,
            state,
            suspension: None,
            pending: None,
            effects: Effects::new(tile_id, dispatcher),
            publisher,
            disabled: false,
            cycle: 0,
        };
        (runner, TileHandle { tile_id, rx })
    }

    /// Continue cycle numbering from `cycle`, for tiles joining a running bus
    pub(crate) fn starting_at(mut self, cycle: u64) -> Self {
        self.cycle = cycle;
        self.effects = self.effects.in_cycle(cycle);
        self
    }

    /// Current query cycle
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> &Arc<M::State> {
        &self.state
    }

    fn commit(&mut self, next: Arc<M::State>) {
        if Arc::ptr_eq(&next, &self.state) {
            return;
        }
        self.state = next;
        self.publisher.send_replace(self.state.clone());
    }

    /// Feed one action to the model
    ///
    /// # Errors
    ///
    /// Usage errors raised by the model's effect phase.
    pub fn deliver(&mut self, action: &Action) -> Result<(), CoordinationError> {
        let tile_id = self.effects.tile_id();

        match action {
            Action::SubmitQuery { .. } => {
                self.cycle += 1;
                self.effects = self.effects.clone().in_cycle(self.cycle);
                // a new query supersedes a wait left over from the previous cycle
                if !self.disabled && self.suspension.is_some() {
                    tracing::debug!(%tile_id, cycle = self.cycle, "dropping stale suspension on new query");
                    self.suspension = None;
                    self.pending = None;
                }
            }
            Action::TileDataLoaded { tile_id: from, cycle, .. }
                if *from == tile_id && *cycle != self.cycle =>
            {
                tracing::debug!(%tile_id, cycle, current = self.cycle, "ignoring stale load");
                return Ok(());
            }
            _ => {}
        }

        if let Some(suspension) = self.suspension.as_mut() {
            let step = suspension.observe(action, &self.effects);
            if let Some(derived) = step.derived_state {
                self.pending = Some(derived);
            }
            if step.done {
                tracing::debug!(%tile_id, action = action.name(), "tile resumed");
                self.suspension = None;
                if let Some(derived) = self.pending.take() {
                    self.commit(Arc::new(derived));
                }
            }
            return Ok(());
        }

        let next = self.model.reduce(&self.state, action);
        self.commit(next);

        let state = self.state.clone();
        let mut ctx = EffectContext {
            effects: &self.effects,
            suspension: &mut self.suspension,
        };
        self.model.run_effects(&state, action, &mut ctx)
    }

    /// Freeze the tile until [`enable`](Self::enable)
    pub fn disable(&mut self) {
        tracing::debug!(tile_id = %self.effects.tile_id(), "tile disabled");
        self.suspension = Some(Box::new(|_: &Action, _: &Effects| Step::<M::State>::pending()));
        self.pending = None;
        self.disabled = true;
    }

    /// Undo [`disable`](Self::disable)
    pub fn enable(&mut self) {
        if self.disabled {
            tracing::debug!(tile_id = %self.effects.tile_id(), "tile enabled");
            self.suspension = None;
            self.disabled = false;
        }
    }

    /// Status summary
    #[must_use]
    pub fn status(&self) -> TileStatus {
        TileStatus {
            tile_id: self.effects.tile_id(),
            is_busy: self.state.is_busy(),
            error: self.state.error().map(str::to_string),
            suspended: self.suspension.is_some(),
            disabled: self.disabled,
        }
    }
}

impl<M: TileModel> RegisteredTile for ModelRunner<M> {
    fn tile_id(&self) -> TileId {
        self.effects.tile_id()
    }

    fn deliver(&mut self, action: &Action) -> Result<(), CoordinationError> {
        ModelRunner::deliver(self, action)
    }

    fn status(&self) -> TileStatus {
        ModelRunner::status(self)
    }

    fn snapshot(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(&*self.state)
    }

    fn supports_query_type(&self, query_type: QueryType) -> bool {
        self.model.supports_query_type(query_type)
    }

    fn disable(&mut self) {
        ModelRunner::disable(self);
    }

    fn enable(&mut self) {
        ModelRunner::enable(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Query;
    use crate::bus::ActionBus;
    use serde::Serialize;

    #[derive(Clone, Debug, Default, Serialize)]
    struct Counter {
        hits: u32,
        is_busy: bool,
    }

    impl TileState for Counter {
        fn is_busy(&self) -> bool {
            self.is_busy
        }

        fn error(&self) -> Option<&str> {
            None
        }
    }

    /// Counts `SetActiveBlock` actions addressed to it (own loads count ten);
    /// optionally suspends twice on submit
    struct CounterModel {
        id: TileId,
        double_suspend: bool,
    }

    impl TileModel for CounterModel {
        type State = Counter;

        fn tile_id(&self) -> TileId {
            self.id
        }

        fn reduce(&self, state: &Arc<Counter>, action: &Action) -> Arc<Counter> {
            match action {
                Action::SetActiveBlock { tile_id, .. } if *tile_id == self.id => Arc::new(Counter {
                    hits: state.hits + 1,
                    ..(**state).clone()
                }),
                Action::TileDataLoaded { tile_id, .. } if *tile_id == self.id => Arc::new(Counter {
                    hits: state.hits + 10,
                    ..(**state).clone()
                }),
                _ => state.clone(),
            }
        }

        fn run_effects(
            &mut self,
            _state: &Arc<Counter>,
            action: &Action,
            ctx: &mut EffectContext<'_, Counter>,
        ) -> Result<(), CoordinationError> {
            if let Action::SubmitQuery { .. } = action {
                // wait for one SetActiveBlock, then report 100 hits
                ctx.suspend(|action: &Action, _: &Effects| match action {
                    Action::SetActiveBlock { .. } => Step::done_with(Counter {
                        hits: 100,
                        is_busy: false,
                    }),
                    _ => Step::pending(),
                })?;
                if self.double_suspend {
                    ctx.suspend(|_: &Action, _: &Effects| Step::<Counter>::pending())?;
                }
            }
            Ok(())
        }
    }

    fn submit() -> Action {
        Action::SubmitQuery {
            query: Query::default(),
        }
    }

    fn block(id: u32) -> Action {
        Action::SetActiveBlock {
            tile_id: TileId(id),
            idx: 0,
        }
    }

    #[tokio::test]
    async fn test_unmatched_action_keeps_same_state() {
        let model = CounterModel {
            id: TileId(1),
            double_suspend: false,
        };
        let state = Arc::new(Counter::default());
        let next = model.reduce(&state, &block(2));
        assert!(Arc::ptr_eq(&state, &next));

        let next = model.reduce(&state, &block(1));
        assert!(!Arc::ptr_eq(&state, &next));
        assert_eq!(next.hits, 1);
    }

    #[tokio::test]
    async fn test_suspension_commits_derived_state_and_resumes() {
        let bus = ActionBus::new();
        let model = CounterModel {
            id: TileId(1),
            double_suspend: false,
        };
        let (mut runner, handle) = ModelRunner::new(model, Counter::default(), bus.dispatcher());

        runner.deliver(&submit()).unwrap();
        assert!(runner.status().suspended);

        // the completing action is consumed by the suspension, not reduced
        runner.deliver(&block(1)).unwrap();
        assert!(!runner.status().suspended);
        assert_eq!(handle.state().hits, 100);

        // normal reduction resumes with the next action
        runner.deliver(&block(1)).unwrap();
        assert_eq!(handle.state().hits, 101);
    }

    #[tokio::test]
    async fn test_loads_from_earlier_cycles_are_dropped() {
        let bus = ActionBus::new();
        let model = CounterModel {
            id: TileId(1),
            double_suspend: false,
        };
        let (mut runner, handle) = ModelRunner::new(model, Counter::default(), bus.dispatcher());

        runner.deliver(&Action::loaded(TileId(1), 0, TilePayload::Empty)).unwrap();
        assert_eq!(handle.state().hits, 10);

        runner.deliver(&submit()).unwrap();
        runner.deliver(&submit()).unwrap();
        assert_eq!(runner.cycle(), 2);
        runner.deliver(&block(1)).unwrap();
        assert_eq!(handle.state().hits, 100);

        // a load issued before the second submit arrives late
        runner.deliver(&Action::loaded(TileId(1), 1, TilePayload::Empty)).unwrap();
        assert_eq!(handle.state().hits, 100);

        runner.deliver(&Action::loaded(TileId(1), 2, TilePayload::Empty)).unwrap();
        assert_eq!(handle.state().hits, 110);
    }

    #[tokio::test]
    async fn test_spawned_loads_carry_the_cycle() {
        let mut bus = ActionBus::new();
        let effects = Effects::new(TileId(3), bus.dispatcher()).in_cycle(4);
        effects.spawn_load(async { Ok(TilePayload::Empty) });
        effects.fail(TileError::Api("down".to_string()));

        let mut cycles = Vec::new();
        for _ in 0..2 {
            if let Action::TileDataLoaded { cycle, .. } = bus.step().await.unwrap() {
                cycles.push(cycle);
            }
        }
        assert_eq!(cycles, vec![4, 4]);
    }

    #[tokio::test]
    async fn test_double_suspend_is_usage_error() {
        let bus = ActionBus::new();
        let model = CounterModel {
            id: TileId(4),
            double_suspend: true,
        };
        let (mut runner, _handle) = ModelRunner::new(model, Counter::default(), bus.dispatcher());

        assert_eq!(
            runner.deliver(&submit()),
            Err(CoordinationError::AlreadySuspended { tile_id: TileId(4) })
        );
    }

    #[tokio::test]
    async fn test_disable_freezes_until_enabled() {
        let bus = ActionBus::new();
        let model = CounterModel {
            id: TileId(1),
            double_suspend: false,
        };
        let (mut runner, handle) = ModelRunner::new(model, Counter::default(), bus.dispatcher());

        runner.disable();
        runner.deliver(&block(1)).unwrap();
        runner.deliver(&submit()).unwrap();
        assert_eq!(handle.state().hits, 0);
        assert!(runner.status().disabled);

        runner.enable();
        runner.deliver(&block(1)).unwrap();
        assert_eq!(handle.state().hits, 1);
    }

    #[tokio::test]
    async fn test_effect_panic_becomes_tile_error() {
        let mut bus = ActionBus::new();
        let effects = Effects::new(TileId(9), bus.dispatcher());

        effects.spawn_load(async {
            if TileId(9).as_u32() == 9 {
                panic!("decoder exploded");
            }
            Ok(TilePayload::Empty)
        });

        let action = bus.step().await.unwrap();
        assert_eq!(
            action,
            Action::failed(TileId(9), 0, TileError::Effect("decoder exploded".to_string()))
        );
    }
}
