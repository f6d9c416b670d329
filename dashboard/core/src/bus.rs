//! Action Bus
//!
//! One ordered queue of [`Action`]s shared by every tile of a dashboard.
//! Producers (effects, the dashboard, tests) hold cloned [`Dispatcher`]s;
//! the bus owner pops actions one at a time and delivers each to every
//! registered tile, in registration order, before notifying listeners.
//!
//! ```text
//! Dispatcher --+
//! Dispatcher --+--> mpsc (unbounded) --> ActionBus::step()
//! Dispatcher --+                              |
//!                                             +--> tile 0 reduce/effects
//!                                             +--> tile 1 reduce/effects
//!                                             +--> ...
//!                                             +--> listeners
//! ```
//!
//! Delivery is synchronous: no tile sees action `n + 1` before every tile
//! has processed action `n`.
//!
//! The bus counts delivered `SubmitQuery` actions; a tile registered after
//! some queries continues from the bus's current cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::actions::{Action, TileId};
use crate::model::{
    CoordinationError, ModelRunner, RegisteredTile, TileHandle, TileModel, TileStatus,
};
use crate::query::QueryType;

/// Cloneable producer side of the bus
#[derive(Clone, Debug)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Action>,
}

impl Dispatcher {
    /// Enqueue an action
    pub fn dispatch(&self, action: Action) {
        if let Err(e) = self.tx.send(action) {
            tracing::debug!(action = e.0.name(), "action bus closed, action dropped");
        }
    }
}

type Listener = Arc<dyn Fn(&Action) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Listener)>>,
}

/// Registration of a bus listener; dropping it unsubscribes
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    /// Remove the listener now
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.entries.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// The dashboard's action bus
pub struct ActionBus {
    tx: mpsc::UnboundedSender<Action>,
    rx: mpsc::UnboundedReceiver<Action>,
    tiles: Vec<Box<dyn RegisteredTile>>,
    listeners: Arc<Listeners>,
    cycle: u64,
}

impl Default for ActionBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            tiles: Vec::new(),
            listeners: Arc::new(Listeners::default()),
            cycle: 0,
        }
    }

    /// New producer handle
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            tx: self.tx.clone(),
        }
    }

    /// Enqueue an action
    pub fn dispatch(&self, action: Action) {
        self.dispatcher().dispatch(action);
    }

    /// Register a tile model with its initial state
    ///
    /// # Errors
    ///
    /// [`CoordinationError::DuplicateTile`] if the id is taken.
    pub fn register<M: TileModel>(
        &mut self,
        model: M,
        initial: M::State,
    ) -> Result<TileHandle<M::State>, CoordinationError> {
        let tile_id = model.tile_id();
        if self.tiles.iter().any(|t| t.tile_id() == tile_id) {
            return Err(CoordinationError::DuplicateTile(tile_id));
        }
        let (runner, handle) = ModelRunner::new(model, initial, self.dispatcher());
        self.tiles.push(Box::new(runner.starting_at(self.cycle)));
        tracing::debug!(%tile_id, "tile registered");
        Ok(handle)
    }

    /// Observe every delivered action, after all tiles processed it
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Action) + Send + Sync + 'static,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.entries.lock().push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn tile_mut(&mut self, tile_id: TileId) -> Result<&mut Box<dyn RegisteredTile>, CoordinationError> {
        self.tiles
            .iter_mut()
            .find(|t| t.tile_id() == tile_id)
            .ok_or(CoordinationError::UnknownTile(tile_id))
    }

    /// Freeze a tile; it ignores every action until enabled again
    ///
    /// # Errors
    ///
    /// [`CoordinationError::UnknownTile`]
    pub fn disable(&mut self, tile_id: TileId) -> Result<(), CoordinationError> {
        self.tile_mut(tile_id)?.disable();
        Ok(())
    }

    /// Unfreeze a disabled tile
    ///
    /// # Errors
    ///
    /// [`CoordinationError::UnknownTile`]
    pub fn enable(&mut self, tile_id: TileId) -> Result<(), CoordinationError> {
        self.tile_mut(tile_id)?.enable();
        Ok(())
    }

    /// Whether a tile can handle the query type
    ///
    /// # Errors
    ///
    /// [`CoordinationError::UnknownTile`]
    pub fn supports_query_type(
        &self,
        tile_id: TileId,
        query_type: QueryType,
    ) -> Result<bool, CoordinationError> {
        self.tiles
            .iter()
            .find(|t| t.tile_id() == tile_id)
            .map(|t| t.supports_query_type(query_type))
            .ok_or(CoordinationError::UnknownTile(tile_id))
    }

    /// Registered tile ids, in delivery order
    #[must_use]
    pub fn tile_ids(&self) -> Vec<TileId> {
        self.tiles.iter().map(|t| t.tile_id()).collect()
    }

    /// Status of every tile
    #[must_use]
    pub fn statuses(&self) -> Vec<TileStatus> {
        self.tiles.iter().map(|t| t.status()).collect()
    }

    /// Status of one tile
    ///
    /// # Errors
    ///
    /// [`CoordinationError::UnknownTile`]
    pub fn status(&self, tile_id: TileId) -> Result<TileStatus, CoordinationError> {
        self.tiles
            .iter()
            .find(|t| t.tile_id() == tile_id)
            .map(|t| t.status())
            .ok_or(CoordinationError::UnknownTile(tile_id))
    }

    /// Serialized state of every tile
    #[must_use]
    pub fn snapshots(&self) -> Vec<(TileId, serde_json::Value)> {
        self.tiles
            .iter()
            .map(|t| {
                let value = t.snapshot().unwrap_or_else(|e| {
                    tracing::warn!(tile_id = %t.tile_id(), error = %e, "failed to serialize tile state");
                    serde_json::Value::Null
                });
                (t.tile_id(), value)
            })
            .collect()
    }

    /// Number of `SubmitQuery` actions delivered so far
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Whether no action is queued
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.rx.is_empty()
    }

    fn deliver(&mut self, action: &Action) -> Result<(), CoordinationError> {
        if matches!(action, Action::SubmitQuery { .. }) {
            self.cycle += 1;
        }
        tracing::debug!(action = action.name(), tile_id = ?action.tile_id(), cycle = self.cycle, "delivering action");
        let mut first_error = None;
        for tile in &mut self.tiles {
            if let Err(e) = tile.deliver(action) {
                tracing::error!(tile_id = %tile.tile_id(), error = %e, "tile rejected action");
                first_error.get_or_insert(e);
            }
        }

        let listeners: Vec<Listener> = self
            .listeners
            .entries
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(action);
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Deliver the next queued action, if any
    ///
    /// # Errors
    ///
    /// The first usage error raised by a tile for this action. The action is
    /// still delivered to every tile.
    pub fn try_step(&mut self) -> Result<Option<Action>, CoordinationError> {
        match self.rx.try_recv() {
            Ok(action) => {
                self.deliver(&action)?;
                Ok(Some(action))
            }
            Err(_) => Ok(None),
        }
    }

    /// Deliver queued actions until the queue is empty
    ///
    /// # Errors
    ///
    /// Stops at the first usage error.
    pub fn drain(&mut self) -> Result<usize, CoordinationError> {
        let mut delivered = 0;
        while self.try_step()?.is_some() {
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Wait for the next action and deliver it
    ///
    /// # Errors
    ///
    /// Usage errors raised by tiles, or [`CoordinationError::BusClosed`].
    pub async fn step(&mut self) -> Result<Action, CoordinationError> {
        let action = self.rx.recv().await.ok_or(CoordinationError::BusClosed)?;
        self.deliver(&action)?;
        Ok(action)
    }
}

impl std::fmt::Debug for ActionBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionBus")
            .field("tiles", &self.tile_ids())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Query, TileError, TilePayload};
    use pretty_assertions::assert_eq;

    fn block(id: u32, idx: usize) -> Action {
        Action::SetActiveBlock {
            tile_id: TileId(id),
            idx,
        }
    }

    #[tokio::test]
    async fn test_listeners_see_actions_in_order() {
        let mut bus = ActionBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = bus.subscribe(move |a| sink.lock().push(a.clone()));

        bus.dispatch(block(1, 0));
        bus.dispatch(Action::SubmitQuery {
            query: Query::default(),
        });
        bus.dispatch(Action::failed(TileId(2), 1, TileError::Api("x".to_string())));

        assert_eq!(bus.drain().unwrap(), 3);
        assert_eq!(bus.cycle(), 1);
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], block(1, 0));
        assert_eq!(seen[1].name(), "SubmitQuery");
        assert!(seen[2].is_error());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let mut bus = ActionBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let sub = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.dispatch(block(1, 0));
        bus.drain().unwrap();
        sub.unsubscribe();
        bus.dispatch(Action::loaded(TileId(1), 0, TilePayload::Empty));
        bus.drain().unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_tile_operations() {
        let mut bus = ActionBus::new();
        assert_eq!(bus.disable(TileId(5)), Err(CoordinationError::UnknownTile(TileId(5))));
        assert!(bus.status(TileId(5)).is_err());
        assert!(bus.is_idle());
        assert_eq!(bus.try_step(), Ok(None));
    }
}
