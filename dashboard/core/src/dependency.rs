//! Inter-tile Dependencies
//!
//! A tile configured with `wait_for` cannot issue its request until every
//! listed upstream tile has loaded. [`DependencyWait`] tracks that as an
//! explicit state machine; [`AwaitUpstream`] wraps it as a [`Suspension`].
//!
//! # State Machine
//!
//! ```text
//! start (cycle n): blocking = { a: true, b: true }, remaining = 2
//!
//! TileDataLoaded { a, n, ok }     -> a: false, remaining = 1   Waiting
//! SetActiveBlock { .. }            -> unchanged                 Waiting
//! TileDataLoaded { b, n, partial } -> unchanged                 Waiting
//! TileDataLoaded { b, n, ok }      -> b: false, remaining = 0   Ready([a, b])
//!
//! TileDataLoaded { a|b, n, error } ->                           Failed(Upstream)
//! TileDataLoaded { a|b, m, .. }    -> stale, ignored            Waiting
//! WaitTimeout { self, cycle: n }   ->                           Failed(Timeout)
//! WaitTimeout { self, cycle: m }   -> stale, ignored            Waiting
//! ```
//!
//! A partial payload is a frequency block followed by more blocks of the
//! same cycle; the upstream counts as delivered with its last block.

use std::collections::HashMap;

use crate::actions::{Action, TileError, TileId, TilePayload};
use crate::model::{Effects, Step, Suspension};

/// Payload received from one upstream tile
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamData {
    /// Upstream tile
    pub tile_id: TileId,
    /// Its successful payload
    pub payload: TilePayload,
}

/// Result of observing one action
#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    /// Still blocked
    Waiting,
    /// Every upstream succeeded; payloads in declaration order
    Ready(Vec<UpstreamData>),
    /// The wait failed
    Failed(TileError),
}

/// Pending upstream tiles of one tile for one query cycle
#[derive(Debug, Clone)]
pub struct DependencyWait {
    tile_id: TileId,
    cycle: u64,
    order: Vec<TileId>,
    /// `true` while the upstream has not delivered
    blocking: HashMap<TileId, bool>,
    remaining: usize,
    payloads: HashMap<TileId, TilePayload>,
    timeout_secs: Option<u64>,
}

impl DependencyWait {
    /// Start waiting for `upstream` (duplicates are ignored)
    #[must_use]
    pub fn new(tile_id: TileId, upstream: &[TileId], cycle: u64) -> Self {
        let mut order = Vec::with_capacity(upstream.len());
        let mut blocking = HashMap::with_capacity(upstream.len());
        for id in upstream {
            if blocking.insert(*id, true).is_none() {
                order.push(*id);
            }
        }
        Self {
            tile_id,
            cycle,
            remaining: order.len(),
            order,
            blocking,
            payloads: HashMap::new(),
            timeout_secs: None,
        }
    }

    /// Fail on `WaitTimeout` for this cycle, reporting `secs`
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Cycle this wait belongs to
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Number of upstream tiles still blocking
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Whether `tile_id` is still blocking
    #[must_use]
    pub fn is_blocked_by(&self, tile_id: TileId) -> bool {
        self.blocking.get(&tile_id).copied().unwrap_or(false)
    }

    /// Advance the state machine
    pub fn observe(&mut self, action: &Action) -> WaitOutcome {
        match action {
            Action::TileDataLoaded {
                tile_id,
                cycle,
                payload,
                error,
            } => {
                let Some(flag) = self.blocking.get_mut(tile_id) else {
                    return WaitOutcome::Waiting;
                };
                if *cycle != self.cycle {
                    tracing::debug!(
                        tile_id = %self.tile_id,
                        upstream = %tile_id,
                        cycle,
                        current = self.cycle,
                        "ignoring stale upstream load"
                    );
                    return WaitOutcome::Waiting;
                }
                if let Some(err) = error {
                    return WaitOutcome::Failed(TileError::Upstream {
                        upstream: *tile_id,
                        reason: err.to_string(),
                    });
                }
                if *flag && !payload.is_partial() {
                    *flag = false;
                    self.remaining -= 1;
                    self.payloads.insert(*tile_id, payload.clone());
                }
                if self.remaining == 0 {
                    let data = self
                        .order
                        .iter()
                        .map(|id| UpstreamData {
                            tile_id: *id,
                            payload: self.payloads.remove(id).unwrap_or_default(),
                        })
                        .collect();
                    WaitOutcome::Ready(data)
                } else {
                    WaitOutcome::Waiting
                }
            }
            Action::WaitTimeout { tile_id, cycle }
                if *tile_id == self.tile_id && *cycle == self.cycle =>
            {
                WaitOutcome::Failed(TileError::Timeout {
                    secs: self.timeout_secs.unwrap_or_default(),
                })
            }
            _ => WaitOutcome::Waiting,
        }
    }
}

type ReadyFn<S> = Box<dyn FnOnce(Vec<UpstreamData>, &Effects) -> Option<S> + Send>;
type FailureFn<S> = Box<dyn FnOnce(&TileError) -> S + Send>;

/// Suspension waiting for upstream tiles
///
/// On success `on_ready` receives the upstream payloads and may issue the
/// tile's own request. On failure the state from `on_failure` is committed
/// and the error is re-broadcast as this tile's own failed
/// `TileDataLoaded`, so tiles waiting on this one unblock as well.
pub struct AwaitUpstream<S> {
    wait: DependencyWait,
    on_ready: Option<ReadyFn<S>>,
    on_failure: Option<FailureFn<S>>,
}

impl<S> AwaitUpstream<S> {
    /// Wrap a wait with its continuations
    pub fn new<R, F>(wait: DependencyWait, on_ready: R, on_failure: F) -> Self
    where
        R: FnOnce(Vec<UpstreamData>, &Effects) -> Option<S> + Send + 'static,
        F: FnOnce(&TileError) -> S + Send + 'static,
    {
        Self {
            wait,
            on_ready: Some(Box::new(on_ready)),
            on_failure: Some(Box::new(on_failure)),
        }
    }
}

impl<S> Suspension<S> for AwaitUpstream<S> {
    fn observe(&mut self, action: &Action, effects: &Effects) -> Step<S> {
        match self.wait.observe(action) {
            WaitOutcome::Waiting => Step::pending(),
            WaitOutcome::Ready(data) => {
                tracing::debug!(
                    tile_id = %effects.tile_id(),
                    cycle = self.wait.cycle(),
                    "upstream tiles ready"
                );
                Step {
                    done: true,
                    derived_state: self.on_ready.take().and_then(|f| f(data, effects)),
                }
            }
            WaitOutcome::Failed(err) => {
                tracing::warn!(
                    tile_id = %effects.tile_id(),
                    cycle = self.wait.cycle(),
                    error = %err,
                    "dependency wait failed"
                );
                let derived = self.on_failure.take().map(|f| f(&err));
                effects.fail(err);
                Step {
                    done: true,
                    derived_state: derived,
                }
            }
        }
    }
}
