//! Source Priority Selection
//!
//! A tile may be configured with several alternative backends for the same
//! logical data source (e.g. two KonText installations). [`PrioritySource`]
//! ranks them and calls them in order until one succeeds.
//!
//! # Ordering
//!
//! ```text
//! api_url      = [ "a",  "b",  "c" ]
//! api_priority = [  3,    1,    2  ]
//!                   |     |     |
//!                   v     v     v
//! ordered      = [ 0 (a), 2 (c), 1 (b) ]
//! ```
//!
//! Instances without an explicit weight get weight 1. Equal weights keep
//! ascending index order.

use std::future::Future;
use std::sync::OnceLock;

use thiserror::Error;

/// Weight of an instance without an explicit priority
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Registration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// An instance with the same index is already registered
    #[error("source instance {0} already registered")]
    DuplicateIndex(usize),
}

/// Failure of a prioritized call
#[derive(Debug, Error)]
pub enum FallbackError<E> {
    /// Nothing to call
    #[error("no source instances registered")]
    NoInstances,

    /// Every candidate failed; carries the last failure
    #[error("source instance {index} failed: {source}")]
    Failed {
        /// Index of the last tried instance
        index: usize,
        /// Its error
        #[source]
        source: E,
    },
}

/// Successful prioritized call
#[derive(Debug, Clone, PartialEq)]
pub struct Selected<R> {
    /// Index of the instance that answered
    pub index: usize,
    /// Its response
    pub value: R,
}

/// Priority-ordered set of interchangeable backend instances
#[derive(Debug)]
pub struct PrioritySource<T> {
    weights: Vec<f64>,
    instances: Vec<(usize, T)>,
    /// Positions into `instances`, best first; reset on registration
    order: OnceLock<Vec<usize>>,
}

impl<T> Default for PrioritySource<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<T> PrioritySource<T> {
    /// Create an empty source with per-index weights
    #[must_use]
    pub fn new(weights: Vec<f64>) -> Self {
        Self {
            weights,
            instances: Vec::new(),
            order: OnceLock::new(),
        }
    }

    /// Register an instance under a unique index
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::DuplicateIndex`] when `index` is taken.
    pub fn add_instance(&mut self, index: usize, instance: T) -> Result<(), SourceError> {
        if self.instances.iter().any(|(i, _)| *i == index) {
            return Err(SourceError::DuplicateIndex(index));
        }
        self.instances.push((index, instance));
        self.order = OnceLock::new();
        Ok(())
    }

    /// Weight of an index (default 1)
    #[must_use]
    pub fn weight_of(&self, index: usize) -> f64 {
        self.weights.get(index).copied().unwrap_or(DEFAULT_WEIGHT)
    }

    fn order(&self) -> &[usize] {
        self.order.get_or_init(|| {
            let mut positions: Vec<usize> = (0..self.instances.len()).collect();
            positions.sort_by(|&a, &b| {
                let (ia, ib) = (self.instances[a].0, self.instances[b].0);
                self.weight_of(ib)
                    .total_cmp(&self.weight_of(ia))
                    .then(ia.cmp(&ib))
            });
            positions
        })
    }

    /// Instance indices, best first
    #[must_use]
    pub fn ordered_indices(&self) -> Vec<usize> {
        self.order().iter().map(|&p| self.instances[p].0).collect()
    }

    /// Instances, best first
    #[must_use]
    pub fn ordered_instances(&self) -> Vec<(usize, &T)> {
        self.order()
            .iter()
            .map(|&p| {
                let (index, instance) = &self.instances[p];
                (*index, instance)
            })
            .collect()
    }

    /// Instance registered under `index`
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.instances
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, instance)| instance)
    }

    /// Number of registered instances
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether no instance is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl<T: Clone> PrioritySource<T> {
    /// Call instances in priority order until one succeeds
    ///
    /// Failures of all but the last candidate are logged and swallowed. The
    /// returned index identifies the winner so the caller can keep using the
    /// same instance ([`call_pinned`](Self::call_pinned)).
    ///
    /// # Errors
    ///
    /// [`FallbackError::NoInstances`] if nothing is registered, otherwise the
    /// last candidate's failure.
    pub async fn call_with_fallback<R, E, F, Fut>(
        &self,
        mut f: F,
    ) -> Result<Selected<R>, FallbackError<E>>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: std::fmt::Display,
    {
        let candidates: Vec<(usize, T)> = self
            .ordered_instances()
            .into_iter()
            .map(|(index, instance)| (index, instance.clone()))
            .collect();
        let total = candidates.len();

        for (position, (index, instance)) in candidates.into_iter().enumerate() {
            match f(instance).await {
                Ok(value) => return Ok(Selected { index, value }),
                Err(source) if position + 1 == total => {
                    return Err(FallbackError::Failed { index, source });
                }
                Err(e) => {
                    tracing::warn!(instance = index, error = %e, "source instance failed, trying next");
                }
            }
        }
        Err(FallbackError::NoInstances)
    }

    /// Call exactly the instance registered under `index`
    ///
    /// # Errors
    ///
    /// [`FallbackError::NoInstances`] if `index` is unknown, otherwise the
    /// instance's own failure.
    pub async fn call_pinned<R, E, F, Fut>(
        &self,
        index: usize,
        f: F,
    ) -> Result<R, FallbackError<E>>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let instance = self.get(index).cloned().ok_or(FallbackError::NoInstances)?;
        f(instance)
            .await
            .map_err(|source| FallbackError::Failed { index, source })
    }
}
