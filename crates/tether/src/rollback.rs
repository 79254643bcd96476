//! Compensating-action lists for multi-step operations.
//!
//! A [`Rollback`] collects one compensation per completed step. If a later
//! step fails, the compensations run in reverse registration order; once the
//! operation reaches its commit point the list is discarded.

use std::future::Future;

use futures::future::BoxFuture;
use tether_common::TetherResult;

type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// An ordered list of compensating actions.
pub struct Rollback {
    operation: &'static str,
    steps: Vec<(&'static str, Compensation)>,
}

impl std::fmt::Debug for Rollback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rollback")
            .field("operation", &self.operation)
            .field(
                "steps",
                &self.steps.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Rollback {
    /// Start an empty list for the named operation.
    #[must_use]
    pub const fn new(operation: &'static str) -> Self {
        Self {
            operation,
            steps: Vec::new(),
        }
    }

    /// Register the compensation for a step that just completed.
    ///
    /// Compensations are best effort: they log their own failures.
    pub fn push<F, Fut>(&mut self, step: &'static str, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.steps.push((step, Box::new(move || Box::pin(undo()))));
    }

    /// Take over every compensation of `other`, keeping their order.
    pub fn append(&mut self, mut other: Self) {
        self.steps.append(&mut other.steps);
    }

    /// Await a step; if it fails, unwind everything registered so far.
    ///
    /// # Errors
    ///
    /// Returns the step's error after the compensations ran.
    pub async fn step<T, Fut>(&mut self, fut: Fut) -> TetherResult<T>
    where
        Fut: Future<Output = TetherResult<T>>,
    {
        match fut.await {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::debug!(
                    operation = self.operation,
                    error = %err,
                    pending = self.steps.len(),
                    "Step failed, rolling back"
                );
                self.unwind().await;
                Err(err)
            }
        }
    }

    /// Run every compensation, most recent first.
    pub async fn run(mut self) {
        self.unwind().await;
    }

    /// Discard the compensations: the operation is committed.
    pub fn commit(mut self) {
        self.steps.clear();
    }

    /// Number of registered compensations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    async fn unwind(&mut self) {
        while let Some((step, undo)) = self.steps.pop() {
            tracing::debug!(operation = self.operation, step, "Running compensation");
            undo().await;
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            tracing::warn!(
                operation = self.operation,
                pending = self.steps.len(),
                "Rollback dropped with pending compensations"
            );
        }
    }
}
