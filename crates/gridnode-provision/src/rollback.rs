//! Reverse-order release of partially acquired resources.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, warn};

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Step = Box<dyn FnOnce() -> BoxFuture + Send>;

/// Undo steps registered while a primitive acquires resources.
///
/// On failure, [`Rollback::run`] releases everything in reverse order;
/// cleanup errors are logged and never replace the original error. On
/// success, [`Rollback::commit`] forgets the steps.
pub struct Rollback {
    owner: String,
    steps: Vec<(&'static str, Step)>,
}

impl Rollback {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            steps: Vec::new(),
        }
    }

    pub fn push<F, Fut>(&mut self, label: &'static str, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push((label, Box::new(move || Box::pin(undo()))));
    }

    pub fn commit(self) {
        debug!(owner = %self.owner, steps = self.steps.len(), "acquisition committed");
    }

    pub async fn run(self) {
        let owner = self.owner;
        for (label, undo) in self.steps.into_iter().rev() {
            match undo().await {
                Ok(()) => debug!(%owner, step = label, "rolled back"),
                Err(e) => warn!(%owner, step = label, error = %e, "rollback step failed"),
            }
        }
    }
}
