//! Bounded batch runner: every item gets its own task, at most `limit` run at once.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemFailure {
    #[error("{0}")]
    Failed(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy)]
pub struct BoundedBatch {
    limit: usize,
    item_timeout: Option<Duration>,
}

impl BoundedBatch {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            item_timeout: None,
        }
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `work` once per item and wait for all of them. The result vector is
    /// index-aligned with `items`; one item failing never affects another.
    pub async fn run<I, F, Fut, T, E>(&self, items: Vec<I>, work: F) -> Vec<Result<T, ItemFailure>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let gate = Arc::new(Semaphore::new(self.limit));
        let mut handles: Vec<JoinHandle<Result<T, ItemFailure>>> = Vec::with_capacity(items.len());

        for item in items {
            // The gate is local to this call and never closed.
            let permit = Arc::clone(&gate)
                .acquire_owned()
                .await
                .expect("batch gate is never closed");
            let task = work(item);
            let item_timeout = self.item_timeout;
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = match item_timeout {
                    Some(limit) => tokio::time::timeout(limit, task)
                        .await
                        .map_err(|_| ItemFailure::TimedOut(limit))?,
                    None => task.await,
                };
                outcome.map_err(|err| ItemFailure::Failed(err.to_string()))
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(ItemFailure::Aborted(join_err.to_string())),
            });
        }
        results
    }
}
