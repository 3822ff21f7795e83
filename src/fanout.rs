//! Fan-out/fan-in over a fixed set of independent tasks.
//!
//! Used to create several StatefulSets at once. Every task runs to
//! completion; failures are collected and reported together.

use std::collections::HashMap;
use std::future::Future;

use tokio::task::{Id, JoinSet};
use tracing::{info, warn};

use crate::error::{Error, Result, TaskFailure};

/// Run every labelled task concurrently and wait for all of them.
///
/// Returns the task outputs in input order when all succeed. Otherwise
/// returns [`Error::FanOut`] carrying one entry per failed task, including
/// tasks that panicked.
pub async fn run_all<T, Fut>(tasks: Vec<(String, Fut)>) -> Result<Vec<T>>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let total = tasks.len();
    let mut labels = Vec::with_capacity(total);
    let mut indices: HashMap<Id, usize> = HashMap::with_capacity(total);
    let mut set = JoinSet::new();

    for (index, (label, task)) in tasks.into_iter().enumerate() {
        labels.push(label);
        let handle = set.spawn(task);
        indices.insert(handle.id(), index);
    }

    let mut outputs: Vec<Option<T>> = (0..total).map(|_| None).collect();
    let mut failures: Vec<(usize, TaskFailure)> = Vec::new();

    while let Some(joined) = set.join_next_with_id().await {
        let (id, outcome) = match joined {
            Ok((id, result)) => (id, result.map_err(|e| e.to_string())),
            Err(join_error) => (
                join_error.id(),
                Err(format!("task panicked or was cancelled: {}", join_error)),
            ),
        };
        let index = indices.get(&id).copied().unwrap_or(total);
        match outcome {
            Ok(value) => {
                if let Some(slot) = outputs.get_mut(index) {
                    *slot = Some(value);
                }
            }
            Err(message) => {
                let label = labels
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| format!("task {}", id));
                warn!(task = %label, error = %message, "Parallel task failed");
                failures.push((index, TaskFailure { label, message }));
            }
        }
    }

    if !failures.is_empty() {
        failures.sort_by_key(|(index, _)| *index);
        return Err(Error::FanOut(
            failures.into_iter().map(|(_, failure)| failure).collect(),
        ));
    }

    info!(tasks = total, "All parallel tasks completed");
    Ok(outputs.into_iter().flatten().collect())
}
