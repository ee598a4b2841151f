//! Fan-out helpers for running independent node operations side by side.
//!
//! Both combinators start every task, then wait for every task. Neither one
//! cancels work in flight, so a caller can rely on nothing still running once
//! the returned future resolves.

use futures::future::BoxFuture;
use tracing::debug;

use crate::errors::AggregateError;

pub type Task = BoxFuture<'static, anyhow::Result<()>>;

/// Run all tasks to completion and report every failure.
///
/// Returns `Ok(())` when no task failed, otherwise an [`AggregateError`]
/// holding the failures in task order.
pub async fn run_all_collect_errors(tasks: Vec<Task>) -> anyhow::Result<()> {
    let errors: Vec<anyhow::Error> = join_in_order(tasks)
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AggregateError::new(errors).into())
    }
}

/// Run all tasks to completion and report the failure of the earliest task
/// (by position, not by time) that failed.
pub async fn run_all_first_error(tasks: Vec<Task>) -> anyhow::Result<()> {
    join_in_order(tasks).await.into_iter().collect()
}

async fn join_in_order(tasks: Vec<Task>) -> Vec<anyhow::Result<()>> {
    debug!(count = tasks.len(), "spawning tasks");
    let handles: Vec<_> = tasks.into_iter().map(tokio::spawn).collect();
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(match handle.await {
            Ok(result) => result,
            Err(join) => Err(anyhow::Error::new(join).context("task did not run to completion")),
        });
    }
    results
}
