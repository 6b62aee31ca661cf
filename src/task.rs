//! Helpers for spawning named long-lived tasks.

use std::future::Future;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawn a task wrapped in a tracing span carrying its name, so log lines
/// from long-lived workers can be attributed.
pub fn spawn_named<F>(name: &'static str, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future.instrument(tracing::info_span!("task", name)))
}
