//! Background task spawning.

use std::future::Future;

/// Spawns a detached task on the current tokio runtime.
///
/// Used for work whose result nobody awaits (cascading deletes, sink
/// commits); such tasks report their own failures through `tracing`.
pub fn spawn_task<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(future);
}
