//! Dependency resolution for task actions.
//!
//! A task may list dependencies that are still running, or that have not
//! even been registered yet. Resolution therefore goes through a small
//! condition-variable pattern on top of [`tokio::sync::Notify`]: register
//! interest *before* checking the registry, so a completion that lands
//! between the check and the await cannot be missed. Every completed task
//! calls `notify_waiters`, which wakes all suspended waiters at once;
//! multiple tasks awaiting the same name all resume against its memoized
//! result.

use std::collections::HashMap;

use super::Shared;
use super::node::{Dynamic, Inputs};

/// Resolves every declared dependency to its memoized result, suspending
/// until all of them are done.
pub(crate) async fn resolve(shared: &Shared, dependencies: &[String]) -> Inputs {
    let mut resolved = HashMap::with_capacity(dependencies.len());

    for name in dependencies {
        let result = wait_done(shared, name).await;
        resolved.insert(name.clone(), result);
    }

    Inputs::new(resolved)
}

/// Suspends until the named task is done, then returns its result. Resolves
/// immediately if it already is.
pub(crate) async fn wait_done(shared: &Shared, name: &str) -> Dynamic {
    loop {
        let notified = shared.notify.notified();

        if let Some(result) = lookup(shared, name) {
            return result;
        }

        notified.await;
    }
}

fn lookup(shared: &Shared, name: &str) -> Option<Dynamic> {
    let registry = shared.registry.lock().unwrap();
    registry
        .nodes
        .get(name)
        .and_then(|node| node.result())
        .cloned()
}
