//! The incremental build graph.
//!
//! A [`Graph`] owns a registry of named tasks. Each task declares the names
//! of the tasks whose results its action reads; the graph runs every action
//! exactly once all of its dependencies are done, memoizes the result under
//! the task's name, and exposes targeted invalidation: [`Graph::rerun`]
//! tears down a task together with everything transitively dependent on it
//! and rebuilds exactly that subtree.
//!
//! Tasks may be registered in any order. A task whose dependency has not
//! been registered yet simply suspends until it appears and finishes; see
//! the [`waiter`] module for the wake-up mechanism.
//!
//! Two limitations are deliberate and documented rather than fixed:
//!
//! * Only a direct self-dependency is rejected at registration. A cycle
//!   across two or more tasks suspends every task in the cycle forever.
//! * A failed action leaves its task not-done; tasks waiting on it stay
//!   suspended. The error surfaces only through the failed task's own
//!   future.

mod node;
mod waiter;

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use camino::Utf8Path;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinSet;

use crate::error::GraphError;

pub use node::{Dynamic, Inputs, TaskOutput, TaskSpec};
use node::{Node, NodeState};

/// Notification emitted by the graph for external consumers, such as a dev
/// server pushing reload messages to open browser tabs.
#[derive(Clone)]
pub enum Event {
    /// A task's action completed and its result became readable.
    Done { name: Arc<str>, result: Dynamic },
    /// A [`Graph::rerun`] fully settled.
    Rerun,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Done { name, .. } => f
                .debug_struct("Done")
                .field("name", name)
                .finish_non_exhaustive(),
            Event::Rerun => write!(f, "Rerun"),
        }
    }
}

pub(crate) struct Shared {
    pub registry: Mutex<Registry>,
    /// Woken whenever any task becomes done; waiters re-check the registry.
    pub notify: Notify,
    pub events: broadcast::Sender<Event>,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub nodes: HashMap<String, Node>,
    pub next_generation: u64,
}

impl Registry {
    /// Names of every registered node listing `name` as a dependency.
    fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.dependencies.iter().any(|dep| dep == name))
            .map(|(dependent, _)| dependent.clone())
            .collect();
        dependents.sort();
        dependents
    }
}

/// The task graph. Cheap to clone; clones share the same registry.
///
/// All mutation of the registry goes through the methods here. Concurrent
/// [`rerun`](Graph::rerun) calls on overlapping subtrees are not serialized
/// against each other; callers who need that guarantee should funnel reruns
/// through a single consumer loop, as the watch bridge does.
#[derive(Clone)]
pub struct Graph {
    shared: Arc<Shared>,
    parent: Option<Arc<Graph>>,
}

impl Graph {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);

        Graph {
            shared: Arc::new(Shared {
                registry: Mutex::default(),
                notify: Notify::new(),
                events,
            }),
            parent: None,
        }
    }

    /// Creates a graph scoped under `parent`. The parent is an escape hatch
    /// for callers layering graphs; none of the algorithms here consult it.
    pub fn with_parent(parent: Graph) -> Self {
        let mut graph = Graph::new();
        graph.parent = Some(Arc::new(parent));
        graph
    }

    pub fn parent(&self) -> Option<&Graph> {
        self.parent.as_deref()
    }

    /// Subscribes to [`Event`]s emitted by this graph.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Registers a task and returns the future driving it.
    ///
    /// Registration is synchronous: the task is visible to concurrently
    /// registering dependents before the returned future is first polled.
    /// The future resolves the declared dependencies, runs the action once
    /// all of them are done, memoizes the result and resolves to it. It must
    /// be awaited (or spawned) for the action to run at all.
    ///
    /// Fails immediately if the spec lists its own name as a dependency.
    /// Re-registering an existing name replaces the previous entry.
    pub fn add_task(
        &self,
        spec: TaskSpec,
    ) -> Result<impl Future<Output = Result<Dynamic, GraphError>> + Send + use<>, GraphError>
    {
        let TaskSpec {
            name,
            dependencies,
            action,
            on_remove,
        } = spec;

        if dependencies.iter().any(|dep| *dep == name) {
            return Err(GraphError::SelfDependency(name));
        }

        let generation = {
            let mut registry = self.shared.registry.lock().unwrap();
            let generation = registry.next_generation;
            registry.next_generation += 1;
            registry.nodes.insert(
                name.clone(),
                Node {
                    dependencies: dependencies.clone(),
                    action: action.clone(),
                    on_remove,
                    state: NodeState::Pending,
                    generation,
                },
            );
            generation
        };

        tracing::debug!(task = %name, "registered");

        let shared = self.shared.clone();

        Ok(async move {
            let inputs = waiter::resolve(&shared, &dependencies).await;

            let output = (action)(inputs)
                .await
                .map_err(|e| GraphError::Task(name.clone(), e))?;

            let (watched, result) = output.into_parts();

            {
                let mut registry = shared.registry.lock().unwrap();
                match registry.nodes.get_mut(&name) {
                    Some(node) if node.generation == generation => {
                        node.state = NodeState::Done {
                            result: result.clone(),
                            watched,
                        };
                    }
                    // The node was removed or replaced while the action ran;
                    // hand the value to the caller but do not publish it.
                    _ => return Ok(result),
                }
            }

            shared.notify.notify_waiters();
            let _ = shared.events.send(Event::Done {
                name: Arc::from(name.as_str()),
                result: result.clone(),
            });
            tracing::debug!(task = %name, "done");

            Ok(result)
        })
    }

    /// Registers every task in the batch, runs them concurrently, and
    /// resolves once all of them are done.
    ///
    /// Returns the results of this batch only, keyed by name; tasks already
    /// present in the graph are not included. The first failure aborts the
    /// rest of the batch and propagates.
    pub async fn add_tasks(
        &self,
        specs: impl IntoIterator<Item = TaskSpec>,
    ) -> Result<HashMap<String, Dynamic>, GraphError> {
        let mut pending = JoinSet::new();

        for spec in specs {
            let name = spec.name().to_string();
            let task = self.add_task(spec)?;
            pending.spawn(async move { (name, task.await) });
        }

        let mut results = HashMap::new();
        while let Some(joined) = pending.join_next().await {
            let (name, result) = joined?;
            results.insert(name, result?);
        }

        Ok(results)
    }

    /// Removes a task permanently, awaiting its cleanup hook first.
    ///
    /// Unknown names are a no-op. Removal is refused while any registered
    /// task still depends on `name`; the error lists the blocking
    /// dependents, which must be removed first.
    pub async fn remove_task(&self, name: &str) -> Result<(), GraphError> {
        let cleanup = {
            let registry = self.shared.registry.lock().unwrap();

            if !registry.nodes.contains_key(name) {
                return Ok(());
            }

            let dependents = registry.dependents_of(name);
            if !dependents.is_empty() {
                return Err(GraphError::HasDependents {
                    name: name.to_string(),
                    dependents,
                });
            }

            registry
                .nodes
                .get(name)
                .and_then(|node| node.on_remove.clone())
        };

        if let Some(cleanup) = cleanup {
            cleanup()
                .await
                .map_err(|e| GraphError::Cleanup(name.to_string(), e))?;
        }

        self.shared.registry.lock().unwrap().nodes.remove(name);
        tracing::debug!(task = %name, "removed");

        Ok(())
    }

    /// Names of every registered task that lists `name` as a dependency.
    /// Pure query, no side effects.
    pub fn direct_dependents(&self, name: &str) -> Vec<String> {
        self.shared.registry.lock().unwrap().dependents_of(name)
    }

    /// Invalidates `name` and everything transitively dependent on it, then
    /// rebuilds exactly that subtree.
    ///
    /// The affected subtree is discovered by reverse reachability over the
    /// dependents relation. It is torn down dependents-first, so no live
    /// task ever depends on an already-deleted one; every collected cleanup
    /// hook runs (concurrently) before anything is re-added. Re-addition is
    /// concurrent as well, the dependency waiter re-serializes the actual
    /// execution order exactly as during initial construction.
    ///
    /// Resolves to the fresh results in subtree collection order (the target
    /// first, then breadth-first dependents), which is not necessarily the
    /// execution order. Rerunning an unknown name is a no-op.
    pub async fn rerun(&self, name: &str) -> Result<Vec<Dynamic>, GraphError> {
        let (order, removed) = {
            let mut registry = self.shared.registry.lock().unwrap();

            if !registry.nodes.contains_key(name) {
                return Ok(Vec::new());
            }

            let order = collect_subtree(&registry, name);
            let removed = teardown(&mut registry, &order);
            (order, removed)
        };

        tracing::info!(task = %name, affected = order.len(), "rerun started");

        // All cleanup hooks complete before any replacement action starts.
        let mut cleanups = JoinSet::new();
        for (task, node) in &removed {
            if let Some(cleanup) = node.on_remove.clone() {
                let task = task.clone();
                cleanups.spawn(async move { (task, cleanup().await) });
            }
        }
        while let Some(joined) = cleanups.join_next().await {
            let (task, result) = joined?;
            result.map_err(|e| GraphError::Cleanup(task, e))?;
        }

        let mut pending = JoinSet::new();
        for (task, node) in removed {
            let future = self.add_task(node.into_spec(task.clone()))?;
            pending.spawn(async move { (task, future.await) });
        }

        let mut results = HashMap::new();
        while let Some(joined) = pending.join_next().await {
            let (task, result) = joined?;
            results.insert(task, result?);
        }

        let _ = self.shared.events.send(Event::Rerun);
        tracing::info!(task = %name, "rerun complete");

        Ok(order
            .iter()
            .map(|task| {
                results
                    .remove(task)
                    .expect("every re-added task reports a result")
            })
            .collect())
    }

    /// Point-in-time snapshot mapping every currently done task's name to
    /// its result. Pending and removed tasks are absent. There is no
    /// consistency guarantee across a concurrent rerun.
    pub fn results(&self) -> HashMap<String, Dynamic> {
        let registry = self.shared.registry.lock().unwrap();
        registry
            .nodes
            .iter()
            .filter_map(|(name, node)| Some((name.clone(), node.result()?.clone())))
            .collect()
    }

    /// Resolves to the named task's result once it is done; immediately if
    /// it already is. This is the name-scoped counterpart of the
    /// [`Event::Done`] stream. Waiting on a task whose action failed
    /// suspends indefinitely.
    pub async fn wait_for(&self, name: &str) -> Dynamic {
        waiter::wait_done(&self.shared, name).await
    }

    /// Names of every done task whose watch path contains `path`.
    pub(crate) fn watched_matches(&self, path: &Utf8Path) -> Vec<String> {
        let registry = self.shared.registry.lock().unwrap();
        let mut matches: Vec<String> = registry
            .nodes
            .iter()
            .filter(|(_, node)| {
                node.watch_path()
                    .is_some_and(|watched| path.starts_with(watched))
            })
            .map(|(name, _)| name.clone())
            .collect();
        matches.sort();
        matches
    }
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

/// Breadth-first reverse reachability over the dependents relation: the
/// start node itself, then every transitive dependent, in discovery order.
fn collect_subtree(registry: &Registry, start: &str) -> Vec<String> {
    let mut order = vec![start.to_string()];
    let mut seen: HashSet<String> = order.iter().cloned().collect();
    let mut queue: VecDeque<String> = order.iter().cloned().collect();

    while let Some(current) = queue.pop_front() {
        for dependent in registry.dependents_of(&current) {
            if seen.insert(dependent.clone()) {
                order.push(dependent.clone());
                queue.push_back(dependent);
            }
        }
    }

    order
}

/// Detaches the subtree from the registry, each node strictly after all of
/// its dependents, and returns the removed nodes in removal order.
///
/// Every dependent of a subtree member is itself a subtree member, so a node
/// is ready for removal as soon as no still-registered node depends on it.
fn teardown(registry: &mut Registry, subtree: &[String]) -> Vec<(String, Node)> {
    let mut removed = Vec::with_capacity(subtree.len());
    let mut remaining: VecDeque<String> = subtree.iter().cloned().collect();
    let mut deferred = 0;

    while let Some(candidate) = remaining.pop_front() {
        let blocked = registry.nodes.iter().any(|(name, node)| {
            *name != candidate && node.dependencies.iter().any(|dep| *dep == candidate)
        });

        // A dependency cycle cannot be torn down dependents-first; once a
        // full rotation makes no progress, drain the rest as-is.
        if blocked && deferred <= remaining.len() {
            deferred += 1;
            remaining.push_back(candidate);
            continue;
        }
        deferred = 0;

        if let Some(node) = registry.nodes.remove(&candidate) {
            removed.push((candidate, node));
        }
    }

    removed
}
