use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::InputError;

/// Type-erased task result, shared between a task and all of its dependents.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub(crate) type Action = Arc<dyn Fn(Inputs) -> BoxFuture<anyhow::Result<TaskOutput>> + Send + Sync>;
pub(crate) type Cleanup = Arc<dyn Fn() -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

/// The value produced by a task action.
///
/// Most tasks return a plain value. A task whose output is derived from
/// files on disk can instead return [`TaskOutput::Watched`] to associate a
/// path with the result; in watch mode a change under that path invalidates
/// the task. Dependents always see the unwrapped value, the path is
/// interpreted by the graph alone.
pub enum TaskOutput {
    Plain(Dynamic),
    Watched { path: Utf8PathBuf, value: Dynamic },
}

impl TaskOutput {
    /// Wraps a plain value.
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        TaskOutput::Plain(Arc::new(value))
    }

    /// Wraps a value whose freshness depends on everything under `path`.
    pub fn watched<T: Any + Send + Sync>(path: impl Into<Utf8PathBuf>, value: T) -> Self {
        TaskOutput::Watched {
            path: path.into(),
            value: Arc::new(value),
        }
    }

    pub(crate) fn into_parts(self) -> (Option<Utf8PathBuf>, Dynamic) {
        match self {
            TaskOutput::Plain(value) => (None, value),
            TaskOutput::Watched { path, value } => (Some(path), value),
        }
    }
}

/// Resolved dependency results passed to a task action, keyed by task name.
pub struct Inputs {
    map: HashMap<String, Dynamic>,
}

impl Inputs {
    pub(crate) fn new(map: HashMap<String, Dynamic>) -> Self {
        Self { map }
    }

    /// Retrieves the result of the named dependency, downcast to `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, InputError> {
        let value = self
            .map
            .get(name)
            .ok_or_else(|| InputError::NotFound(name.to_string()))?;

        value
            .clone()
            .downcast::<T>()
            .map_err(|_| InputError::WrongType {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Retrieves the type-erased result of the named dependency.
    pub fn raw(&self, name: &str) -> Option<&Dynamic> {
        self.map.get(name)
    }

    /// Iterates over every resolved dependency as a `(name, result)` pair,
    /// in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Dynamic)> {
        self.map.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of resolved dependencies, one per declared name.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True for a task that declared no dependencies.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Declarative description of a single task: a unique name, the names of the
/// tasks whose results its action reads, and an optional cleanup hook run
/// when the task is removed or replaced during a rerun.
///
/// A task may not list itself as a dependency; the graph rejects such a spec
/// at registration time. Dependencies on tasks that are not registered yet
/// are fine, the action simply waits for them to appear and finish.
pub struct TaskSpec {
    pub(crate) name: String,
    pub(crate) dependencies: Vec<String>,
    pub(crate) action: Action,
    pub(crate) on_remove: Option<Cleanup>,
}

impl TaskSpec {
    /// Creates a spec with no dependencies and no cleanup hook.
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(Inputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<TaskOutput>> + Send + 'static,
    {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            action: Arc::new(move |inputs| Box::pin(action(inputs))),
            on_remove: None,
        }
    }

    /// Declares the tasks whose results this task's action requires.
    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(names.into_iter().map(Into::into));
        self
    }

    /// Registers a cleanup hook, awaited when the task is removed or torn
    /// down during a rerun. Tasks owning external resources (a generated
    /// file, say) release them here.
    pub fn on_remove<F, Fut>(mut self, cleanup: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_remove = Some(Arc::new(move || Box::pin(cleanup())));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

impl Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// One registered task inside the graph's registry.
pub(crate) struct Node {
    pub dependencies: Vec<String>,
    pub action: Action,
    pub on_remove: Option<Cleanup>,
    pub state: NodeState,
    /// Incremented whenever the name is (re-)registered. An action finishing
    /// after its node was replaced must not publish into the replacement.
    pub generation: u64,
}

pub(crate) enum NodeState {
    Pending,
    Done {
        result: Dynamic,
        watched: Option<Utf8PathBuf>,
    },
}

impl Node {
    pub fn result(&self) -> Option<&Dynamic> {
        match &self.state {
            NodeState::Pending => None,
            NodeState::Done { result, .. } => Some(result),
        }
    }

    pub fn watch_path(&self) -> Option<&Utf8Path> {
        match &self.state {
            NodeState::Pending => None,
            NodeState::Done { watched, .. } => watched.as_deref(),
        }
    }

    /// Rebuilds the spec this node was registered from, for re-addition
    /// during a rerun. The declared dependencies never change across a
    /// task's lifetime.
    pub fn into_spec(self, name: String) -> TaskSpec {
        TaskSpec {
            name,
            dependencies: self.dependencies,
            action: self.action,
            on_remove: self.on_remove,
        }
    }
}
