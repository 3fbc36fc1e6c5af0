use thiserror::Error;

/// Errors produced by [`Graph`](crate::Graph) operations.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("task '{0}' cannot list itself as a dependency")]
    SelfDependency(String),

    #[error("cannot remove task '{name}', it is still required by: {}", .dependents.join(", "))]
    HasDependents {
        name: String,
        dependents: Vec<String>,
    },

    #[error("task '{0}':\n{1}")]
    Task(String, #[source] anyhow::Error),

    #[error("cleanup for task '{0}':\n{1}")]
    Cleanup(String, #[source] anyhow::Error),

    #[error("task runtime failure:\n{0}")]
    Runtime(#[from] tokio::task::JoinError),
}

/// Errors from reading dependency results inside a task action.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("dependency result not found: {0}")]
    NotFound(String),

    #[error("dependency result '{name}' has an unexpected type, expected {expected}")]
    WrongType { name: String, expected: &'static str },
}

#[cfg(feature = "watch")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("couldn't convert path to UTF-8:\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}
