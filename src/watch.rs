//! Watch mode is implemented as a two-part system:
//!
//! 1. **Filesystem watcher** (feature `watch`): uses the `notify` crate to
//!    monitor the watched roots recursively, with debouncing to avoid
//!    duplicate rebuilds from rapid file saves. It translates raw
//!    notifications into [`ChangeEvent`]s on a channel.
//! 2. **Bridge**: an async loop consuming change events. Each changed path
//!    is matched against the watch path of every registered task; every
//!    task whose watch path contains the changed path is rerun, together
//!    with its transitive dependents.
//!
//! The bridge is best-effort: a failed rerun is logged and the loop keeps
//! processing subsequent events. It only terminates when the event channel
//! closes.

use camino::Utf8PathBuf;
use tokio::sync::mpsc;

use crate::graph::Graph;

/// Kind of filesystem change reported to the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Modify,
    Remove,
}

/// A single debounced filesystem change.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: Utf8PathBuf,
}

impl Graph {
    /// Creates a graph with a change-event stream already attached.
    ///
    /// Must be called within a tokio runtime; the bridge runs on a
    /// background task until the stream closes.
    pub fn with_watcher(events: mpsc::Receiver<ChangeEvent>) -> Graph {
        let graph = Graph::new();
        graph.attach_watcher(events);
        graph
    }

    /// Spawns the bridge consuming `events` against this graph.
    pub fn attach_watcher(
        &self,
        events: mpsc::Receiver<ChangeEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(bridge(self.clone(), events))
    }
}

/// Feeds change events into the graph until the stream ends.
pub async fn bridge(graph: Graph, mut events: mpsc::Receiver<ChangeEvent>) {
    while let Some(event) = events.recv().await {
        tracing::debug!(path = %event.path, kind = ?event.kind, "change detected");

        for name in graph.watched_matches(&event.path) {
            tracing::info!(task = %name, path = %event.path, "re-running");

            if let Err(e) = graph.rerun(&name).await {
                tracing::error!(task = %name, "rerun failed: {e}");
            }
        }
    }
}

#[cfg(feature = "watch")]
pub use fs::{FsWatcher, watch_roots};

#[cfg(feature = "watch")]
mod fs {
    use std::time::Duration;

    use camino::Utf8PathBuf;
    use notify::{EventKind, RecommendedWatcher, RecursiveMode};
    use notify_debouncer_full::{
        DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache, new_debouncer,
    };
    use tokio::sync::mpsc;

    use super::{ChangeEvent, ChangeKind};
    use crate::error::WatchError;

    /// Guard for the running filesystem watcher; dropping it stops the
    /// event stream.
    pub type FsWatcher = Debouncer<RecommendedWatcher, RecommendedCache>;

    /// Watches the given roots recursively and returns the debounced
    /// change-event stream, suitable for
    /// [`Graph::attach_watcher`](crate::Graph::attach_watcher).
    pub fn watch_roots(
        roots: impl IntoIterator<Item = Utf8PathBuf>,
    ) -> Result<(FsWatcher, mpsc::Receiver<ChangeEvent>), WatchError> {
        let (tx, rx) = mpsc::channel(64);

        let mut debouncer = new_debouncer(
            Duration::from_millis(250),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in translate(events) {
                        if tx.blocking_send(event).is_err() {
                            return;
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        tracing::error!("watch error: {e}");
                    }
                }
            },
        )?;

        for root in collapse_watch_roots(roots.into_iter().collect()) {
            tracing::info!("watching {root}");
            debouncer.watch(root.as_std_path(), RecursiveMode::Recursive)?;
        }

        Ok((debouncer, rx))
    }

    fn translate(events: Vec<DebouncedEvent>) -> Vec<ChangeEvent> {
        let mut out = Vec::new();

        for de in events {
            let kind = match de.event.kind {
                EventKind::Create(..) => ChangeKind::Create,
                EventKind::Modify(..) => ChangeKind::Modify,
                EventKind::Remove(..) => ChangeKind::Remove,
                _ => continue,
            };

            for path in &de.event.paths {
                match Utf8PathBuf::try_from(path.clone()) {
                    Ok(path) => out.push(ChangeEvent { kind, path }),
                    Err(e) => tracing::error!("failed to convert path: {e}"),
                }
            }
        }

        out
    }

    /// Reduces a set of paths to the minimal set of watch roots.
    ///
    /// The watcher is recursive, so watching `/a` already covers `/a/b`.
    /// Sorting puts ancestors first; a path covered by the previously
    /// accepted root is skipped.
    pub(super) fn collapse_watch_roots(roots: Vec<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
        let mut roots = roots;
        roots.sort();
        roots.dedup();

        let mut collapsed: Vec<Utf8PathBuf> = Vec::new();
        for root in roots {
            if let Some(last) = collapsed.last()
                && root.starts_with(last)
            {
                continue;
            }
            collapsed.push(root);
        }

        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::graph::{Event, TaskOutput, TaskSpec};

    fn counting_task(name: &str, watched: &'static str, runs: &Arc<AtomicUsize>) -> TaskSpec {
        let runs = runs.clone();
        TaskSpec::new(name, move |_| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(TaskOutput::watched(watched, ()))
            }
        })
    }

    async fn wait_for_rerun(events: &mut tokio::sync::broadcast::Receiver<Event>) {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Event::Rerun = events.recv().await.unwrap() {
                    break;
                }
            }
        })
        .await
        .expect("rerun event within deadline");
    }

    #[tokio::test]
    async fn change_event_reruns_watching_task() {
        let graph = Graph::new();
        let runs = Arc::new(AtomicUsize::new(0));

        graph
            .add_tasks([counting_task("pages", "content", &runs)])
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let handle = graph.attach_watcher(rx);
        let mut events = graph.subscribe();

        // An unmatched path first; the matched one must be the only trigger.
        tx.send(ChangeEvent {
            kind: ChangeKind::Modify,
            path: "static/style.css".into(),
        })
        .await
        .unwrap();
        tx.send(ChangeEvent {
            kind: ChangeKind::Modify,
            path: "content/post.md".into(),
        })
        .await
        .unwrap();

        wait_for_rerun(&mut events).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn bridge_survives_rerun_failure() {
        let graph = Graph::new();

        let broken_runs = Arc::new(AtomicUsize::new(0));
        let broken = {
            let runs = broken_runs.clone();
            TaskSpec::new("broken", move |_| {
                let runs = runs.clone();
                async move {
                    if runs.fetch_add(1, Ordering::SeqCst) > 0 {
                        anyhow::bail!("rebuild failed");
                    }
                    Ok(TaskOutput::watched("bad", ()))
                }
            })
        };

        let ok_runs = Arc::new(AtomicUsize::new(0));
        graph
            .add_tasks([broken, counting_task("ok", "good", &ok_runs)])
            .await
            .unwrap();

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let handle = graph.attach_watcher(rx);
        let mut events = graph.subscribe();

        tx.send(ChangeEvent {
            kind: ChangeKind::Modify,
            path: "bad/x".into(),
        })
        .await
        .unwrap();
        tx.send(ChangeEvent {
            kind: ChangeKind::Modify,
            path: "good/y".into(),
        })
        .await
        .unwrap();

        // The failed rerun emits no event; seeing the healthy task's rerun
        // proves the loop survived.
        wait_for_rerun(&mut events).await;
        assert_eq!(broken_runs.load(Ordering::SeqCst), 2);
        assert_eq!(ok_runs.load(Ordering::SeqCst), 2);

        drop(tx);
        handle.await.unwrap();
    }

    #[cfg(feature = "watch")]
    mod roots {
        use super::super::fs::collapse_watch_roots;
        use camino::Utf8PathBuf;

        #[test]
        fn nested_roots_collapse_to_ancestor() {
            let collapsed = collapse_watch_roots(
                ["/a", "/a/b", "/a/b/c", "/b", "/c/d"]
                    .map(Utf8PathBuf::from)
                    .to_vec(),
            );

            assert_eq!(
                collapsed,
                ["/a", "/b", "/c/d"].map(Utf8PathBuf::from).to_vec()
            );
        }

        #[test]
        fn similar_names_are_not_collapsed() {
            let collapsed =
                collapse_watch_roots(["/foo", "/foo-bar"].map(Utf8PathBuf::from).to_vec());

            assert_eq!(collapsed, ["/foo", "/foo-bar"].map(Utf8PathBuf::from).to_vec());
        }
    }
}
