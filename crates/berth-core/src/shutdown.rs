//! Process-wide shutdown coordination.
//!
//! Components register named cleanup actions; the signal trap calls
//! [`ShutdownCoordinator::shutdown`] once, which runs every action
//! concurrently and gives up after a fixed timeout.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::BoxFuture;

type Action = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
struct Registry {
    started: bool,
    actions: Vec<(String, Action)>,
}

struct Inner {
    timeout: Duration,
    registry: Mutex<Registry>,
    /// `None` until shutdown finishes, then whether every action completed in time.
    finished: watch::Sender<Option<bool>>,
}

/// Registry of cleanup actions with a bounded, run-once shutdown.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        f.debug_struct("ShutdownCoordinator")
            .field("timeout", &self.inner.timeout)
            .field("started", &registry.started)
            .field("pending", &registry.actions.len())
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (finished, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                timeout,
                registry: Mutex::new(Registry::default()),
                finished,
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a cleanup action.
    ///
    /// If shutdown has already begun the action is started right away.
    pub fn register<F, Fut>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let action: Action = Box::new(move || Box::pin(action()));

        let late = {
            let mut registry = self.registry();
            if registry.started {
                Some(action)
            } else {
                registry.actions.push((name.clone(), action));
                None
            }
        };

        match late {
            Some(action) => {
                tracing::debug!(name, "shutdown in progress, running cleanup immediately");
                tokio::spawn(action());
            }
            None => tracing::trace!(name, "cleanup registered"),
        }
    }

    /// Run every registered action once, concurrently, bounded by the timeout.
    ///
    /// Returns whether all actions finished in time. Later calls wait for the
    /// first one and report its result.
    pub async fn shutdown(&self) -> bool {
        let actions = {
            let mut registry = self.registry();
            if registry.started {
                None
            } else {
                registry.started = true;
                Some(std::mem::take(&mut registry.actions))
            }
        };
        let Some(actions) = actions else {
            return self.wait().await;
        };

        tracing::info!(count = actions.len(), "running shutdown actions");
        let mut running = JoinSet::new();
        for (name, action) in actions {
            running.spawn(async move {
                action().await;
                tracing::debug!(name, "cleanup finished");
            });
        }

        let all_done = tokio::time::timeout(self.inner.timeout, async {
            while let Some(res) = running.join_next().await {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "cleanup action failed");
                }
            }
        })
        .await
        .is_ok();

        if !all_done {
            tracing::warn!(
                timeout_secs = self.inner.timeout.as_secs_f64(),
                pending = running.len(),
                "shutdown timed out, abandoning remaining cleanup"
            );
        }

        self.inner.finished.send_replace(Some(all_done));
        all_done
    }

    /// Block until shutdown has completed; returns its result.
    pub async fn wait(&self) -> bool {
        let mut rx = self.inner.finished.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(result) => result.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.registry().started
    }
}
