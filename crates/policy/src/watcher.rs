/// Hot reload of the policy directory using notify-debouncer-full.
use std::{sync::Arc, time::Duration};

use {
    notify_debouncer_full::{
        DebounceEventResult, Debouncer, RecommendedCache, new_debouncer,
        notify::{EventKind, RecommendedWatcher, RecursiveMode},
    },
    tokio::{sync::mpsc, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{engine::PolicyEngine, error::PolicyLoadError, loader::is_policy_file};

/// Reloads a [`PolicyEngine`] whenever a policy file in its directory changes.
///
/// Bursts of events inside the debounce window produce one reload. Reloads
/// run on the blocking pool and never overlap.
pub struct PolicyWatcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PolicyWatcher {
    /// Must be called from inside a tokio runtime.
    pub fn start(engine: Arc<PolicyEngine>) -> Result<Self, PolicyLoadError> {
        let dir = engine.config().policies_dir.clone();
        let debounce = Duration::from_millis(engine.config().debounce_ms.max(1));
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let relevant = events.iter().any(|event| {
                        matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) && event.paths.iter().any(|p| is_policy_file(p))
                    });
                    if relevant {
                        let _ = tx.send(());
                    }
                },
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "policy watcher error");
                    }
                },
            }
        })
        .map_err(|e| PolicyLoadError::Watcher(e.to_string()))?;

        debouncer
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| PolicyLoadError::Watcher(e.to_string()))?;
        info!(dir = %dir.display(), "policy watcher: watching directory");

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => {
                        if msg.is_none() {
                            break;
                        }
                        // Collapse anything queued while the previous reload ran.
                        while rx.try_recv().is_ok() {}
                        debug!("policy files changed, reloading");
                        let engine = Arc::clone(&engine);
                        match tokio::task::spawn_blocking(move || engine.reload()).await {
                            Ok(Ok(_)) => {},
                            Ok(Err(e)) => warn!(error = %e, "policy hot reload failed"),
                            Err(e) => warn!(error = %e, "policy reload task panicked"),
                        }
                    },
                }
            }
        });

        Ok(Self {
            _debouncer: debouncer,
            cancel,
            task: Some(task),
        })
    }

    /// Stop watching and wait for an in-flight reload to finish.
    pub async fn stop(mut self) -> Result<(), PolicyLoadError> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| PolicyLoadError::Task(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for PolicyWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
