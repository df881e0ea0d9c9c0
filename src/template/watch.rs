//! Hot reload of the template registry.
//!
//! Watches the template roots using the `notify` crate. On each detected
//! change (with 100ms debounce), the registry is rebuilt from disk. On
//! success, the inner `Arc<TemplateRegistry>` is swapped inside the outer
//! `Arc<RwLock<...>>` shared by every component, and the ids of changed
//! templates are published so the tool cache can invalidate them.
//!
//! On reload failure, the previous registry is preserved and a warning is
//! logged.

use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::template::registry::TemplateRegistry;

/// Shared registry handle. Readers clone the inner `Arc` per operation;
/// the watch task swaps it under a short write lock.
pub type RegistryHandle = Arc<RwLock<Arc<TemplateRegistry>>>;

/// Wrap a freshly discovered registry for sharing.
pub fn registry_handle(registry: TemplateRegistry) -> RegistryHandle {
    Arc::new(RwLock::new(Arc::new(registry)))
}

/// Watch the registry's roots and reload on each change.
///
/// Changed template ids are sent on `changed_tx` after every successful
/// reload; the receiver is expected to invalidate derived caches. The
/// function returns when `cancel` fires.
pub async fn run_template_watch(
    registry_handle: RegistryHandle,
    changed_tx: mpsc::UnboundedSender<Vec<String>>,
    cancel: CancellationToken,
) {
    let roots: Vec<std::path::PathBuf> = {
        let guard = registry_handle.read().await;
        guard.roots().iter().map(|(p, _)| p.clone()).collect()
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();

    // notify v8's EventHandler is implemented for FnMut; forward events into
    // the tokio channel. Send errors mean we are shutting down.
    let mut watcher = match notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to create template watcher");
            return;
        }
    };

    let mut watching = 0usize;
    for root in &roots {
        if !root.is_dir() {
            continue;
        }
        match watcher.watch(root, RecursiveMode::Recursive) {
            Ok(()) => watching += 1,
            Err(e) => {
                tracing::error!(root = %root.display(), error = %e, "failed to watch template root");
            }
        }
    }
    if watching == 0 {
        tracing::warn!("no template roots to watch, hot reload disabled");
        return;
    }

    // Keep the watcher alive for the duration of this task; dropping it stops
    // the OS-level watch and events silently stop arriving.
    let _watcher = watcher;

    tracing::info!(roots = watching, "template hot-reload watching");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(Ok(_)) => {
                        // Debounce: wait 100ms for a burst of events to settle,
                        // then drain whatever arrived during the sleep.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        while rx.try_recv().is_ok() {}

                        let previous = registry_handle.read().await.clone();
                        match previous.refreshed() {
                            Ok(fresh) => {
                                let changed = fresh.changed_since(&previous);
                                let count = fresh.len();
                                {
                                    let mut guard = registry_handle.write().await;
                                    *guard = Arc::new(fresh);
                                }
                                tracing::info!(
                                    templates = count,
                                    changed = changed.len(),
                                    "template registry reloaded"
                                );
                                if !changed.is_empty() && changed_tx.send(changed).is_err() {
                                    tracing::debug!("template change receiver dropped");
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    "template reload failed, keeping previous registry"
                                );
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "template watcher error");
                    }
                    None => {
                        tracing::debug!("template watcher channel closed");
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("template watch cancelled");
                return;
            }
        }
    }
}
