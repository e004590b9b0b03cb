//! Config-Dir Watcher: filesystem-event source for the log-forwarder
//! supervisor (component I). Watches a directory for `.yml`/`.yaml`
//! create/write/remove/rename events and coalesces them into a
//! single-slot signal the supervisor can poll without ever blocking on a
//! burst of edits.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::watch;

/// A config-directory change has been observed and not yet consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigChanged;

fn is_yaml_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("yml") | Some("yaml")
    )
}

fn is_relevant_event(event: &Event) -> bool {
    let is_watched_kind = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) || matches!(&event.kind, EventKind::Any);
    is_watched_kind && event.paths.iter().any(|p| is_yaml_extension(p))
}

/// Watches `directory` for relevant YAML file events, coalescing them into
/// a single-slot `watch` channel. Holding the returned [`RecommendedWatcher`]
/// keeps the OS-level watch alive; dropping it stops the watcher.
pub struct ConfigDirWatcher {
    _inner: RecommendedWatcher,
    rx: watch::Receiver<u64>,
}

impl ConfigDirWatcher {
    /// Start watching `directory`. Errors from the underlying watcher (a
    /// missing directory, an OS limit) are returned once at construction;
    /// errors surfaced later through the notify callback are logged at
    /// debug and do not stop the watcher (§7).
    pub fn new(directory: impl AsRef<Path>) -> notify::Result<Self> {
        let (tx, rx) = watch::channel(0u64);
        let directory = directory.as_ref().to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_relevant_event(&event) => {
                    tx.send_modify(|counter| *counter = counter.wrapping_add(1));
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(error = %err, dir = %directory.display(), "config watcher error");
                }
            },
            notify::Config::default(),
        )?;

        watcher.watch(directory.as_path(), RecursiveMode::NonRecursive)?;

        Ok(Self { _inner: watcher, rx })
    }

    /// Block until the next coalesced change notification arrives, or
    /// return immediately if one is already pending. Never buffers more
    /// than one pending restart: intervening edits between calls collapse
    /// into a single wakeup.
    pub async fn changed(&mut self) -> ConfigChanged {
        let _ = self.rx.changed().await;
        ConfigChanged
    }
}
