//! File watcher for the catalog CSV. Notifies when the file changes so the
//! index can be rebuilt.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify_debouncer_mini::notify::{self, RecommendedWatcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use tracing::warn;

/// Keeps the watch alive. Dropping it stops notifications.
pub struct CatalogWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    path: PathBuf,
}

impl CatalogWatcher {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Watches `catalog` and calls `on_change` whenever it is written (debounced).
/// The parent directory is watched so editors that replace the file still trigger.
pub fn watch_catalog(
    catalog: &Path,
    debounce: Duration,
    on_change: impl Fn() + Send + 'static,
) -> Result<CatalogWatcher, WatchError> {
    if !catalog.is_file() {
        return Err(WatchError::NotAFile(catalog.to_path_buf()));
    }
    let catalog = catalog.canonicalize().map_err(WatchError::Canonicalize)?;
    let dir = catalog
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| WatchError::NotAFile(catalog.clone()))?;
    let target = catalog.clone();

    let mut debouncer = new_debouncer(debounce, move |res: DebounceEventResult| match res {
        Ok(events) => {
            if events.iter().any(|e| e.path == target) {
                on_change();
            }
        }
        Err(e) => warn!("catalog watcher error: {}", e),
    })
    .map_err(|e| WatchError::Notify(e.to_string()))?;

    debouncer
        .watcher()
        .watch(&dir, notify::RecursiveMode::NonRecursive)
        .map_err(|e| WatchError::Watch(e.to_string()))?;

    Ok(CatalogWatcher {
        _debouncer: debouncer,
        path: catalog,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("not a file: {0}")]
    NotAFile(PathBuf),
    #[error("failed to resolve path: {0}")]
    Canonicalize(std::io::Error),
    #[error("watcher init: {0}")]
    Notify(String),
    #[error("watch failed: {0}")]
    Watch(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let err = watch_catalog(&dir.path().join("nope.csv"), Duration::from_millis(50), || {});
        assert!(matches!(err, Err(WatchError::NotAFile(_))));
    }

    #[test]
    fn rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        let err = watch_catalog(dir.path(), Duration::from_millis(50), || {});
        assert!(matches!(err, Err(WatchError::NotAFile(_))));
    }

    #[test]
    fn watches_existing_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("catalog.csv");
        std::fs::write(&csv, "product_id\nB001\n").unwrap();
        let w = watch_catalog(&csv, Duration::from_millis(50), || {}).unwrap();
        assert_eq!(w.path(), csv.canonicalize().unwrap());
    }

    #[test]
    fn fires_on_catalog_writes_only() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("catalog.csv");
        std::fs::write(&csv, "product_id\nB001\n").unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let _w = watch_catalog(&csv, Duration::from_millis(50), move || {
            let _ = tx.send(());
        })
        .unwrap();

        std::fs::write(dir.path().join("notes.txt"), "unrelated").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

        std::fs::write(&csv, "product_id\nB001\nB002\n").unwrap();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("catalog write should trigger a change");
    }
}
