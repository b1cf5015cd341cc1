//! Debounced watch on the source document.
//!
//! No diff information is assumed: every detected change re-reads the whole
//! file and hands the full text to the coordinator, which re-derives
//! everything through the parser and reconciliation. The parent directory is
//! watched (filtered to our file) so editors that replace the file on save
//! do not break the watch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{error, info, warn};
use notify_debouncer_mini::{DebounceEventResult, Debouncer};
use tokio::sync::mpsc;

use crate::coordinator::Event;

/// Start watching `source` (an absolute path). The returned debouncer must
/// be kept alive for the watch to stay active.
pub fn spawn(
    source: PathBuf,
    events: mpsc::Sender<Event>,
) -> anyhow::Result<Debouncer<notify::RecommendedWatcher>> {
    let watch_dir: PathBuf = source
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("source path {:?} has no parent directory", source))?;

    let source_path = source.clone();
    let mut debouncer = notify_debouncer_mini::new_debouncer(
        Duration::from_millis(300),
        move |res: DebounceEventResult| match res {
            Ok(changes) => {
                if !changes.iter().any(|change| change.path == source_path) {
                    return;
                }
                match std::fs::read_to_string(&source_path) {
                    // The callback runs on the watcher thread, outside the
                    // tokio runtime.
                    Ok(text) => {
                        let _ = events.blocking_send(Event::SourceChanged(text));
                    }
                    Err(e) => warn!("[watch] Cannot read {:?}: {}", source_path, e),
                }
            }
            Err(e) => error!("[watch] Watch error: {}", e),
        },
    )?;

    debouncer
        .watcher()
        .watch(&watch_dir, notify::RecursiveMode::NonRecursive)?;
    info!("[watch] Watching {:?}", source);

    Ok(debouncer)
}
