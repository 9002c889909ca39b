//! Filesystem side of the watcher: turns raw `notify` events under the share
//! root into folder-level signals.
//!
//! The tree is `root/{preset}/{product}/{images}`. Only second-level
//! directories are product folders; anything deeper is activity inside one.

use crate::config::WatchSettings;
use crate::orchestrator::FolderRef;
use notify::{
    Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher,
    event::ModifyKind,
};
use std::{
    path::{Component, Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Capacity of the bridge from the notify thread into tokio. When it fills
/// up the backlog is dropped and a rescan is requested instead.
pub const CHANNEL_CAPACITY: usize = 512;

const IGNORED_NAMES: &[&str] = &[
    "thumbs.db",
    "desktop.ini",
    ".ds_store",
    "@eadir",
    "$recycle.bin",
];

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("watch root {0} is not a directory")]
    RootMissing(PathBuf),
    #[error("filesystem watch failed: {0}")]
    Notify(#[from] notify::Error),
}

#[derive(Debug, Clone)]
pub enum FolderSignal {
    /// A product folder appeared (created, or moved into place).
    Detected(FolderRef),
    /// A preset directory appeared; its product folders need listing.
    PresetAppeared(PathBuf),
    /// Something changed inside a product folder.
    Activity(PathBuf),
}

/// Hidden entries and OS metadata droppings are never product content.
pub fn is_ignored_name(name: &str) -> bool {
    name.starts_with('.') || IGNORED_NAMES.contains(&name.to_ascii_lowercase().as_str())
}

/// Position of `path` in the tree, or `None` when it is outside the root or
/// inside an ignored entry.
fn relative_parts<'a>(root: &Path, path: &'a Path) -> Option<Vec<&'a str>> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        let Component::Normal(name) = component else {
            return None;
        };
        let name = name.to_str()?;
        if is_ignored_name(name) {
            return None;
        }
        parts.push(name);
    }
    Some(parts)
}

/// Maps one changed path to a folder signal. `appeared` is true for creates
/// and renames, where a new directory means a new folder.
pub fn classify(root: &Path, path: &Path, appeared: bool, is_dir: bool) -> Option<FolderSignal> {
    let parts = relative_parts(root, path)?;
    match parts.len() {
        1 if appeared && is_dir => Some(FolderSignal::PresetAppeared(path.to_path_buf())),
        2 if appeared && is_dir => FolderRef::from_path(path).map(FolderSignal::Detected),
        2 => None,
        n if n >= 3 => Some(FolderSignal::Activity(
            root.join(parts[0]).join(parts[1]),
        )),
        _ => None,
    }
}

fn signals_for(root: &Path, event: &Event) -> Vec<FolderSignal> {
    let appeared = match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) => true,
        EventKind::Modify(_) => false,
        EventKind::Access(_) | EventKind::Remove(_) | EventKind::Any | EventKind::Other => {
            return Vec::new();
        }
    };
    event
        .paths
        .iter()
        .filter_map(|path| classify(root, path, appeared, appeared && path.is_dir()))
        .collect()
}

/// Keeps the OS watch alive; dropping it stops event delivery.
pub struct FolderWatcher {
    _watcher: Box<dyn Watcher + Send>,
}

impl FolderWatcher {
    pub fn start(
        root: &Path,
        settings: &WatchSettings,
        tx: mpsc::Sender<FolderSignal>,
        overflowed: Arc<AtomicBool>,
    ) -> Result<Self, WatcherError> {
        if !root.is_dir() {
            return Err(WatcherError::RootMissing(root.to_path_buf()));
        }
        let callback_root = root.to_path_buf();
        let handler = move |result: notify::Result<Event>| match result {
            Ok(event) => {
                for signal in signals_for(&callback_root, &event) {
                    if tx.try_send(signal).is_err() {
                        if !overflowed.swap(true, Ordering::Relaxed) {
                            warn!(
                                target = "ingest.watcher",
                                capacity = CHANNEL_CAPACITY,
                                "event channel full, falling back to rescan"
                            );
                        }
                        break;
                    }
                }
            }
            Err(err) => warn!(target = "ingest.watcher", error = %err, "watch error"),
        };

        let mut watcher: Box<dyn Watcher + Send> = if settings.use_polling {
            Box::new(PollWatcher::new(
                handler,
                notify::Config::default().with_poll_interval(settings.poll_interval),
            )?)
        } else {
            Box::new(RecommendedWatcher::new(handler, notify::Config::default())?)
        };
        watcher.watch(root, RecursiveMode::Recursive)?;
        debug!(
            target = "ingest.watcher",
            root = %root.display(),
            polling = settings.use_polling,
            "watch armed"
        );
        Ok(Self { _watcher: watcher })
    }
}

/// Every product folder currently under `root`, as if each had just appeared.
pub async fn scan_tree(root: &Path) -> std::io::Result<Vec<FolderRef>> {
    let mut folders = Vec::new();
    for preset in child_dirs(root).await? {
        match child_dirs(&preset).await {
            Ok(children) => folders.extend(children.iter().filter_map(|p| FolderRef::from_path(p))),
            Err(err) => warn!(
                target = "ingest.watcher",
                preset = %preset.display(),
                error = %err,
                "cannot list preset"
            ),
        }
    }
    Ok(folders)
}

/// Non-ignored subdirectories of `dir`, sorted by name.
pub async fn child_dirs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let ignored = entry.file_name().to_str().is_none_or(is_ignored_name);
        if ignored || !entry.file_type().await?.is_dir() {
            continue;
        }
        dirs.push(entry.path());
    }
    dirs.sort();
    Ok(dirs)
}
