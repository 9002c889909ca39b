//! The watcher as one owned unit: filesystem watch, mount monitor, and the
//! per-folder pipelines they feed. Built once at startup and shared through
//! clones of [`WatchService`].

use crate::catalog::{Catalog, CatalogError};
use crate::config::WatchSettings;
use crate::models::{WatchLogEntry, WatchStats};
use crate::mount::{MountEvent, MountMonitor, is_reachable};
use crate::orchestrator::{FolderPipeline, FolderRef};
use crate::stabilizer::Stabilizer;
use crate::watch_log::{WatchLog, WatchLogError};
use crate::watcher::{CHANNEL_CAPACITY, FolderSignal, FolderWatcher, child_dirs, scan_tree};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("WATCH_ROOT is not configured")]
    NoRoot,
    #[error("watcher is already running")]
    AlreadyRunning,
    #[error("watcher is not running")]
    NotRunning,
    #[error("watch log entry {0} not found")]
    EntryNotFound(i64),
    #[error("watch log entry {0} cannot be relinked in its current state")]
    NotLinkable(i64),
    #[error("catalog product {0} not found")]
    ProductNotFound(String),
    #[error(transparent)]
    WatchLog(#[from] WatchLogError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("cannot scan watch root: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchStatusReport {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub in_flight: usize,
    pub pending_stabilization: usize,
    pub stabilize_window_secs: u64,
}

struct Running {
    root: PathBuf,
    started_at: DateTime<Utc>,
    event_loop: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

struct Shared<C> {
    pipeline: FolderPipeline<C>,
    stabilizer: Stabilizer,
    watch_log: WatchLog,
    catalog: Arc<C>,
    settings: Arc<WatchSettings>,
    connected: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
}

pub struct WatchService<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for WatchService<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Catalog> WatchService<C> {
    pub fn new(
        pipeline: FolderPipeline<C>,
        stabilizer: Stabilizer,
        watch_log: WatchLog,
        catalog: Arc<C>,
        settings: Arc<WatchSettings>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                pipeline,
                stabilizer,
                watch_log,
                catalog,
                settings,
                connected: Arc::new(AtomicBool::new(false)),
                running: Mutex::new(None),
            }),
        }
    }

    pub async fn start(&self) -> Result<WatchStatusReport, ServiceError> {
        let root = self.shared.settings.root.clone().ok_or(ServiceError::NoRoot)?;
        let mut running = self.shared.running.lock().await;
        if running.is_some() {
            return Err(ServiceError::AlreadyRunning);
        }

        let settings = &self.shared.settings;
        let reachable = is_reachable(&root, settings.mount_check_timeout).await;
        self.shared.connected.store(reachable, Ordering::SeqCst);

        let (signal_tx, signal_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let overflowed = Arc::new(AtomicBool::new(false));
        let watcher = if reachable {
            match FolderWatcher::start(&root, settings, signal_tx.clone(), overflowed.clone()) {
                Ok(watcher) => Some(watcher),
                Err(err) => {
                    warn!(target = "ingest.service", error = %err, "could not arm watch");
                    None
                }
            }
        } else {
            warn!(
                target = "ingest.service",
                root = %root.display(),
                "watch root unreachable at start, waiting for mount"
            );
            None
        };

        let (mount_tx, mount_rx) = mpsc::channel(8);
        let monitor = MountMonitor::new(
            root.clone(),
            settings.mount_check_interval,
            settings.mount_check_timeout,
            Arc::clone(&self.shared.connected),
        )
        .spawn(mount_tx);

        let event_loop = tokio::spawn(self.clone().event_loop(EventLoop {
            root: root.clone(),
            watcher,
            signal_tx,
            signal_rx,
            mount_rx,
            overflowed,
        }));

        if reachable {
            self.spawn_rescan(root.clone());
        }

        let started_at = Utc::now();
        info!(target = "ingest.service", root = %root.display(), reachable, "watcher started");
        *running = Some(Running {
            root,
            started_at,
            event_loop,
            monitor,
        });
        drop(running);
        Ok(self.status().await)
    }

    /// Stops watching. Folder pipelines already running finish on their own.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let stopped = self
            .shared
            .running
            .lock()
            .await
            .take()
            .ok_or(ServiceError::NotRunning)?;
        stopped.event_loop.abort();
        stopped.monitor.abort();
        info!(target = "ingest.service", root = %stopped.root.display(), "watcher stopped");
        Ok(())
    }

    /// Stops the watcher if running and cancels pending stabilization.
    pub async fn shutdown(&self) {
        let _ = self.stop().await;
        self.shared.stabilizer.cancel_all();
    }

    pub async fn status(&self) -> WatchStatusReport {
        let running = self.shared.running.lock().await;
        WatchStatusReport {
            running: running.is_some(),
            root: self
                .shared
                .settings
                .root
                .as_ref()
                .map(|root| root.display().to_string()),
            connected: running.is_some() && self.shared.connected.load(Ordering::SeqCst),
            started_at: running.as_ref().map(|r| r.started_at),
            in_flight: self.shared.pipeline.in_flight_count(),
            pending_stabilization: self.shared.stabilizer.pending_count(),
            stabilize_window_secs: self.shared.stabilizer.window().as_secs(),
        }
    }

    /// Replays every product folder under the root. Returns how many were queued.
    pub async fn rescan(&self) -> Result<usize, ServiceError> {
        let root = self.shared.settings.root.clone().ok_or(ServiceError::NoRoot)?;
        let folders = scan_tree(&root).await?;
        let count = folders.len();
        for folder in folders {
            self.spawn_process(folder);
        }
        info!(target = "ingest.service", folders = count, "rescan queued");
        Ok(count)
    }

    pub async fn stats(&self) -> Result<WatchStats, ServiceError> {
        Ok(self.shared.watch_log.stats().await?)
    }

    pub async fn unmatched(&self, limit: i64) -> Result<Vec<WatchLogEntry>, ServiceError> {
        Ok(self.shared.watch_log.list_unmatched(limit).await?)
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<WatchLogEntry>, ServiceError> {
        Ok(self.shared.watch_log.list_recent(limit).await?)
    }

    /// Attaches a catalog product to a folder and queues it for upload.
    pub async fn link_manual(
        &self,
        id: i64,
        product_id: &str,
    ) -> Result<WatchLogEntry, ServiceError> {
        let product = self
            .shared
            .catalog
            .get_product(product_id)
            .await?
            .ok_or_else(|| ServiceError::ProductNotFound(product_id.to_string()))?;
        if self.shared.watch_log.find(id).await?.is_none() {
            return Err(ServiceError::EntryNotFound(id));
        }
        let entry = self
            .shared
            .watch_log
            .link_manual(id, &product.id, &product.title)
            .await?
            .ok_or(ServiceError::NotLinkable(id))?;

        self.spawn_process(FolderRef {
            path: PathBuf::from(&entry.folder_path),
            preset_name: entry.preset_name.clone(),
            folder_name: entry.folder_name.clone(),
        });
        Ok(entry)
    }

    pub async fn delete(&self, id: i64) -> Result<(), ServiceError> {
        if self.shared.watch_log.delete(id).await? {
            Ok(())
        } else {
            Err(ServiceError::EntryNotFound(id))
        }
    }

    fn spawn_process(&self, folder: FolderRef) {
        let pipeline = self.shared.pipeline.clone();
        tokio::spawn(async move {
            pipeline.process(&folder).await;
        });
    }

    fn spawn_rescan(&self, root: PathBuf) {
        let service = self.clone();
        tokio::spawn(async move {
            match scan_tree(&root).await {
                Ok(folders) => {
                    info!(target = "ingest.service", folders = folders.len(), "full rescan");
                    for folder in folders {
                        service.spawn_process(folder);
                    }
                }
                Err(err) => warn!(target = "ingest.service", error = %err, "rescan failed"),
            }
        });
    }

    async fn spawn_preset(&self, preset: &Path) {
        match child_dirs(preset).await {
            Ok(children) => {
                for child in children {
                    if let Some(folder) = FolderRef::from_path(&child) {
                        self.spawn_process(folder);
                    }
                }
            }
            Err(err) => warn!(
                target = "ingest.service",
                preset = %preset.display(),
                error = %err,
                "cannot list new preset"
            ),
        }
    }

    async fn event_loop(self, mut state: EventLoop) {
        loop {
            tokio::select! {
                signal = state.signal_rx.recv() => {
                    let Some(signal) = signal else { break };
                    if state.overflowed.swap(false, Ordering::Relaxed) {
                        self.spawn_rescan(state.root.clone());
                    }
                    match signal {
                        FolderSignal::Detected(folder) => {
                            info!(
                                target = "ingest.service",
                                folder = %folder.folder_name,
                                preset = %folder.preset_name,
                                "folder detected"
                            );
                            self.spawn_process(folder);
                        }
                        FolderSignal::PresetAppeared(preset) => self.spawn_preset(&preset).await,
                        FolderSignal::Activity(folder) => self.shared.stabilizer.notify_change(&folder),
                    }
                }
                event = state.mount_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        MountEvent::Connected => {
                            state.watcher = None;
                            match FolderWatcher::start(
                                &state.root,
                                &self.shared.settings,
                                state.signal_tx.clone(),
                                state.overflowed.clone(),
                            ) {
                                Ok(watcher) => state.watcher = Some(watcher),
                                Err(err) => warn!(
                                    target = "ingest.service",
                                    error = %err,
                                    "could not re-arm watch"
                                ),
                            }
                            self.spawn_rescan(state.root.clone());
                        }
                        MountEvent::Disconnected => {}
                    }
                }
            }
        }
    }
}

struct EventLoop {
    root: PathBuf,
    watcher: Option<FolderWatcher>,
    signal_tx: mpsc::Sender<FolderSignal>,
    signal_rx: mpsc::Receiver<FolderSignal>,
    mount_rx: mpsc::Receiver<MountEvent>,
    overflowed: Arc<AtomicBool>,
}
