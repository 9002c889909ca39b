//! Reachability polling for the network share. A dropped SMB/NFS mount does
//! not reliably surface as a watch error, so it is checked explicitly.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountEvent {
    Connected,
    Disconnected,
}

/// `Some` only when reachability flipped.
pub fn transition(was_connected: bool, reachable: bool) -> Option<MountEvent> {
    match (was_connected, reachable) {
        (false, true) => Some(MountEvent::Connected),
        (true, false) => Some(MountEvent::Disconnected),
        _ => None,
    }
}

/// The root answers both a metadata call and a directory listing within
/// `limit`. A hung mount counts as unreachable.
pub async fn is_reachable(root: &Path, limit: Duration) -> bool {
    let probe = async {
        let meta = tokio::fs::metadata(root).await?;
        if !meta.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                "watch root is not a directory",
            ));
        }
        let mut entries = tokio::fs::read_dir(root).await?;
        entries.next_entry().await?;
        Ok::<_, std::io::Error>(())
    };
    matches!(timeout(limit, probe).await, Ok(Ok(())))
}

pub struct MountMonitor {
    root: PathBuf,
    interval: Duration,
    check_timeout: Duration,
    connected: Arc<AtomicBool>,
}

impl MountMonitor {
    pub fn new(
        root: PathBuf,
        interval: Duration,
        check_timeout: Duration,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            root,
            interval,
            check_timeout,
            connected,
        }
    }

    /// Runs one check and records the result, reporting a transition if any.
    pub async fn check(&self) -> Option<MountEvent> {
        let reachable = is_reachable(&self.root, self.check_timeout).await;
        let was = self.connected.swap(reachable, Ordering::SeqCst);
        let event = transition(was, reachable);
        match event {
            Some(MountEvent::Connected) => info!(
                target = "ingest.mount",
                root = %self.root.display(),
                "watch root reachable"
            ),
            Some(MountEvent::Disconnected) => warn!(
                target = "ingest.mount",
                root = %self.root.display(),
                "watch root unreachable, waiting for it to come back"
            ),
            None => {}
        }
        event
    }

    /// Checks on every interval tick and forwards transitions. Ends when the
    /// receiver goes away.
    pub fn spawn(self, tx: mpsc::Sender<MountEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Some(event) = self.check().await
                    && tx.send(event).await.is_err()
                {
                    break;
                }
            }
        })
    }
}
