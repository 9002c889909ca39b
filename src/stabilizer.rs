//! Per-folder debounce used to wait out slow, non-atomic copies onto the share.
//!
//! Every folder with recent activity owns one delayed task. Touching the folder
//! aborts that task and schedules a new one, so the folder only counts as
//! stable once a full window passes without activity.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::debug;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StabilizeError {
    #[error("stabilization cancelled by shutdown")]
    Cancelled,
    #[error("stabilization timer dropped before firing")]
    TimerLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Pending,
    Fired,
    Cancelled,
}

struct PendingTimer {
    generation: u64,
    task: JoinHandle<()>,
    state: watch::Sender<TimerState>,
}

#[derive(Default)]
struct Timers {
    pending: HashMap<PathBuf, PendingTimer>,
    next_generation: u64,
}

#[derive(Clone)]
pub struct Stabilizer {
    window: Duration,
    timers: Arc<Mutex<Timers>>,
}

impl Stabilizer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            timers: Arc::new(Mutex::new(Timers::default())),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Starts or restarts the quiet window for `path`.
    pub fn notify_change(&self, path: &Path) {
        let mut timers = lock(&self.timers);
        timers.next_generation += 1;
        let generation = timers.next_generation;

        // Waiters subscribed to the old timer keep their channel across restarts.
        let state = match timers.pending.remove(path) {
            Some(existing) => {
                existing.task.abort();
                existing.state
            }
            None => watch::channel(TimerState::Pending).0,
        };

        let task = self.spawn_timer(path.to_path_buf(), generation);
        timers.pending.insert(
            path.to_path_buf(),
            PendingTimer {
                generation,
                task,
                state,
            },
        );
    }

    /// Resolves once `path` has been quiet for a full window. Returns at once
    /// when nothing is pending for the path.
    pub async fn wait_for_stable(&self, path: &Path) -> Result<(), StabilizeError> {
        let mut rx = {
            let timers = lock(&self.timers);
            match timers.pending.get(path) {
                Some(timer) => timer.state.subscribe(),
                None => return Ok(()),
            }
        };

        let state = rx
            .wait_for(|state| *state != TimerState::Pending)
            .await
            .map(|state| *state)
            .map_err(|_| StabilizeError::TimerLost)?;

        match state {
            TimerState::Fired => Ok(()),
            TimerState::Cancelled => Err(StabilizeError::Cancelled),
            TimerState::Pending => Err(StabilizeError::TimerLost),
        }
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        lock(&self.timers).pending.contains_key(path)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.timers).pending.len()
    }

    /// Aborts every pending timer. Waiters see [`StabilizeError::Cancelled`].
    pub fn cancel_all(&self) {
        let drained = {
            let mut timers = lock(&self.timers);
            timers.pending.drain().collect::<Vec<_>>()
        };
        let count = drained.len();
        for (_, timer) in drained {
            timer.task.abort();
            timer.state.send_replace(TimerState::Cancelled);
        }
        debug!(target = "ingest.stabilizer", count, "cancelled pending timers");
    }

    fn spawn_timer(&self, path: PathBuf, generation: u64) -> JoinHandle<()> {
        let timers = Arc::clone(&self.timers);
        let window = self.window;
        tokio::spawn(async move {
            sleep(window).await;
            let fired = {
                let mut guard = lock(&timers);
                match guard.pending.get(&path) {
                    Some(timer) if timer.generation == generation => guard.pending.remove(&path),
                    _ => None,
                }
            };
            if let Some(timer) = fired {
                debug!(target = "ingest.stabilizer", path = %path.display(), "folder stable");
                timer.state.send_replace(TimerState::Fired);
            }
        })
    }
}

fn lock(timers: &Mutex<Timers>) -> MutexGuard<'_, Timers> {
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn untouched_path_is_stable_immediately() {
        let stabilizer = Stabilizer::new(Duration::from_secs(30));
        let path = PathBuf::from("/share/studio/hasselblad x2d");
        let started = Instant::now();
        stabilizer.wait_for_stable(&path).await.expect("stable");
        assert_eq!(Instant::now(), started);
        assert!(!stabilizer.is_pending(&path));
    }

    #[tokio::test(start_paused = true)]
    async fn each_change_restarts_the_window() {
        let stabilizer = Stabilizer::new(Duration::from_secs(30));
        let path = PathBuf::from("/share/studio/sigma 24-70 #624");

        stabilizer.notify_change(&path);
        assert!(stabilizer.is_pending(&path));

        let waiter = {
            let stabilizer = stabilizer.clone();
            let path = path.clone();
            tokio::spawn(async move {
                stabilizer.wait_for_stable(&path).await.map(|_| Instant::now())
            })
        };
        tokio::task::yield_now().await;

        for _ in 0..3 {
            sleep(Duration::from_secs(20)).await;
            stabilizer.notify_change(&path);
        }
        let last_change = Instant::now();

        let fired_at = waiter.await.expect("join").expect("stable");
        assert!(fired_at >= last_change + Duration::from_secs(30));
        assert!(!stabilizer.is_pending(&path));
    }

    #[tokio::test(start_paused = true)]
    async fn second_wait_after_firing_resolves_immediately() {
        let stabilizer = Stabilizer::new(Duration::from_secs(5));
        let path = PathBuf::from("/share/studio/leica m6");
        stabilizer.notify_change(&path);
        stabilizer.wait_for_stable(&path).await.expect("first wait");

        let started = Instant::now();
        stabilizer.wait_for_stable(&path).await.expect("second wait");
        assert_eq!(Instant::now(), started);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_does_not_report_success() {
        let stabilizer = Stabilizer::new(Duration::from_secs(30));
        let path = PathBuf::from("/share/studio/nikon z 180-600 #12");
        stabilizer.notify_change(&path);

        let waiter = {
            let stabilizer = stabilizer.clone();
            let path = path.clone();
            tokio::spawn(async move { stabilizer.wait_for_stable(&path).await })
        };
        tokio::task::yield_now().await;

        stabilizer.cancel_all();
        let outcome = waiter.await.expect("join");
        assert_eq!(outcome, Err(StabilizeError::Cancelled));
        assert_eq!(stabilizer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn independent_paths_fire_independently() {
        let stabilizer = Stabilizer::new(Duration::from_secs(10));
        let a = PathBuf::from("/share/a/one");
        let b = PathBuf::from("/share/a/two");
        stabilizer.notify_change(&a);
        sleep(Duration::from_secs(6)).await;
        stabilizer.notify_change(&b);

        stabilizer.wait_for_stable(&a).await.expect("a stable");
        assert!(!stabilizer.is_pending(&a));
        assert!(stabilizer.is_pending(&b));
    }
}
