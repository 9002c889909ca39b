//! Pipeline job tracking: a bounded in-memory table of multi-step jobs,
//! written through to SQLite and broadcast on the [`EventBus`].

use crate::events::{EventBus, JobEvent};
use crate::models::{JobStatus, PipelineJob, PipelineStep, StepStatus};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Steps of the product photo workflow, in execution order.
pub const WORKFLOW_STEPS: &[&str] = &[
    "fetch_product",
    "download_images",
    "process_images",
    "upload_images",
];

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {job_id} has no step `{step}`")]
    UnknownStep { job_id: String, step: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
}

/// Overall status as a pure function of the steps.
pub fn derive_status(steps: &[PipelineStep]) -> JobStatus {
    if steps.iter().any(|step| step.status == StepStatus::Error) {
        JobStatus::Failed
    } else if !steps.is_empty() && steps.iter().all(|step| step.status == StepStatus::Done) {
        JobStatus::Completed
    } else {
        JobStatus::Processing
    }
}

fn recompute(job: &mut PipelineJob, now: DateTime<Utc>) {
    let untouched = job
        .steps
        .iter()
        .all(|step| step.status == StepStatus::Pending);
    job.status = if job.started_at.is_none() && untouched {
        JobStatus::Queued
    } else {
        derive_status(&job.steps)
    };
    job.updated_at = now;
    if job.status.is_terminal() {
        job.completed_at.get_or_insert(now);
    }
    if job.status == JobStatus::Failed && job.error.is_none() {
        job.error = job
            .steps
            .iter()
            .find(|step| step.status == StepStatus::Error)
            .map(|step| {
                step.result
                    .as_ref()
                    .and_then(|result| result.get("error"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("step `{}` failed", step.name))
            });
    }
}

/// Errors every running or pending step with "cancelled" and fails the job.
/// Returns the names of the steps it closed.
fn fail_open_steps(job: &mut PipelineJob, now: DateTime<Utc>) -> Vec<String> {
    let mut touched = Vec::new();
    for step in job.steps.iter_mut() {
        if matches!(step.status, StepStatus::Running | StepStatus::Pending) {
            step.status = StepStatus::Error;
            step.completed_at = Some(now);
            step.result = Some(json!({ "error": "cancelled" }));
            touched.push(step.name.clone());
        }
    }
    job.error = Some("cancelled".to_string());
    recompute(job, now);
    job.status = JobStatus::Failed;
    touched
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, PipelineJob>,
    order: VecDeque<String>,
}

#[derive(Clone)]
pub struct JobStore {
    table: Arc<Mutex<JobTable>>,
    capacity: usize,
    steps: &'static [&'static str],
    bus: Arc<EventBus>,
    pool: Option<SqlitePool>,
}

impl JobStore {
    pub fn new(
        capacity: usize,
        steps: &'static [&'static str],
        bus: Arc<EventBus>,
        pool: Option<SqlitePool>,
    ) -> Self {
        Self {
            table: Arc::new(Mutex::new(JobTable::default())),
            capacity: capacity.max(1),
            steps,
            bus,
            pool,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub async fn create_job(
        &self,
        shopify_product_id: &str,
        shopify_title: Option<String>,
    ) -> Result<String, JobError> {
        let now = Utc::now();
        let job = PipelineJob {
            id: Uuid::new_v4().to_string(),
            shopify_product_id: shopify_product_id.to_string(),
            shopify_title,
            status: JobStatus::Queued,
            steps: self.steps.iter().map(|name| PipelineStep::pending(name)).collect(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        };
        let id = job.id.clone();

        let evicted = {
            let mut table = self.table.lock().await;
            let mut evicted = Vec::new();
            while table.order.len() >= self.capacity {
                let Some(oldest) = table.order.pop_front() else {
                    break;
                };
                if let Some(old) = table.jobs.remove(&oldest) {
                    evicted.push(old);
                }
            }
            table.order.push_back(id.clone());
            table.jobs.insert(id.clone(), job.clone());
            evicted
        };
        for mut old in evicted {
            // An unfinished job leaves memory as failed so its history row
            // does not stay queued or processing forever.
            if !old.status.is_terminal() {
                let touched = fail_open_steps(&mut old, Utc::now());
                warn!(target = "ingest.jobs", job_id = %old.id, "unfinished job evicted, cancelling");
                self.persist(&old).await;
                self.publish_cancelled(&old, touched).await;
            } else {
                debug!(target = "ingest.jobs", job_id = %old.id, "evicted oldest job");
            }
            self.bus.close_job(&old.id).await;
        }

        self.persist(&job).await;
        info!(
            target = "ingest.jobs",
            job_id = %id,
            product_id = shopify_product_id,
            "job created"
        );
        Ok(id)
    }

    /// Marks the job processing and stamps `started_at` the first time only.
    pub async fn start_job(&self, job_id: &str) -> Result<PipelineJob, JobError> {
        let job = self
            .mutate(job_id, |job, now| {
                if job.status.is_terminal() {
                    return;
                }
                job.started_at.get_or_insert(now);
                recompute(job, now);
            })
            .await?;
        Ok(job)
    }

    pub async fn update_step(
        &self,
        job_id: &str,
        step: &str,
        status: StepStatus,
        result: Option<Value>,
    ) -> Result<PipelineJob, JobError> {
        let mut applied = false;
        let job = {
            let mut table = self.table.lock().await;
            let job = table
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            if job.status.is_terminal() {
                debug!(
                    target = "ingest.jobs",
                    job_id,
                    step,
                    "late step update on finished job discarded"
                );
            } else {
                let now = Utc::now();
                let slot = job
                    .steps
                    .iter_mut()
                    .find(|candidate| candidate.name == step)
                    .ok_or_else(|| JobError::UnknownStep {
                        job_id: job_id.to_string(),
                        step: step.to_string(),
                    })?;
                slot.status = status;
                match status {
                    StepStatus::Running => {
                        slot.started_at.get_or_insert(now);
                    }
                    StepStatus::Done | StepStatus::Error => {
                        slot.started_at.get_or_insert(now);
                        slot.completed_at = Some(now);
                    }
                    StepStatus::Pending => {}
                }
                if result.is_some() {
                    slot.result = result.clone();
                }
                if status != StepStatus::Pending {
                    job.started_at.get_or_insert(now);
                }
                recompute(job, now);
                applied = true;
            }
            job.clone()
        };

        if applied {
            crate::metrics::job_step(step, status.as_str());
            self.persist(&job).await;
            self.bus
                .publish(JobEvent::StepUpdated {
                    job_id: job.id.clone(),
                    step: step.to_string(),
                    status,
                    job_status: job.status,
                    result,
                })
                .await;
        }
        Ok(job)
    }

    /// Advisory sub-step counters; nothing is persisted.
    pub async fn emit_progress(
        &self,
        job_id: &str,
        step: &str,
        current: u32,
        total: u32,
        message: Option<String>,
    ) -> Result<(), JobError> {
        if !self.table.lock().await.jobs.contains_key(job_id) {
            return Err(JobError::NotFound(job_id.to_string()));
        }
        self.bus
            .publish(JobEvent::Progress {
                job_id: job_id.to_string(),
                step: step.to_string(),
                current,
                total,
                message,
            })
            .await;
        Ok(())
    }

    /// Fails every unfinished step with "cancelled". Returns `false` when the
    /// job had already finished.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool, JobError> {
        let (job, touched) = {
            let mut table = self.table.lock().await;
            let job = table
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            if job.status.is_terminal() {
                return Ok(false);
            }
            let touched = fail_open_steps(job, Utc::now());
            (job.clone(), touched)
        };

        self.persist(&job).await;
        self.publish_cancelled(&job, touched).await;
        info!(target = "ingest.jobs", job_id, "job cancelled");
        Ok(true)
    }

    async fn publish_cancelled(&self, job: &PipelineJob, steps: Vec<String>) {
        for step in steps {
            self.bus
                .publish(JobEvent::StepUpdated {
                    job_id: job.id.clone(),
                    step,
                    status: StepStatus::Error,
                    job_status: job.status,
                    result: Some(json!({ "error": "cancelled" })),
                })
                .await;
        }
    }

    pub async fn is_cancelled(&self, job_id: &str) -> bool {
        self.table
            .lock()
            .await
            .jobs
            .get(job_id)
            .map(|job| job.status.is_terminal())
            .unwrap_or(true)
    }

    /// Looks in memory first, then in the persisted history for evicted jobs.
    pub async fn get(&self, job_id: &str) -> Result<Option<PipelineJob>, JobError> {
        if let Some(job) = self.table.lock().await.jobs.get(job_id).cloned() {
            return Ok(Some(job));
        }
        let Some(pool) = &self.pool else {
            return Ok(None);
        };
        let row = sqlx::query(
            "SELECT id, shopify_product_id, shopify_title, status, steps, error, created_at, \
                 updated_at, started_at, completed_at \
             FROM pipeline_jobs WHERE id = ?1",
        )
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Jobs held in memory, newest first.
    pub async fn list(&self, limit: usize) -> Vec<PipelineJob> {
        let table = self.table.lock().await;
        table
            .order
            .iter()
            .rev()
            .filter_map(|id| table.jobs.get(id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Cancels unfinished jobs whose first step started more than `stale_after` ago.
    pub async fn sweep_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> Vec<String> {
        let max_age = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        let stale = {
            let table = self.table.lock().await;
            table
                .jobs
                .values()
                .filter(|job| !job.status.is_terminal())
                .filter(|job| {
                    let since = job
                        .steps
                        .first()
                        .and_then(|step| step.started_at)
                        .or(job.started_at)
                        .unwrap_or(job.created_at);
                    now - since > max_age
                })
                .map(|job| job.id.clone())
                .collect::<Vec<_>>()
        };

        let mut cancelled = Vec::new();
        for id in stale {
            match self.cancel_job(&id).await {
                Ok(true) => {
                    warn!(target = "ingest.jobs", job_id = %id, "stale job cancelled");
                    cancelled.push(id);
                }
                Ok(false) => {}
                Err(err) => warn!(target = "ingest.jobs", job_id = %id, error = %err, "stale sweep failed"),
            }
        }
        cancelled
    }

    pub fn spawn_sweeper(&self, every: Duration, stale_after: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.sweep_stale(Utc::now(), stale_after).await;
            }
        })
    }

    async fn mutate<F>(&self, job_id: &str, apply: F) -> Result<PipelineJob, JobError>
    where
        F: FnOnce(&mut PipelineJob, DateTime<Utc>),
    {
        let job = {
            let mut table = self.table.lock().await;
            let job = table
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            apply(job, Utc::now());
            job.clone()
        };
        self.persist(&job).await;
        Ok(job)
    }

    async fn persist(&self, job: &PipelineJob) {
        let Some(pool) = &self.pool else {
            return;
        };
        let steps = match serde_json::to_string(&job.steps) {
            Ok(steps) => steps,
            Err(err) => {
                warn!(target = "ingest.jobs", job_id = %job.id, error = %err, "job steps not serializable");
                return;
            }
        };
        let outcome = sqlx::query(
            "INSERT INTO pipeline_jobs (id, shopify_product_id, shopify_title, status, current_step, \
                 steps, error, created_at, updated_at, started_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(id) DO UPDATE SET \
                 shopify_title = excluded.shopify_title, \
                 status = excluded.status, \
                 current_step = excluded.current_step, \
                 steps = excluded.steps, \
                 error = excluded.error, \
                 updated_at = excluded.updated_at, \
                 started_at = excluded.started_at, \
                 completed_at = excluded.completed_at",
        )
        .bind(&job.id)
        .bind(&job.shopify_product_id)
        .bind(job.shopify_title.as_deref())
        .bind(job.status.as_str())
        .bind(job.current_step())
        .bind(steps)
        .bind(job.error.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(pool)
        .await;
        if let Err(err) = outcome {
            warn!(target = "ingest.jobs", job_id = %job.id, error = %err, "job persist failed");
        }
    }
}

fn job_from_row(row: &SqliteRow) -> Result<PipelineJob, JobError> {
    let status_raw: String = row.try_get("status")?;
    let steps_raw: String = row.try_get("steps")?;
    let steps: Vec<PipelineStep> = serde_json::from_str(&steps_raw)
        .map_err(|err| JobError::Corrupt(format!("steps: {err}")))?;
    Ok(PipelineJob {
        id: row.try_get("id")?,
        shopify_product_id: row.try_get("shopify_product_id")?,
        shopify_title: row.try_get("shopify_title")?,
        status: JobStatus::parse(&status_raw)
            .ok_or_else(|| JobError::Corrupt(format!("status `{status_raw}`")))?,
        steps,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
    })
}
