//! Product photo workflow: pull a catalog product's images, run each through
//! the image-processing service, and push the results back.

use crate::catalog::{Catalog, CatalogProduct, ImagePayload, ImageSource};
use crate::image_service::ImageProcessor;
use crate::jobs::{JobError, JobStore};
use crate::models::StepStatus;
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("workflow worker is not running")]
    QueueClosed,
}

#[derive(Debug, Error)]
#[error("step `{step}` failed: {message}")]
pub struct StepError {
    step: &'static str,
    message: String,
}

impl StepError {
    fn new(step: &'static str, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }

    fn cancelled(step: &'static str) -> Self {
        Self::new(step, "cancelled")
    }
}

struct StepOutcome<T> {
    value: T,
    output: Value,
}

impl<T> StepOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

struct WorkItem {
    job_id: String,
    product_id: String,
}

struct NamedImage {
    filename: String,
    bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct WorkflowRunner {
    tx: mpsc::Sender<WorkItem>,
    store: JobStore,
}

impl WorkflowRunner {
    pub fn spawn<C, P>(
        store: JobStore,
        catalog: Arc<C>,
        processor: Arc<P>,
        queue_capacity: usize,
    ) -> (Self, JoinHandle<()>)
    where
        C: Catalog,
        P: ImageProcessor,
    {
        let (tx, mut rx) = mpsc::channel::<WorkItem>(queue_capacity.max(1));
        let worker = Worker {
            store: store.clone(),
            catalog,
            processor,
        };
        let handle = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                worker.run(&item).await;
            }
        });
        (Self { tx, store }, handle)
    }

    pub async fn submit(
        &self,
        product_id: &str,
        title: Option<String>,
    ) -> Result<String, WorkflowError> {
        let job_id = self.store.create_job(product_id, title).await?;
        let item = WorkItem {
            job_id: job_id.clone(),
            product_id: product_id.to_string(),
        };
        if self.tx.send(item).await.is_err() {
            let _ = self.store.cancel_job(&job_id).await;
            return Err(WorkflowError::QueueClosed);
        }
        Ok(job_id)
    }
}

struct Worker<C, P> {
    store: JobStore,
    catalog: Arc<C>,
    processor: Arc<P>,
}

impl<C: Catalog, P: ImageProcessor> Worker<C, P> {
    async fn run(&self, item: &WorkItem) {
        let job_id = item.job_id.as_str();
        if self.store.is_cancelled(job_id).await {
            debug!(target = "ingest.workflow", job_id, "job cancelled before start");
            return;
        }
        if let Err(err) = self.store.start_job(job_id).await {
            warn!(target = "ingest.workflow", job_id, error = %err, "job vanished before start");
            return;
        }
        let started = Instant::now();
        match self.steps(job_id, &item.product_id).await {
            Ok(uploaded) => info!(
                target = "ingest.workflow",
                job_id,
                product_id = %item.product_id,
                uploaded,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "workflow completed"
            ),
            Err(err) => warn!(
                target = "ingest.workflow",
                job_id,
                product_id = %item.product_id,
                step = err.step,
                error = %err.message,
                "workflow stopped"
            ),
        }
    }

    async fn steps(&self, job_id: &str, product_id: &str) -> Result<usize, StepError> {
        let product = self
            .capture_step(job_id, "fetch_product", self.fetch_product(product_id))
            .await?;
        let originals = self
            .capture_step(job_id, "download_images", self.download_images(job_id, &product))
            .await?;
        let processed = self
            .capture_step(job_id, "process_images", self.process_images(job_id, originals))
            .await?;
        self.capture_step(
            job_id,
            "upload_images",
            self.upload_images(job_id, product_id, processed),
        )
        .await
    }

    /// Marks the step running, awaits it, and records the outcome. A job that
    /// was cancelled meanwhile keeps its cancelled state; the result is dropped.
    async fn capture_step<T, Fut>(
        &self,
        job_id: &str,
        step: &'static str,
        work: Fut,
    ) -> Result<T, StepError>
    where
        Fut: Future<Output = Result<StepOutcome<T>, StepError>>,
    {
        if self.store.is_cancelled(job_id).await {
            return Err(StepError::cancelled(step));
        }
        self.record(job_id, step, StepStatus::Running, None).await;

        match work.await {
            Ok(outcome) => {
                if self.store.is_cancelled(job_id).await {
                    debug!(target = "ingest.workflow", job_id, step, "late result discarded");
                    return Err(StepError::cancelled(step));
                }
                self.record(job_id, step, StepStatus::Done, Some(outcome.output))
                    .await;
                Ok(outcome.value)
            }
            Err(err) => {
                self.record(
                    job_id,
                    step,
                    StepStatus::Error,
                    Some(json!({ "error": err.message })),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn record(&self, job_id: &str, step: &str, status: StepStatus, result: Option<Value>) {
        if let Err(err) = self.store.update_step(job_id, step, status, result).await {
            warn!(target = "ingest.workflow", job_id, step, error = %err, "step update dropped");
        }
    }

    async fn progress(&self, job_id: &str, step: &str, current: usize, total: usize, name: &str) {
        let _ = self
            .store
            .emit_progress(
                job_id,
                step,
                current as u32,
                total as u32,
                Some(name.to_string()),
            )
            .await;
    }

    async fn fetch_product(
        &self,
        product_id: &str,
    ) -> Result<StepOutcome<CatalogProduct>, StepError> {
        const STEP: &str = "fetch_product";
        let product = self
            .catalog
            .get_product(product_id)
            .await
            .map_err(|err| StepError::new(STEP, err.to_string()))?
            .ok_or_else(|| StepError::new(STEP, format!("product {product_id} not found")))?;
        if product.image_urls.is_empty() {
            return Err(StepError::new(STEP, "product has no images"));
        }
        let output = json!({
            "title": product.title,
            "images": product.image_urls.len(),
        });
        Ok(StepOutcome::new(product, output))
    }

    async fn download_images(
        &self,
        job_id: &str,
        product: &CatalogProduct,
    ) -> Result<StepOutcome<Vec<NamedImage>>, StepError> {
        const STEP: &str = "download_images";
        let total = product.image_urls.len();
        let mut images = Vec::with_capacity(total);
        let mut bytes_total = 0usize;
        for (index, url) in product.image_urls.iter().enumerate() {
            if self.store.is_cancelled(job_id).await {
                return Err(StepError::cancelled(STEP));
            }
            let filename = filename_from_url(url, index);
            self.progress(job_id, STEP, index + 1, total, &filename).await;
            let bytes = self
                .catalog
                .fetch_image(url)
                .await
                .map_err(|err| StepError::new(STEP, format!("{filename}: {err}")))?;
            bytes_total += bytes.len();
            images.push(NamedImage { filename, bytes });
        }
        let output = json!({ "downloaded": images.len(), "bytes": bytes_total });
        Ok(StepOutcome::new(images, output))
    }

    async fn process_images(
        &self,
        job_id: &str,
        originals: Vec<NamedImage>,
    ) -> Result<StepOutcome<Vec<NamedImage>>, StepError> {
        const STEP: &str = "process_images";
        let total = originals.len();
        let mut processed = Vec::with_capacity(total);
        for (index, image) in originals.into_iter().enumerate() {
            if self.store.is_cancelled(job_id).await {
                return Err(StepError::cancelled(STEP));
            }
            self.progress(job_id, STEP, index + 1, total, &image.filename)
                .await;
            let bytes = self
                .processor
                .process_full(image.bytes, &image.filename)
                .await
                .map_err(|err| StepError::new(STEP, format!("{}: {err}", image.filename)))?;
            processed.push(NamedImage {
                filename: png_name(&image.filename),
                bytes,
            });
        }
        let output = json!({ "processed": processed.len() });
        Ok(StepOutcome::new(processed, output))
    }

    async fn upload_images(
        &self,
        job_id: &str,
        product_id: &str,
        images: Vec<NamedImage>,
    ) -> Result<StepOutcome<usize>, StepError> {
        const STEP: &str = "upload_images";
        let total = images.len();
        let mut uploaded = 0usize;
        let mut failures = Vec::new();
        for (index, image) in images.into_iter().enumerate() {
            if self.store.is_cancelled(job_id).await {
                return Err(StepError::cancelled(STEP));
            }
            self.progress(job_id, STEP, index + 1, total, &image.filename)
                .await;
            let payload = ImagePayload {
                filename: image.filename.clone(),
                position: index as u32 + 1,
                source: ImageSource::Attachment(image.bytes),
            };
            match self.catalog.upload_image(product_id, payload).await {
                Ok(_) => {
                    uploaded += 1;
                    crate::metrics::image_uploaded(true);
                }
                Err(err) => {
                    crate::metrics::image_uploaded(false);
                    failures.push(json!({ "file": image.filename, "error": err.to_string() }));
                }
            }
        }
        if uploaded == 0 {
            return Err(StepError::new(STEP, "all uploads failed"));
        }
        let output = json!({
            "uploaded": uploaded,
            "failed": failures.len(),
            "failures": failures,
        });
        Ok(StepOutcome::new(uploaded, output))
    }
}

fn filename_from_url(url: &str, index: usize) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("image-{}.jpg", index + 1))
}

fn png_name(filename: &str) -> String {
    let stem = filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(filename);
    format!("{stem}.png")
}
