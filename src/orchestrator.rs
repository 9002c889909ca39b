//! Per-folder ingest: wait out the copy, match the folder to a catalog
//! product, and push its photos.

use crate::catalog::{Catalog, CatalogError};
use crate::config::WatchSettings;
use crate::folder_name::parse_folder_name;
use crate::matcher::ProductMatcher;
use crate::models::WatchStatus;
use crate::stabilizer::{StabilizeError, Stabilizer};
use crate::uploader::ImageUploader;
use crate::watch_log::{FolderDetection, WatchLog, WatchLogError};
use serde::Serialize;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    WatchLog(#[from] WatchLogError),
    #[error("catalog lookup failed: {0}")]
    Catalog(#[from] CatalogError),
    #[error("cannot read folder: {0}")]
    Io(#[from] std::io::Error),
}

/// How one pass over a folder ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FolderOutcome {
    AlreadyRunning,
    AlreadyDone,
    Cancelled,
    NoImages,
    Unmatched,
    Done { uploaded: usize, failed: usize },
    UploadFailed { failed: usize },
    Failed { error: String },
}

impl FolderOutcome {
    fn label(&self) -> &'static str {
        match self {
            FolderOutcome::AlreadyRunning => "already_running",
            FolderOutcome::AlreadyDone => "already_done",
            FolderOutcome::Cancelled => "cancelled",
            FolderOutcome::NoImages => "no_images",
            FolderOutcome::Unmatched => "unmatched",
            FolderOutcome::Done { .. } => "done",
            FolderOutcome::UploadFailed { .. } => "upload_failed",
            FolderOutcome::Failed { .. } => "failed",
        }
    }
}

/// Where to find the folder and what to call it.
#[derive(Debug, Clone)]
pub struct FolderRef {
    pub path: PathBuf,
    pub preset_name: String,
    pub folder_name: String,
}

impl FolderRef {
    /// Splits `root/{preset}/{folder}` into its parts.
    pub fn from_path(path: &Path) -> Option<Self> {
        let folder_name = path.file_name()?.to_str()?.to_string();
        let preset_name = path.parent()?.file_name()?.to_str()?.to_string();
        Some(Self {
            path: path.to_path_buf(),
            preset_name,
            folder_name,
        })
    }
}

type InFlight = Arc<Mutex<HashSet<PathBuf>>>;

struct InFlightGuard {
    set: InFlight,
    path: PathBuf,
}

impl InFlightGuard {
    fn acquire(set: &InFlight, path: &Path) -> Option<Self> {
        if !lock(set).insert(path.to_path_buf()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            path: path.to_path_buf(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.path);
    }
}

fn lock(set: &InFlight) -> MutexGuard<'_, HashSet<PathBuf>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct FolderPipeline<C> {
    watch_log: WatchLog,
    stabilizer: Stabilizer,
    matcher: ProductMatcher<C>,
    uploader: ImageUploader<C>,
    settings: Arc<WatchSettings>,
    in_flight: InFlight,
}

impl<C> Clone for FolderPipeline<C> {
    fn clone(&self) -> Self {
        Self {
            watch_log: self.watch_log.clone(),
            stabilizer: self.stabilizer.clone(),
            matcher: self.matcher.clone(),
            uploader: self.uploader.clone(),
            settings: Arc::clone(&self.settings),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<C: Catalog> FolderPipeline<C> {
    pub fn new(
        watch_log: WatchLog,
        stabilizer: Stabilizer,
        matcher: ProductMatcher<C>,
        uploader: ImageUploader<C>,
        settings: Arc<WatchSettings>,
    ) -> Self {
        Self {
            watch_log,
            stabilizer,
            matcher,
            uploader,
            settings,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Runs the folder through the pipeline. Never fails: unexpected errors
    /// are logged and recorded on the folder's row when one exists.
    pub async fn process(&self, folder: &FolderRef) -> FolderOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &folder.path) else {
            debug!(
                target = "ingest.pipeline",
                folder = %folder.folder_name,
                "already in flight"
            );
            return FolderOutcome::AlreadyRunning;
        };

        let started = Instant::now();
        let mut row_id = None;
        let outcome = match self.run(folder, &mut row_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    target = "ingest.pipeline",
                    folder = %folder.folder_name,
                    error = %err,
                    "folder pipeline failed"
                );
                if let Some(id) = row_id
                    && let Err(record_err) = self.watch_log.mark_error(id, &err.to_string()).await
                {
                    warn!(
                        target = "ingest.pipeline",
                        folder = %folder.folder_name,
                        error = %record_err,
                        "could not record failure"
                    );
                }
                FolderOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };
        crate::metrics::folder_outcome(outcome.label(), started.elapsed().as_millis());
        outcome
    }

    async fn run(
        &self,
        folder: &FolderRef,
        row_id: &mut Option<i64>,
    ) -> Result<FolderOutcome, IngestError> {
        let name = folder.folder_name.as_str();
        if let Some(existing) = self.watch_log.find_by_folder(name).await?
            && existing.status == WatchStatus::Done
        {
            debug!(target = "ingest.pipeline", folder = %name, "already done");
            return Ok(FolderOutcome::AlreadyDone);
        }

        let parsed = parse_folder_name(name);

        if !self.stabilizer.is_pending(&folder.path) {
            self.stabilizer.notify_change(&folder.path);
        }
        match self.stabilizer.wait_for_stable(&folder.path).await {
            Ok(()) => {}
            Err(StabilizeError::Cancelled) => {
                info!(target = "ingest.pipeline", folder = %name, "stabilization cancelled");
                return Ok(FolderOutcome::Cancelled);
            }
            Err(err) => warn!(
                target = "ingest.pipeline",
                folder = %name,
                error = %err,
                "stabilization interrupted, continuing with current files"
            ),
        }

        let images = list_images(&folder.path, &self.settings).await?;
        let entry = self
            .watch_log
            .upsert_detected(&FolderDetection {
                folder_name: name.to_string(),
                folder_path: folder.path.display().to_string(),
                preset_name: folder.preset_name.clone(),
                parsed_product_name: parsed.product_name.clone(),
                parsed_serial_suffix: parsed.serial_suffix.clone(),
            })
            .await?;
        *row_id = Some(entry.id);

        if images.is_empty() {
            self.watch_log.mark_no_images(entry.id).await?;
            info!(target = "ingest.pipeline", folder = %name, "no images in folder");
            return Ok(FolderOutcome::NoImages);
        }

        let product_id = match (&entry.status, &entry.shopify_product_id) {
            (WatchStatus::Matched, Some(product_id)) => {
                debug!(
                    target = "ingest.pipeline",
                    folder = %name,
                    product_id = %product_id,
                    "reusing recorded match"
                );
                product_id.clone()
            }
            _ => {
                let found = self
                    .matcher
                    .find_match(&parsed.product_name, parsed.serial_suffix.as_deref())
                    .await?;
                let Some(found) = found else {
                    self.watch_log.mark_unmatched(entry.id).await?;
                    info!(
                        target = "ingest.pipeline",
                        folder = %name,
                        product = %parsed.product_name,
                        "no catalog match"
                    );
                    return Ok(FolderOutcome::Unmatched);
                };
                self.watch_log
                    .mark_matched(entry.id, &found.product_id, &found.title, found.confidence)
                    .await?;
                info!(
                    target = "ingest.pipeline",
                    folder = %name,
                    product_id = %found.product_id,
                    confidence = found.confidence.as_str(),
                    score = found.score,
                    "folder matched"
                );
                found.product_id
            }
        };

        self.watch_log
            .mark_uploading(entry.id, images.len() as i64)
            .await?;
        let report = self.uploader.upload_images(&product_id, &images).await;

        if report.uploaded > 0 {
            self.watch_log
                .mark_done(entry.id, report.uploaded as i64)
                .await?;
            info!(
                target = "ingest.pipeline",
                folder = %name,
                product_id = %product_id,
                uploaded = report.uploaded,
                failed = report.failed,
                "folder done"
            );
            Ok(FolderOutcome::Done {
                uploaded: report.uploaded,
                failed: report.failed,
            })
        } else {
            self.watch_log
                .mark_error(entry.id, "all uploads failed")
                .await?;
            Ok(FolderOutcome::UploadFailed {
                failed: report.failed,
            })
        }
    }
}

/// Image files directly inside `dir`, sorted by name. Dotfiles are skipped.
pub async fn list_images(dir: &Path, settings: &WatchSettings) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut images = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| settings.is_image_extension(ext));
        if is_image {
            images.push(path);
        }
    }
    images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fake::FakeCatalog;
    use crate::db::memory_pool;
    use crate::models::MatchConfidence;
    use std::time::Duration;

    struct Harness {
        pipeline: FolderPipeline<FakeCatalog>,
        catalog: FakeCatalog,
        log: WatchLog,
        root: tempfile::TempDir,
    }

    async fn harness(products: &[(&str, &str)]) -> Harness {
        let catalog = FakeCatalog::with_products(products);
        let shared = Arc::new(catalog.clone());
        let log = WatchLog::new(memory_pool().await);
        let pipeline = FolderPipeline::new(
            log.clone(),
            Stabilizer::new(Duration::from_millis(20)),
            ProductMatcher::new(shared.clone(), crate::matcher::DEFAULT_THRESHOLD),
            ImageUploader::new(shared, None),
            Arc::new(WatchSettings::default()),
        );
        Harness {
            pipeline,
            catalog,
            log,
            root: tempfile::tempdir().expect("tempdir"),
        }
    }

    fn make_folder(root: &Path, preset: &str, name: &str, files: &[&str]) -> FolderRef {
        let path = root.join(preset).join(name);
        std::fs::create_dir_all(&path).expect("mkdir");
        for file in files {
            std::fs::write(path.join(file), b"jpeg").expect("write");
        }
        FolderRef::from_path(&path).expect("folder ref")
    }

    #[test]
    fn folder_ref_splits_preset_and_name() {
        let folder = FolderRef::from_path(Path::new("/mnt/studio/white/sigma 24-70 #624"))
            .expect("ref");
        assert_eq!(folder.preset_name, "white");
        assert_eq!(folder.folder_name, "sigma 24-70 #624");
    }

    #[tokio::test]
    async fn image_listing_filters_and_sorts() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["b.JPG", "a.jpg", ".hidden.jpg", "notes.txt", "c.png"] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }
        std::fs::create_dir(dir.path().join("sub.jpg")).expect("mkdir");

        let images = list_images(dir.path(), &WatchSettings::default())
            .await
            .expect("list");
        let names: Vec<_> = images
            .iter()
            .map(|p| p.file_name().and_then(|n| n.to_str()).unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.JPG", "c.png"]);
    }

    #[tokio::test]
    async fn matched_folder_is_uploaded_and_done() {
        let h = harness(&[("624", "Sigma 24-70 #624")]).await;
        let folder = make_folder(h.root.path(), "white", "sigma 24-70 #624", &["01.jpg", "02.jpg"]);

        let outcome = h.pipeline.process(&folder).await;
        assert_eq!(
            outcome,
            FolderOutcome::Done {
                uploaded: 2,
                failed: 0
            }
        );

        let entry = h
            .log
            .find_by_folder("sigma 24-70 #624")
            .await
            .expect("find")
            .expect("row");
        assert_eq!(entry.status, WatchStatus::Done);
        assert_eq!(entry.image_count, 2);
        assert_eq!(entry.match_confidence, Some(MatchConfidence::Exact));
        assert_eq!(entry.preset_name, "white");
        assert_eq!(h.pipeline.in_flight_count(), 0);

        let again = h.pipeline.process(&folder).await;
        assert_eq!(again, FolderOutcome::AlreadyDone);
    }

    #[tokio::test]
    async fn partial_upload_still_completes() {
        let h = harness(&[("624", "Sigma 24-70 #624")]).await;
        let files = ["01.jpg", "02.jpg", "03.jpg", "04.jpg", "05.jpg"];
        let folder = make_folder(h.root.path(), "white", "sigma 24-70 #624", &files);
        h.catalog.fail_uploads_for("02.jpg");
        h.catalog.fail_uploads_for("04.jpg");

        let outcome = h.pipeline.process(&folder).await;
        assert_eq!(
            outcome,
            FolderOutcome::Done {
                uploaded: 3,
                failed: 2
            }
        );
        let entry = h
            .log
            .find_by_folder("sigma 24-70 #624")
            .await
            .expect("find")
            .expect("row");
        assert_eq!(entry.status, WatchStatus::Done);
        assert_eq!(entry.image_count, 3);
    }

    #[tokio::test]
    async fn every_upload_failing_is_an_error() {
        let h = harness(&[("624", "Sigma 24-70 #624")]).await;
        let folder = make_folder(h.root.path(), "white", "sigma 24-70 #624", &["01.jpg"]);
        h.catalog.fail_uploads_for("01.jpg");

        let outcome = h.pipeline.process(&folder).await;
        assert_eq!(outcome, FolderOutcome::UploadFailed { failed: 1 });
        let entry = h
            .log
            .find_by_folder("sigma 24-70 #624")
            .await
            .expect("find")
            .expect("row");
        assert_eq!(entry.status, WatchStatus::Error);
        assert_eq!(entry.error.as_deref(), Some("all uploads failed"));
    }

    #[tokio::test]
    async fn empty_folder_is_recorded_as_error() {
        let h = harness(&[]).await;
        let folder = make_folder(h.root.path(), "white", "leica m6", &["notes.txt"]);

        assert_eq!(h.pipeline.process(&folder).await, FolderOutcome::NoImages);
        let entry = h
            .log
            .find_by_folder("leica m6")
            .await
            .expect("find")
            .expect("row");
        assert_eq!(entry.status, WatchStatus::Error);
        assert_eq!(entry.image_count, 0);
        assert_eq!(entry.error.as_deref(), Some("no images"));
    }

    #[tokio::test]
    async fn emptied_folder_resets_its_image_count() {
        let h = harness(&[("624", "Sigma 24-70 #624")]).await;
        let folder = make_folder(h.root.path(), "white", "sigma 24-70 #624", &["01.jpg", "02.jpg"]);
        h.catalog.fail_uploads_for("01.jpg");
        h.catalog.fail_uploads_for("02.jpg");
        assert_eq!(
            h.pipeline.process(&folder).await,
            FolderOutcome::UploadFailed { failed: 2 }
        );
        let failed = h
            .log
            .find_by_folder("sigma 24-70 #624")
            .await
            .expect("find")
            .expect("row");
        assert_eq!(failed.image_count, 2);

        for file in ["01.jpg", "02.jpg"] {
            std::fs::remove_file(folder.path.join(file)).expect("remove");
        }
        assert_eq!(h.pipeline.process(&folder).await, FolderOutcome::NoImages);
        let entry = h
            .log
            .find_by_folder("sigma 24-70 #624")
            .await
            .expect("find")
            .expect("row");
        assert_eq!(entry.status, WatchStatus::Error);
        assert_eq!(entry.image_count, 0);
        assert_eq!(entry.error.as_deref(), Some("no images"));
    }

    #[tokio::test]
    async fn unmatched_folder_uploads_nothing() {
        let h = harness(&[("5", "Leica Q3")]).await;
        let folder = make_folder(h.root.path(), "white", "hasselblad x2d", &["01.jpg"]);

        assert_eq!(h.pipeline.process(&folder).await, FolderOutcome::Unmatched);
        assert!(h.catalog.uploaded().is_empty());
        let unmatched = h.log.list_unmatched(10).await.expect("list");
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].parsed_product_name, "hasselblad x2d");
    }

    #[tokio::test]
    async fn manual_link_is_reused_on_next_pass() {
        let h = harness(&[]).await;
        let folder = make_folder(h.root.path(), "white", "mystery lens", &["01.jpg"]);
        assert_eq!(h.pipeline.process(&folder).await, FolderOutcome::Unmatched);

        let entry = h
            .log
            .find_by_folder("mystery lens")
            .await
            .expect("find")
            .expect("row");
        h.log
            .link_manual(entry.id, "900", "Mystery Lens 50mm")
            .await
            .expect("link")
            .expect("linked");

        let outcome = h.pipeline.process(&folder).await;
        assert_eq!(
            outcome,
            FolderOutcome::Done {
                uploaded: 1,
                failed: 0
            }
        );
        assert_eq!(h.catalog.uploaded()[0].0, "900");
        let entry = h.log.find(entry.id).await.expect("find").expect("row");
        assert_eq!(entry.match_confidence, Some(MatchConfidence::Manual));
    }

    #[tokio::test]
    async fn catalog_outage_marks_row_error() {
        let h = harness(&[("5", "Leica Q3")]).await;
        *h.catalog.search_fails.lock().expect("lock") = true;
        let folder = make_folder(h.root.path(), "white", "leica q3", &["01.jpg"]);

        let outcome = h.pipeline.process(&folder).await;
        assert!(matches!(outcome, FolderOutcome::Failed { .. }));
        let entry = h
            .log
            .find_by_folder("leica q3")
            .await
            .expect("find")
            .expect("row");
        assert_eq!(entry.status, WatchStatus::Error);
        assert_eq!(h.pipeline.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_pass_on_same_folder_is_skipped() {
        let h = harness(&[("624", "Sigma 24-70 #624")]).await;
        let folder = make_folder(h.root.path(), "white", "sigma 24-70 #624", &["01.jpg"]);

        let (first, second) = tokio::join!(h.pipeline.process(&folder), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            h.pipeline.process(&folder).await
        });
        assert!(matches!(first, FolderOutcome::Done { .. }));
        assert_eq!(second, FolderOutcome::AlreadyRunning);
        assert_eq!(h.catalog.uploaded().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_during_stabilization_writes_nothing() {
        let h = harness(&[("624", "Sigma 24-70 #624")]).await;
        let folder = make_folder(h.root.path(), "white", "sigma 24-70 #624", &["01.jpg"]);
        let stabilizer = h.pipeline.stabilizer.clone();

        let (outcome, ()) = tokio::join!(h.pipeline.process(&folder), async {
            while !stabilizer.is_pending(&folder.path) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            stabilizer.cancel_all();
        });
        assert_eq!(outcome, FolderOutcome::Cancelled);
        assert!(
            h.log
                .find_by_folder("sigma 24-70 #624")
                .await
                .expect("find")
                .is_none()
        );
    }
}
