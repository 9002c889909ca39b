use crate::catalog::{Catalog, ImagePayload, ImageSource};
use crate::storage::SignedUrlResolver;
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadReport {
    pub uploaded: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<UploadFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadFailure {
    pub file: String,
    pub error: String,
}

pub struct ImageUploader<C> {
    catalog: Arc<C>,
    signer: Option<SignedUrlResolver>,
}

impl<C> Clone for ImageUploader<C> {
    fn clone(&self) -> Self {
        Self {
            catalog: Arc::clone(&self.catalog),
            signer: self.signer.clone(),
        }
    }
}

impl<C: Catalog> ImageUploader<C> {
    pub fn new(catalog: Arc<C>, signer: Option<SignedUrlResolver>) -> Self {
        Self { catalog, signer }
    }

    /// Uploads `files` in order. A failed file is recorded and skipped; the
    /// caller decides what partial success means.
    pub async fn upload_images(&self, product_id: &str, files: &[PathBuf]) -> UploadReport {
        let mut report = UploadReport::default();
        for (index, path) in files.iter().enumerate() {
            let filename = file_name(path);
            let outcome = match self.source_for(path).await {
                Ok(source) => self
                    .catalog
                    .upload_image(
                        product_id,
                        ImagePayload {
                            filename: filename.clone(),
                            position: index as u32 + 1,
                            source,
                        },
                    )
                    .await
                    .map_err(|err| err.to_string()),
                Err(err) => Err(err),
            };

            match outcome {
                Ok(_) => {
                    report.uploaded += 1;
                    crate::metrics::image_uploaded(true);
                }
                Err(error) => {
                    warn!(
                        target = "ingest.uploader",
                        product_id,
                        file = %filename,
                        error = %error,
                        "image upload failed"
                    );
                    crate::metrics::image_uploaded(false);
                    report.failed += 1;
                    report.failures.push(UploadFailure {
                        file: filename,
                        error,
                    });
                }
            }
        }
        info!(
            target = "ingest.uploader",
            product_id,
            uploaded = report.uploaded,
            failed = report.failed,
            "upload batch finished"
        );
        report
    }

    async fn source_for(&self, path: &Path) -> Result<ImageSource, String> {
        match &self.signer {
            Some(signer) => signer
                .signed_url(path)
                .await
                .map(ImageSource::Url)
                .map_err(|err| err.to_string()),
            None => tokio::fs::read(path)
                .await
                .map(ImageSource::Attachment)
                .map_err(|err| format!("read {}: {err}", path.display())),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fake::FakeCatalog;

    #[tokio::test]
    async fn continues_past_failed_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut files = Vec::new();
        for name in ["01.jpg", "02.jpg", "03.jpg"] {
            let path = dir.path().join(name);
            std::fs::write(&path, b"jpeg").expect("write");
            files.push(path);
        }
        files.push(dir.path().join("missing.jpg"));

        let catalog = FakeCatalog::default();
        catalog.fail_uploads_for("02.jpg");
        let uploader = ImageUploader::new(Arc::new(catalog.clone()), None);

        let report = uploader.upload_images("77", &files).await;
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.failures[0].file, "02.jpg");
        assert_eq!(report.failures[1].file, "missing.jpg");

        let positions: Vec<u32> = catalog.uploaded().iter().map(|(_, _, pos)| *pos).collect();
        assert_eq!(positions, vec![1, 3]);
    }
}
