pub mod shopify;

pub use shopify::ShopifyClient;

use serde::Serialize;
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog credentials are not configured")]
    NotConfigured,
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogProduct {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ImageSource {
    Attachment(Vec<u8>),
    Url(String),
}

#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub filename: String,
    pub position: u32,
    pub source: ImageSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedImage {
    pub id: String,
    pub position: u32,
}

/// Remote product catalog the ingest pipeline matches folders against and
/// pushes photography into.
pub trait Catalog: Send + Sync + 'static {
    fn search_products(
        &self,
        query: &str,
    ) -> impl Future<Output = Result<Vec<CatalogProduct>, CatalogError>> + Send;

    fn get_product(
        &self,
        product_id: &str,
    ) -> impl Future<Output = Result<Option<CatalogProduct>, CatalogError>> + Send;

    fn upload_image(
        &self,
        product_id: &str,
        image: ImagePayload,
    ) -> impl Future<Output = Result<UploadedImage, CatalogError>> + Send;

    fn fetch_image(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, CatalogError>> + Send;
}

#[cfg(test)]
pub mod fake {
    //! In-memory catalog used by pipeline and workflow tests.

    use super::*;
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex},
    };

    #[derive(Clone, Default)]
    pub struct FakeCatalog {
        pub products: Arc<Mutex<Vec<CatalogProduct>>>,
        pub failing_files: Arc<Mutex<HashSet<String>>>,
        pub uploads: Arc<Mutex<Vec<(String, String, u32)>>>,
        pub search_fails: Arc<Mutex<bool>>,
    }

    impl FakeCatalog {
        pub fn with_products(products: &[(&str, &str)]) -> Self {
            let catalog = Self::default();
            {
                let mut guard = catalog.products.lock().expect("lock");
                for (id, title) in products {
                    guard.push(CatalogProduct {
                        id: id.to_string(),
                        title: title.to_string(),
                        image_urls: vec![format!("https://cdn.example.com/{id}/1.jpg")],
                    });
                }
            }
            catalog
        }

        pub fn fail_uploads_for(&self, filename: &str) {
            self.failing_files
                .lock()
                .expect("lock")
                .insert(filename.to_string());
        }

        pub fn uploaded(&self) -> Vec<(String, String, u32)> {
            self.uploads.lock().expect("lock").clone()
        }
    }

    impl Catalog for FakeCatalog {
        async fn search_products(&self, _query: &str) -> Result<Vec<CatalogProduct>, CatalogError> {
            if *self.search_fails.lock().expect("lock") {
                return Err(CatalogError::Request("catalog offline".into()));
            }
            Ok(self.products.lock().expect("lock").clone())
        }

        async fn get_product(
            &self,
            product_id: &str,
        ) -> Result<Option<CatalogProduct>, CatalogError> {
            Ok(self
                .products
                .lock()
                .expect("lock")
                .iter()
                .find(|p| p.id == product_id)
                .cloned())
        }

        async fn upload_image(
            &self,
            product_id: &str,
            image: ImagePayload,
        ) -> Result<UploadedImage, CatalogError> {
            if self
                .failing_files
                .lock()
                .expect("lock")
                .contains(&image.filename)
            {
                return Err(CatalogError::Http {
                    status: 422,
                    body: "image rejected".into(),
                });
            }
            let mut uploads = self.uploads.lock().expect("lock");
            uploads.push((product_id.to_string(), image.filename, image.position));
            Ok(UploadedImage {
                id: format!("img-{}", uploads.len()),
                position: image.position,
            })
        }

        async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, CatalogError> {
            Ok(url.as_bytes().to_vec())
        }
    }
}
