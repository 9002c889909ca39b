use crate::http::{Upstream, build_client};
use reqwest::{
    Client, Response,
    multipart::{Form, Part},
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ImageServiceError {
    #[error("image service request failed: {0}")]
    Request(String),
    #[error("image service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("invalid image service response: {0}")]
    Deserialize(String),
}

/// Knobs forwarded to `/process-full`. Defaults match the service's own.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub background: String,
    pub padding: f32,
    pub shadow: bool,
    pub width: u32,
    pub height: u32,
    pub template_text: String,
    pub bar_height: u32,
    pub font_size: u32,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            background: "FFFFFF".into(),
            padding: 0.1,
            shadow: true,
            width: 1200,
            height: 1200,
            template_text: "usedcameragear.com".into(),
            bar_height: 50,
            font_size: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub uptime_s: Option<f64>,
}

impl ServiceHealth {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Background removal, padding, and branding for one product photo.
pub trait ImageProcessor: Send + Sync + 'static {
    fn process_full(
        &self,
        image: Vec<u8>,
        filename: &str,
    ) -> impl Future<Output = Result<Vec<u8>, ImageServiceError>> + Send;
}

#[derive(Debug, Clone)]
pub struct ImageServiceClient {
    base_url: String,
    options: ProcessOptions,
    http: Client,
}

impl ImageServiceClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            options: ProcessOptions::default(),
            http: build_client(Upstream::ImageProcessing),
        }
    }

    pub async fn health(&self) -> Result<ServiceHealth, ImageServiceError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|err| ImageServiceError::Request(err.to_string()))?;
        check_status(response)
            .await?
            .json()
            .await
            .map_err(|err| ImageServiceError::Deserialize(err.to_string()))
    }

    fn form(&self, image: Vec<u8>, filename: &str) -> Result<Form, ImageServiceError> {
        let part = Part::bytes(image)
            .file_name(filename.to_string())
            .mime_str(mime_for(filename))
            .map_err(|err| ImageServiceError::Request(err.to_string()))?;
        let opts = &self.options;
        Ok(Form::new()
            .part("image", part)
            .text("background", opts.background.clone())
            .text("padding", opts.padding.to_string())
            .text("shadow", opts.shadow.to_string())
            .text("width", opts.width.to_string())
            .text("height", opts.height.to_string())
            .text("template_text", opts.template_text.clone())
            .text("bar_height", opts.bar_height.to_string())
            .text("font_size", opts.font_size.to_string()))
    }
}

impl ImageProcessor for ImageServiceClient {
    async fn process_full(&self, image: Vec<u8>, filename: &str) -> Result<Vec<u8>, ImageServiceError> {
        let size_in = image.len();
        let form = self.form(image, filename)?;
        let response = self
            .http
            .post(format!("{}/process-full", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|err| ImageServiceError::Request(err.to_string()))?;
        let bytes = check_status(response)
            .await?
            .bytes()
            .await
            .map_err(|err| ImageServiceError::Request(err.to_string()))?;
        debug!(
            target = "ingest.image_service",
            filename,
            size_in,
            size_out = bytes.len(),
            "image processed"
        );
        Ok(bytes.to_vec())
    }
}

fn mime_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "heic" => "image/heic",
        _ => "application/octet-stream",
    }
}

async fn check_status(response: Response) -> Result<Response, ImageServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ImageServiceError::Http {
        status: status.as_u16(),
        body: body.chars().take(512).collect(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_follows_extension() {
        assert_eq!(mime_for("IMG_0001.JPG"), "image/jpeg");
        assert_eq!(mime_for("shot.png"), "image/png");
        assert_eq!(mime_for("noext"), "application/octet-stream");
    }

    #[test]
    fn default_options_match_service_defaults() {
        let opts = ProcessOptions::default();
        assert_eq!(opts.background, "FFFFFF");
        assert_eq!((opts.width, opts.height), (1200, 1200));
        assert!(opts.shadow);
    }

    #[test]
    fn health_status_parses() {
        let health: ServiceHealth =
            serde_json::from_str(r#"{"status":"ok","version":"2.0.0","uptime_s":12.5}"#)
                .expect("parse");
        assert!(health.is_ok());
        assert_eq!(health.version.as_deref(), Some("2.0.0"));
    }
}
