use crate::config::MirrorSettings;
use crate::http::{Upstream, build_client};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use urlencoding::encode;

/// Resolves files under the watched root to signed URLs on the Supabase
/// bucket that mirrors it, for trees that are a mounted cloud bucket.
#[derive(Debug, Clone)]
pub struct SignedUrlResolver {
    base_url: String,
    service_key: String,
    root: PathBuf,
    mirror: MirrorSettings,
    http: Client,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("path {0} is outside the mirrored root")]
    OutsideRoot(String),
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl SignedUrlResolver {
    pub fn from_env(root: &Path, mirror: MirrorSettings) -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            root: root.to_path_buf(),
            mirror,
            http: build_client(Upstream::Api),
        })
    }

    /// Object key of `path` inside the bucket, percent-encoded per segment.
    pub fn object_path(&self, path: &Path) -> Result<String, StorageError> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::OutsideRoot(path.display().to_string()))?;
        let mut segments = Vec::new();
        if !self.mirror.prefix.is_empty() {
            segments.extend(self.mirror.prefix.split('/').map(|s| encode(s).into_owned()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    segments.push(encode(&part.to_string_lossy()).into_owned())
                }
                _ => return Err(StorageError::OutsideRoot(path.display().to_string())),
            }
        }
        Ok(segments.join("/"))
    }

    pub async fn signed_url(&self, path: &Path) -> Result<String, StorageError> {
        let object = self.object_path(path)?;
        let url = format!(
            "{}/storage/v1/object/sign/{}/{}",
            self.base_url,
            encode(&self.mirror.bucket),
            object
        );
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .json(&json!({ "expiresIn": self.mirror.signed_url_ttl_secs }))
            .send()
            .await
            .map_err(|err| StorageError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StorageError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let payload: SignedUrlResponse = response
            .json()
            .await
            .map_err(|err| StorageError::Deserialize(err.to_string()))?;
        Ok(format!("{}/storage/v1{}", self.base_url, payload.signed_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(prefix: &str) -> SignedUrlResolver {
        SignedUrlResolver {
            base_url: "https://project.supabase.co".into(),
            service_key: "service".into(),
            root: PathBuf::from("/mnt/photos"),
            mirror: MirrorSettings {
                bucket: "photography".into(),
                prefix: prefix.into(),
                signed_url_ttl_secs: 600,
            },
            http: build_client(Upstream::Api),
        }
    }

    #[test]
    fn object_path_encodes_each_segment() {
        let path = Path::new("/mnt/photos/studio/sigma 24-70 #624/IMG_0001.JPG");
        let object = resolver("raw").object_path(path).expect("object path");
        assert_eq!(object, "raw/studio/sigma%2024-70%20%23624/IMG_0001.JPG");
    }

    #[test]
    fn paths_outside_root_are_rejected() {
        let err = resolver("")
            .object_path(Path::new("/tmp/elsewhere.jpg"))
            .unwrap_err();
        assert!(matches!(err, StorageError::OutsideRoot(_)));
    }
}
