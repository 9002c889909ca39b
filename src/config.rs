use crate::matcher::DEFAULT_THRESHOLD;
use std::{env, path::PathBuf, time::Duration};

const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "tif", "tiff", "heic"];

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub database_url: String,
    pub watch: WatchSettings,
    pub jobs: JobSettings,
    pub match_threshold: f64,
    pub shopify: ShopifySettings,
    pub image_service_url: String,
    pub mirror: Option<MirrorSettings>,
}

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub root: Option<PathBuf>,
    pub autostart: bool,
    pub stabilize_window: Duration,
    pub mount_check_interval: Duration,
    pub mount_check_timeout: Duration,
    pub use_polling: bool,
    pub poll_interval: Duration,
    pub image_extensions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub capacity: usize,
    pub queue_capacity: usize,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
}

#[derive(Debug, Clone)]
pub struct ShopifySettings {
    pub store_domain: String,
    pub access_token: String,
    pub api_version: String,
}

/// Where a watched tree is mirrored to cloud storage, so images can be handed
/// to the catalog as signed URLs instead of inline bytes.
#[derive(Debug, Clone)]
pub struct MirrorSettings {
    pub bucket: String,
    pub prefix: String,
    pub signed_url_ttl_secs: u64,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT").unwrap_or(8000),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://studio-ingest.db?mode=rwc".to_string()),
            watch: WatchSettings::from_env(),
            jobs: JobSettings::from_env(),
            match_threshold: match_threshold(env_parse::<f64>("MATCH_FUZZY_THRESHOLD")),
            shopify: ShopifySettings::from_env(),
            image_service_url: env::var("IMAGE_SERVICE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://localhost:8100".to_string()),
            mirror: MirrorSettings::from_env(),
        }
    }
}

impl WatchSettings {
    pub fn from_env() -> Self {
        let image_extensions = env::var("IMAGE_EXTENSIONS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                    .filter(|ext| !ext.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| {
                DEFAULT_IMAGE_EXTENSIONS
                    .iter()
                    .map(|ext| ext.to_string())
                    .collect()
            });
        Self {
            root: env::var("WATCH_ROOT")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            autostart: parse_env_bool("WATCH_AUTOSTART"),
            stabilize_window: env_secs("STABILIZE_WINDOW_SECS", 30),
            mount_check_interval: env_secs("MOUNT_CHECK_INTERVAL_SECS", 60),
            mount_check_timeout: env_secs("MOUNT_CHECK_TIMEOUT_SECS", 10),
            use_polling: parse_env_bool("WATCH_USE_POLLING"),
            poll_interval: env_secs("WATCH_POLL_INTERVAL_SECS", 5),
            image_extensions,
        }
    }

    pub fn is_image_extension(&self, ext: &str) -> bool {
        self.image_extensions
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext))
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            root: None,
            autostart: false,
            stabilize_window: Duration::from_secs(30),
            mount_check_interval: Duration::from_secs(60),
            mount_check_timeout: Duration::from_secs(10),
            use_polling: false,
            poll_interval: Duration::from_secs(5),
            image_extensions: DEFAULT_IMAGE_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

impl JobSettings {
    pub fn from_env() -> Self {
        Self {
            capacity: env_parse::<usize>("JOB_CAPACITY")
                .filter(|v| *v > 0)
                .unwrap_or(100),
            queue_capacity: env_parse::<usize>("QUEUE_CAPACITY")
                .filter(|v| *v > 0)
                .unwrap_or(64),
            sweep_interval: env_secs("JOB_SWEEP_INTERVAL_SECS", 120),
            stale_after: env_secs("JOB_STALE_AFTER_SECS", 600),
        }
    }
}

impl ShopifySettings {
    pub fn from_env() -> Self {
        Self {
            store_domain: env::var("SHOPIFY_STORE_DOMAIN")
                .map(|v| {
                    v.trim()
                        .trim_start_matches("https://")
                        .trim_end_matches('/')
                        .to_string()
                })
                .unwrap_or_default(),
            access_token: env::var("SHOPIFY_ACCESS_TOKEN").unwrap_or_default(),
            api_version: env::var("SHOPIFY_API_VERSION").unwrap_or_else(|_| "2024-10".into()),
        }
    }
}

impl MirrorSettings {
    pub fn from_env() -> Option<Self> {
        let bucket = env::var("MIRROR_BUCKET")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())?;
        Some(Self {
            bucket,
            prefix: env::var("MIRROR_PREFIX")
                .map(|v| v.trim_matches('/').to_string())
                .unwrap_or_default(),
            signed_url_ttl_secs: env_parse::<u64>("SIGNED_URL_TTL_SECS")
                .filter(|v| *v > 0)
                .unwrap_or(3600),
        })
    }
}

/// Fuzzy match cut-off; out-of-range values fall back to the matcher default.
fn match_threshold(raw: Option<f64>) -> f64 {
    raw.filter(|v| *v > 0.0 && *v <= 1.0)
        .unwrap_or(DEFAULT_THRESHOLD)
}

pub fn parse_env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        env_parse::<u64>(key)
            .filter(|v| *v > 0)
            .unwrap_or(default),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_extension_check_ignores_case() {
        let settings = WatchSettings::default();
        assert!(settings.is_image_extension("JPG"));
        assert!(settings.is_image_extension("heic"));
        assert!(!settings.is_image_extension("txt"));
    }

    #[test]
    fn match_threshold_falls_back_to_matcher_default() {
        assert_eq!(match_threshold(None), DEFAULT_THRESHOLD);
        assert_eq!(match_threshold(Some(1.5)), DEFAULT_THRESHOLD);
        assert_eq!(match_threshold(Some(0.0)), DEFAULT_THRESHOLD);
        assert_eq!(match_threshold(Some(0.8)), 0.8);
    }
}
