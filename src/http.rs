use reqwest::Client;
use std::time::Duration;

/// Outbound HTTP traffic class. Image processing runs background removal on
/// the remote side and needs a far longer request timeout than API calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    Api,
    ImageProcessing,
}

impl Upstream {
    fn timeout(self) -> Duration {
        let (var, default) = match self {
            Upstream::Api => ("HTTP_TIMEOUT_SECS", 30),
            Upstream::ImageProcessing => ("IMAGE_SERVICE_TIMEOUT_SECS", 300),
        };
        Duration::from_secs(secs_from_env(var).unwrap_or(default))
    }
}

fn secs_from_env(var: &str) -> Option<u64> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

pub fn build_client(upstream: Upstream) -> Client {
    let connect = secs_from_env("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(5);
    Client::builder()
        .user_agent(concat!("studio-ingest/", env!("CARGO_PKG_VERSION")))
        .timeout(upstream.timeout())
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_waits_longer_than_api_calls() {
        assert!(Upstream::ImageProcessing.timeout() > Upstream::Api.timeout());
    }
}
