use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

const KEY_HEADER: &str = "X-Ingest-Key";

/// Operator keys from `INGEST_API_KEYS`, a comma list of `name:key` or bare
/// `key` entries. With no keys configured the API is open, which suits a
/// studio LAN but is logged loudly at startup.
#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashMap<String, String>>,
}

#[derive(Clone, Debug)]
pub struct Operator {
    pub name: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let state = Self::parse(&env::var("INGEST_API_KEYS").unwrap_or_default());
        if state.is_open() {
            warn!(
                target = "ingest.api",
                "INGEST_API_KEYS is empty; protected routes accept any caller"
            );
        } else {
            info!(
                target = "ingest.api",
                key_count = state.keys.len(),
                "loaded API keys from env"
            );
        }
        state
    }

    pub fn parse(raw: &str) -> Self {
        let mut keys = HashMap::new();
        for (idx, token) in raw.split(',').enumerate() {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                continue;
            }
            let (name, secret) = match trimmed.split_once(':') {
                Some((name, secret)) => (name.trim().to_string(), secret.trim()),
                None => (format!("key-{:02}", idx + 1), trimmed),
            };
            if secret.is_empty() || name.is_empty() {
                warn!(target = "ingest.api", "ignored malformed INGEST_API_KEYS entry #{}", idx + 1);
                continue;
            }
            keys.insert(secret.to_string(), name);
        }
        Self {
            keys: Arc::new(keys),
        }
    }

    pub fn is_open(&self) -> bool {
        self.keys.is_empty()
    }

    fn authenticate(&self, presented: &str) -> Option<Operator> {
        self.keys
            .get(presented)
            .map(|name| Operator { name: name.clone() })
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    if state.is_open() {
        request.extensions_mut().insert(Operator {
            name: "anonymous".into(),
        });
        return Ok(next.run(request).await);
    }

    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Ingest-Key or Bearer token",
        ));
    };
    let Some(operator) = state.authenticate(&presented) else {
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };

    request.extensions_mut().insert(operator);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}
