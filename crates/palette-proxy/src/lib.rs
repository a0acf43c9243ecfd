use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use reqwest::Url;
use serde_json::json;

pub const DEFAULT_UPSTREAM: &str = "https://api-inference.huggingface.co";
pub const DEFAULT_BIND: &str = "127.0.0.1:8787";
pub const ROUTE_PREFIX: &str = "/api/hf";

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(180);
const FORWARDED_HEADERS: [header::HeaderName; 2] = [header::CONTENT_TYPE, header::ACCEPT];
const WAIT_FOR_MODEL_HEADER: &str = "x-wait-for-model";

#[derive(Clone)]
pub struct ProxyConfig {
    pub upstream_base: String,
    pub api_token: Option<String>,
    pub bind: SocketAddr,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("upstream_base", &self.upstream_base)
            .field("has_api_token", &self.api_token.is_some())
            .field("bind", &self.bind)
            .finish()
    }
}

impl ProxyConfig {
    pub fn from_env(bind: SocketAddr) -> Self {
        Self::from_lookup(bind, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(bind: SocketAddr, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let first_non_empty = |keys: &[&str]| {
            keys.iter().find_map(|key| {
                lookup(key)
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
        };
        let upstream_base = first_non_empty(&["PALETTE_PROXY_UPSTREAM"])
            .unwrap_or_else(|| DEFAULT_UPSTREAM.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            upstream_base,
            api_token: first_non_empty(&["HF_TOKEN", "HUGGINGFACE_API_KEY"]),
            bind,
        }
    }
}

struct ProxyState {
    upstream_base: String,
    api_token: Option<String>,
    http: reqwest::Client,
}

/// `/api/hf/{path}` forwarder. Everything else is a JSON 404.
pub fn router(config: &ProxyConfig) -> Result<Router> {
    let http = reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .context("failed building upstream HTTP client")?;
    let state = Arc::new(ProxyState {
        upstream_base: config.upstream_base.clone(),
        api_token: config.api_token.clone(),
        http,
    });
    Ok(Router::new()
        .route(&format!("{ROUTE_PREFIX}/{{*path}}"), any(forward))
        .fallback(not_found)
        .with_state(state))
}

pub async fn serve(config: ProxyConfig) -> Result<()> {
    let app = router(&config)?;
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed binding {}", config.bind))?;
    log::info!(
        "palette proxy listening on http://{} -> {}",
        listener.local_addr()?,
        config.upstream_base
    );
    if config.api_token.is_none() {
        log::warn!("HF_TOKEN is not set; forwarded requests will be rejected");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("palette proxy shutting down");
        })
        .await
        .context("proxy server failed")
}

/// `v1/chat/completions` or `models/<id>` with a non-empty id.
pub fn is_allowed_route(path: &str) -> bool {
    let path = path.trim_start_matches('/');
    if path.contains('\\') || path.split('/').any(|segment| segment == ".." || segment == ".") {
        return false;
    }
    if path == "v1/chat/completions" {
        return true;
    }
    match path.strip_prefix("models/") {
        Some(model) => !model.trim_matches('/').is_empty(),
        None => false,
    }
}

/// Resolves the still percent-encoded path after `/api/hf/` against the
/// upstream base. The check runs on the normalized URL the upstream will
/// receive, so dot segments and encoded separators cannot leave the
/// allowed routes or the upstream origin.
pub fn upstream_target(upstream_base: &str, raw_path: &str, query: Option<&str>) -> Option<Url> {
    let lowered = raw_path.to_ascii_lowercase();
    if raw_path.contains('\\') || lowered.contains("%5c") || lowered.contains("%2f") {
        return None;
    }
    let base = Url::parse(&format!("{}/", upstream_base.trim_end_matches('/'))).ok()?;
    let mut target = base.join(raw_path.trim_start_matches('/')).ok()?;
    if target.origin() != base.origin() {
        return None;
    }
    let relative = target.path().strip_prefix(base.path())?;
    if !is_allowed_route(relative) {
        return None;
    }
    target.set_query(query);
    target.set_fragment(None);
    Some(target)
}

async fn forward(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method == Method::OPTIONS {
        return with_cors(StatusCode::NO_CONTENT.into_response());
    }
    let path = uri
        .path()
        .strip_prefix(ROUTE_PREFIX)
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    let Some(target) = upstream_target(&state.upstream_base, &path, uri.query()) else {
        log::warn!("rejected proxy route {method} /{path}");
        return error_response(StatusCode::NOT_FOUND, "Not found");
    };
    let Some(token) = state.api_token.as_deref() else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server is missing HF_TOKEN configuration",
        );
    };

    let mut upstream = state.http.request(method.clone(), target).bearer_auth(token);
    for name in FORWARDED_HEADERS {
        if let Some(value) = headers.get(&name) {
            upstream = upstream.header(name, value.clone());
        }
    }
    if let Some(value) = headers.get(WAIT_FOR_MODEL_HEADER) {
        upstream = upstream.header(WAIT_FOR_MODEL_HEADER, value.clone());
    }
    if !body.is_empty() {
        upstream = upstream.body(body);
    }

    let reply = match upstream.send().await {
        Ok(reply) => reply,
        Err(err) => {
            log::warn!("upstream request failed for /{path}: {err}");
            return error_response(StatusCode::BAD_GATEWAY, "Upstream request failed");
        }
    };
    let status = reply.status();
    let content_type = reply.headers().get(header::CONTENT_TYPE).cloned();
    let bytes = match reply.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            log::warn!("upstream body read failed for /{path}: {err}");
            return error_response(StatusCode::BAD_GATEWAY, "Upstream response was interrupted");
        }
    };
    log::info!("{method} /{path} -> {}", status.as_u16());

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    with_cors(response)
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    with_cors((status, Json(json!({ "error": message }))).into_response())
}

fn with_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Accept, X-Wait-For-Model"),
    );
    response
}
