//! HTTP surface of the local cache registry.
//!
//! Implements the subset of the OCI distribution API the mirror needs:
//!
//! | Method        | Path                                   |
//! |---------------|----------------------------------------|
//! | GET           | `/v2/`                                 |
//! | GET/HEAD/PUT  | `/v2/<name>/manifests/<reference>`     |
//! | GET/HEAD      | `/v2/<name>/blobs/<digest>`            |
//! | POST          | `/v2/<name>/blobs/uploads/`            |
//! | PATCH/PUT     | `/v2/<name>/blobs/uploads/<uuid>`      |
//!
//! Repository names contain slashes, so everything below `/v2/` goes through
//! a single catch-all route and is parsed from the right.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use a3s_mirror_core::error::{MirrorError, Result};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use bytes::Bytes;
use tower_http::set_header::SetResponseHeaderLayer;

use super::config::RegistryConfig;
use super::health::StorageHealth;
use super::log::RegistryLog;
use super::storage::{digest_hex, validate_repository_name, Storage};

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
const DOCKER_UPLOAD_UUID: &str = "docker-upload-uuid";
const API_VERSION_HEADER: &str = "docker-distribution-api-version";

/// State shared by every request handler.
#[derive(Clone)]
pub struct ServerState {
    pub(crate) storage: Arc<Storage>,
    pub(crate) health: Arc<StorageHealth>,
    pub(crate) log: RegistryLog,
}

impl ServerState {
    pub fn new(storage: Arc<Storage>, health: Arc<StorageHealth>, log: RegistryLog) -> Self {
        Self {
            storage,
            health,
            log,
        }
    }
}

/// Build the registry router with the configured response headers.
pub fn router(state: ServerState, config: &RegistryConfig) -> Result<Router> {
    let mut router = Router::new()
        .route("/v2/", get(base))
        .route("/v2", get(base))
        .route("/v2/{*path}", any(dispatch))
        .layer(DefaultBodyLimit::disable());

    if config.access_log_enabled() {
        router = router.layer(middleware::from_fn_with_state(state.clone(), access_log));
    }

    for (name, values) in &config.http.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            MirrorError::Setup(format!("invalid registry response header '{}': {}", name, e))
        })?;
        for value in values {
            let value = HeaderValue::from_str(value).map_err(|e| {
                MirrorError::Setup(format!("invalid value for header '{}': {}", name, e))
            })?;
            router = router.layer(SetResponseHeaderLayer::appending(name.clone(), value));
        }
    }

    Ok(router
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static(API_VERSION_HEADER),
            HeaderValue::from_static("registry/2.0"),
        ))
        .with_state(state))
}

async fn access_log(State(state): State<ServerState>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let latency_ms = started.elapsed().as_millis() as u64;
    state.log.in_scope(|| {
        tracing::info!(method = %method, path = %path, status, latency_ms, "request");
    });
    response
}

async fn base(State(state): State<ServerState>) -> Response {
    if state.health.is_healthy() {
        (StatusCode::OK, Json(serde_json::json!({}))).into_response()
    } else {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "UNAVAILABLE",
            "storage driver health check failing",
        )
        .into_response()
    }
}

/// Distribution error envelope.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn manifest_unknown(reference: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "MANIFEST_UNKNOWN",
            format!("manifest unknown: {}", reference),
        )
    }

    fn blob_unknown(digest: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "BLOB_UNKNOWN",
            format!("blob unknown to registry: {}", digest),
        )
    }

    fn upload_unknown(uuid: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "BLOB_UPLOAD_UNKNOWN",
            format!("blob upload unknown to registry: {}", uuid),
        )
    }

    fn digest_invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "DIGEST_INVALID", message)
    }

    fn unsupported() -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "UNSUPPORTED",
            "the operation is unsupported",
        )
    }

    fn internal(log: &RegistryLog, err: MirrorError) -> Self {
        log.in_scope(|| tracing::error!(error = %err, "Registry request failed"));
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN", err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "errors": [{ "code": self.code, "message": self.message, "detail": null }]
        });
        (self.status, Json(body)).into_response()
    }
}

/// Operation addressed by a path below `/v2/`.
#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Manifest { name: &'a str, reference: &'a str },
    Blob { name: &'a str, digest: &'a str },
    StartUpload { name: &'a str },
    Upload { name: &'a str, uuid: &'a str },
}

fn parse_route(path: &str) -> Option<Route<'_>> {
    let path = path.trim_start_matches('/');
    let trimmed = path.trim_end_matches('/');

    if let Some(name) = trimmed.strip_suffix("/blobs/uploads") {
        return Some(Route::StartUpload { name });
    }
    if let Some(idx) = path.rfind("/blobs/uploads/") {
        let uuid = &path[idx + "/blobs/uploads/".len()..];
        return Some(Route::Upload {
            name: &path[..idx],
            uuid,
        });
    }
    if let Some(idx) = path.rfind("/manifests/") {
        return Some(Route::Manifest {
            name: &path[..idx],
            reference: &path[idx + "/manifests/".len()..],
        });
    }
    if let Some(idx) = path.rfind("/blobs/") {
        return Some(Route::Blob {
            name: &path[..idx],
            digest: &path[idx + "/blobs/".len()..],
        });
    }
    None
}

fn route_name<'a>(route: &Route<'a>) -> &'a str {
    match route {
        Route::Manifest { name, .. }
        | Route::Blob { name, .. }
        | Route::StartUpload { name }
        | Route::Upload { name, .. } => name,
    }
}

async fn dispatch(
    State(state): State<ServerState>,
    method: Method,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let Some(route) = parse_route(&path) else {
        return ApiError::new(StatusCode::NOT_FOUND, "NAME_UNKNOWN", "repository name not known to registry")
            .into_response();
    };
    if let Err(e) = validate_repository_name(route_name(&route)) {
        return ApiError::new(StatusCode::BAD_REQUEST, "NAME_INVALID", e.to_string()).into_response();
    }

    let head = method == Method::HEAD;
    let read = method == Method::GET || head;
    let result = match route {
        Route::Manifest { name, reference } if read => {
            get_manifest(&state, name, reference, head).await
        }
        Route::Manifest { name, reference } if method == Method::PUT => {
            put_manifest(&state, name, reference, body).await
        }
        Route::Blob { digest, .. } if read => get_blob(&state, digest, head).await,
        Route::StartUpload { name } if method == Method::POST => {
            start_upload(&state, name, &params, body).await
        }
        Route::Upload { name, uuid } if method == Method::PATCH => {
            patch_upload(&state, name, uuid, body).await
        }
        Route::Upload { name, uuid } if method == Method::PUT => {
            put_upload(&state, name, uuid, &params, body).await
        }
        _ => Err(ApiError::unsupported()),
    };

    result.unwrap_or_else(IntoResponse::into_response)
}

fn header_value(value: &str) -> std::result::Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|e| {
        ApiError::new(StatusCode::BAD_REQUEST, "UNSUPPORTED", format!("invalid header value: {}", e))
    })
}

fn created(location: String, digest: &str) -> std::result::Result<Response, ApiError> {
    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, header_value(&location)?),
            (HeaderName::from_static(DOCKER_CONTENT_DIGEST), header_value(digest)?),
        ],
    )
        .into_response())
}

fn upload_accepted(name: &str, uuid: &str, size: u64) -> std::result::Result<Response, ApiError> {
    let range = format!("0-{}", size.saturating_sub(1));
    Ok((
        StatusCode::ACCEPTED,
        [
            (
                header::LOCATION,
                header_value(&format!("/v2/{}/blobs/uploads/{}", name, uuid))?,
            ),
            (HeaderName::from_static(DOCKER_UPLOAD_UUID), header_value(uuid)?),
            (header::RANGE, header_value(&range)?),
        ],
    )
        .into_response())
}

async fn get_manifest(
    state: &ServerState,
    name: &str,
    reference: &str,
    head: bool,
) -> std::result::Result<Response, ApiError> {
    let manifest = match state.storage.get_manifest(name, reference).await {
        Ok(Some(m)) => m,
        Ok(None) => return Err(ApiError::manifest_unknown(reference)),
        Err(MirrorError::Registry(msg)) => {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "MANIFEST_INVALID", msg))
        }
        Err(e) => return Err(ApiError::internal(&state.log, e)),
    };

    let headers = [
        (header::CONTENT_TYPE, header_value(&manifest.media_type)?),
        (HeaderName::from_static(DOCKER_CONTENT_DIGEST), header_value(&manifest.digest)?),
        (header::CONTENT_LENGTH, HeaderValue::from(manifest.content.len())),
    ];
    let body = if head { Body::empty() } else { Body::from(manifest.content) };
    Ok((StatusCode::OK, headers, body).into_response())
}

async fn put_manifest(
    state: &ServerState,
    name: &str,
    reference: &str,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    match state.storage.put_manifest(name, reference, &body).await {
        Ok(digest) => created(format!("/v2/{}/manifests/{}", name, digest), &digest),
        Err(MirrorError::Image { message, .. }) => Err(ApiError::digest_invalid(message)),
        Err(MirrorError::Registry(msg)) => {
            Err(ApiError::new(StatusCode::BAD_REQUEST, "TAG_INVALID", msg))
        }
        Err(e) => Err(ApiError::internal(&state.log, e)),
    }
}

async fn get_blob(
    state: &ServerState,
    digest: &str,
    head: bool,
) -> std::result::Result<Response, ApiError> {
    digest_hex(digest).map_err(|e| ApiError::digest_invalid(e.to_string()))?;

    let (length, body) = if head {
        let size = state
            .storage
            .blob_size(digest)
            .await
            .ok_or_else(|| ApiError::blob_unknown(digest))?;
        (size as usize, Body::empty())
    } else {
        let data = state
            .storage
            .read_blob(digest)
            .await
            .map_err(|e| ApiError::internal(&state.log, e))?
            .ok_or_else(|| ApiError::blob_unknown(digest))?;
        (data.len(), Body::from(data))
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (HeaderName::from_static(DOCKER_CONTENT_DIGEST), header_value(digest)?),
            (header::CONTENT_LENGTH, HeaderValue::from(length)),
        ],
        body,
    )
        .into_response())
}

async fn start_upload(
    state: &ServerState,
    name: &str,
    params: &HashMap<String, String>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    // cross-repository mount of a blob we already hold
    if let Some(mount) = params.get("mount") {
        digest_hex(mount).map_err(|e| ApiError::digest_invalid(e.to_string()))?;
        if state.storage.blob_size(mount).await.is_some() {
            state
                .storage
                .link_blob(name, mount)
                .await
                .map_err(|e| ApiError::internal(&state.log, e))?;
            return created(format!("/v2/{}/blobs/{}", name, mount), mount);
        }
    }

    if let Some(digest) = params.get("digest") {
        return match state.storage.put_blob(name, digest, &body).await {
            Ok(digest) => created(format!("/v2/{}/blobs/{}", name, digest), &digest),
            Err(MirrorError::Image { message, .. }) => Err(ApiError::digest_invalid(message)),
            Err(MirrorError::Registry(msg)) => Err(ApiError::digest_invalid(msg)),
            Err(e) => Err(ApiError::internal(&state.log, e)),
        };
    }

    let uuid = state
        .storage
        .start_upload(name)
        .await
        .map_err(|e| ApiError::internal(&state.log, e))?;
    upload_accepted(name, &uuid, 0)
}

async fn patch_upload(
    state: &ServerState,
    name: &str,
    uuid: &str,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    match state.storage.append_upload(name, uuid, &body).await {
        Ok(Some(size)) => upload_accepted(name, uuid, size),
        Ok(None) | Err(MirrorError::Registry(_)) => Err(ApiError::upload_unknown(uuid)),
        Err(e) => Err(ApiError::internal(&state.log, e)),
    }
}

async fn put_upload(
    state: &ServerState,
    name: &str,
    uuid: &str,
    params: &HashMap<String, String>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let Some(expected) = params.get("digest") else {
        return Err(ApiError::digest_invalid("digest parameter is required"));
    };
    digest_hex(expected).map_err(|e| ApiError::digest_invalid(e.to_string()))?;

    match state.storage.commit_upload(name, uuid, expected, &body).await {
        Ok(Some(digest)) => created(format!("/v2/{}/blobs/{}", name, digest), &digest),
        Ok(None) | Err(MirrorError::Registry(_)) => Err(ApiError::upload_unknown(uuid)),
        Err(MirrorError::Image { message, .. }) => Err(ApiError::digest_invalid(message)),
        Err(e) => Err(ApiError::internal(&state.log, e)),
    }
}
