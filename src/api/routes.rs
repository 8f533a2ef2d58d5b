use std::str::FromStr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, head, put},
    Json, Router,
};
use bytes::Bytes;
use opentelemetry::metrics::{Counter, Histogram};
use serde::Deserialize;
use tracing::{error, info, instrument};

use crate::digest::OciDigest;
use crate::error::{AppError, Result};
use crate::handler::handler_for;
use crate::manifest::sniff_media_type;
use crate::manifest::Descriptor;
use crate::referrers::ReferrerIndex;
use crate::storage::Storage;

use super::models::{ReferrerMetadataResponse, ReferrersResponse};

// Application state with storage and metrics
pub struct AppMetrics {
    pub request_counter: Counter<u64>,
    pub manifest_size_histogram: Histogram<f64>,
}

// Type alias for our application state
pub type AppState = (Arc<Storage>, Arc<AppMetrics>);

// Query parameters for the referrers endpoint
#[derive(Debug, Deserialize)]
pub struct ReferrersQuery {
    #[serde(rename = "artifact-type")]
    artifact_type: Option<String>,
}

// Query parameters for the referrer metadata endpoint
#[derive(Debug, Deserialize)]
pub struct ReferrerMetadataQuery {
    #[serde(rename = "media-type")]
    media_type: Option<String>,
}

// Create the main router for the registry API
pub fn registry_router(state: AppState) -> Router<AppState> {
    Router::new()
        // API Version Check
        .route("/v2/", get(api_version_check))

        // Manifest operations
        .route("/v2/{name}/manifests/{reference}", get(get_manifest))
        .route("/v2/{name}/manifests/{reference}", head(check_manifest))
        .route("/v2/{name}/manifests/{reference}", put(put_manifest))

        // Referrer queries
        .route("/v2/{name}/referrers/{reference}", get(get_referrers))
        .route("/v2/{name}/referrer-metadata/{reference}", get(get_referrer_metadata))
        .with_state(state)
}

// API Version Check
#[instrument(name = "api_version_check", skip_all)]
async fn api_version_check(
    State((_, metrics)): State<AppState>,
) -> impl IntoResponse {
    // Increment request counter
    metrics.request_counter.add(1, &[]);

    info!("API version check");
    StatusCode::OK
}

/// Resolve a reference to a digest. Anything that does not parse as a digest
/// is treated as a tag; an unresolvable tag is an unknown manifest. Returns
/// the tag when one was used, so responses can echo it back.
async fn resolve_reference(
    storage: &Storage,
    name: &str,
    reference: &str,
) -> Result<(Option<String>, OciDigest)> {
    match OciDigest::from_str(reference) {
        Ok(digest) => Ok((None, digest)),
        Err(_) => {
            let digest = storage.resolve_tag(name, reference).await?;
            Ok((Some(reference.to_string()), digest))
        }
    }
}

// Put manifest
#[instrument(name = "put_manifest", skip(storage, metrics, headers, body), fields(repository = %name, reference = %reference))]
async fn put_manifest(
    State((storage, metrics)): State<AppState>,
    Path((name, reference)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    // Increment request counter
    metrics.request_counter.add(1, &[]);

    let body_size = body.len();
    info!("Putting manifest: {}/{}, size: {} bytes", name, reference, body_size);

    // Record manifest size in histogram
    metrics.manifest_size_histogram.record(body_size as f64, &[]);

    // Dispatch on the declared media type, sniffing the body when the
    // request did not declare one
    let declared = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let media_type = if declared.is_empty() {
        sniff_media_type(&body)?.to_string()
    } else {
        declared.to_string()
    };

    let handler = handler_for(&media_type, Arc::clone(&storage), &name)?;
    let manifest = handler.unmarshal(&body)?;
    let digest = handler.put(&manifest, false).await?;

    // A digest reference must name the content that was actually pushed; a
    // non-digest reference becomes a tag link
    match OciDigest::from_str(&reference) {
        Ok(expected) => {
            if expected != digest {
                error!("manifest digest mismatch: expected {}, got {}", expected, digest);
                return Err(AppError::BadRequest(format!(
                    "Digest mismatch: expected {}, got {}",
                    expected, digest
                )));
            }
        }
        Err(_) => {
            storage.link_tag(&name, &reference, &digest).await?;
        }
    }

    info!("Stored manifest: {}/{}, digest: {}", name, reference, digest);

    // Build response
    let mut response = Response::new(());
    let headers_map = response.headers_mut();

    headers_map.insert("Docker-Content-Digest", digest.to_string().parse().unwrap());
    headers_map.insert(header::LOCATION, format!("/v2/{}/manifests/{}", name, digest).parse().unwrap());

    *response.status_mut() = StatusCode::CREATED;

    Ok(empty_response_to_body(response))
}

// Get manifest
#[instrument(name = "get_manifest", skip(storage, metrics), fields(repository = %name, reference = %reference))]
async fn get_manifest(
    State((storage, metrics)): State<AppState>,
    Path((name, reference)): Path<(String, String)>,
) -> Result<Response> {
    // Increment request counter
    metrics.request_counter.add(1, &[]);

    info!("Getting manifest: {}/{}", name, reference);

    let (_, digest) = resolve_reference(&storage, &name, &reference).await?;
    let content = storage.get_manifest(&name, &digest).await?;

    let content_length = content.len();
    metrics.manifest_size_histogram.record(content_length as f64, &[]);

    // The stored bytes are canonical; the served media type comes from the
    // content itself
    let content_type = sniff_media_type(&content)
        .map(str::to_string)
        .unwrap_or_else(|_| "application/octet-stream".to_string());

    info!("Retrieved manifest: {}/{}, size: {} bytes, digest: {}",
          name, reference, content_length, digest);

    // Build response
    let mut response = Response::new(content.into());
    let headers = response.headers_mut();

    headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
    headers.insert(header::CONTENT_LENGTH, content_length.into());
    headers.insert("Docker-Content-Digest", digest.to_string().parse().unwrap());

    Ok(response)
}

// Check manifest existence
#[instrument(name = "check_manifest", skip(storage, metrics), fields(repository = %name, reference = %reference))]
async fn check_manifest(
    State((storage, metrics)): State<AppState>,
    Path((name, reference)): Path<(String, String)>,
) -> Result<StatusCode> {
    // Increment request counter
    metrics.request_counter.add(1, &[]);

    info!("Checking manifest: {}/{}", name, reference);

    let (_, digest) = resolve_reference(&storage, &name, &reference).await?;
    if storage.manifest_exists(&name, &digest).await? {
        Ok(StatusCode::OK)
    } else {
        Err(AppError::ManifestUnknown(format!("{}/{}", name, reference)))
    }
}

// List referrers of a manifest, optionally filtered by artifact type
#[instrument(name = "get_referrers", skip(storage, metrics, params), fields(repository = %name, reference = %reference))]
async fn get_referrers(
    State((storage, metrics)): State<AppState>,
    Path((name, reference)): Path<(String, String)>,
    Query(params): Query<ReferrersQuery>,
) -> Result<Json<ReferrersResponse>> {
    // Increment request counter
    metrics.request_counter.add(1, &[]);

    // This can be empty
    let artifact_type = params.artifact_type.unwrap_or_default();

    info!("Listing referrers: {}/{}, artifact-type: {:?}", name, reference, artifact_type);

    let (tag, digest) = resolve_reference(&storage, &name, &reference).await?;

    let index = ReferrerIndex::new(Arc::clone(&storage), name);
    let entries = index.referrers(&digest, &artifact_type).await?;

    let links = entries
        .into_iter()
        .map(|e| Descriptor::new(e.media_type, e.referrer, e.size))
        .collect::<Vec<_>>();

    info!("Found {} referrers", links.len());

    Ok(Json(ReferrersResponse {
        digest: tag.is_none().then_some(digest),
        tag,
        links,
        next_link: "not implemented".to_string(),
    }))
}

// List referrer metadata digests for a manifest, filtered by media type
#[instrument(name = "get_referrer_metadata", skip(storage, metrics, params), fields(repository = %name, reference = %reference))]
async fn get_referrer_metadata(
    State((storage, metrics)): State<AppState>,
    Path((name, reference)): Path<(String, String)>,
    Query(params): Query<ReferrerMetadataQuery>,
) -> Result<Json<ReferrerMetadataResponse>> {
    // Increment request counter
    metrics.request_counter.add(1, &[]);

    // The media type filter is mandatory; fail before resolving anything
    let media_type = params.media_type.unwrap_or_default();
    if media_type.is_empty() {
        return Err(AppError::MediaTypeUnspecified);
    }

    info!("Listing referrer metadata: {}/{}, media-type: {}", name, reference, media_type);

    let (tag, digest) = resolve_reference(&storage, &name, &reference).await?;

    let index = ReferrerIndex::new(Arc::clone(&storage), name);
    let referrer_metadata = index.referrer_metadata(&digest, &media_type).await?;

    info!("Found {} referrer metadata entries", referrer_metadata.len());

    Ok(Json(ReferrerMetadataResponse {
        digest: tag.is_none().then_some(digest),
        tag,
        referrer_metadata,
        next_link: "not implemented".to_string(),
    }))
}

// Helper function to convert Response<()> to Response<Body>
fn empty_response_to_body(response: Response<()>) -> Response<Body> {
    let (parts, _) = response.into_parts();
    Response::from_parts(parts, Body::empty())
}
