//! Access gateway: answers reads against virtual paths.
//!
//! `GET /{namespace}/{filename}` is revalidated here and served straight
//! from the object store. Every request gets exactly one answer:
//! 400 for foreign origins or unsafe names (the store is never consulted),
//! 404 for anything the store will not hand out, 500 with a generic body
//! for everything else.

use crate::{
    errors::AppError,
    models::stored_object::StoredObject,
    services::storage_service::StorageError,
    state::AppState,
    validation,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::Response,
};
use chrono::DateTime;
use std::fmt::Write as _;
use tracing::{debug, warn};

const CACHE_CONTROL_LONG_LIVED: &str = "public, max-age=31536000";
const SEC_FETCH_SITE: HeaderName = HeaderName::from_static("sec-fetch-site");

/// `GET /{namespace}/{filename}` (HEAD is answered by the same handler).
pub async fn serve_virtual_path(
    State(state): State<AppState>,
    Path((namespace, filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if !is_same_origin(&headers, &state.config.origin) {
        warn!(%filename, "rejecting cross-origin virtual path request");
        return Err(AppError::bad_request("cross-origin request"));
    }
    if let Err(err) = validation::check_name(&filename) {
        debug!(%filename, error = %err, "rejecting malformed virtual path");
        return Err(AppError::bad_request("invalid filename"));
    }
    if namespace != state.config.namespace {
        return Err(AppError::not_found());
    }

    let record = match state.store.get(&filename).await {
        Ok(record) => record,
        Err(StorageError::NotFound(_)) => return Err(AppError::not_found()),
        Err(err) => return Err(AppError::internal(err)),
    };

    let fallback = state.optimizer.media_type().as_mime();
    let mut response = Response::new(Body::from(record.bytes()));
    set_object_headers(response.headers_mut(), &record, fallback);
    Ok(response)
}

/// A request is foreign when its `Origin` differs from ours, or when the
/// browser marks it `Sec-Fetch-Site: cross-site`. Neither header present
/// means a direct navigation or fetch from our own page.
pub(crate) fn is_same_origin(headers: &HeaderMap, origin: &str) -> bool {
    if let Some(value) = headers.get(header::ORIGIN) {
        return value
            .to_str()
            .map(|v| v.trim_end_matches('/') == origin)
            .unwrap_or(false);
    }
    !matches!(
        headers.get(SEC_FETCH_SITE).and_then(|v| v.to_str().ok()),
        Some("cross-site")
    )
}

fn set_object_headers(headers: &mut HeaderMap, record: &StoredObject, fallback_type: &'static str) {
    let content_type = record.media().map(|m| m.as_mime()).unwrap_or(fallback_type);
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(record.payload.len()));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CACHE_CONTROL_LONG_LIVED),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));

    if let Ok(value) = HeaderValue::from_str(&content_disposition(&record.filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    if let Some(checksum) = record.checksum.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", checksum)) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Some(created) = DateTime::from_timestamp_millis(record.created_at) {
        let http_date = created.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&http_date) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
}

/// `inline` disposition carrying the stored filename, so drag and download
/// keep the real name. Non-ASCII names go in the RFC 5987 form.
fn content_disposition(filename: &str) -> String {
    if filename.is_ascii() {
        return format!("inline; filename=\"{}\"", filename);
    }
    let fallback: String = filename
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    let mut encoded = String::with_capacity(filename.len() * 3);
    for byte in filename.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "%{:02X}", byte);
        }
    }
    format!(
        "inline; filename=\"{}\"; filename*=UTF-8''{}",
        fallback, encoded
    )
}
