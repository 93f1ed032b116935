//! Ingress: upload → validation → optimizer → object store → virtual path.

use crate::{
    errors::AppError,
    handlers::gateway_handlers::is_same_origin,
    models::{media_type::MediaType, stored_object::VirtualPath},
    services::{optimizer::ResizeMode, optimizer_client::OptimizeJob},
    state::AppState,
    validation::{IncomingFile, Policy},
};
use axum::{
    Json,
    extract::{
        Multipart, State,
        multipart::{Field, MultipartError},
    },
    http::{HeaderMap, StatusCode},
};
use bytes::Bytes;
use serde::Serialize;
use std::str::FromStr;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct ConvertResponse {
    pub filename: String,
    pub virtual_path: String,
    pub size: usize,
    pub media_type: MediaType,
    pub quality: f32,
}

struct Upload {
    file_name: String,
    declared_type: String,
    bytes: Bytes,
}

/// `POST /api/images` - multipart with `file` plus optional `mode`, `size`,
/// `min_bytes`, `max_bytes` and `name`.
pub async fn convert_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ConvertResponse>), AppError> {
    if !is_same_origin(&headers, &state.config.origin) {
        return Err(AppError::bad_request("cross-origin request"));
    }

    let mut upload = None;
    let mut mode = ResizeMode::default();
    let mut target = state.config.default_target();
    let mut requested_name = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let declared_type = field.content_type().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                upload = Some(Upload {
                    file_name,
                    declared_type,
                    bytes,
                });
            }
            "mode" => {
                mode = text(field)
                    .await?
                    .parse()
                    .map_err(AppError::bad_request)?;
            }
            "size" => {
                let edge = parse_field(field).await?;
                target.output_width = edge;
                target.output_height = edge;
            }
            "min_bytes" => target.min_bytes = parse_field(field).await?,
            "max_bytes" => target.max_bytes = parse_field(field).await?,
            "name" => requested_name = Some(text(field).await?),
            other => debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    let upload = upload.ok_or_else(|| AppError::bad_request("missing `file` field"))?;
    Policy::with_max_blob_size(state.config.max_blob_size).validate(&IncomingFile {
        name: &upload.file_name,
        declared_type: &upload.declared_type,
        bytes: &upload.bytes,
    })?;

    let raw = upload.bytes.clone();
    let image = tokio::task::spawn_blocking(move || image::load_from_memory(&raw))
        .await
        .map_err(AppError::internal)?
        .map_err(|e| {
            debug!(error = %e, "upload failed to decode");
            AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "could not decode image")
        })?;

    let compressed = state
        .optimizer
        .submit(OptimizeJob {
            image,
            mode,
            target,
        })
        .await?;

    let output_name = requested_name
        .filter(|n| !n.trim().is_empty())
        .map(|n| with_extension(&n, compressed.media_type));
    let size = compressed.size();
    let quality = compressed.quality;
    let media_type = compressed.media_type;

    let filename = state
        .store
        .put(
            Bytes::from(compressed.bytes),
            media_type.as_mime(),
            output_name.as_deref(),
            Some(&upload.file_name),
        )
        .await?;

    let virtual_path = VirtualPath::new(state.config.namespace.as_str(), filename.as_str());
    info!(%virtual_path, size, quality, "converted upload");

    Ok((
        StatusCode::CREATED,
        Json(ConvertResponse {
            filename,
            virtual_path: virtual_path.to_string(),
            size,
            media_type,
            quality,
        }),
    ))
}

/// Keeps the transport's status, so an oversized body answers 413.
fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

async fn text(field: Field<'_>) -> Result<String, AppError> {
    field.text().await.map_err(multipart_error)
}

async fn parse_field<T: FromStr>(field: Field<'_>) -> Result<T, AppError> {
    let name = field.name().unwrap_or_default().to_string();
    let value = text(field).await?;
    value
        .trim()
        .parse()
        .map_err(|_| AppError::bad_request(format!("field `{}` is not a number", name)))
}

/// Replace a known image extension (or append one) so the stored name
/// matches what the optimizer produced.
fn with_extension(name: &str, media: MediaType) -> String {
    let stem = match name.rsplit_once('.') {
        Some((stem, ext))
            if MediaType::ALL
                .iter()
                .any(|m| m.extensions().contains(&ext.to_ascii_lowercase().as_str())) =>
        {
            stem
        }
        _ => name,
    };
    format!("{}.{}", stem, media.preferred_extension())
}
