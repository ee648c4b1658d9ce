//! Request body parsing.
//!
//! URL-encoded forms are merged into [`RequestParams`]; multipart uploads are
//! streamed to the upload directory and described by [`UploadedFiles`], and
//! deleted again unless the handler answers with [`UploadsClaimed`].
//! Other bodies (JSON) pass through untouched for the handler to read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::server::ApiError;
use crate::server::middleware::RequestParams;

/// Largest URL-encoded form accepted.
const FORM_LIMIT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub field: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadedFiles(pub Vec<UploadedFile>);

impl UploadedFiles {
    /// Delete every stored file. Missing files are ignored.
    pub async fn remove_all(&self) {
        for upload in &self.0 {
            match tokio::fs::remove_file(&upload.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %upload.path.display(),
                    "Failed to remove upload: {}",
                    e
                ),
            }
        }
    }
}

/// Response extension set by a handler that took over the request's uploads.
///
/// Uploads of any response without it are deleted once the response is built.
#[derive(Debug, Clone, Copy)]
pub struct UploadsClaimed;

#[derive(Debug, Clone)]
pub struct UploadDir(pub Arc<PathBuf>);

/// Keep only the final path component and characters safe on every filesystem.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

fn content_type(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase())
}

pub async fn parse_body(
    State(upload_dir): State<UploadDir>,
    request: Request,
    next: Next,
) -> Response {
    let result = match content_type(&request).as_deref() {
        Some(ct) if ct.starts_with("application/x-www-form-urlencoded") => {
            parse_form(request).await
        }
        Some(ct) if ct.starts_with("multipart/form-data") => {
            parse_multipart(request, &upload_dir.0).await
        }
        _ => Ok(request),
    };
    let request = match result {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };

    let uploads = request.extensions().get::<UploadedFiles>().cloned();
    let response = next.run(request).await;
    if let Some(uploads) = uploads
        && response.extensions().get::<UploadsClaimed>().is_none()
    {
        tracing::debug!(count = uploads.0.len(), "Discarding unclaimed uploads");
        uploads.remove_all().await;
    }
    response
}

async fn parse_form(request: Request) -> Result<Request, ApiError> {
    let (mut parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, FORM_LIMIT_BYTES)
        .await
        .map_err(|e| ApiError::bad_request(format!("unreadable form body: {e}")))?;

    if let Some(params) = parts.extensions.get_mut::<RequestParams>() {
        params.extend_from_urlencoded(&bytes);
    } else {
        let mut params = RequestParams::default();
        params.extend_from_urlencoded(&bytes);
        parts.extensions.insert(params);
    }
    Ok(Request::from_parts(parts, Body::from(bytes)))
}

fn malformed(detail: impl std::fmt::Display) -> ApiError {
    tracing::debug!("Rejected multipart body: {}", detail);
    ApiError::bad_request("malformed multipart body")
}

async fn parse_multipart(request: Request, dir: &Path) -> Result<Request, ApiError> {
    let (parts, body) = request.into_parts();
    let mut rebuilt = Request::from_parts(parts.clone(), Body::empty());

    let multipart = Multipart::from_request(Request::from_parts(parts, body), &())
        .await
        .map_err(|e| malformed(e.body_text()))?;

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ApiError::internal(format!("cannot create upload dir: {e}")))?;

    let mut params = rebuilt
        .extensions_mut()
        .remove::<RequestParams>()
        .unwrap_or_default();
    let mut uploads = UploadedFiles::default();

    if let Err(e) = store_fields(multipart, dir, &mut params, &mut uploads).await {
        uploads.remove_all().await;
        return Err(e);
    }

    rebuilt.extensions_mut().insert(params);
    rebuilt.extensions_mut().insert(uploads);
    Ok(rebuilt)
}

/// Stream file fields to `dir` and merge text fields into `params`.
///
/// Every file created is recorded in `uploads` before it is written, so the
/// caller can clean up after a failure.
async fn store_fields(
    mut multipart: Multipart,
    dir: &Path,
    params: &mut RequestParams,
    uploads: &mut UploadedFiles,
) -> Result<(), ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        let Some(file_name) = field.file_name().map(sanitize_file_name) else {
            let text = field.text().await.map_err(malformed)?;
            params.insert(name, text);
            continue;
        };
        let content_type = field.content_type().map(str::to_string);

        let path = dir.join(format!("{}-{}", Uuid::new_v4(), file_name));
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ApiError::internal(format!("cannot create {}: {e}", path.display())))?;
        uploads.0.push(UploadedFile {
            field: name,
            file_name,
            content_type,
            path: path.clone(),
            size: 0,
        });

        let mut size = 0u64;
        while let Some(chunk) = field.chunk().await.map_err(malformed)? {
            size += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| ApiError::internal(format!("write {}: {e}", path.display())))?;
        }
        file.flush()
            .await
            .map_err(|e| ApiError::internal(format!("flush {}: {e}", path.display())))?;

        if let Some(stored) = uploads.0.last_mut() {
            stored.size = size;
            tracing::debug!(field = %stored.field, file = %stored.file_name, size, "Stored upload");
        }
    }
    Ok(())
}
