//! Versioned client bundle serving and the not-found redirect policy.
//!
//! Every client asset lives under `/<version>/...`. Files are looked up in
//! the on-disk approot first and in the bundle compiled into the binary
//! second. Requests for anything that does not exist are redirected rather
//! than answered with a 404, so a client holding a stale version token lands
//! on the current bundle.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderValue, Uri, header};
use axum::response::{IntoResponse, Redirect, Response};
use include_dir::{Dir, include_dir};

use crate::server::ServerContext;

static EMBEDDED_APP: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/src/server/static");

/// Placeholder in `index.html` replaced with the current version token.
const VERSION_PLACEHOLDER: &str = "__FABHOST_VERSION__";

/// Where a request for a missing resource is sent.
///
/// If the first path segment is not the current version it is replaced with
/// it; if it already is the current version the resource really does not
/// exist and the client is sent to the root.
pub fn not_found_redirect(path: &str, current_version: &str) -> String {
    let mut segments: Vec<&str> = path.split('/').collect();
    match segments.get(1) {
        Some(segment) if !segment.is_empty() && *segment != current_version => {
            segments[1] = current_version;
            segments.join("/")
        }
        _ => "/".to_string(),
    }
}

fn redirect_for(uri: &Uri, current_version: &str) -> Response {
    let mut location = not_found_redirect(uri.path(), current_version);
    if location != "/"
        && let Some(query) = uri.query()
    {
        location = format!("{location}?{query}");
    }
    tracing::debug!(path = %uri.path(), to = %location, "Redirecting missing resource");
    Redirect::to(&location).into_response()
}

pub async fn fallback_handler(State(ctx): State<Arc<ServerContext>>, uri: Uri) -> Response {
    redirect_for(&uri, &ctx.current_version())
}

/// Relative asset path with no way out of the approot.
fn safe_relative(path: &str) -> Option<PathBuf> {
    let relative = Path::new(path);
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then(|| relative.to_path_buf())
}

async fn read_asset(approot: &Path, relative: &Path) -> Option<Vec<u8>> {
    let on_disk = approot.join(relative);
    match tokio::fs::read(&on_disk).await {
        Ok(contents) => return Some(contents),
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            tracing::debug!("Cannot read {}: {}", on_disk.display(), e);
        }
        Err(_) => {}
    }
    EMBEDDED_APP
        .get_file(relative)
        .map(|file| file.contents().to_vec())
}

fn asset_response(name: &Path, contents: Vec<u8>, cache_control: &'static str) -> Response {
    let content_type = mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    let mut response = Response::new(Body::from(contents));
    let content_type_header = HeaderValue::from_str(&content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type_header);
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    response
}

async fn index_response(ctx: &ServerContext) -> Response {
    let name = Path::new("index.html");
    let Some(contents) = read_asset(&ctx.approot, name).await else {
        tracing::error!("No index.html in the approot or the embedded bundle");
        return crate::server::ApiError::unavailable("client bundle missing").into_response();
    };
    let html = String::from_utf8_lossy(&contents).replace(VERSION_PLACEHOLDER, &ctx.current_version());
    asset_response(name, html.into_bytes(), "no-store, max-age=0")
}

pub async fn root_handler(State(ctx): State<Arc<ServerContext>>) -> Response {
    index_response(&ctx).await
}

pub async fn version_root_handler(
    State(ctx): State<Arc<ServerContext>>,
    UrlPath(version): UrlPath<String>,
    uri: Uri,
) -> Response {
    let current = ctx.current_version();
    if version != current {
        return redirect_for(&uri, &current);
    }
    index_response(&ctx).await
}

pub async fn asset_handler(
    State(ctx): State<Arc<ServerContext>>,
    UrlPath((version, path)): UrlPath<(String, String)>,
    uri: Uri,
) -> Response {
    let current = ctx.current_version();
    if version != current {
        return redirect_for(&uri, &current);
    }
    let Some(relative) = safe_relative(&path) else {
        return redirect_for(&uri, &current);
    };
    if relative == Path::new("index.html") {
        return index_response(&ctx).await;
    }
    match read_asset(&ctx.approot, &relative).await {
        Some(contents) => asset_response(&relative, contents, "public, max-age=31536000, immutable"),
        None => redirect_for(&uri, &current),
    }
}
