//! Engine API handlers.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::machine::{JobPayload, MachineState};
use crate::server::middleware::RequestParams;
use crate::server::upload::{UploadedFiles, UploadsClaimed};
use crate::server::{ApiError, JsonBody, ServerContext, success};

/// Largest JSON job body accepted; programs normally arrive as uploads.
const JOB_BODY_LIMIT_BYTES: usize = 4 * 1024 * 1024;

pub async fn status_handler(State(ctx): State<Arc<ServerContext>>) -> Json<Value> {
    let (state, connected, port) = match &ctx.machine {
        Some(machine) => (
            machine.state(),
            machine.is_connected(),
            machine.port().map(str::to_string),
        ),
        None => (MachineState::NotReady, false, None),
    };
    success(json!({
        "state": state,
        "connected": connected,
        "port": port,
        "firmware": ctx.firmware,
        "clock_synced": ctx.clock.is_synced(),
        "time": ctx.clock.now(),
    }))
}

pub async fn version_handler(State(ctx): State<Arc<ServerContext>>) -> Json<Value> {
    success(json!({
        "token": ctx.current_version(),
        "hash": ctx.build.hash,
        "number": ctx.build.number,
        "type": ctx.build.kind.as_str(),
        "debug": ctx.build.debug,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TimeRequest {
    pub utc: DateTime<Utc>,
}

/// Adopt the client's clock if the host has not been synchronized yet.
pub async fn time_handler(
    State(ctx): State<Arc<ServerContext>>,
    JsonBody(request): JsonBody<TimeRequest>,
) -> Json<Value> {
    let applied = ctx.clock.sync(request.utc);
    success(json!({ "applied": applied, "time": ctx.clock.now() }))
}

fn job_from_upload(uploads: &UploadedFiles, params: Option<&RequestParams>) -> Option<JobPayload> {
    let upload = uploads.0.first()?;
    let param = |key: &str| params.and_then(|p| p.get(key)).map(str::to_string);
    Some(JobPayload {
        name: param("name").unwrap_or_else(|| upload.file_name.clone()),
        description: param("description"),
        file: Some(upload.path.to_string_lossy().into_owned()),
        program: None,
    })
}

/// Queue a job from a multipart upload or a JSON body.
///
/// A queued upload stays on disk for the machine to read.
pub async fn job_handler(
    State(ctx): State<Arc<ServerContext>>,
    request: Request,
) -> Result<Response, ApiError> {
    let machine = ctx
        .machine
        .clone()
        .ok_or_else(|| ApiError::unavailable("no machine attached"))?;

    let (parts, body) = request.into_parts();
    let from_upload = parts
        .extensions
        .get::<UploadedFiles>()
        .and_then(|uploads| job_from_upload(uploads, parts.extensions.get::<RequestParams>()));

    let uploaded = from_upload.is_some();
    let job = match from_upload {
        Some(job) => job,
        None => {
            let bytes = axum::body::to_bytes(body, JOB_BODY_LIMIT_BYTES)
                .await
                .map_err(|_| ApiError::bad_request("job body unreadable or too large"))?;
            serde_json::from_slice::<JobPayload>(&bytes).map_err(|e| {
                tracing::debug!("Rejected job body: {}", e);
                ApiError::bad_request("invalid job payload")
            })?
        }
    };

    let receipt = machine.add_job(job).await.map_err(ApiError::from)?;
    tracing::info!(job = %receipt.id, name = %receipt.name, "Job queued");
    let body = success(json!(receipt));
    if uploaded {
        Ok((Extension(UploadsClaimed), body).into_response())
    } else {
        Ok(body.into_response())
    }
}
