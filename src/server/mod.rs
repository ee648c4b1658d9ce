//! The engine's HTTP server.
//!
//! Request pipeline, outermost first:
//!
//! 1. CORS (any origin, `X-Requested-With` allowed)
//! 2. artificial latency (slow debug mode only)
//! 3. request tracing (debug mode only)
//! 4. query string parsing
//! 5. body parsing (forms and multipart uploads)
//! 6. path canonicalization
//! 7. signed cookie session
//! 8. session user restoration
//! 9. response compression
//!
//! followed by the routes. Anything that does not match a route, including a
//! known path requested with the wrong method, goes through the not-found
//! redirect policy in [`approot`].

pub mod approot;
pub mod auth;
pub mod handlers;
pub mod middleware;
pub mod session;
pub mod upload;

use std::any::Any;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, FromRequest};
use axum::http::{HeaderName, HeaderValue, Response as HttpResponse, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, middleware as axum_middleware};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{self, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::boot::{AuthSecret, BuildInfo, TimeSync};
use crate::config::ServerConfig;
use crate::error::{CollaboratorError, ServerError};
use crate::machine::{FirmwareInfo, Machine};
use crate::server::auth::Authenticator;
use crate::server::session::SessionKey;
use crate::server::upload::UploadDir;
use crate::settings::{ConfigStore, VERSION_KEY};

/// Largest request body accepted, uploads included.
pub const UPLOAD_LIMIT_BYTES: usize = 256 * 1024 * 1024;

/// What the handlers can see of the engine.
pub struct ServerContext {
    pub config: Arc<dyn ConfigStore>,
    pub machine: Option<Arc<dyn Machine>>,
    pub build: BuildInfo,
    pub firmware: FirmwareInfo,
    pub clock: TimeSync,
    pub approot: PathBuf,
    pub authenticator: Arc<dyn Authenticator>,
}

impl ServerContext {
    /// The version token clients must use as the first path segment.
    pub fn current_version(&self) -> String {
        match self.config.get(VERSION_KEY) {
            Some(Value::String(token)) if !token.trim().is_empty() => token.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => self.build.identity().unwrap_or_default(),
        }
    }
}

/// Error body sent for every failed request: `{"status":"error","message":...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    /// Logs the detail and answers with a generic message.
    pub fn internal(detail: impl Into<String>) -> Self {
        tracing::error!("Request failed: {}", detail.into());
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<CollaboratorError> for ApiError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Rejected { .. } => Self::bad_request(err.to_string()),
            CollaboratorError::CallFailed { .. } => Self::internal(err.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::debug!("Rejected JSON body: {}", rejection.body_text());
        let status = rejection.status();
        let message = match rejection {
            JsonRejection::MissingJsonContentType(_) => "expected an application/json body",
            _ => "invalid JSON body",
        };
        Self::new(status, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "status": "error", "message": self.message })),
        )
            .into_response()
    }
}

/// [`axum::Json`] whose rejections are answered with the error envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(request: axum::extract::Request, state: &S) -> Result<Self, ApiError> {
        let Json(value) = Json::<T>::from_request(request, state).await?;
        Ok(Self(value))
    }
}

/// Success envelope: `{"status":"success","data":...}`.
pub fn success(data: Value) -> Json<Value> {
    Json(json!({ "status": "success", "data": data }))
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> HttpResponse<Body> {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!("Request handler panicked: {}", detail);

    let body = json!({ "status": "error", "message": "internal server error" }).to_string();
    let mut response = HttpResponse::new(Body::from(body));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn routes(context: Arc<ServerContext>) -> Router {
    let protected = Router::new()
        .route("/job", post(handlers::job_handler))
        .route("/authentication/user", get(auth::current_user_handler))
        .route_layer(axum_middleware::from_fn(auth::require_user));

    Router::new()
        .route("/", get(approot::root_handler))
        .route("/status", get(handlers::status_handler))
        .route("/version", get(handlers::version_handler))
        .route("/time", post(handlers::time_handler))
        .route("/authentication/login", post(auth::login_handler))
        .route("/authentication/logout", post(auth::logout_handler))
        .merge(protected)
        .route("/{version}", get(approot::version_root_handler))
        .route("/{version}/{*path}", get(approot::asset_handler))
        .method_not_allowed_fallback(approot::fallback_handler)
        .fallback(approot::fallback_handler)
        .with_state(context)
}

/// The assembled, not yet listening, HTTP server.
pub struct EngineServer {
    router: Router,
    config: ServerConfig,
}

impl EngineServer {
    pub fn assemble(context: ServerContext, secret: &AuthSecret, config: ServerConfig) -> Self {
        let authenticator = Arc::clone(&context.authenticator);
        let upload_dir = UploadDir(Arc::new(config.upload_dir.clone()));

        // Router::layer wraps outside-in: the last layer added runs first.
        let mut router = routes(Arc::new(context))
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(CompressionLayer::new())
            .layer(axum_middleware::from_fn_with_state(
                authenticator,
                auth::restore_user,
            ))
            .layer(axum_middleware::from_fn_with_state(
                SessionKey::new(secret),
                session::session_middleware,
            ))
            .layer(axum_middleware::from_fn(middleware::sanitize_path))
            .layer(axum_middleware::from_fn_with_state(
                upload_dir,
                upload::parse_body,
            ))
            .layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES))
            .layer(axum_middleware::from_fn(middleware::parse_query));

        if config.debug.enabled {
            router = router.layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_response(DefaultOnResponse::new().level(Level::INFO)),
            );
        }
        if config.debug.slow {
            router = router.layer(axum_middleware::from_fn(middleware::inject_latency));
        }

        let cors = CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods(cors::Any)
            .allow_headers([
                HeaderName::from_static("x-requested-with"),
                header::CONTENT_TYPE,
            ]);
        router = router.layer(cors);

        tracing::info!(
            host = %config.host,
            port = config.port,
            debug = config.debug.enabled,
            slow = config.debug.slow,
            "HTTP server assembled"
        );
        Self { router, config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Bind the configured address and serve in a background task.
    pub async fn listen(&self) -> Result<RunningServer, ServerError> {
        let addr = self.config.bind_addr().map_err(|e| ServerError::Bind {
            addr: format!("{}:{}", self.config.host, self.config.port),
            reason: e.to_string(),
        })?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let bound_addr = listener.local_addr().map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            reason: format!("failed to get local addr: {e}"),
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = self.router.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("HTTP server shutting down");
                })
                .await
            {
                tracing::error!("HTTP server error: {}", e);
            }
        });

        tracing::info!(addr = %bound_addr, "Listening for HTTP requests");
        Ok(RunningServer {
            addr: bound_addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }
}

/// Handle to a serving [`EngineServer`].
pub struct RunningServer {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RunningServer {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            tracing::warn!("HTTP server task ended abnormally: {}", e);
        }
    }
}
