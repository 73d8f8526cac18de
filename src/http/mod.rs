//! HTTP transport for the pipeline.
//!
//! - `POST /{fn}`: call a function. JSON body, see [`Envelope`].
//! - `GET /`: server info.
//!
//! Single results come back as a JSON [`SignedPayload`]; sequences as a
//! `text/event-stream`, one event per chunk.
//!
//! [`Envelope`]: crate::pipeline::Envelope
//! [`SignedPayload`]: crate::identity::SignedPayload

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::pipeline::{PipelineError, PipelineResponse, RequestPipeline};
use crate::shutdown::{ShutdownCoordinator, ShutdownGuard};
use crate::security_log;
use crate::telemetry::SecurityEvent;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_body())).into_response()
    }
}

impl IntoResponse for PipelineResponse {
    fn into_response(self) -> Response {
        respond(self, None)
    }
}

/// Map a pipeline response to HTTP. A stream holds `guard` until it is
/// finished or dropped, so the call stays in flight for shutdown.
fn respond(response: PipelineResponse, guard: Option<ShutdownGuard>) -> Response {
    match response {
        PipelineResponse::Signed(payload) => (StatusCode::OK, Json(payload)).into_response(),
        PipelineResponse::Denied(decision) => {
            (StatusCode::FORBIDDEN, Json(decision)).into_response()
        }
        PipelineResponse::Rejected(error) => error.into_response(),
        PipelineResponse::Stream(chunks) => {
            let events = chunks.map(move |chunk| {
                let _in_flight = &guard;
                Ok::<_, Infallible>(Event::default().data(chunk))
            });
            Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
    }
}

/// Shared state of the router.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RequestPipeline>,
    pub shutdown: ShutdownCoordinator,
}

/// Build the router. `max_body` bounds request bodies in bytes.
pub fn router(state: AppState, max_body: usize) -> Router {
    Router::new()
        .route("/", get(info))
        .route("/:function", post(call))
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}

async fn info(State(state): State<AppState>) -> Json<Value> {
    let pipeline = &state.pipeline;
    let identity = pipeline.identity();
    Json(json!({
        "name": identity.name(),
        "address": identity.network_address(),
        "key": identity.key_address(),
        "functions": pipeline.module().functions(),
        "public": pipeline.config().public,
        "streaming": pipeline.config().streaming,
    }))
}

async fn call(
    State(state): State<AppState>,
    Path(function): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let Some(guard) = state.shutdown.track() else {
        return state
            .pipeline
            .reject(&function, PipelineError::Unavailable)
            .into_response();
    };

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            let status = rejection.status();
            if status == StatusCode::PAYLOAD_TOO_LARGE {
                security_log!(
                    SecurityEvent::OversizedPayload,
                    "Request body over limit",
                    "fn" => function.as_str()
                );
            }
            return (status, Json(json!({ "error": rejection.body_text() }))).into_response();
        }
    };

    let response = state.pipeline.handle_body(&function, &body).await;
    respond(response, Some(guard))
}

/// Serve `router` on `listener` until `shutdown` is requested.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: ShutdownCoordinator,
) -> Result<(), ServeError> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.requested().await })
    .await?;
    Ok(())
}

/// Bind a listener, mapping the error to [`ServeError::Bind`].
pub async fn bind(addr: &str) -> Result<TcpListener, ServeError> {
    TcpListener::bind(addr).await.map_err(|source| ServeError::Bind {
        addr: addr.to_string(),
        source,
    })
}
