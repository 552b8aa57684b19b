//! SSE endpoints on the scheduler.
//!
//! Per-task progress streams replay the cached snapshot, emit a
//! connection event, then deliver live frames with a heartbeat comment
//! for every idle second. The notice stream carries task-completion
//! events. Once the global connection cap is hit, new subscriptions get
//! 503 with `Retry-After`.

use crate::context::SchedulerContext;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

/// Seconds a rejected client should wait before reconnecting.
const RETRY_AFTER_SECONDS: &str = "10";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

type SchedulerState = Arc<SchedulerContext>;

/// CORS for the SSE endpoints, from the same origin allowlist as the
/// ingest API. No configured origins means same-origin only; browsers
/// on other origins cannot read the streams. `"*"` allows any origin.
fn build_cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    if origins.iter().any(|origin| origin == "*") {
        return Some(CorsLayer::new().allow_origin(Any).allow_methods(Any));
    }
    let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    Some(CorsLayer::new().allow_origin(allowed).allow_methods(Any))
}

/// Build the scheduler's HTTP router.
pub fn create_router(ctx: SchedulerState) -> Router {
    let cors = build_cors_layer(&ctx.settings.cors_allowed_origins);

    let mut router = Router::new()
        .route("/api/progress/notice", get(notice_stream))
        .route("/api/progress/:uuid", get(progress_stream))
        .route("/api/sse/status", get(sse_status))
        .with_state(ctx);
    if let Some(cors) = cors {
        router = router.layer(cors);
    }
    router
}

/// Run the SSE server until the process exits.
pub async fn serve(ctx: SchedulerState) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], ctx.settings.sse.port));
    let app = create_router(ctx);
    tracing::info!(%addr, "SSE server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn capacity_rejection() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, RETRY_AFTER_SECONDS)],
        "SSE连接数已达最大限制",
    )
        .into_response()
}

fn event_stream(
    mut subscription: crate::bus::Subscription,
    connected: serde_json::Value,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        // Cached snapshot first, then the connection marker, then live.
        for payload in std::mem::take(&mut subscription.replay) {
            yield Ok(Event::default().data(payload));
        }
        yield Ok(Event::default().data(connected.to_string()));

        loop {
            match tokio::time::timeout(HEARTBEAT_INTERVAL, subscription.rx.recv()).await {
                Ok(Some(payload)) => yield Ok(Event::default().data(payload)),
                Ok(None) => break,
                Err(_) => yield Ok(Event::default().comment("heartbeat")),
            }
        }
    }
}

/// `GET /api/progress/{uuid}` - one task's progress stream.
async fn progress_stream(
    State(ctx): State<SchedulerState>,
    Path(uuid): Path<String>,
) -> Response {
    let Some(subscription) = ctx.bus.subscribe_task(&uuid) else {
        return capacity_rejection();
    };
    let connected = json!({"event": "connected", "uuid": uuid});
    Sse::new(event_stream(subscription, connected))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

/// `GET /api/progress/notice` - task completion notices.
async fn notice_stream(State(ctx): State<SchedulerState>) -> Response {
    let Some(subscription) = ctx.bus.subscribe_notice() else {
        return capacity_rejection();
    };
    let connected = json!({"event": "connected", "type": "notice"});
    Sse::new(event_stream(subscription, connected))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

/// `GET /api/sse/status` - connection counts.
async fn sse_status(State(ctx): State<SchedulerState>) -> Json<crate::bus::BusStatus> {
    Json(ctx.bus.status())
}
