//! Route definitions and server entry for the ingest API.

use crate::context::{AppState, IngestContext};
use crate::handlers;
use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the CORS layer from the configured origin allowlist.
///
/// `None` (no origins configured) means same-origin only - the
/// submission API identifies callers by the `X-User` header, and that
/// custom header forces a preflight which fails without CORS approval,
/// so third-party pages cannot reach the API from a browser. A literal
/// `"*"` entry opts into allowing any origin.
pub(crate) fn build_cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    if origins.iter().any(|origin| origin == "*") {
        return Some(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    Some(
        CorsLayer::new()
            .allow_origin(allowed)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// Build the ingest router over a shared context.
pub fn create_router(ctx: Arc<IngestContext>) -> Router {
    let cors = build_cors_layer(&ctx.settings.cors_allowed_origins);

    let mut router = Router::new()
        .route(
            "/task",
            get(handlers::tasks::list).post(handlers::tasks::submit),
        )
        .route("/token", get(handlers::token::get))
        .route("/user/avatar", get(handlers::avatar::get))
        .route("/search", get(handlers::search::proxy))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx);
    if let Some(cors) = cors {
        router = router.layer(cors);
    }
    router
}

async fn health_check() -> &'static str {
    "OK"
}

/// Run the ingest HTTP server until the process exits. Also starts the
/// token background refresher.
pub async fn serve(ctx: AppState) -> anyhow::Result<()> {
    ctx.token.spawn_background_refresh();

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], ctx.settings.ingest_port));
    let app = create_router(ctx);
    tracing::info!(%addr, "ingest API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_configured_origins_means_no_cors_layer() {
        assert!(build_cors_layer(&[]).is_none());
    }

    #[test]
    fn configured_origins_produce_a_layer() {
        let origins = vec!["https://ui.example.com".to_string()];
        assert!(build_cors_layer(&origins).is_some());
    }

    #[test]
    fn wildcard_opts_into_allow_all() {
        let origins = vec!["*".to_string()];
        assert!(build_cors_layer(&origins).is_some());
    }
}
