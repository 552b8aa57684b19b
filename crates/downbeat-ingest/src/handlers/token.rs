//! `GET /token` - expose the current upstream token to the scheduler and
//! browser clients, refreshing proactively near expiry.

use crate::context::AppState;
use crate::error::HttpError;
use axum::extract::State;
use axum::Json;
use serde::Serialize;

/// Refresh when less than this many seconds remain.
const PROACTIVE_REFRESH_SECONDS: i64 = 30 * 60;

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_in: i64,
    pub expires_at: Option<String>,
    pub storefront: String,
    pub language: String,
}

/// `GET /token`
pub async fn get(State(ctx): State<AppState>) -> Result<Json<TokenResponse>, HttpError> {
    match ctx.token.remaining_seconds() {
        Some(remaining) if remaining >= PROACTIVE_REFRESH_SECONDS => {}
        Some(remaining) => {
            tracing::info!(remaining, "token under 30 minutes remaining, refreshing");
            ctx.token.refresh().await;
        }
        None => {
            tracing::info!("no token held, fetching");
            ctx.token.refresh().await;
        }
    }

    let token = ctx
        .token
        .get()
        .await
        .ok_or_else(|| HttpError::Internal("无法获取有效的 API Token".to_string()))?;
    let remaining = ctx
        .token
        .remaining_seconds()
        .filter(|secs| *secs > 0)
        .ok_or_else(|| HttpError::Internal("无法获取有效的 API Token".to_string()))?;

    let storefront = ctx.settings.upstream.default_storefront.clone();
    let language = ctx.settings.language_for(&storefront).to_string();
    Ok(Json(TokenResponse {
        token,
        expires_in: remaining,
        expires_at: ctx.token.expires_at().map(|ts| ts.to_rfc3339()),
        storefront,
        language,
    }))
}
