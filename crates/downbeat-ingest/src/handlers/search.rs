//! `GET /search` - caching proxy for the upstream search endpoint.
//!
//! Query parameters pass through untouched. `X-Storefront` picks the
//! region (falling back to the configured default) and `X-Use-Cache`
//! lets clients bypass cache reads; successful responses are always
//! written to the cache.

use crate::context::AppState;
use crate::error::HttpError;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// `GET /search`
pub async fn proxy(
    State(ctx): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<Value>, HttpError> {
    let default_storefront = ctx.settings.upstream.default_storefront.clone();
    let storefront = headers
        .get("X-Storefront")
        .and_then(|v| v.to_str().ok())
        .map(str::to_lowercase)
        .filter(|sf| {
            let known = ctx.settings.upstream.storefront_language_map.contains_key(sf);
            if !known {
                tracing::warn!(storefront = sf, "unknown search storefront, using default");
            }
            known
        })
        .unwrap_or(default_storefront);

    let use_cache = headers
        .get("X-Use-Cache")
        .and_then(|v| v.to_str().ok())
        .map_or(true, |v| {
            matches!(v.to_lowercase().as_str(), "true" | "1" | "yes")
        });

    if use_cache {
        if let Some(cache) = &ctx.search_cache {
            if let Some(cached) = cache.lookup(&storefront, &params) {
                return Ok(Json(cached));
            }
        }
    } else {
        tracing::info!("cache read bypassed by X-Use-Cache header");
    }

    let token = ctx
        .token
        .get()
        .await
        .ok_or_else(|| HttpError::Internal("无法获取有效的API Token".to_string()))?;

    let base = ctx.settings.upstream.api_base_url.trim_end_matches('/');
    let url = format!("{base}/{storefront}/search");
    let response = ctx
        .client
        .get(&url)
        .query(&params)
        .header(reqwest::header::USER_AGENT, &ctx.settings.upstream.user_agent)
        .header(reqwest::header::ORIGIN, &ctx.settings.upstream.token_fetch_url)
        .bearer_auth(&token)
        .timeout(Duration::from_secs(20))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                HttpError::UpstreamTimeout("搜索请求超时".to_string())
            } else {
                HttpError::Internal(format!("搜索请求时发生网络错误: {e}"))
            }
        })?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        tracing::warn!(status = %status, "search token rejected, invalidating");
        ctx.token.invalidate();
        return Err(HttpError::Unauthorized("API Token已失效，请重试".to_string()));
    }
    if !status.is_success() {
        // Upstream errors pass through with their original status; the
        // cache is an accelerator, never a mask.
        tracing::error!(status = %status, "upstream search failed");
        let status = axum::http::StatusCode::from_u16(status.as_u16())
            .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
        return Err(HttpError::Upstream {
            status,
            message: format!("搜索请求失败: HTTP {status}"),
        });
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| HttpError::Internal(format!("搜索响应解析失败: {e}")))?;

    // Written even on cache-bypassed reads so later requests benefit.
    if let Some(cache) = &ctx.search_cache {
        cache.store(&storefront, &params, &body);
    }
    tracing::info!(storefront, "search proxied");
    Ok(Json(body))
}
