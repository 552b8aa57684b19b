//! `GET /user/avatar` - resolve a submitted name to the canonical user
//! and their configured avatar URL.

use crate::context::AppState;
use crate::error::HttpError;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct AvatarQuery {
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AvatarResponse {
    pub status: &'static str,
    pub standard_username: String,
    pub avatar_url: String,
}

/// `GET /user/avatar?username=…`
pub async fn get(
    State(ctx): State<AppState>,
    Query(query): Query<AvatarQuery>,
) -> Result<Json<AvatarResponse>, HttpError> {
    let submitted = query
        .username
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            HttpError::BadRequest("缺少必需的查询参数 'username'。".to_string())
        })?;

    let canonical = ctx
        .users
        .normalize(submitted)
        .ok_or_else(|| HttpError::NotFound(format!("未找到用户: {submitted}")))?;

    let avatar_url = ctx
        .users
        .profile(canonical)
        .and_then(|profile| profile.avatar.clone())
        .ok_or_else(|| HttpError::NotFound(format!("用户 {canonical} 未配置头像链接")))?;

    tracing::info!(submitted, canonical, "avatar lookup");
    Ok(Json(AvatarResponse {
        status: "success",
        standard_username: canonical.to_string(),
        avatar_url,
    }))
}
