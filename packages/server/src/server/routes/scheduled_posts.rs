use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{parse_id, ApiError, ApiJson, ApiResult};
use crate::common::ScheduledPostId;
use crate::domains::scheduled_posts::{
    CreateScheduledPostInput, ScheduledPost, ScheduledPostStatus, UpdateScheduledPostInput,
};
use crate::server::app::AppState;
use crate::server::middleware::AuthUser;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleBody {
    pub scheduled_for: DateTime<Utc>,
}

fn post_id(raw: &str) -> ApiResult<ScheduledPostId> {
    parse_id(raw, "scheduled post")
}

pub async fn create_scheduled_post(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    ApiJson(input): ApiJson<CreateScheduledPostInput>,
) -> ApiResult<(StatusCode, Json<ScheduledPost>)> {
    let post = state.kernel.dispatcher.create(user.member_id, input).await?;
    Ok((StatusCode::CREATED, Json(post)))
}

pub async fn list_scheduled_posts(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ScheduledPost>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ScheduledPostStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    Ok(Json(
        state.kernel.dispatcher.list(user.member_id, status).await?,
    ))
}

pub async fn get_scheduled_post(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<ScheduledPost>> {
    let id = post_id(&id)?;
    Ok(Json(state.kernel.dispatcher.get(user.member_id, id).await?))
}

pub async fn update_scheduled_post(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(input): ApiJson<UpdateScheduledPostInput>,
) -> ApiResult<Json<ScheduledPost>> {
    let id = post_id(&id)?;
    Ok(Json(
        state.kernel.dispatcher.update(user.member_id, id, input).await?,
    ))
}

pub async fn delete_scheduled_post(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = post_id(&id)?;
    state.kernel.dispatcher.delete(user.member_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reschedule_scheduled_post(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<RescheduleBody>,
) -> ApiResult<Json<ScheduledPost>> {
    let id = post_id(&id)?;
    Ok(Json(
        state
            .kernel
            .dispatcher
            .reschedule(user.member_id, id, body.scheduled_for)
            .await?,
    ))
}

pub async fn publish_scheduled_post_now(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<ScheduledPost>> {
    let id = post_id(&id)?;
    Ok(Json(
        state.kernel.dispatcher.publish_now(user.member_id, id).await?,
    ))
}

pub async fn cancel_scheduled_post(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<ScheduledPost>> {
    let id = post_id(&id)?;
    Ok(Json(
        state.kernel.dispatcher.cancel(user.member_id, id).await?,
    ))
}
