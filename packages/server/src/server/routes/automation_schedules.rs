use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};

use super::{parse_id, ApiJson, ApiResult};
use crate::common::AutomationScheduleId;
use crate::domains::automation::{
    AutomationExecution, AutomationSchedule, CreateScheduleInput, UpdateScheduleInput,
};
use crate::server::app::AppState;
use crate::server::middleware::AuthUser;

fn schedule_id(raw: &str) -> ApiResult<AutomationScheduleId> {
    parse_id(raw, "automation schedule")
}

pub async fn create_schedule(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    ApiJson(input): ApiJson<CreateScheduleInput>,
) -> ApiResult<(StatusCode, Json<AutomationSchedule>)> {
    let schedule = state.kernel.automation.create(user.member_id, input).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn list_schedules(
    Extension(state): Extension<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Vec<AutomationSchedule>>> {
    Ok(Json(state.kernel.automation.list(user.member_id).await?))
}

pub async fn get_schedule(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<AutomationSchedule>> {
    let id = schedule_id(&id)?;
    Ok(Json(state.kernel.automation.get(user.member_id, id).await?))
}

pub async fn update_schedule(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(input): ApiJson<UpdateScheduleInput>,
) -> ApiResult<Json<AutomationSchedule>> {
    let id = schedule_id(&id)?;
    Ok(Json(
        state.kernel.automation.update(user.member_id, id, input).await?,
    ))
}

pub async fn delete_schedule(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = schedule_id(&id)?;
    state.kernel.automation.delete(user.member_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pause_schedule(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<AutomationSchedule>> {
    let id = schedule_id(&id)?;
    Ok(Json(state.kernel.automation.pause(user.member_id, id).await?))
}

pub async fn resume_schedule(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<AutomationSchedule>> {
    let id = schedule_id(&id)?;
    Ok(Json(state.kernel.automation.resume(user.member_id, id).await?))
}

/// Returns 202 with the RUNNING execution; it finishes in the background.
pub async fn run_schedule_now(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<AutomationExecution>)> {
    let id = schedule_id(&id)?;
    let execution = state.kernel.automation.run_now(user.member_id, id).await?;
    Ok((StatusCode::ACCEPTED, Json(execution)))
}

pub async fn list_schedule_executions(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<AutomationExecution>>> {
    let id = schedule_id(&id)?;
    Ok(Json(
        state
            .kernel
            .automation
            .list_executions(user.member_id, id)
            .await?,
    ))
}
