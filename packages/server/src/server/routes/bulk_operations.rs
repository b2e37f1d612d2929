use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};

use serde::Serialize;

use super::{parse_id, ApiError, ApiJson, ApiResult};
use crate::common::{BulkOperationId, Page, PageArgs};
use crate::domains::bulk_operations::{BulkAction, BulkOperation, SubmitBulkOperation};
use crate::server::app::AppState;
use crate::server::middleware::AuthUser;

#[derive(Serialize)]
pub struct BulkOperationAccepted {
    pub operation_id: BulkOperationId,
    #[serde(flatten)]
    pub operation: BulkOperation,
}

/// `POST /bulk-operations/:action`. Returns 202 with the QUEUED record;
/// poll `GET /bulk-operations/:id` for progress.
pub async fn submit_bulk_operation(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(action): Path<String>,
    ApiJson(mut request): ApiJson<SubmitBulkOperation>,
) -> ApiResult<(StatusCode, Json<BulkOperationAccepted>)> {
    let action: BulkAction = action.parse().map_err(ApiError::BadRequest)?;
    request.action = Some(action);
    let op = state.kernel.bulk_runner.submit(user.member_id, request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(BulkOperationAccepted {
            operation_id: op.id,
            operation: op,
        }),
    ))
}

pub async fn get_bulk_operation(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<BulkOperation>> {
    let id = parse_id(&id, "bulk operation")?;
    Ok(Json(
        state.kernel.bulk_runner.get_status(user.member_id, id).await?,
    ))
}

pub async fn list_bulk_operations(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Query(args): Query<PageArgs>,
) -> ApiResult<Json<Page<BulkOperation>>> {
    Ok(Json(
        state.kernel.bulk_runner.list(user.member_id, &args).await?,
    ))
}
