use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};

use super::{parse_id, ApiJson, ApiResult};
use crate::domains::sites::{find_owned_site, list_sites, register_site, RegisterSiteInput, Site};
use crate::server::app::AppState;
use crate::server::middleware::AuthUser;

pub async fn create_site(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    ApiJson(input): ApiJson<RegisterSiteInput>,
) -> ApiResult<(StatusCode, Json<Site>)> {
    let site = register_site(user.member_id, input, state.kernel.deps.store.as_ref()).await?;
    Ok((StatusCode::CREATED, Json(site)))
}

pub async fn list_sites_handler(
    Extension(state): Extension<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Vec<Site>>> {
    Ok(Json(
        list_sites(user.member_id, state.kernel.deps.store.as_ref()).await?,
    ))
}

pub async fn get_site(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Site>> {
    let id = parse_id(&id, "site")?;
    Ok(Json(
        find_owned_site(user.member_id, id, state.kernel.deps.store.as_ref()).await?,
    ))
}
