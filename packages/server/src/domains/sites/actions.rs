//! Site registry operations.

use serde::Deserialize;
use tracing::info;
use url::Url;

use super::models::{CreateSite, Site};
use crate::common::{EngineError, EngineResult, MemberId, SiteId};
use crate::kernel::ExecutionStore;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterSiteInput {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub application_password: Option<String>,
}

pub async fn register_site(
    owner_id: MemberId,
    input: RegisterSiteInput,
    store: &dyn ExecutionStore,
) -> EngineResult<Site> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(EngineError::validation("site name must not be empty"));
    }
    let url = Url::parse(input.base_url.trim())
        .map_err(|e| EngineError::validation(format!("invalid base_url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(EngineError::validation("base_url must be http or https"));
    }

    let site = Site::new(
        CreateSite::builder()
            .owner_id(owner_id)
            .name(name)
            .base_url(url.as_str().trim_end_matches('/'))
            .username(input.username.filter(|u| !u.trim().is_empty()))
            .application_password(input.application_password.filter(|p| !p.trim().is_empty()))
            .build(),
    );
    let site = store.insert_site(&site).await?;

    info!(site_id = %site.id, owner_id = %owner_id, has_credentials = site.has_credentials(), "site registered");
    Ok(site)
}

/// Load a site, treating another owner's site as missing.
pub async fn find_owned_site(
    owner_id: MemberId,
    id: SiteId,
    store: &dyn ExecutionStore,
) -> EngineResult<Site> {
    store
        .find_site(id)
        .await?
        .filter(|s| s.owner_id == owner_id)
        .ok_or_else(|| EngineError::not_found("site", id))
}

pub async fn list_sites(owner_id: MemberId, store: &dyn ExecutionStore) -> EngineResult<Vec<Site>> {
    Ok(store.list_sites(owner_id).await?)
}
