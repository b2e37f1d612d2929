//! Bulk operation runner.
//!
//! `submit` validates and persists a QUEUED record, then hands the actual work
//! to a spawned task and returns. The task moves the record to RUNNING,
//! checks preconditions, and pushes every target through a fixed-size pool of
//! remote calls. Counters are bumped in the store after each item, so a
//! client polling `get_status` sees progress move forward one item at a time.
//!
//! ```text
//! submit ─► validate ─► insert QUEUED ─► spawn run
//!                                          │
//!                                          ├─► start (QUEUED → RUNNING)
//!                                          ├─► site credentials? ── no ─► FAILED
//!                                          ├─► for_each_concurrent(pool) ─► record item
//!                                          └─► COMPLETED | COMPLETED_WITH_ERRORS
//! ```

use anyhow::{Context, Result};
use futures::stream::{self, TryStreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::models::{
    BulkAction, BulkOperation, BulkOperationStatus, CreateBulkOperation, ItemError, ItemOutcome,
};
use crate::common::{
    BulkOperationId, EngineError, EngineResult, MemberId, Page, PageArgs, SiteId,
};
use crate::config::EngineConfig;
use crate::domains::sites::{find_owned_site, Site};
use crate::kernel::ServerDeps;

pub const MAX_TARGETS: usize = 1000;

/// Message stored on operations a previous process never finished.
pub const ABANDONED_MESSAGE: &str = "interrupted by restart";

/// A bulk request as accepted from the API.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitBulkOperation {
    #[serde(skip)]
    pub action: Option<BulkAction>,
    pub site_id: SiteId,
    #[serde(default = "default_target_type")]
    pub target_type: String,
    pub target_ids: Vec<i64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn default_target_type() -> String {
    "post".to_string()
}

impl SubmitBulkOperation {
    pub fn new(action: BulkAction, site_id: SiteId, target_ids: Vec<i64>) -> Self {
        Self {
            action: Some(action),
            site_id,
            target_type: default_target_type(),
            target_ids,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Validate a request. Returns the action and the de-duplicated target ids
/// in their original order.
pub fn validate_request(request: &SubmitBulkOperation) -> EngineResult<(BulkAction, Vec<i64>)> {
    let action = request
        .action
        .ok_or_else(|| EngineError::validation("bulk action is required"))?;

    if request.target_type.trim().is_empty() {
        return Err(EngineError::validation("target_type must not be empty"));
    }

    let mut seen = HashSet::with_capacity(request.target_ids.len());
    let targets: Vec<i64> = request
        .target_ids
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect();

    if targets.is_empty() {
        return Err(EngineError::validation("target_ids must not be empty"));
    }
    if targets.len() > MAX_TARGETS {
        return Err(EngineError::validation(format!(
            "at most {MAX_TARGETS} target ids per operation, got {}",
            targets.len()
        )));
    }

    if action == BulkAction::UpdateMetadata {
        match &request.metadata {
            Some(serde_json::Value::Object(fields)) if !fields.is_empty() => {}
            _ => {
                return Err(EngineError::validation(
                    "update_metadata requires a non-empty metadata object",
                ))
            }
        }
    }

    Ok((action, targets))
}

pub struct BulkOperationRunner {
    deps: ServerDeps,
    concurrency: usize,
}

impl BulkOperationRunner {
    pub fn new(deps: ServerDeps, config: &EngineConfig) -> Self {
        Self {
            deps,
            concurrency: config.bulk_concurrency.max(1),
        }
    }

    /// Persist a QUEUED operation and start it in the background.
    pub async fn submit(
        self: &Arc<Self>,
        owner_id: MemberId,
        request: SubmitBulkOperation,
    ) -> EngineResult<BulkOperation> {
        let (action, targets) = validate_request(&request)?;
        let site = find_owned_site(owner_id, request.site_id, self.deps.store.as_ref()).await?;

        let op = BulkOperation::new(
            CreateBulkOperation::builder()
                .owner_id(owner_id)
                .site_id(site.id)
                .target_type(request.target_type.trim())
                .action(action)
                .target_ids(targets)
                .metadata(request.metadata)
                .build(),
        );
        let op = self.deps.store.insert_bulk_operation(&op).await?;

        info!(
            operation_id = %op.id,
            action = %op.action,
            total = op.total,
            "bulk operation queued"
        );

        let runner = Arc::clone(self);
        let id = op.id;
        tokio::spawn(async move {
            if let Err(e) = runner.run(id).await {
                error!(operation_id = %id, error = %e, "bulk operation aborted");
            }
        });

        Ok(op)
    }

    pub async fn get_status(
        &self,
        owner_id: MemberId,
        id: BulkOperationId,
    ) -> EngineResult<BulkOperation> {
        self.deps
            .store
            .find_bulk_operation(id)
            .await?
            .filter(|op| op.owner_id == owner_id)
            .ok_or_else(|| EngineError::not_found("bulk operation", id))
    }

    pub async fn list(
        &self,
        owner_id: MemberId,
        args: &PageArgs,
    ) -> EngineResult<Page<BulkOperation>> {
        let page = args.validate().map_err(EngineError::validation)?;
        let rows = self.deps.store.list_bulk_operations(owner_id, &page).await?;
        Ok(Page::from_rows(rows, &page, |op| op.id.into_uuid()))
    }

    /// Execute a QUEUED operation to completion.
    pub async fn run(&self, id: BulkOperationId) -> Result<BulkOperation> {
        let store = &self.deps.store;

        let Some(op) = store.start_bulk_operation(id).await? else {
            warn!(operation_id = %id, "bulk operation is not queued, skipping");
            return store
                .find_bulk_operation(id)
                .await?
                .with_context(|| format!("bulk operation {id} disappeared"));
        };

        let site = match self.check_preconditions(&op).await? {
            Ok(site) => site,
            Err(reason) => {
                warn!(operation_id = %id, reason = %reason, "bulk operation precondition failed");
                return store
                    .finish_bulk_operation(id, BulkOperationStatus::Failed, Some(reason.as_str()))
                    .await;
            }
        };

        debug!(operation_id = %id, concurrency = self.concurrency, "bulk operation running");

        let site = &site;
        let op_ref = &op;
        let processed = stream::iter(op.target_ids.iter().copied().map(Ok::<i64, anyhow::Error>))
            .try_for_each_concurrent(self.concurrency, |target_id| async move {
                let outcome = self.run_item(site, op_ref, target_id).await;
                store.record_bulk_item(id, &outcome).await?;
                Ok(())
            })
            .await;

        if let Err(e) = processed {
            let reason = format!("storage error: {e}");
            if let Err(finish_err) = store
                .finish_bulk_operation(id, BulkOperationStatus::Failed, Some(reason.as_str()))
                .await
            {
                error!(operation_id = %id, error = %finish_err, "could not mark bulk operation failed");
            }
            return Err(e);
        }

        let current = store
            .find_bulk_operation(id)
            .await?
            .with_context(|| format!("bulk operation {id} disappeared"))?;
        let finished = store
            .finish_bulk_operation(id, current.final_status(), None)
            .await?;

        info!(
            operation_id = %id,
            status = ?finished.status,
            succeeded = finished.succeeded,
            failed = finished.failed,
            "bulk operation finished"
        );
        Ok(finished)
    }

    /// `Ok(Err(reason))` is a failed precondition; `Err` is a storage failure.
    async fn check_preconditions(&self, op: &BulkOperation) -> Result<Result<Site, String>> {
        let Some(site) = self.deps.store.find_site(op.site_id).await? else {
            return Ok(Err(format!("site {} no longer exists", op.site_id)));
        };
        if !site.has_credentials() {
            return Ok(Err(format!("site {} has no credentials", site.id)));
        }
        Ok(Ok(site))
    }

    async fn run_item(&self, site: &Site, op: &BulkOperation, target_id: i64) -> ItemOutcome {
        let client = &self.deps.remote_client;
        let result = match op.action {
            BulkAction::Publish => client.publish_existing(site, target_id).await,
            BulkAction::Unpublish => client.unpublish(site, target_id).await,
            BulkAction::Delete => client.delete(site, target_id).await,
            BulkAction::UpdateMetadata => {
                let fields = op.metadata.clone().unwrap_or_default();
                client.update_metadata(site, target_id, &fields).await
            }
        };

        match result {
            Ok(()) => ItemOutcome::Succeeded,
            Err(e) => {
                debug!(operation_id = %op.id, target_id, error = %e, "bulk item failed");
                ItemOutcome::Failed(ItemError {
                    target_id,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Fail operations a previous process left QUEUED or RUNNING.
    pub async fn recover_abandoned(&self) -> Result<u64> {
        let count = self
            .deps
            .store
            .fail_abandoned_bulk_operations(ABANDONED_MESSAGE)
            .await?;
        if count > 0 {
            warn!(count, "failed abandoned bulk operations");
        }
        Ok(count)
    }
}
