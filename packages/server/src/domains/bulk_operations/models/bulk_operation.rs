use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;
use std::fmt;
use std::str::FromStr;
use typed_builder::TypedBuilder;

use crate::common::{BulkOperationId, MemberId, PageRequest, SiteId};

/// At most this many per-item errors are kept on a record. The `failed`
/// counter keeps counting past it.
pub const MAX_RECORDED_ERRORS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "bulk_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    Publish,
    Unpublish,
    Delete,
    UpdateMetadata,
}

impl BulkAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkAction::Publish => "publish",
            BulkAction::Unpublish => "unpublish",
            BulkAction::Delete => "delete",
            BulkAction::UpdateMetadata => "update_metadata",
        }
    }
}

impl fmt::Display for BulkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulkAction {
    type Err = String;

    /// Accepts both `update_metadata` and the URL form `update-metadata`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "publish" => Ok(BulkAction::Publish),
            "unpublish" => Ok(BulkAction::Unpublish),
            "delete" => Ok(BulkAction::Delete),
            "update_metadata" => Ok(BulkAction::UpdateMetadata),
            other => Err(format!("unknown bulk action: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "bulk_operation_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkOperationStatus {
    #[default]
    Queued,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl BulkOperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BulkOperationStatus::Completed
                | BulkOperationStatus::CompletedWithErrors
                | BulkOperationStatus::Failed
        )
    }
}

/// One failed target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub target_id: i64,
    pub message: String,
}

/// The outcome of running one target through the remote client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Failed(ItemError),
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BulkOperation {
    pub id: BulkOperationId,
    pub owner_id: MemberId,
    pub site_id: SiteId,
    pub target_type: String,
    pub action: BulkAction,
    pub target_ids: Vec<i64>,
    pub metadata: Option<serde_json::Value>,
    pub status: BulkOperationStatus,
    pub total: i32,
    pub processed: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub errors: Json<Vec<ItemError>>,
    pub fatal_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct CreateBulkOperation {
    pub owner_id: MemberId,
    pub site_id: SiteId,
    #[builder(setter(into))]
    pub target_type: String,
    pub action: BulkAction,
    pub target_ids: Vec<i64>,
    #[builder(default)]
    pub metadata: Option<serde_json::Value>,
}

impl BulkOperation {
    pub fn new(input: CreateBulkOperation) -> Self {
        let now = Utc::now();
        Self {
            id: BulkOperationId::new(),
            owner_id: input.owner_id,
            site_id: input.site_id,
            target_type: input.target_type,
            action: input.action,
            total: input.target_ids.len() as i32,
            target_ids: input.target_ids,
            metadata: input.metadata,
            status: BulkOperationStatus::Queued,
            processed: 0,
            succeeded: 0,
            failed: 0,
            errors: Json(Vec::new()),
            fatal_error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Status implied by the counters once every item has been processed.
    pub fn final_status(&self) -> BulkOperationStatus {
        if self.failed > 0 {
            BulkOperationStatus::CompletedWithErrors
        } else {
            BulkOperationStatus::Completed
        }
    }

    /// Apply one item outcome to the in-memory counters.
    pub fn apply_outcome(&mut self, outcome: &ItemOutcome) {
        self.processed += 1;
        match outcome {
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::Failed(err) => {
                self.failed += 1;
                if self.errors.0.len() < MAX_RECORDED_ERRORS {
                    self.errors.0.push(err.clone());
                }
            }
        }
        self.updated_at = Utc::now();
    }

    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO bulk_operations (
                id, owner_id, site_id, target_type, action, target_ids, metadata,
                status, total, processed, succeeded, failed, errors, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, 0, 0, '[]'::jsonb, $10, $10)
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(self.owner_id)
        .bind(self.site_id)
        .bind(&self.target_type)
        .bind(self.action)
        .bind(&self.target_ids)
        .bind(&self.metadata)
        .bind(self.status)
        .bind(self.total)
        .bind(self.created_at)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: BulkOperationId, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM bulk_operations WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    /// Newest first. Returns up to `fetch_limit()` rows.
    pub async fn find_for_owner_paginated(
        owner_id: MemberId,
        page: &PageRequest,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM bulk_operations
            WHERE owner_id = $1 AND ($2::uuid IS NULL OR id < $2)
            ORDER BY id DESC
            LIMIT $3
            "#,
        )
        .bind(owner_id)
        .bind(page.after)
        .bind(page.fetch_limit())
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// QUEUED -> RUNNING. `None` when the operation was not queued.
    pub async fn start(id: BulkOperationId, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE bulk_operations
            SET status = 'running', started_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// Bump the counters for one processed item in a single statement, so
    /// concurrent workers never lose an update.
    pub async fn record_item(
        id: BulkOperationId,
        outcome: &ItemOutcome,
        pool: &PgPool,
    ) -> Result<Self> {
        let (ok, error) = match outcome {
            ItemOutcome::Succeeded => (1i32, None),
            ItemOutcome::Failed(err) => (0i32, Some(Json(vec![err.clone()]))),
        };

        sqlx::query_as::<_, Self>(
            r#"
            UPDATE bulk_operations
            SET processed = processed + 1,
                succeeded = succeeded + $2,
                failed = failed + (1 - $2),
                errors = CASE
                    WHEN $3::jsonb IS NOT NULL AND jsonb_array_length(errors) < $4
                        THEN errors || $3::jsonb
                    ELSE errors
                END,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(ok)
        .bind(error)
        .bind(MAX_RECORDED_ERRORS as i32)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    /// RUNNING/QUEUED -> terminal.
    pub async fn finish(
        id: BulkOperationId,
        status: BulkOperationStatus,
        fatal_error: Option<&str>,
        pool: &PgPool,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE bulk_operations
            SET status = $2, fatal_error = $3, finished_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'running')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(fatal_error)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    /// Operations left QUEUED or RUNNING by a previous process.
    pub async fn fail_abandoned(message: &str, pool: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE bulk_operations
            SET status = 'failed', fatal_error = $1, finished_at = NOW(), updated_at = NOW()
            WHERE status IN ('queued', 'running')
            "#,
        )
        .bind(message)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation(ids: Vec<i64>) -> BulkOperation {
        BulkOperation::new(
            CreateBulkOperation::builder()
                .owner_id(MemberId::new())
                .site_id(SiteId::new())
                .target_type("post")
                .action(BulkAction::Delete)
                .target_ids(ids)
                .build(),
        )
    }

    #[test]
    fn action_parses_url_forms() {
        assert_eq!("publish".parse::<BulkAction>(), Ok(BulkAction::Publish));
        assert_eq!(
            "update-metadata".parse::<BulkAction>(),
            Ok(BulkAction::UpdateMetadata)
        );
        assert_eq!(
            "update_metadata".parse::<BulkAction>(),
            Ok(BulkAction::UpdateMetadata)
        );
        assert!("archive".parse::<BulkAction>().is_err());
    }

    #[test]
    fn status_serializes_screaming() {
        let json = serde_json::to_string(&BulkOperationStatus::CompletedWithErrors).unwrap();
        assert_eq!(json, "\"COMPLETED_WITH_ERRORS\"");
    }

    #[test]
    fn new_operation_is_queued_with_total() {
        let op = operation(vec![1, 2, 3]);
        assert_eq!(op.status, BulkOperationStatus::Queued);
        assert_eq!(op.total, 3);
        assert_eq!(op.processed, 0);
    }

    #[test]
    fn error_list_is_bounded_but_counter_is_not() {
        let mut op = operation((0..150).collect());
        for id in 0..150 {
            op.apply_outcome(&ItemOutcome::Failed(ItemError {
                target_id: id,
                message: "boom".into(),
            }));
        }
        assert_eq!(op.failed, 150);
        assert_eq!(op.processed, 150);
        assert_eq!(op.errors.0.len(), MAX_RECORDED_ERRORS);
        assert_eq!(op.final_status(), BulkOperationStatus::CompletedWithErrors);
    }

    #[test]
    fn zero_failures_completes() {
        let mut op = operation(vec![1]);
        op.apply_outcome(&ItemOutcome::Succeeded);
        assert_eq!(op.final_status(), BulkOperationStatus::Completed);
    }
}
