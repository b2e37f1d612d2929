use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{AutomationStore, BulkOperationStore, ExecutionStore, ScheduledPostStore, SiteStore};
use crate::common::{
    AutomationExecutionId, AutomationScheduleId, BulkOperationId, MemberId, PageRequest,
    ScheduledPostId, SiteId,
};
use crate::domains::automation::models::{
    AutomationExecution, AutomationSchedule, ExecutionOutcome,
};
use crate::domains::bulk_operations::models::{BulkOperation, BulkOperationStatus, ItemOutcome};
use crate::domains::scheduled_posts::models::{
    PostChanges, PublishResult, ScheduledPost, ScheduledPostStatus,
};
use crate::domains::sites::models::Site;

/// PostgreSQL-backed store. The SQL lives on the model types.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SiteStore for PostgresStore {
    async fn insert_site(&self, site: &Site) -> Result<Site> {
        site.insert(&self.pool).await.context("insert site")
    }

    async fn find_site(&self, id: SiteId) -> Result<Option<Site>> {
        Site::find_by_id(id, &self.pool).await
    }

    async fn list_sites(&self, owner_id: MemberId) -> Result<Vec<Site>> {
        Site::find_for_owner(owner_id, &self.pool).await
    }
}

#[async_trait]
impl BulkOperationStore for PostgresStore {
    async fn insert_bulk_operation(&self, op: &BulkOperation) -> Result<BulkOperation> {
        op.insert(&self.pool).await.context("insert bulk operation")
    }

    async fn find_bulk_operation(&self, id: BulkOperationId) -> Result<Option<BulkOperation>> {
        BulkOperation::find_by_id(id, &self.pool).await
    }

    async fn list_bulk_operations(
        &self,
        owner_id: MemberId,
        page: &PageRequest,
    ) -> Result<Vec<BulkOperation>> {
        BulkOperation::find_for_owner_paginated(owner_id, page, &self.pool).await
    }

    async fn start_bulk_operation(&self, id: BulkOperationId) -> Result<Option<BulkOperation>> {
        BulkOperation::start(id, &self.pool).await
    }

    async fn record_bulk_item(
        &self,
        id: BulkOperationId,
        outcome: &ItemOutcome,
    ) -> Result<BulkOperation> {
        BulkOperation::record_item(id, outcome, &self.pool)
            .await
            .with_context(|| format!("record item on bulk operation {id}"))
    }

    async fn finish_bulk_operation(
        &self,
        id: BulkOperationId,
        status: BulkOperationStatus,
        fatal_error: Option<&str>,
    ) -> Result<BulkOperation> {
        BulkOperation::finish(id, status, fatal_error, &self.pool)
            .await
            .with_context(|| format!("finish bulk operation {id}"))
    }

    async fn fail_abandoned_bulk_operations(&self, message: &str) -> Result<u64> {
        BulkOperation::fail_abandoned(message, &self.pool).await
    }
}

#[async_trait]
impl ScheduledPostStore for PostgresStore {
    async fn insert_scheduled_post(&self, post: &ScheduledPost) -> Result<ScheduledPost> {
        post.insert(&self.pool).await.context("insert scheduled post")
    }

    async fn find_scheduled_post(&self, id: ScheduledPostId) -> Result<Option<ScheduledPost>> {
        ScheduledPost::find_by_id(id, &self.pool).await
    }

    async fn list_scheduled_posts(
        &self,
        owner_id: MemberId,
        status: Option<ScheduledPostStatus>,
    ) -> Result<Vec<ScheduledPost>> {
        ScheduledPost::find_for_owner(owner_id, status, &self.pool).await
    }

    async fn update_pending_post(
        &self,
        id: ScheduledPostId,
        changes: &PostChanges,
    ) -> Result<Option<ScheduledPost>> {
        ScheduledPost::update_pending(id, changes, &self.pool).await
    }

    async fn cancel_pending_post(&self, id: ScheduledPostId) -> Result<Option<ScheduledPost>> {
        ScheduledPost::cancel_pending(id, &self.pool).await
    }

    async fn delete_scheduled_post(&self, id: ScheduledPostId) -> Result<bool> {
        ScheduledPost::delete_unless_publishing(id, &self.pool).await
    }

    async fn claim_due_posts(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledPost>> {
        ScheduledPost::claim_due(now, limit, &self.pool)
            .await
            .context("claim due scheduled posts")
    }

    async fn claim_post(
        &self,
        id: ScheduledPostId,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledPost>> {
        ScheduledPost::claim_one(id, now, &self.pool).await
    }

    async fn complete_post_attempt(
        &self,
        id: ScheduledPostId,
        result: &PublishResult,
    ) -> Result<ScheduledPost> {
        ScheduledPost::complete_attempt(id, result, &self.pool)
            .await
            .with_context(|| format!("finalize scheduled post {id}"))
    }

    async fn release_stale_post_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        ScheduledPost::release_stale_claims(claimed_before, &self.pool).await
    }
}

#[async_trait]
impl AutomationStore for PostgresStore {
    async fn insert_schedule(&self, schedule: &AutomationSchedule) -> Result<AutomationSchedule> {
        schedule
            .insert(&self.pool)
            .await
            .context("insert automation schedule")
    }

    async fn find_schedule(
        &self,
        id: AutomationScheduleId,
    ) -> Result<Option<AutomationSchedule>> {
        AutomationSchedule::find_by_id(id, &self.pool).await
    }

    async fn list_schedules(&self, owner_id: MemberId) -> Result<Vec<AutomationSchedule>> {
        AutomationSchedule::find_for_owner(owner_id, &self.pool).await
    }

    async fn list_active_schedules(&self) -> Result<Vec<AutomationSchedule>> {
        AutomationSchedule::find_active(&self.pool).await
    }

    async fn update_schedule(
        &self,
        schedule: &AutomationSchedule,
    ) -> Result<Option<AutomationSchedule>> {
        schedule.update(&self.pool).await
    }

    async fn delete_schedule(&self, id: AutomationScheduleId) -> Result<bool> {
        AutomationSchedule::delete(id, &self.pool).await
    }

    async fn claim_schedule_fire(
        &self,
        id: AutomationScheduleId,
        expected_next: Option<DateTime<Utc>>,
        next: Option<DateTime<Utc>>,
    ) -> Result<Option<AutomationSchedule>> {
        AutomationSchedule::claim_fire(id, expected_next, next, &self.pool).await
    }

    async fn record_schedule_run(
        &self,
        id: AutomationScheduleId,
        started_at: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
        deactivate: bool,
        seen_updated_at: DateTime<Utc>,
    ) -> Result<Option<AutomationSchedule>> {
        AutomationSchedule::record_run(id, started_at, next, deactivate, seen_updated_at, &self.pool)
            .await
    }

    async fn insert_execution(&self, exec: &AutomationExecution) -> Result<AutomationExecution> {
        exec.insert(&self.pool)
            .await
            .context("insert automation execution")
    }

    async fn finish_execution(
        &self,
        id: AutomationExecutionId,
        outcome: &ExecutionOutcome,
    ) -> Result<Option<AutomationExecution>> {
        AutomationExecution::finish(id, outcome, &self.pool).await
    }

    async fn list_executions(
        &self,
        schedule_id: AutomationScheduleId,
    ) -> Result<Vec<AutomationExecution>> {
        AutomationExecution::find_for_schedule(schedule_id, &self.pool).await
    }

    async fn fail_stale_executions(
        &self,
        started_before: DateTime<Utc>,
        message: &str,
    ) -> Result<u64> {
        AutomationExecution::fail_stale(started_before, message, &self.pool).await
    }
}

#[async_trait]
impl ExecutionStore for PostgresStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping")?;
        Ok(())
    }
}
