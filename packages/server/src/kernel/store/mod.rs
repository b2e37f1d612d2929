//! Execution record store.
//!
//! Every manager reads and writes through these traits. All state
//! transitions are single atomic operations at this layer (compare-and-set
//! on the current status, or counter increments), so callers never hold a
//! record across an await and write it back.
//!
//! Two implementations: [`PostgresStore`] for production and
//! [`MemoryStore`] for tests and local runs without a database.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

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

#[async_trait]
pub trait SiteStore: Send + Sync {
    async fn insert_site(&self, site: &Site) -> Result<Site>;
    async fn find_site(&self, id: SiteId) -> Result<Option<Site>>;
    async fn list_sites(&self, owner_id: MemberId) -> Result<Vec<Site>>;
}

#[async_trait]
pub trait BulkOperationStore: Send + Sync {
    async fn insert_bulk_operation(&self, op: &BulkOperation) -> Result<BulkOperation>;
    async fn find_bulk_operation(&self, id: BulkOperationId) -> Result<Option<BulkOperation>>;

    /// Newest first, up to `page.fetch_limit()` rows.
    async fn list_bulk_operations(
        &self,
        owner_id: MemberId,
        page: &PageRequest,
    ) -> Result<Vec<BulkOperation>>;

    /// QUEUED -> RUNNING. `None` if the operation was not QUEUED.
    async fn start_bulk_operation(&self, id: BulkOperationId) -> Result<Option<BulkOperation>>;

    /// Count one processed item. Errors if the operation is not RUNNING.
    async fn record_bulk_item(
        &self,
        id: BulkOperationId,
        outcome: &ItemOutcome,
    ) -> Result<BulkOperation>;

    async fn finish_bulk_operation(
        &self,
        id: BulkOperationId,
        status: BulkOperationStatus,
        fatal_error: Option<&str>,
    ) -> Result<BulkOperation>;

    /// Fail every QUEUED or RUNNING operation. Used once at startup.
    async fn fail_abandoned_bulk_operations(&self, message: &str) -> Result<u64>;
}

#[async_trait]
pub trait ScheduledPostStore: Send + Sync {
    async fn insert_scheduled_post(&self, post: &ScheduledPost) -> Result<ScheduledPost>;
    async fn find_scheduled_post(&self, id: ScheduledPostId) -> Result<Option<ScheduledPost>>;
    async fn list_scheduled_posts(
        &self,
        owner_id: MemberId,
        status: Option<ScheduledPostStatus>,
    ) -> Result<Vec<ScheduledPost>>;

    /// `None` if the post is not PENDING.
    async fn update_pending_post(
        &self,
        id: ScheduledPostId,
        changes: &PostChanges,
    ) -> Result<Option<ScheduledPost>>;

    /// PENDING -> CANCELLED. `None` if the post is not PENDING.
    async fn cancel_pending_post(&self, id: ScheduledPostId) -> Result<Option<ScheduledPost>>;

    /// `false` if missing or PUBLISHING.
    async fn delete_scheduled_post(&self, id: ScheduledPostId) -> Result<bool>;

    /// Move up to `limit` PENDING posts due at `now` to PUBLISHING.
    async fn claim_due_posts(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledPost>>;

    /// Move one PENDING post to PUBLISHING regardless of due time.
    async fn claim_post(
        &self,
        id: ScheduledPostId,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledPost>>;

    /// Finalize a PUBLISHING post.
    async fn complete_post_attempt(
        &self,
        id: ScheduledPostId,
        result: &PublishResult,
    ) -> Result<ScheduledPost>;

    async fn release_stale_post_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait AutomationStore: Send + Sync {
    async fn insert_schedule(&self, schedule: &AutomationSchedule) -> Result<AutomationSchedule>;
    async fn find_schedule(&self, id: AutomationScheduleId)
        -> Result<Option<AutomationSchedule>>;
    async fn list_schedules(&self, owner_id: MemberId) -> Result<Vec<AutomationSchedule>>;
    async fn list_active_schedules(&self) -> Result<Vec<AutomationSchedule>>;
    async fn update_schedule(
        &self,
        schedule: &AutomationSchedule,
    ) -> Result<Option<AutomationSchedule>>;
    async fn delete_schedule(&self, id: AutomationScheduleId) -> Result<bool>;

    /// Compare-and-set on `next_run_at`. `None` means somebody else fired
    /// this occurrence, or the schedule is no longer active.
    async fn claim_schedule_fire(
        &self,
        id: AutomationScheduleId,
        expected_next: Option<DateTime<Utc>>,
        next: Option<DateTime<Utc>>,
    ) -> Result<Option<AutomationSchedule>>;

    /// Record a finished run. `last_run_at` only moves forward. `next` is
    /// written only while the row still carries `seen_updated_at`, so an
    /// edit made during the run keeps the `next_run_at` it computed.
    async fn record_schedule_run(
        &self,
        id: AutomationScheduleId,
        started_at: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
        deactivate: bool,
        seen_updated_at: DateTime<Utc>,
    ) -> Result<Option<AutomationSchedule>>;

    async fn insert_execution(&self, exec: &AutomationExecution) -> Result<AutomationExecution>;
    async fn finish_execution(
        &self,
        id: AutomationExecutionId,
        outcome: &ExecutionOutcome,
    ) -> Result<Option<AutomationExecution>>;
    async fn list_executions(
        &self,
        schedule_id: AutomationScheduleId,
    ) -> Result<Vec<AutomationExecution>>;
    async fn fail_stale_executions(
        &self,
        started_before: DateTime<Utc>,
        message: &str,
    ) -> Result<u64>;
}

/// The whole store, as handed to the managers.
#[async_trait]
pub trait ExecutionStore: SiteStore + BulkOperationStore + ScheduledPostStore + AutomationStore {
    /// Connectivity check for `/health`.
    async fn ping(&self) -> Result<()>;
}
