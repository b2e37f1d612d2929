use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::{AutomationStore, BulkOperationStore, ExecutionStore, ScheduledPostStore, SiteStore};
use crate::common::{
    AutomationExecutionId, AutomationScheduleId, BulkOperationId, MemberId, PageRequest,
    ScheduledPostId, SiteId,
};
use crate::domains::automation::models::{
    AutomationExecution, AutomationSchedule, ExecutionOutcome, ExecutionStatus,
};
use crate::domains::bulk_operations::models::{BulkOperation, BulkOperationStatus, ItemOutcome};
use crate::domains::scheduled_posts::models::{
    PostChanges, PublishResult, ScheduledPost, ScheduledPostStatus,
};
use crate::domains::sites::models::Site;

#[derive(Default)]
struct State {
    sites: HashMap<SiteId, Site>,
    bulk_operations: HashMap<BulkOperationId, BulkOperation>,
    scheduled_posts: HashMap<ScheduledPostId, ScheduledPost>,
    schedules: HashMap<AutomationScheduleId, AutomationSchedule>,
    executions: HashMap<AutomationExecutionId, AutomationExecution>,
}

/// In-process store with the same transition semantics as [`super::PostgresStore`].
///
/// A single mutex guards all tables, so every trait method is atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, as if the database had gone away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl SiteStore for MemoryStore {
    async fn insert_site(&self, site: &Site) -> Result<Site> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.sites.insert(site.id, site.clone());
        Ok(site.clone())
    }

    async fn find_site(&self, id: SiteId) -> Result<Option<Site>> {
        self.check()?;
        Ok(self.state.lock().await.sites.get(&id).cloned())
    }

    async fn list_sites(&self, owner_id: MemberId) -> Result<Vec<Site>> {
        self.check()?;
        let state = self.state.lock().await;
        let mut sites: Vec<Site> = state
            .sites
            .values()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect();
        sites.sort_by_key(|s| s.id);
        Ok(sites)
    }
}

#[async_trait]
impl BulkOperationStore for MemoryStore {
    async fn insert_bulk_operation(&self, op: &BulkOperation) -> Result<BulkOperation> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.bulk_operations.insert(op.id, op.clone());
        Ok(op.clone())
    }

    async fn find_bulk_operation(&self, id: BulkOperationId) -> Result<Option<BulkOperation>> {
        self.check()?;
        Ok(self.state.lock().await.bulk_operations.get(&id).cloned())
    }

    async fn list_bulk_operations(
        &self,
        owner_id: MemberId,
        page: &PageRequest,
    ) -> Result<Vec<BulkOperation>> {
        self.check()?;
        let state = self.state.lock().await;
        let mut ops: Vec<BulkOperation> = state
            .bulk_operations
            .values()
            .filter(|op| op.owner_id == owner_id)
            .filter(|op| page.after.map_or(true, |after| *op.id.as_uuid() < after))
            .cloned()
            .collect();
        ops.sort_by(|a, b| b.id.cmp(&a.id));
        ops.truncate(page.fetch_limit() as usize);
        Ok(ops)
    }

    async fn start_bulk_operation(&self, id: BulkOperationId) -> Result<Option<BulkOperation>> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.bulk_operations.get_mut(&id) {
            Some(op) if op.status == BulkOperationStatus::Queued => {
                let now = Utc::now();
                op.status = BulkOperationStatus::Running;
                op.started_at = Some(now);
                op.updated_at = now;
                Ok(Some(op.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn record_bulk_item(
        &self,
        id: BulkOperationId,
        outcome: &ItemOutcome,
    ) -> Result<BulkOperation> {
        self.check()?;
        let mut state = self.state.lock().await;
        let op = state
            .bulk_operations
            .get_mut(&id)
            .filter(|op| op.status == BulkOperationStatus::Running)
            .ok_or_else(|| anyhow!("bulk operation {id} is not running"))?;
        op.apply_outcome(outcome);
        Ok(op.clone())
    }

    async fn finish_bulk_operation(
        &self,
        id: BulkOperationId,
        status: BulkOperationStatus,
        fatal_error: Option<&str>,
    ) -> Result<BulkOperation> {
        self.check()?;
        let mut state = self.state.lock().await;
        let op = state
            .bulk_operations
            .get_mut(&id)
            .filter(|op| !op.status.is_terminal())
            .ok_or_else(|| anyhow!("bulk operation {id} is not active"))?;
        let now = Utc::now();
        op.status = status;
        op.fatal_error = fatal_error.map(str::to_string);
        op.finished_at = Some(now);
        op.updated_at = now;
        Ok(op.clone())
    }

    async fn fail_abandoned_bulk_operations(&self, message: &str) -> Result<u64> {
        self.check()?;
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut count = 0;
        for op in state
            .bulk_operations
            .values_mut()
            .filter(|op| !op.status.is_terminal())
        {
            op.status = BulkOperationStatus::Failed;
            op.fatal_error = Some(message.to_string());
            op.finished_at = Some(now);
            op.updated_at = now;
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl ScheduledPostStore for MemoryStore {
    async fn insert_scheduled_post(&self, post: &ScheduledPost) -> Result<ScheduledPost> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.scheduled_posts.insert(post.id, post.clone());
        Ok(post.clone())
    }

    async fn find_scheduled_post(&self, id: ScheduledPostId) -> Result<Option<ScheduledPost>> {
        self.check()?;
        Ok(self.state.lock().await.scheduled_posts.get(&id).cloned())
    }

    async fn list_scheduled_posts(
        &self,
        owner_id: MemberId,
        status: Option<ScheduledPostStatus>,
    ) -> Result<Vec<ScheduledPost>> {
        self.check()?;
        let state = self.state.lock().await;
        let mut posts: Vec<ScheduledPost> = state
            .scheduled_posts
            .values()
            .filter(|p| p.owner_id == owner_id)
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        posts.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for).then(a.id.cmp(&b.id)));
        Ok(posts)
    }

    async fn update_pending_post(
        &self,
        id: ScheduledPostId,
        changes: &PostChanges,
    ) -> Result<Option<ScheduledPost>> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.scheduled_posts.get_mut(&id) {
            Some(post) if post.status == ScheduledPostStatus::Pending => {
                post.apply_changes(changes);
                Ok(Some(post.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn cancel_pending_post(&self, id: ScheduledPostId) -> Result<Option<ScheduledPost>> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.scheduled_posts.get_mut(&id) {
            Some(post) if post.status == ScheduledPostStatus::Pending => {
                post.status = ScheduledPostStatus::Cancelled;
                post.updated_at = Utc::now();
                Ok(Some(post.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_scheduled_post(&self, id: ScheduledPostId) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.scheduled_posts.get(&id) {
            Some(post) if post.status != ScheduledPostStatus::Publishing => {
                state.scheduled_posts.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_due_posts(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledPost>> {
        self.check()?;
        let mut state = self.state.lock().await;
        let mut due: Vec<(DateTime<Utc>, ScheduledPostId)> = state
            .scheduled_posts
            .values()
            .filter(|p| p.is_due(now))
            .map(|p| (p.scheduled_for, p.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(post) = state.scheduled_posts.get_mut(&id) {
                post.status = ScheduledPostStatus::Publishing;
                post.claimed_at = Some(now);
                post.updated_at = now;
                claimed.push(post.clone());
            }
        }
        Ok(claimed)
    }

    async fn claim_post(
        &self,
        id: ScheduledPostId,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledPost>> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.scheduled_posts.get_mut(&id) {
            Some(post) if post.status == ScheduledPostStatus::Pending => {
                post.status = ScheduledPostStatus::Publishing;
                post.claimed_at = Some(now);
                post.updated_at = now;
                Ok(Some(post.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete_post_attempt(
        &self,
        id: ScheduledPostId,
        result: &PublishResult,
    ) -> Result<ScheduledPost> {
        self.check()?;
        let mut state = self.state.lock().await;
        let post = state
            .scheduled_posts
            .get_mut(&id)
            .filter(|p| p.status == ScheduledPostStatus::Publishing)
            .ok_or_else(|| anyhow!("scheduled post {id} is not publishing"))?;
        post.apply_result(result, Utc::now());
        Ok(post.clone())
    }

    async fn release_stale_post_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        self.check()?;
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut count = 0;
        for post in state.scheduled_posts.values_mut().filter(|p| {
            p.status == ScheduledPostStatus::Publishing
                && p.claimed_at.is_some_and(|at| at < claimed_before)
        }) {
            post.status = ScheduledPostStatus::Pending;
            post.claimed_at = None;
            post.updated_at = now;
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl AutomationStore for MemoryStore {
    async fn insert_schedule(&self, schedule: &AutomationSchedule) -> Result<AutomationSchedule> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule.clone())
    }

    async fn find_schedule(
        &self,
        id: AutomationScheduleId,
    ) -> Result<Option<AutomationSchedule>> {
        self.check()?;
        Ok(self.state.lock().await.schedules.get(&id).cloned())
    }

    async fn list_schedules(&self, owner_id: MemberId) -> Result<Vec<AutomationSchedule>> {
        self.check()?;
        let state = self.state.lock().await;
        let mut schedules: Vec<AutomationSchedule> = state
            .schedules
            .values()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.id);
        Ok(schedules)
    }

    async fn list_active_schedules(&self) -> Result<Vec<AutomationSchedule>> {
        self.check()?;
        let state = self.state.lock().await;
        let mut schedules: Vec<AutomationSchedule> = state
            .schedules
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.id);
        Ok(schedules)
    }

    async fn update_schedule(
        &self,
        schedule: &AutomationSchedule,
    ) -> Result<Option<AutomationSchedule>> {
        self.check()?;
        let mut state = self.state.lock().await;
        let Some(current) = state.schedules.get_mut(&schedule.id) else {
            return Ok(None);
        };
        let last_run_at = current.last_run_at;
        let created_at = current.created_at;
        *current = AutomationSchedule {
            last_run_at,
            created_at,
            updated_at: Utc::now(),
            ..schedule.clone()
        };
        Ok(Some(current.clone()))
    }

    async fn delete_schedule(&self, id: AutomationScheduleId) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        let removed = state.schedules.remove(&id).is_some();
        if removed {
            state.executions.retain(|_, e| e.schedule_id != id);
        }
        Ok(removed)
    }

    async fn claim_schedule_fire(
        &self,
        id: AutomationScheduleId,
        expected_next: Option<DateTime<Utc>>,
        next: Option<DateTime<Utc>>,
    ) -> Result<Option<AutomationSchedule>> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.schedules.get_mut(&id) {
            Some(s) if s.is_active && s.next_run_at == expected_next => {
                s.next_run_at = next;
                s.updated_at = Utc::now();
                Ok(Some(s.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn record_schedule_run(
        &self,
        id: AutomationScheduleId,
        started_at: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
        deactivate: bool,
        seen_updated_at: DateTime<Utc>,
    ) -> Result<Option<AutomationSchedule>> {
        self.check()?;
        let mut state = self.state.lock().await;
        let Some(s) = state.schedules.get_mut(&id) else {
            return Ok(None);
        };
        s.last_run_at = Some(s.last_run_at.map_or(started_at, |prev| prev.max(started_at)));
        if deactivate {
            s.is_active = false;
        }
        if !s.is_active {
            s.next_run_at = None;
        } else if s.updated_at == seen_updated_at {
            s.next_run_at = next;
        }
        s.updated_at = Utc::now();
        Ok(Some(s.clone()))
    }

    async fn insert_execution(&self, exec: &AutomationExecution) -> Result<AutomationExecution> {
        self.check()?;
        let mut state = self.state.lock().await;
        if !state.schedules.contains_key(&exec.schedule_id) {
            bail!("automation schedule {} does not exist", exec.schedule_id);
        }
        state.executions.insert(exec.id, exec.clone());
        Ok(exec.clone())
    }

    async fn finish_execution(
        &self,
        id: AutomationExecutionId,
        outcome: &ExecutionOutcome,
    ) -> Result<Option<AutomationExecution>> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.executions.get_mut(&id) {
            Some(exec) if !exec.is_finished() => {
                exec.status = outcome.status;
                exec.articles_generated = outcome.articles_generated;
                exec.articles_published = outcome.articles_published;
                exec.error_message = outcome.error_message.clone();
                exec.finished_at = Some(Utc::now());
                Ok(Some(exec.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        schedule_id: AutomationScheduleId,
    ) -> Result<Vec<AutomationExecution>> {
        self.check()?;
        let state = self.state.lock().await;
        let mut execs: Vec<AutomationExecution> = state
            .executions
            .values()
            .filter(|e| e.schedule_id == schedule_id)
            .cloned()
            .collect();
        execs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(execs)
    }

    async fn fail_stale_executions(
        &self,
        started_before: DateTime<Utc>,
        message: &str,
    ) -> Result<u64> {
        self.check()?;
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut count = 0;
        for exec in state.executions.values_mut().filter(|e| {
            e.status == ExecutionStatus::Running && !e.is_finished() && e.started_at < started_before
        }) {
            exec.status = ExecutionStatus::Failed;
            exec.error_message = Some(message.to_string());
            exec.finished_at = Some(now);
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::scheduled_posts::models::{CreateScheduledPost, PostPayload};
    use chrono::Duration;

    fn due_post(owner: MemberId, offset_secs: i64) -> ScheduledPost {
        ScheduledPost::new(
            CreateScheduledPost::builder()
                .owner_id(owner)
                .site_id(SiteId::new())
                .payload(PostPayload {
                    title: "t".into(),
                    ..Default::default()
                })
                .scheduled_for(Utc::now() + Duration::seconds(offset_secs))
                .build(),
        )
    }

    #[tokio::test]
    async fn claim_due_takes_each_post_once() {
        let store = MemoryStore::new();
        let owner = MemberId::new();
        let post = store
            .insert_scheduled_post(&due_post(owner, -5))
            .await
            .unwrap();
        store
            .insert_scheduled_post(&due_post(owner, 3600))
            .await
            .unwrap();

        let now = Utc::now();
        let first = store.claim_due_posts(now, 10).await.unwrap();
        let second = store.claim_due_posts(now, 10).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, post.id);
        assert_eq!(first[0].status, ScheduledPostStatus::Publishing);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn publishing_posts_cannot_be_deleted_or_cancelled() {
        let store = MemoryStore::new();
        let post = store
            .insert_scheduled_post(&due_post(MemberId::new(), -1))
            .await
            .unwrap();
        store.claim_post(post.id, Utc::now()).await.unwrap();

        assert!(!store.delete_scheduled_post(post.id).await.unwrap());
        assert!(store.cancel_pending_post(post.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_claims_are_released() {
        let store = MemoryStore::new();
        let post = store
            .insert_scheduled_post(&due_post(MemberId::new(), -60))
            .await
            .unwrap();
        let long_ago = Utc::now() - Duration::minutes(30);
        store.claim_post(post.id, long_ago).await.unwrap();

        let released = store
            .release_stale_post_claims(Utc::now() - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(released, 1);
        let post = store.find_scheduled_post(post.id).await.unwrap().unwrap();
        assert_eq!(post.status, ScheduledPostStatus::Pending);
    }

    #[tokio::test]
    async fn recorded_run_keeps_next_run_of_an_edit_made_meanwhile() {
        use crate::domains::automation::models::{CreateAutomationSchedule, ScheduleKind};

        let store = MemoryStore::new();
        let first_next = Utc::now() + Duration::hours(1);
        let schedule = store
            .insert_schedule(&AutomationSchedule::new(
                CreateAutomationSchedule::builder()
                    .owner_id(MemberId::new())
                    .site_id(SiteId::new())
                    .name("digest")
                    .kind(ScheduleKind::Hourly)
                    .cron_expression("0 0 * * * *")
                    .timezone("UTC")
                    .next_run_at(Some(first_next))
                    .build(),
            ))
            .await
            .unwrap();
        let seen = schedule.clone();

        // Edited to a new expression while a run is in flight.
        let edited_next = Utc::now() + Duration::minutes(5);
        let edited = store
            .update_schedule(&AutomationSchedule {
                cron_expression: "0 */5 * * * *".into(),
                next_run_at: Some(edited_next),
                ..schedule
            })
            .await
            .unwrap()
            .unwrap();

        let started = Utc::now();
        let recorded = store
            .record_schedule_run(seen.id, started, Some(first_next), false, seen.updated_at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorded.next_run_at, Some(edited_next));
        assert_eq!(recorded.last_run_at, Some(started));

        let next = Utc::now() + Duration::minutes(10);
        let recorded = store
            .record_schedule_run(seen.id, started, Some(next), false, edited.updated_at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorded.next_run_at, Some(next));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.ping().await.is_err());
        assert!(store.claim_due_posts(Utc::now(), 1).await.is_err());
        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }
}
