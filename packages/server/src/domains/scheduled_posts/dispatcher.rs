//! Scheduled post dispatcher.
//!
//! A fixed-interval loop claims due PENDING posts (PENDING -> PUBLISHING in
//! one atomic store call), publishes them through a bounded pool, and writes
//! back PUBLISHED, PENDING-with-backoff, or FAILED.
//!
//! ```text
//! tick ─► claim_due_posts (SKIP LOCKED) ─► for_each_concurrent(pool)
//!                                              ├─► publish ok   ─► PUBLISHED
//!                                              ├─► transient    ─► PENDING (+backoff)
//!                                              └─► permanent /
//!                                                  exhausted    ─► FAILED
//! ```
//!
//! Publish-now goes through the same claim and finalize path.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::models::{
    CreateScheduledPost, PostChanges, PostPayload, PublishResult, ScheduledPost,
    ScheduledPostStatus,
};
use super::retry::{RetryPolicy, MAX_RETRIES_LIMIT};
use crate::common::{EngineError, EngineResult, MemberId, ScheduledPostId, SiteId};
use crate::config::EngineConfig;
use crate::domains::automation::cron::parse_timezone;
use crate::domains::sites::find_owned_site;
use crate::kernel::{RemoteActionError, ServerDeps};

/// Configuration for the dispatcher loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub tick_interval: Duration,
    pub batch_size: i64,
    pub concurrency: usize,
    pub stale_claim_after: Duration,
    pub default_max_retries: i32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl DispatcherConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            tick_interval: config.dispatcher_tick,
            batch_size: config.dispatcher_batch_size.max(1),
            concurrency: config.dispatch_concurrency.max(1),
            stale_claim_after: config.stale_claim_after,
            default_max_retries: config.post_max_retries,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateScheduledPostInput {
    pub site_id: SiteId,
    #[serde(flatten)]
    pub payload: PostPayload,
    pub scheduled_for: DateTime<Utc>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateScheduledPostInput {
    #[serde(default)]
    pub site_id: Option<SiteId>,
    #[serde(default)]
    pub payload: Option<PostPayload>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct ScheduledPostDispatcher {
    deps: ServerDeps,
    policy: RetryPolicy,
    config: DispatcherConfig,
}

fn validate_payload(payload: &PostPayload) -> EngineResult<()> {
    if payload.title.trim().is_empty() {
        return Err(EngineError::validation("title must not be empty"));
    }
    if payload.status.trim().is_empty() {
        return Err(EngineError::validation("status must not be empty"));
    }
    Ok(())
}

fn validate_max_retries(max_retries: i32) -> EngineResult<()> {
    if !(0..=MAX_RETRIES_LIMIT).contains(&max_retries) {
        return Err(EngineError::validation(format!(
            "max_retries must be between 0 and {MAX_RETRIES_LIMIT}"
        )));
    }
    Ok(())
}

fn validate_timezone(timezone: &str) -> EngineResult<()> {
    parse_timezone(timezone).map(|_| ())
}

impl ScheduledPostDispatcher {
    pub fn new(deps: ServerDeps, policy: RetryPolicy, config: DispatcherConfig) -> Self {
        Self {
            deps,
            policy,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    pub async fn create(
        &self,
        owner_id: MemberId,
        input: CreateScheduledPostInput,
    ) -> EngineResult<ScheduledPost> {
        validate_payload(&input.payload)?;
        let timezone = input.timezone.unwrap_or_else(|| "UTC".to_string());
        validate_timezone(&timezone)?;
        let max_retries = input.max_retries.unwrap_or(self.config.default_max_retries);
        validate_max_retries(max_retries)?;
        let site = find_owned_site(owner_id, input.site_id, self.deps.store.as_ref()).await?;

        let post = ScheduledPost::new(
            CreateScheduledPost::builder()
                .owner_id(owner_id)
                .site_id(site.id)
                .payload(input.payload)
                .scheduled_for(input.scheduled_for)
                .timezone(timezone)
                .max_retries(max_retries)
                .build(),
        );
        let post = self.deps.store.insert_scheduled_post(&post).await?;

        info!(
            post_id = %post.id,
            site_id = %post.site_id,
            scheduled_for = %post.scheduled_for,
            "scheduled post created"
        );
        Ok(post)
    }

    pub async fn get(&self, owner_id: MemberId, id: ScheduledPostId) -> EngineResult<ScheduledPost> {
        self.deps
            .store
            .find_scheduled_post(id)
            .await?
            .filter(|p| p.owner_id == owner_id)
            .ok_or_else(|| EngineError::not_found("scheduled post", id))
    }

    pub async fn list(
        &self,
        owner_id: MemberId,
        status: Option<ScheduledPostStatus>,
    ) -> EngineResult<Vec<ScheduledPost>> {
        Ok(self.deps.store.list_scheduled_posts(owner_id, status).await?)
    }

    /// Change payload, site, or time. Only while PENDING.
    pub async fn update(
        &self,
        owner_id: MemberId,
        id: ScheduledPostId,
        input: UpdateScheduledPostInput,
    ) -> EngineResult<ScheduledPost> {
        self.get(owner_id, id).await?;

        if let Some(payload) = &input.payload {
            validate_payload(payload)?;
        }
        if let Some(tz) = &input.timezone {
            validate_timezone(tz)?;
        }
        if let Some(max) = input.max_retries {
            validate_max_retries(max)?;
        }
        if let Some(site_id) = input.site_id {
            find_owned_site(owner_id, site_id, self.deps.store.as_ref()).await?;
        }

        let changes = PostChanges {
            site_id: input.site_id,
            payload: input.payload,
            scheduled_for: input.scheduled_for,
            timezone: input.timezone,
            max_retries: input.max_retries,
            reset_retries: false,
        };
        self.apply_pending_change(id, &changes, "updated").await
    }

    /// Move a PENDING post to a new time and give it a fresh retry budget.
    pub async fn reschedule(
        &self,
        owner_id: MemberId,
        id: ScheduledPostId,
        scheduled_for: DateTime<Utc>,
    ) -> EngineResult<ScheduledPost> {
        self.get(owner_id, id).await?;
        let changes = PostChanges {
            scheduled_for: Some(scheduled_for),
            reset_retries: true,
            ..Default::default()
        };
        self.apply_pending_change(id, &changes, "rescheduled").await
    }

    async fn apply_pending_change(
        &self,
        id: ScheduledPostId,
        changes: &PostChanges,
        verb: &str,
    ) -> EngineResult<ScheduledPost> {
        let post = self
            .deps
            .store
            .update_pending_post(id, changes)
            .await?
            .ok_or_else(|| {
                EngineError::invalid_state(format!("only PENDING posts can be {verb}"))
            })?;
        info!(post_id = %id, scheduled_for = %post.scheduled_for, "scheduled post {}", verb);
        Ok(post)
    }

    pub async fn cancel(&self, owner_id: MemberId, id: ScheduledPostId) -> EngineResult<ScheduledPost> {
        self.get(owner_id, id).await?;
        let post = self
            .deps
            .store
            .cancel_pending_post(id)
            .await?
            .ok_or_else(|| EngineError::invalid_state("only PENDING posts can be cancelled"))?;
        info!(post_id = %id, "scheduled post cancelled");
        Ok(post)
    }

    pub async fn delete(&self, owner_id: MemberId, id: ScheduledPostId) -> EngineResult<()> {
        self.get(owner_id, id).await?;
        if !self.deps.store.delete_scheduled_post(id).await? {
            return Err(EngineError::invalid_state(
                "a post cannot be deleted while it is publishing",
            ));
        }
        info!(post_id = %id, "scheduled post deleted");
        Ok(())
    }

    /// Publish immediately, through the same claim and finalize path as a tick.
    /// If the outcome cannot be stored the post stays claimed until a tick
    /// releases it as stale.
    pub async fn publish_now(
        &self,
        owner_id: MemberId,
        id: ScheduledPostId,
    ) -> EngineResult<ScheduledPost> {
        self.get(owner_id, id).await?;
        let claimed = self
            .deps
            .store
            .claim_post(id, Utc::now())
            .await?
            .ok_or_else(|| EngineError::invalid_state("only PENDING posts can be published"))?;
        Ok(self.execute(claimed).await?)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Release stale claims, then claim and publish everything due at `now`.
    ///
    /// A post whose outcome could not be written back stays PUBLISHING and
    /// is picked up again by the first tick after `stale_claim_after`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        self.recover_stale_claims(now).await?;

        let claimed = self
            .deps
            .store
            .claim_due_posts(now, self.config.batch_size)
            .await?;

        if claimed.is_empty() {
            return Ok(TickSummary::default());
        }
        debug!(count = claimed.len(), "claimed due posts");

        let published = AtomicUsize::new(0);
        let retried = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let claimed_count = claimed.len();

        stream::iter(claimed)
            .for_each_concurrent(self.config.concurrency, |post| {
                let (published, retried, failed) = (&published, &retried, &failed);
                async move {
                    let id = post.id;
                    match self.execute(post).await {
                        Ok(done) => {
                            let counter = match done.status {
                                ScheduledPostStatus::Published => published,
                                ScheduledPostStatus::Pending => retried,
                                _ => failed,
                            };
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            // Left PUBLISHING until a later tick releases the claim.
                            error!(post_id = %id, error = %e, "failed to finalize scheduled post");
                        }
                    }
                }
            })
            .await;

        let summary = TickSummary {
            claimed: claimed_count,
            published: published.into_inner(),
            retried: retried.into_inner(),
            failed: failed.into_inner(),
        };
        info!(
            claimed = summary.claimed,
            published = summary.published,
            retried = summary.retried,
            failed = summary.failed,
            "dispatcher tick finished"
        );
        Ok(summary)
    }

    /// Publish one claimed (PUBLISHING) post and write back the outcome.
    async fn execute(&self, post: ScheduledPost) -> Result<ScheduledPost> {
        let now = Utc::now();
        let result = match self.deps.store.find_site(post.site_id).await? {
            None => PublishResult::Failed {
                error: format!("site {} no longer exists", post.site_id),
            },
            Some(site) if !site.has_credentials() => PublishResult::Failed {
                error: format!("site {} has no credentials", site.id),
            },
            Some(site) => match self.deps.remote_client.publish(&site, &post.payload.0).await {
                Ok(remote) => PublishResult::Published {
                    remote_post_id: remote.remote_id,
                    link: remote.link,
                },
                Err(e) => self.on_remote_error(&post, &e, now),
            },
        };

        let done = self
            .deps
            .store
            .complete_post_attempt(post.id, &result)
            .await?;

        match &result {
            PublishResult::Published { remote_post_id, .. } => {
                info!(post_id = %done.id, remote_post_id, "scheduled post published")
            }
            PublishResult::Retry { retry_at, error } => warn!(
                post_id = %done.id,
                retry_count = done.retry_count,
                retry_at = %retry_at,
                error = %error,
                "scheduled post publish failed, will retry"
            ),
            PublishResult::Failed { error } => {
                warn!(post_id = %done.id, error = %error, "scheduled post failed")
            }
        }
        Ok(done)
    }

    fn on_remote_error(
        &self,
        post: &ScheduledPost,
        error: &RemoteActionError,
        now: DateTime<Utc>,
    ) -> PublishResult {
        self.policy.on_failure(post, error, now)
    }

    /// Return PUBLISHING claims abandoned by a crashed process to PENDING.
    pub async fn recover_stale_claims(&self, now: DateTime<Utc>) -> Result<u64> {
        let threshold = chrono::Duration::from_std(self.config.stale_claim_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let released = self
            .deps
            .store
            .release_stale_post_claims(now - threshold)
            .await?;
        if released > 0 {
            warn!(count = released, "released stale scheduled post claims");
        }
        Ok(released)
    }

    /// Run ticks until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "scheduled post dispatcher starting"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "dispatcher tick failed");
                    }
                }
            }
        }

        info!("scheduled post dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_follows_engine_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.default_max_retries, 3);
    }

    #[test]
    fn create_input_accepts_flat_payload() {
        let input: CreateScheduledPostInput = serde_json::from_value(serde_json::json!({
            "site_id": SiteId::new(),
            "title": "Launch",
            "content": "<p>hi</p>",
            "tags": [1, 2],
            "scheduled_for": "2030-01-01T09:00:00Z",
            "timezone": "Europe/Berlin"
        }))
        .unwrap();
        assert_eq!(input.payload.title, "Launch");
        assert_eq!(input.payload.tags, vec![1, 2]);
        assert_eq!(input.payload.status, "publish");
        assert_eq!(input.timezone.as_deref(), Some("Europe/Berlin"));
    }

    #[test]
    fn retry_override_is_bounded() {
        assert!(validate_max_retries(0).is_ok());
        assert!(validate_max_retries(10).is_ok());
        assert!(validate_max_retries(11).is_err());
        assert!(validate_max_retries(-1).is_err());
    }
}
