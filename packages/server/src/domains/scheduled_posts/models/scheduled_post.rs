use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;
use typed_builder::TypedBuilder;

use crate::common::{MemberId, ScheduledPostId, SiteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "scheduled_post_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduledPostStatus {
    #[default]
    Pending,
    Publishing,
    Published,
    Failed,
    Cancelled,
}

impl ScheduledPostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledPostStatus::Pending => "PENDING",
            ScheduledPostStatus::Publishing => "PUBLISHING",
            ScheduledPostStatus::Published => "PUBLISHED",
            ScheduledPostStatus::Failed => "FAILED",
            ScheduledPostStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::str::FromStr for ScheduledPostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "PUBLISHING" => Ok(Self::Publishing),
            "PUBLISHED" => Ok(Self::Published),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown scheduled post status: {other}")),
        }
    }
}

/// The post as it will be sent to WordPress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostPayload {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub excerpt: Option<String>,
    /// WordPress status on publish (`publish`, `draft`, `private`...).
    #[serde(default = "default_publish_status")]
    pub status: String,
    #[serde(default)]
    pub categories: Vec<i64>,
    #[serde(default)]
    pub tags: Vec<i64>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub featured_media: Option<i64>,
}

fn default_publish_status() -> String {
    "publish".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledPost {
    pub id: ScheduledPostId,
    pub owner_id: MemberId,
    pub site_id: SiteId,
    pub payload: Json<PostPayload>,
    pub scheduled_for: DateTime<Utc>,
    pub timezone: String,
    pub status: ScheduledPostStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub remote_post_id: Option<i64>,
    pub remote_link: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct CreateScheduledPost {
    pub owner_id: MemberId,
    pub site_id: SiteId,
    pub payload: PostPayload,
    pub scheduled_for: DateTime<Utc>,
    #[builder(default = "UTC".to_string(), setter(into))]
    pub timezone: String,
    #[builder(default = 3)]
    pub max_retries: i32,
}

/// Fields a PENDING post may change. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct PostChanges {
    pub site_id: Option<SiteId>,
    pub payload: Option<PostPayload>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
    pub max_retries: Option<i32>,
    /// Set by reschedule.
    pub reset_retries: bool,
}

/// How a publish attempt ended, as written back by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    Published { remote_post_id: i64, link: String },
    Retry { error: String, retry_at: DateTime<Utc> },
    Failed { error: String },
}

impl ScheduledPost {
    pub fn new(input: CreateScheduledPost) -> Self {
        let now = Utc::now();
        Self {
            id: ScheduledPostId::new(),
            owner_id: input.owner_id,
            site_id: input.site_id,
            payload: Json(input.payload),
            scheduled_for: input.scheduled_for,
            timezone: input.timezone,
            status: ScheduledPostStatus::Pending,
            retry_count: 0,
            max_retries: input.max_retries,
            last_error: None,
            remote_post_id: None,
            remote_link: None,
            claimed_at: None,
            published_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduledPostStatus::Pending && self.scheduled_for <= now
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Apply changes in memory.
    pub fn apply_changes(&mut self, changes: &PostChanges) {
        if let Some(site_id) = changes.site_id {
            self.site_id = site_id;
        }
        if let Some(payload) = &changes.payload {
            self.payload = Json(payload.clone());
        }
        if let Some(at) = changes.scheduled_for {
            self.scheduled_for = at;
        }
        if let Some(tz) = &changes.timezone {
            self.timezone = tz.clone();
        }
        if let Some(max) = changes.max_retries {
            self.max_retries = max;
        }
        if changes.reset_retries {
            self.retry_count = 0;
            self.last_error = None;
        }
        self.updated_at = Utc::now();
    }

    /// Apply a publish result in memory.
    pub fn apply_result(&mut self, result: &PublishResult, now: DateTime<Utc>) {
        match result {
            PublishResult::Published {
                remote_post_id,
                link,
            } => {
                self.status = ScheduledPostStatus::Published;
                self.remote_post_id = Some(*remote_post_id);
                self.remote_link = Some(link.clone());
                self.published_at = Some(now);
                self.last_error = None;
            }
            PublishResult::Retry { error, retry_at } => {
                self.status = ScheduledPostStatus::Pending;
                self.retry_count += 1;
                self.scheduled_for = *retry_at;
                self.last_error = Some(error.clone());
            }
            PublishResult::Failed { error } => {
                self.status = ScheduledPostStatus::Failed;
                self.last_error = Some(error.clone());
            }
        }
        self.claimed_at = None;
        self.updated_at = now;
    }

    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO scheduled_posts (
                id, owner_id, site_id, payload, scheduled_for, timezone,
                status, retry_count, max_retries, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $9, $9)
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(self.owner_id)
        .bind(self.site_id)
        .bind(&self.payload)
        .bind(self.scheduled_for)
        .bind(&self.timezone)
        .bind(self.status)
        .bind(self.max_retries)
        .bind(self.created_at)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: ScheduledPostId, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM scheduled_posts WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_for_owner(
        owner_id: MemberId,
        status: Option<ScheduledPostStatus>,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM scheduled_posts
            WHERE owner_id = $1 AND ($2::scheduled_post_status IS NULL OR status = $2)
            ORDER BY scheduled_for ASC, id ASC
            "#,
        )
        .bind(owner_id)
        .bind(status)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Update a post that is still PENDING. `None` when it is not.
    pub async fn update_pending(
        id: ScheduledPostId,
        changes: &PostChanges,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE scheduled_posts
            SET site_id = COALESCE($2, site_id),
                payload = COALESCE($3, payload),
                scheduled_for = COALESCE($4, scheduled_for),
                timezone = COALESCE($5, timezone),
                max_retries = COALESCE($6, max_retries),
                retry_count = CASE WHEN $7 THEN 0 ELSE retry_count END,
                last_error = CASE WHEN $7 THEN NULL ELSE last_error END,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(changes.site_id)
        .bind(changes.payload.clone().map(Json))
        .bind(changes.scheduled_for)
        .bind(&changes.timezone)
        .bind(changes.max_retries)
        .bind(changes.reset_retries)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn cancel_pending(id: ScheduledPostId, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE scheduled_posts
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// Delete unless PUBLISHING. Returns whether a row was removed.
    pub async fn delete_unless_publishing(id: ScheduledPostId, pool: &PgPool) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM scheduled_posts WHERE id = $1 AND status <> 'publishing'")
                .bind(id)
                .execute(pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically move up to `limit` due PENDING posts to PUBLISHING.
    ///
    /// `SKIP LOCKED` lets two concurrent ticks split the due set instead of
    /// both claiming the same rows.
    pub async fn claim_due(now: DateTime<Utc>, limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            WITH due AS (
                SELECT id FROM scheduled_posts
                WHERE status = 'pending' AND scheduled_for <= $1
                ORDER BY scheduled_for ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE scheduled_posts p
            SET status = 'publishing', claimed_at = $1, updated_at = $1
            FROM due
            WHERE p.id = due.id
            RETURNING p.*
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Claim one PENDING post regardless of its due time (publish-now).
    pub async fn claim_one(
        id: ScheduledPostId,
        now: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE scheduled_posts
            SET status = 'publishing', claimed_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// Write the outcome of a publish attempt on a claimed post.
    pub async fn complete_attempt(
        id: ScheduledPostId,
        result: &PublishResult,
        pool: &PgPool,
    ) -> Result<Self> {
        let query = match result {
            PublishResult::Published {
                remote_post_id,
                link,
            } => sqlx::query_as::<_, Self>(
                r#"
                UPDATE scheduled_posts
                SET status = 'published', remote_post_id = $2, remote_link = $3,
                    published_at = NOW(), last_error = NULL, claimed_at = NULL, updated_at = NOW()
                WHERE id = $1 AND status = 'publishing'
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(*remote_post_id)
            .bind(link.clone()),
            PublishResult::Retry { error, retry_at } => sqlx::query_as::<_, Self>(
                r#"
                UPDATE scheduled_posts
                SET status = 'pending', retry_count = retry_count + 1, last_error = $2,
                    scheduled_for = $3, claimed_at = NULL, updated_at = NOW()
                WHERE id = $1 AND status = 'publishing'
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(error.clone())
            .bind(*retry_at),
            PublishResult::Failed { error } => sqlx::query_as::<_, Self>(
                r#"
                UPDATE scheduled_posts
                SET status = 'failed', last_error = $2, claimed_at = NULL, updated_at = NOW()
                WHERE id = $1 AND status = 'publishing'
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(error.clone()),
        };

        query.fetch_one(pool).await.map_err(Into::into)
    }

    /// Return PUBLISHING claims older than `claimed_before` to PENDING.
    pub async fn release_stale_claims(claimed_before: DateTime<Utc>, pool: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'pending', claimed_at = NULL, updated_at = NOW()
            WHERE status = 'publishing' AND claimed_at < $1
            "#,
        )
        .bind(claimed_before)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn post() -> ScheduledPost {
        ScheduledPost::new(
            CreateScheduledPost::builder()
                .owner_id(MemberId::new())
                .site_id(SiteId::new())
                .payload(PostPayload {
                    title: "Hello".into(),
                    ..Default::default()
                })
                .scheduled_for(Utc::now() - Duration::seconds(1))
                .build(),
        )
    }

    #[test]
    fn payload_defaults_to_publish_status() {
        let payload: PostPayload = serde_json::from_str(r#"{"title":"t"}"#).unwrap();
        assert_eq!(payload.status, "publish");
        assert!(payload.categories.is_empty());
    }

    #[test]
    fn status_round_trips_through_strings() {
        assert_eq!(
            "pending".parse::<ScheduledPostStatus>(),
            Ok(ScheduledPostStatus::Pending)
        );
        assert_eq!(ScheduledPostStatus::Cancelled.as_str(), "CANCELLED");
    }

    #[test]
    fn only_pending_posts_are_due() {
        let mut p = post();
        assert!(p.is_due(Utc::now()));
        p.status = ScheduledPostStatus::Cancelled;
        assert!(!p.is_due(Utc::now()));
    }

    #[test]
    fn retry_result_bumps_count_and_moves_the_clock() {
        let mut p = post();
        p.status = ScheduledPostStatus::Publishing;
        let retry_at = Utc::now() + Duration::seconds(60);
        p.apply_result(
            &PublishResult::Retry {
                error: "503".into(),
                retry_at,
            },
            Utc::now(),
        );
        assert_eq!(p.status, ScheduledPostStatus::Pending);
        assert_eq!(p.retry_count, 1);
        assert_eq!(p.scheduled_for, retry_at);
        assert_eq!(p.last_error.as_deref(), Some("503"));
        assert!(p.claimed_at.is_none());
    }

    #[test]
    fn reschedule_resets_retries() {
        let mut p = post();
        p.retry_count = 2;
        p.last_error = Some("x".into());
        p.apply_changes(&PostChanges {
            reset_retries: true,
            ..Default::default()
        });
        assert_eq!(p.retry_count, 0);
        assert!(p.last_error.is_none());
    }
}
