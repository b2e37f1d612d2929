//! Retry policy for scheduled post publishing.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::models::{PublishResult, ScheduledPost};
use crate::config::EngineConfig;
use crate::kernel::RemoteActionError;

/// Upper bound for a per-post `max_retries` override.
pub const MAX_RETRIES_LIMIT: i32 = 10;

/// Exponential backoff: `min(base * 2^retry_count, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base: config.retry_backoff_base,
            cap: config.retry_backoff_cap,
        }
    }

    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exp = retry_count.clamp(0, 30) as u32;
        self.base
            .checked_mul(2u32.saturating_pow(exp))
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// Decide what a failed attempt turns into.
    pub fn on_failure(
        &self,
        post: &ScheduledPost,
        error: &RemoteActionError,
        now: DateTime<Utc>,
    ) -> PublishResult {
        if !error.should_retry() {
            return PublishResult::Failed {
                error: error.to_string(),
            };
        }
        if !post.retries_remaining() {
            return PublishResult::Failed {
                error: format!("{error} (gave up after {} retries)", post.retry_count),
            };
        }
        let delay = chrono::Duration::from_std(self.backoff(post.retry_count))
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        PublishResult::Retry {
            error: error.to_string(),
            retry_at: now + delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{MemberId, SiteId};
    use crate::domains::scheduled_posts::models::{CreateScheduledPost, PostPayload};

    fn post(retry_count: i32, max_retries: i32) -> ScheduledPost {
        let mut post = ScheduledPost::new(
            CreateScheduledPost::builder()
                .owner_id(MemberId::new())
                .site_id(SiteId::new())
                .payload(PostPayload::default())
                .scheduled_for(Utc::now())
                .max_retries(max_retries)
                .build(),
        );
        post.retry_count = retry_count;
        post
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(60));
        assert_eq!(policy.backoff(1), Duration::from_secs(120));
        assert_eq!(policy.backoff(2), Duration::from_secs(240));
        assert_eq!(policy.backoff(6), Duration::from_secs(3600));
        assert_eq!(policy.backoff(1000), Duration::from_secs(3600));
    }

    #[test]
    fn transient_failure_with_budget_retries() {
        let now = Utc::now();
        let result = RetryPolicy::default().on_failure(
            &post(1, 3),
            &RemoteActionError::Transient("503".into()),
            now,
        );
        match result {
            PublishResult::Retry { retry_at, .. } => {
                assert_eq!(retry_at, now + chrono::Duration::seconds(120))
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_budget_fails() {
        let result = RetryPolicy::default().on_failure(
            &post(3, 3),
            &RemoteActionError::Transient("503".into()),
            Utc::now(),
        );
        assert!(matches!(result, PublishResult::Failed { .. }));
    }

    #[test]
    fn permanent_failure_never_retries() {
        let result = RetryPolicy::default().on_failure(
            &post(0, 3),
            &RemoteActionError::Permanent("401".into()),
            Utc::now(),
        );
        assert!(matches!(result, PublishResult::Failed { .. }));
    }

    #[test]
    fn zero_retry_budget_fails_first_time() {
        let result = RetryPolicy::default().on_failure(
            &post(0, 0),
            &RemoteActionError::Transient("timeout".into()),
            Utc::now(),
        );
        assert!(matches!(result, PublishResult::Failed { .. }));
    }
}
