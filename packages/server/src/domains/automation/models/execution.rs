use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::common::{AutomationExecutionId, AutomationScheduleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "automation_execution_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Success,
    Failed,
}

/// One run of a schedule. Append-only: once `finished_at` is set the row
/// never changes.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AutomationExecution {
    pub id: AutomationExecutionId,
    pub schedule_id: AutomationScheduleId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub articles_generated: i32,
    pub articles_published: i32,
    pub error_message: Option<String>,
}

/// Final tallies for a finished execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub articles_generated: i32,
    pub articles_published: i32,
    pub error_message: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(generated: i32, published: i32) -> Self {
        Self {
            status: ExecutionStatus::Success,
            articles_generated: generated,
            articles_published: published,
            error_message: None,
        }
    }

    pub fn failed(generated: i32, published: i32, error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            articles_generated: generated,
            articles_published: published,
            error_message: Some(error.into()),
        }
    }
}

impl AutomationExecution {
    pub fn start(schedule_id: AutomationScheduleId, started_at: DateTime<Utc>) -> Self {
        Self {
            id: AutomationExecutionId::new(),
            schedule_id,
            status: ExecutionStatus::Running,
            started_at,
            finished_at: None,
            articles_generated: 0,
            articles_published: 0,
            error_message: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO automation_executions (id, schedule_id, status, started_at)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(self.schedule_id)
        .bind(self.status)
        .bind(self.started_at)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    /// RUNNING -> SUCCESS/FAILED. `None` if it was already finished.
    pub async fn finish(
        id: AutomationExecutionId,
        outcome: &ExecutionOutcome,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE automation_executions
            SET status = $2, articles_generated = $3, articles_published = $4,
                error_message = $5, finished_at = NOW()
            WHERE id = $1 AND finished_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(outcome.status)
        .bind(outcome.articles_generated)
        .bind(outcome.articles_published)
        .bind(&outcome.error_message)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// Newest first.
    pub async fn find_for_schedule(
        schedule_id: AutomationScheduleId,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM automation_executions
            WHERE schedule_id = $1
            ORDER BY started_at DESC, id DESC
            "#,
        )
        .bind(schedule_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Finish RUNNING executions started before `started_before` as FAILED.
    pub async fn fail_stale(
        started_before: DateTime<Utc>,
        message: &str,
        pool: &PgPool,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE automation_executions
            SET status = 'failed', error_message = $2, finished_at = NOW()
            WHERE status = 'running' AND finished_at IS NULL AND started_at < $1
            "#,
        )
        .bind(started_before)
        .bind(message)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_execution_is_running() {
        let exec = AutomationExecution::start(AutomationScheduleId::new(), Utc::now());
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert!(!exec.is_finished());
    }

    #[test]
    fn failed_outcome_keeps_partial_counts() {
        let outcome = ExecutionOutcome::failed(2, 1, "publish failed");
        assert_eq!(outcome.articles_generated, 2);
        assert_eq!(outcome.articles_published, 1);
        assert_eq!(outcome.error_message.as_deref(), Some("publish failed"));
    }
}
