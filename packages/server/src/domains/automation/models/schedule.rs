use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::str::FromStr;
use typed_builder::TypedBuilder;

use crate::common::{AutomationScheduleId, MemberId, SiteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "schedule_kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    #[serde(rename = "ONCE")]
    Once,
    #[sqlx(rename = "every_5_minutes")]
    #[serde(rename = "EVERY_5_MINUTES")]
    Every5Minutes,
    #[sqlx(rename = "every_15_minutes")]
    #[serde(rename = "EVERY_15_MINUTES")]
    Every15Minutes,
    #[sqlx(rename = "every_30_minutes")]
    #[serde(rename = "EVERY_30_MINUTES")]
    Every30Minutes,
    #[serde(rename = "HOURLY")]
    Hourly,
    #[serde(rename = "DAILY")]
    Daily,
    #[serde(rename = "WEEKLY")]
    Weekly,
    #[serde(rename = "CUSTOM")]
    Custom,
}

impl ScheduleKind {
    /// Built-in expression for the fixed kinds. `Once` and `Custom` have none.
    pub fn preset_cron(&self) -> Option<&'static str> {
        match self {
            ScheduleKind::Every5Minutes => Some("0 */5 * * * *"),
            ScheduleKind::Every15Minutes => Some("0 */15 * * * *"),
            ScheduleKind::Every30Minutes => Some("0 */30 * * * *"),
            ScheduleKind::Hourly => Some("0 0 * * * *"),
            ScheduleKind::Daily => Some("0 0 9 * * *"),
            ScheduleKind::Weekly => Some("0 0 9 * * Mon"),
            ScheduleKind::Once | ScheduleKind::Custom => None,
        }
    }
}

impl FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "ONCE" => Ok(Self::Once),
            "EVERY_5_MINUTES" => Ok(Self::Every5Minutes),
            "EVERY_15_MINUTES" => Ok(Self::Every15Minutes),
            "EVERY_30_MINUTES" => Ok(Self::Every30Minutes),
            "HOURLY" => Ok(Self::Hourly),
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "CUSTOM" => Ok(Self::Custom),
            other => Err(format!("unknown schedule kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AutomationSchedule {
    pub id: AutomationScheduleId,
    pub owner_id: MemberId,
    pub site_id: SiteId,
    /// e.g. an RSS feed URL handed to the content generator.
    pub source_ref: Option<String>,
    pub name: String,
    pub kind: ScheduleKind,
    /// Six- or seven-field expression, seconds first.
    pub cron_expression: String,
    pub run_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub is_active: bool,
    pub auto_publish: bool,
    pub max_articles: i32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A validated, cron-resolved schedule ready to persist.
#[derive(Debug, Clone, TypedBuilder)]
pub struct CreateAutomationSchedule {
    pub owner_id: MemberId,
    pub site_id: SiteId,
    #[builder(default)]
    pub source_ref: Option<String>,
    #[builder(setter(into))]
    pub name: String,
    pub kind: ScheduleKind,
    #[builder(setter(into))]
    pub cron_expression: String,
    #[builder(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[builder(setter(into))]
    pub timezone: String,
    #[builder(default = true)]
    pub is_active: bool,
    #[builder(default = false)]
    pub auto_publish: bool,
    #[builder(default = 1)]
    pub max_articles: i32,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl AutomationSchedule {
    pub fn new(input: CreateAutomationSchedule) -> Self {
        let now = Utc::now();
        Self {
            id: AutomationScheduleId::new(),
            owner_id: input.owner_id,
            site_id: input.site_id,
            source_ref: input.source_ref,
            name: input.name,
            kind: input.kind,
            cron_expression: input.cron_expression,
            run_at: input.run_at,
            timezone: input.timezone,
            is_active: input.is_active,
            auto_publish: input.auto_publish,
            max_articles: input.max_articles,
            next_run_at: input.next_run_at,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// ONCE schedules deactivate after their single fire.
    pub fn is_one_shot(&self) -> bool {
        self.kind == ScheduleKind::Once
    }

    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO automation_schedules (
                id, owner_id, site_id, source_ref, name, kind, cron_expression, run_at,
                timezone, is_active, auto_publish, max_articles, next_run_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(self.owner_id)
        .bind(self.site_id)
        .bind(&self.source_ref)
        .bind(&self.name)
        .bind(self.kind)
        .bind(&self.cron_expression)
        .bind(self.run_at)
        .bind(&self.timezone)
        .bind(self.is_active)
        .bind(self.auto_publish)
        .bind(self.max_articles)
        .bind(self.next_run_at)
        .bind(self.created_at)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: AutomationScheduleId, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM automation_schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_for_owner(owner_id: MemberId, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM automation_schedules WHERE owner_id = $1 ORDER BY id",
        )
        .bind(owner_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_active(pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM automation_schedules WHERE is_active = TRUE ORDER BY id",
        )
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Overwrite every user-editable column. `last_run_at` is owned by the
    /// fire path and left alone.
    pub async fn update(&self, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE automation_schedules
            SET site_id = $2, source_ref = $3, name = $4, kind = $5, cron_expression = $6,
                run_at = $7, timezone = $8, is_active = $9, auto_publish = $10,
                max_articles = $11, next_run_at = $12, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(self.site_id)
        .bind(&self.source_ref)
        .bind(&self.name)
        .bind(self.kind)
        .bind(&self.cron_expression)
        .bind(self.run_at)
        .bind(&self.timezone)
        .bind(self.is_active)
        .bind(self.auto_publish)
        .bind(self.max_articles)
        .bind(self.next_run_at)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn delete(id: AutomationScheduleId, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query("DELETE FROM automation_schedules WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Claim a timer fire: advance `next_run_at` from the value the trigger
    /// saw to the following occurrence. Only one caller can win for a given
    /// `expected`, and an inactive schedule never matches.
    pub async fn claim_fire(
        id: AutomationScheduleId,
        expected: Option<DateTime<Utc>>,
        next: Option<DateTime<Utc>>,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE automation_schedules
            SET next_run_at = $3, updated_at = NOW()
            WHERE id = $1 AND is_active = TRUE AND next_run_at IS NOT DISTINCT FROM $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(next)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// Record that an execution started at `started_at` has finished.
    /// `last_run_at` only moves forward. `next` is ignored if the row was
    /// updated after `seen_updated_at`.
    pub async fn record_run(
        id: AutomationScheduleId,
        started_at: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
        deactivate: bool,
        seen_updated_at: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE automation_schedules
            SET last_run_at = GREATEST(COALESCE(last_run_at, $2), $2),
                is_active = CASE WHEN $4 THEN FALSE ELSE is_active END,
                next_run_at = CASE
                    WHEN $4 OR NOT is_active THEN NULL
                    WHEN updated_at = $5 THEN $3
                    ELSE next_run_at
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(started_at)
        .bind(next)
        .bind(deactivate)
        .bind(seen_updated_at)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_in_api_form() {
        assert_eq!(
            serde_json::to_string(&ScheduleKind::Every15Minutes).unwrap(),
            "\"EVERY_15_MINUTES\""
        );
        let kind: ScheduleKind = serde_json::from_str("\"WEEKLY\"").unwrap();
        assert_eq!(kind, ScheduleKind::Weekly);
    }

    #[test]
    fn kinds_parse_loosely() {
        assert_eq!("every-5-minutes".parse::<ScheduleKind>(), Ok(ScheduleKind::Every5Minutes));
        assert_eq!("hourly".parse::<ScheduleKind>(), Ok(ScheduleKind::Hourly));
        assert!("fortnightly".parse::<ScheduleKind>().is_err());
    }

    #[test]
    fn presets() {
        assert_eq!(ScheduleKind::Hourly.preset_cron(), Some("0 0 * * * *"));
        assert_eq!(ScheduleKind::Weekly.preset_cron(), Some("0 0 9 * * Mon"));
        assert_eq!(ScheduleKind::Custom.preset_cron(), None);
        assert_eq!(ScheduleKind::Once.preset_cron(), None);
    }
}
