//! Automation schedule manager.
//!
//! Owns schedule CRUD, keeps the [`TriggerRegistry`] in step with the store,
//! and runs the generate-then-publish pipeline for every fire.
//!
//! ```text
//! timer ─► fire loop ─► fire(id)
//!                         ├─► load, skip unless active and due
//!                         ├─► claim_schedule_fire (CAS on next_run_at)
//!                         └─► execute ─► [per-schedule lock]
//!                                          ├─► generate(max_articles)
//!                                          ├─► publish each (auto_publish)
//!                                          ├─► finish execution
//!                                          └─► record_schedule_run (CAS on updated_at)
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cron::{next_run_after, parse_timezone, resolve_cron};
use super::models::{
    AutomationExecution, AutomationSchedule, CreateAutomationSchedule, ExecutionOutcome,
    ScheduleKind,
};
use super::registry::{FireReceiver, TriggerRegistry};
use crate::common::{AutomationScheduleId, EngineError, EngineResult, MemberId, SiteId};
use crate::config::EngineConfig;
use crate::domains::sites::find_owned_site;
use crate::kernel::ServerDeps;

pub const MAX_ARTICLES_LIMIT: i32 = 50;

/// Error stored on executions a previous process never finished.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// How far ahead of `next_run_at` a trigger may arrive and still count as due.
const FIRE_TOLERANCE_MS: i64 = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateScheduleInput {
    pub site_id: SiteId,
    pub name: String,
    pub kind: ScheduleKind,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub auto_publish: bool,
    #[serde(default)]
    pub max_articles: Option<i32>,
}

impl CreateScheduleInput {
    pub fn new(site_id: SiteId, name: impl Into<String>, kind: ScheduleKind) -> Self {
        Self {
            site_id,
            name: name.into(),
            kind,
            cron_expression: None,
            run_at: None,
            timezone: None,
            source_ref: None,
            is_active: None,
            auto_publish: false,
            max_articles: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateScheduleInput {
    #[serde(default)]
    pub site_id: Option<SiteId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<ScheduleKind>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timezone: Option<String>,
    /// An empty string clears the source.
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub auto_publish: Option<bool>,
    #[serde(default)]
    pub max_articles: Option<i32>,
}

/// Cron expression and first fire for a schedule definition.
struct Resolved {
    cron_expression: String,
    next_run_at: Option<DateTime<Utc>>,
}

fn validate_fields(name: &str, max_articles: i32) -> EngineResult<()> {
    if name.trim().is_empty() {
        return Err(EngineError::validation("name must not be empty"));
    }
    if !(1..=MAX_ARTICLES_LIMIT).contains(&max_articles) {
        return Err(EngineError::validation(format!(
            "max_articles must be between 1 and {MAX_ARTICLES_LIMIT}"
        )));
    }
    Ok(())
}

fn resolve(
    kind: ScheduleKind,
    custom: Option<&str>,
    run_at: Option<DateTime<Utc>>,
    timezone: &str,
    active: bool,
    now: DateTime<Utc>,
) -> EngineResult<Resolved> {
    let tz = parse_timezone(timezone)?;
    if kind == ScheduleKind::Once && active && !run_at.is_some_and(|t| t > now) {
        return Err(EngineError::validation("ONCE schedules require a future run_at"));
    }
    let cron_expression = resolve_cron(kind, custom, run_at, tz)?;
    if !active {
        return Ok(Resolved {
            cron_expression,
            next_run_at: None,
        });
    }

    let next_run_at = next_run_after(&cron_expression, tz, now)?;
    if next_run_at.is_none() {
        return Err(EngineError::validation(
            "schedule has no future occurrence",
        ));
    }
    Ok(Resolved {
        cron_expression,
        next_run_at,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub struct AutomationScheduleManager {
    deps: ServerDeps,
    registry: TriggerRegistry,
    fires: Mutex<Option<FireReceiver>>,
    locks: Mutex<HashMap<AutomationScheduleId, Arc<Mutex<()>>>>,
    stale_after: Duration,
}

impl AutomationScheduleManager {
    /// Build the manager and its (empty, already ticking) trigger registry.
    pub async fn new(deps: ServerDeps, config: &EngineConfig) -> Result<Arc<Self>> {
        let (registry, fires) = TriggerRegistry::start().await?;
        Ok(Arc::new(Self {
            deps,
            registry,
            fires: Mutex::new(Some(fires)),
            locks: Mutex::new(HashMap::new()),
            stale_after: config.stale_claim_after,
        }))
    }

    pub fn registry(&self) -> &TriggerRegistry {
        &self.registry
    }

    pub async fn trigger_count(&self) -> usize {
        self.registry.len().await
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    pub async fn create(
        &self,
        owner_id: MemberId,
        input: CreateScheduleInput,
    ) -> EngineResult<AutomationSchedule> {
        let max_articles = input.max_articles.unwrap_or(1);
        validate_fields(&input.name, max_articles)?;
        let timezone = non_empty(input.timezone).unwrap_or_else(|| "UTC".to_string());
        let is_active = input.is_active.unwrap_or(true);
        let resolved = resolve(
            input.kind,
            input.cron_expression.as_deref(),
            input.run_at,
            &timezone,
            is_active,
            Utc::now(),
        )?;
        let site = find_owned_site(owner_id, input.site_id, self.deps.store.as_ref()).await?;

        let schedule = AutomationSchedule::new(
            CreateAutomationSchedule::builder()
                .owner_id(owner_id)
                .site_id(site.id)
                .source_ref(non_empty(input.source_ref))
                .name(input.name.trim())
                .kind(input.kind)
                .cron_expression(resolved.cron_expression)
                .run_at(input.run_at.filter(|_| input.kind == ScheduleKind::Once))
                .timezone(timezone)
                .is_active(is_active)
                .auto_publish(input.auto_publish)
                .max_articles(max_articles)
                .next_run_at(resolved.next_run_at)
                .build(),
        );
        let schedule = self.deps.store.insert_schedule(&schedule).await?;
        let schedule = self.install_trigger(schedule).await?;

        info!(
            schedule_id = %schedule.id,
            kind = ?schedule.kind,
            cron = %schedule.cron_expression,
            next_run_at = ?schedule.next_run_at,
            "automation schedule created"
        );
        Ok(schedule)
    }

    pub async fn get(
        &self,
        owner_id: MemberId,
        id: AutomationScheduleId,
    ) -> EngineResult<AutomationSchedule> {
        self.deps
            .store
            .find_schedule(id)
            .await?
            .filter(|s| s.owner_id == owner_id)
            .ok_or_else(|| EngineError::not_found("automation schedule", id))
    }

    pub async fn list(&self, owner_id: MemberId) -> EngineResult<Vec<AutomationSchedule>> {
        Ok(self.deps.store.list_schedules(owner_id).await?)
    }

    pub async fn list_executions(
        &self,
        owner_id: MemberId,
        id: AutomationScheduleId,
    ) -> EngineResult<Vec<AutomationExecution>> {
        self.get(owner_id, id).await?;
        Ok(self.deps.store.list_executions(id).await?)
    }

    /// Apply changes, recompute the cron and `next_run_at`, and swap the timer.
    pub async fn update(
        &self,
        owner_id: MemberId,
        id: AutomationScheduleId,
        input: UpdateScheduleInput,
    ) -> EngineResult<AutomationSchedule> {
        let mut schedule = self.get(owner_id, id).await?;

        if let Some(site_id) = input.site_id {
            schedule.site_id = find_owned_site(owner_id, site_id, self.deps.store.as_ref())
                .await?
                .id;
        }
        if let Some(name) = input.name {
            schedule.name = name.trim().to_string();
        }
        if let Some(source_ref) = input.source_ref {
            schedule.source_ref = non_empty(Some(source_ref));
        }
        if let Some(timezone) = input.timezone {
            schedule.timezone = timezone.trim().to_string();
        }
        if let Some(active) = input.is_active {
            schedule.is_active = active;
        }
        if let Some(auto_publish) = input.auto_publish {
            schedule.auto_publish = auto_publish;
        }
        if let Some(max_articles) = input.max_articles {
            schedule.max_articles = max_articles;
        }
        let kind_changed = input.kind.is_some_and(|k| k != schedule.kind);
        if let Some(kind) = input.kind {
            schedule.kind = kind;
        }
        if input.run_at.is_some() {
            schedule.run_at = input.run_at;
        }
        if schedule.kind != ScheduleKind::Once {
            schedule.run_at = None;
        }
        validate_fields(&schedule.name, schedule.max_articles)?;

        // A CUSTOM schedule keeps its expression unless a new one is given.
        let custom = match (&input.cron_expression, schedule.kind) {
            (Some(expr), _) => Some(expr.clone()),
            (None, ScheduleKind::Custom) if !kind_changed => Some(schedule.cron_expression.clone()),
            _ => None,
        };
        let resolved = resolve(
            schedule.kind,
            custom.as_deref(),
            schedule.run_at,
            &schedule.timezone,
            schedule.is_active,
            Utc::now(),
        )?;
        schedule.cron_expression = resolved.cron_expression;
        schedule.next_run_at = resolved.next_run_at;

        self.registry.unregister(id).await?;
        let updated = self
            .deps
            .store
            .update_schedule(&schedule)
            .await?
            .ok_or_else(|| EngineError::not_found("automation schedule", id))?;
        let updated = self.install_trigger(updated).await?;

        info!(
            schedule_id = %id,
            cron = %updated.cron_expression,
            is_active = updated.is_active,
            next_run_at = ?updated.next_run_at,
            "automation schedule updated"
        );
        Ok(updated)
    }

    pub async fn delete(&self, owner_id: MemberId, id: AutomationScheduleId) -> EngineResult<()> {
        self.get(owner_id, id).await?;
        self.registry.unregister(id).await?;
        if !self.deps.store.delete_schedule(id).await? {
            return Err(EngineError::not_found("automation schedule", id));
        }
        self.locks.lock().await.remove(&id);
        info!(schedule_id = %id, "automation schedule deleted");
        Ok(())
    }

    /// Stop firing. An execution already in flight finishes.
    pub async fn pause(
        &self,
        owner_id: MemberId,
        id: AutomationScheduleId,
    ) -> EngineResult<AutomationSchedule> {
        let mut schedule = self.get(owner_id, id).await?;
        self.registry.unregister(id).await?;
        if !schedule.is_active {
            return Ok(schedule);
        }

        schedule.is_active = false;
        schedule.next_run_at = None;
        let paused = self
            .deps
            .store
            .update_schedule(&schedule)
            .await?
            .ok_or_else(|| EngineError::not_found("automation schedule", id))?;
        info!(schedule_id = %id, "automation schedule paused");
        Ok(paused)
    }

    pub async fn resume(
        &self,
        owner_id: MemberId,
        id: AutomationScheduleId,
    ) -> EngineResult<AutomationSchedule> {
        let mut schedule = self.get(owner_id, id).await?;
        if schedule.is_active && self.registry.contains(id).await {
            return Ok(schedule);
        }

        let tz = parse_timezone(&schedule.timezone)?;
        let now = Utc::now();
        if schedule.is_one_shot() && !schedule.run_at.is_some_and(|t| t > now) {
            return Err(EngineError::invalid_state(
                "a ONCE schedule whose run_at has passed cannot be resumed",
            ));
        }
        schedule.is_active = true;
        schedule.next_run_at = next_run_after(&schedule.cron_expression, tz, now)?;

        let resumed = self
            .deps
            .store
            .update_schedule(&schedule)
            .await?
            .ok_or_else(|| EngineError::not_found("automation schedule", id))?;
        let resumed = self.install_trigger(resumed).await?;
        info!(schedule_id = %id, next_run_at = ?resumed.next_run_at, "automation schedule resumed");
        Ok(resumed)
    }

    /// Start an execution now, outside the timer. Returns the RUNNING record.
    pub async fn run_now(
        self: &Arc<Self>,
        owner_id: MemberId,
        id: AutomationScheduleId,
    ) -> EngineResult<AutomationExecution> {
        let schedule = self.get(owner_id, id).await?;
        let execution = self
            .deps
            .store
            .insert_execution(&AutomationExecution::start(schedule.id, Utc::now()))
            .await?;
        info!(schedule_id = %id, execution_id = %execution.id, "manual run started");

        let manager = Arc::clone(self);
        let started = execution.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.execute(started, false).await {
                error!(schedule_id = %id, error = %e, "manual run aborted");
            }
        });
        Ok(execution)
    }

    // =========================================================================
    // Fire path
    // =========================================================================

    /// Handle one timer fire. `None` when the trigger was stale, the schedule
    /// is gone or inactive, or another fire already claimed this occurrence.
    pub async fn fire(&self, id: AutomationScheduleId) -> Result<Option<AutomationExecution>> {
        let store = &self.deps.store;
        let Some(schedule) = store.find_schedule(id).await? else {
            self.registry.unregister(id).await?;
            return Ok(None);
        };
        if !schedule.is_active {
            debug!(schedule_id = %id, "ignoring fire for inactive schedule");
            self.registry.unregister(id).await?;
            return Ok(None);
        }

        let now = Utc::now();
        match schedule.next_run_at {
            Some(due) if due <= now + chrono::Duration::milliseconds(FIRE_TOLERANCE_MS) => {}
            other => {
                debug!(schedule_id = %id, next_run_at = ?other, "ignoring stale trigger");
                return Ok(None);
            }
        }

        let tz = parse_timezone(&schedule.timezone)?;
        let next = next_run_after(&schedule.cron_expression, tz, now)?;
        let Some(claimed) = store
            .claim_schedule_fire(id, schedule.next_run_at, next)
            .await?
        else {
            debug!(schedule_id = %id, "fire already claimed");
            return Ok(None);
        };

        let execution = store
            .insert_execution(&AutomationExecution::start(claimed.id, now))
            .await?;
        debug!(schedule_id = %id, execution_id = %execution.id, "schedule fired");
        self.execute(execution, claimed.is_one_shot()).await
    }

    /// Register the timer for a saved schedule. If that fails the row is
    /// saved inactive, so storage never holds an active schedule without a
    /// live timer.
    async fn install_trigger(&self, schedule: AutomationSchedule) -> EngineResult<AutomationSchedule> {
        let registered = self.registry.register(&schedule).await;
        self.settle_trigger(schedule, registered).await
    }

    async fn settle_trigger(
        &self,
        schedule: AutomationSchedule,
        registered: Result<()>,
    ) -> EngineResult<AutomationSchedule> {
        let Err(e) = registered else {
            return Ok(schedule);
        };
        error!(schedule_id = %schedule.id, error = %e, "trigger registration failed, deactivating schedule");
        let inactive = AutomationSchedule {
            is_active: false,
            next_run_at: None,
            ..schedule
        };
        self.deps.store.update_schedule(&inactive).await?;
        Err(EngineError::Storage(e.context("failed to register trigger")))
    }

    async fn schedule_lock(&self, id: AutomationScheduleId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().await.entry(id).or_default())
    }

    /// Run the pipeline for a RUNNING execution. Executions of one schedule
    /// never overlap.
    async fn execute(
        &self,
        execution: AutomationExecution,
        one_shot_fire: bool,
    ) -> Result<Option<AutomationExecution>> {
        let id = execution.schedule_id;
        let lock = self.schedule_lock(id).await;
        let _guard = lock.lock().await;

        let store = &self.deps.store;
        let outcome = match store.find_schedule(id).await? {
            Some(schedule) => self.run_pipeline(&schedule).await,
            None => ExecutionOutcome::failed(0, 0, "schedule was deleted"),
        };
        let finished = store.finish_execution(execution.id, &outcome).await?;

        match &finished {
            Some(done) if outcome.error_message.is_none() => info!(
                schedule_id = %id,
                execution_id = %done.id,
                generated = done.articles_generated,
                published = done.articles_published,
                "automation execution succeeded"
            ),
            Some(done) => warn!(
                schedule_id = %id,
                execution_id = %done.id,
                generated = done.articles_generated,
                published = done.articles_published,
                error = ?done.error_message,
                "automation execution failed"
            ),
            None => warn!(execution_id = %execution.id, "execution was already finished"),
        }

        let Some(schedule) = store.find_schedule(id).await? else {
            return Ok(finished);
        };
        let next = if one_shot_fire {
            None
        } else {
            let tz = parse_timezone(&schedule.timezone)?;
            next_run_after(&schedule.cron_expression, tz, Utc::now())?
        };
        store
            .record_schedule_run(
                id,
                execution.started_at,
                next,
                one_shot_fire,
                schedule.updated_at,
            )
            .await?;
        if one_shot_fire {
            self.registry.unregister(id).await?;
            info!(schedule_id = %id, "one-shot schedule deactivated");
        }
        Ok(finished)
    }

    /// Generate, then publish if asked to. Never fails; problems land in the
    /// outcome.
    async fn run_pipeline(&self, schedule: &AutomationSchedule) -> ExecutionOutcome {
        let max = schedule.max_articles.clamp(1, MAX_ARTICLES_LIMIT) as usize;
        let (mut articles, generation_error) = match self
            .deps
            .content_generator
            .generate(schedule.source_ref.as_deref(), max)
            .await
        {
            Ok(articles) => (articles, None),
            Err(e) => (e.produced, Some(e.message)),
        };
        articles.truncate(max);
        let generated = articles.len() as i32;

        if let Some(message) = generation_error {
            return ExecutionOutcome::failed(generated, 0, format!("generation failed: {message}"));
        }
        if !schedule.auto_publish {
            return ExecutionOutcome::success(generated, 0);
        }

        let site = match self.deps.store.find_site(schedule.site_id).await {
            Ok(Some(site)) if site.has_credentials() => site,
            Ok(Some(site)) => {
                return ExecutionOutcome::failed(
                    generated,
                    0,
                    format!("site {} has no credentials", site.id),
                )
            }
            Ok(None) => {
                return ExecutionOutcome::failed(
                    generated,
                    0,
                    format!("site {} no longer exists", schedule.site_id),
                )
            }
            Err(e) => return ExecutionOutcome::failed(generated, 0, format!("storage error: {e}")),
        };

        let mut published = 0;
        let mut first_error = None;
        for article in articles {
            let title = article.title.clone();
            match self
                .deps
                .remote_client
                .publish(&site, &article.into_payload())
                .await
            {
                Ok(remote) => {
                    published += 1;
                    debug!(schedule_id = %schedule.id, remote_id = remote.remote_id, "article published");
                }
                Err(e) => {
                    warn!(schedule_id = %schedule.id, title = %title, error = %e, "article publish failed");
                    first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        match first_error {
            None => ExecutionOutcome::success(generated, published),
            Some(message) => ExecutionOutcome::failed(generated, published, message),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Fail RUNNING executions left behind by a crashed process.
    pub async fn recover_stale_executions(&self, now: DateTime<Utc>) -> Result<u64> {
        let threshold = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let count = self
            .deps
            .store
            .fail_stale_executions(now - threshold, INTERRUPTED_MESSAGE)
            .await?;
        if count > 0 {
            warn!(count, "failed interrupted automation executions");
        }
        Ok(count)
    }

    /// Recompute `next_run_at` for every active schedule and install one
    /// timer each. One-shot schedules whose instant passed while the process
    /// was down are deactivated without running.
    pub async fn load_active(&self) -> Result<usize> {
        let now = Utc::now();
        let mut active = Vec::new();
        for mut schedule in self.deps.store.list_active_schedules().await? {
            let next = parse_timezone(&schedule.timezone)
                .and_then(|tz| next_run_after(&schedule.cron_expression, tz, now));
            let next = match next {
                Ok(next) => next,
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "skipping unloadable schedule");
                    continue;
                }
            };

            if next.is_none() {
                schedule.is_active = false;
            }
            if schedule.next_run_at != next {
                schedule.next_run_at = next;
                if let Some(saved) = self.deps.store.update_schedule(&schedule).await? {
                    schedule = saved;
                }
            }
            if schedule.is_active {
                active.push(schedule);
            } else {
                info!(schedule_id = %schedule.id, "missed one-shot schedule deactivated");
            }
        }
        self.registry.reconcile(&active).await
    }

    /// Recover, load timers, and start consuming fires until `shutdown`.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<usize> {
        self.recover_stale_executions(Utc::now()).await?;
        let live = self.load_active().await?;

        let fires = self
            .fires
            .lock()
            .await
            .take()
            .context("automation manager already started")?;
        tokio::spawn(Arc::clone(self).run_fire_loop(fires, shutdown));

        info!(live, "automation schedules loaded");
        Ok(live)
    }

    async fn run_fire_loop(self: Arc<Self>, mut fires: FireReceiver, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("automation fire loop shutting down");
                    break;
                }
                fired = fires.recv() => {
                    let Some(id) = fired else { break };
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = manager.fire(id).await {
                            error!(schedule_id = %id, error = %e, "schedule fire failed");
                        }
                    });
                }
            }
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.registry.shutdown().await
    }
}
