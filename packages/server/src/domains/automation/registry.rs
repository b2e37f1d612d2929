//! Trigger registry: one live cron job per active schedule.
//!
//! The registry only owns timers. When a timer fires it sends the schedule
//! id down a channel and returns; the manager's fire loop does the claim and
//! the work. Registrations are in-memory only and are rebuilt from the store
//! on every start (see [`TriggerRegistry::reconcile`]).

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cron::parse_timezone;
use super::models::AutomationSchedule;
use crate::common::AutomationScheduleId;

pub type FireSender = mpsc::UnboundedSender<AutomationScheduleId>;
pub type FireReceiver = mpsc::UnboundedReceiver<AutomationScheduleId>;

pub struct TriggerRegistry {
    scheduler: JobScheduler,
    handles: Mutex<HashMap<AutomationScheduleId, Uuid>>,
    fires: FireSender,
}

impl TriggerRegistry {
    /// Start an empty scheduler. Fires are delivered on the returned receiver.
    pub async fn start() -> Result<(Self, FireReceiver)> {
        let scheduler = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        scheduler
            .start()
            .await
            .context("Failed to start job scheduler")?;

        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                scheduler,
                handles: Mutex::new(HashMap::new()),
                fires: tx,
            },
            rx,
        ))
    }

    /// Install (or replace) the timer for `schedule`. Inactive schedules are
    /// unregistered instead.
    pub async fn register(&self, schedule: &AutomationSchedule) -> Result<()> {
        if !schedule.is_active {
            self.unregister(schedule.id).await?;
            return Ok(());
        }

        let tz = parse_timezone(&schedule.timezone)?;
        let schedule_id = schedule.id;
        let fires = self.fires.clone();
        let job = Job::new_async_tz(schedule.cron_expression.as_str(), tz, move |_uuid, _lock| {
            let fires = fires.clone();
            Box::pin(async move {
                if fires.send(schedule_id).is_err() {
                    debug!(schedule_id = %schedule_id, "fire loop gone, dropping trigger");
                }
            })
        })
        .with_context(|| format!("invalid trigger for schedule {schedule_id}"))?;

        let mut handles = self.handles.lock().await;
        if let Some(old) = handles.remove(&schedule_id) {
            self.remove_job(schedule_id, old).await;
        }
        let job_id = self.scheduler.add(job).await?;
        handles.insert(schedule_id, job_id);

        debug!(
            schedule_id = %schedule_id,
            cron = %schedule.cron_expression,
            timezone = %schedule.timezone,
            "trigger registered"
        );
        Ok(())
    }

    /// Remove the timer for `id`. Returns whether one existed.
    pub async fn unregister(&self, id: AutomationScheduleId) -> Result<bool> {
        let removed = self.handles.lock().await.remove(&id);
        match removed {
            Some(job_id) => {
                self.remove_job(id, job_id).await;
                debug!(schedule_id = %id, "trigger unregistered");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_job(&self, id: AutomationScheduleId, job_id: Uuid) {
        if let Err(e) = self.scheduler.remove(&job_id).await {
            warn!(schedule_id = %id, error = %e, "failed to remove cron job");
        }
    }

    pub async fn contains(&self, id: AutomationScheduleId) -> bool {
        self.handles.lock().await.contains_key(&id)
    }

    /// Number of live timers.
    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Make the live timers match `active` exactly: drop timers for anything
    /// not in the list, (re)install the rest. A schedule that cannot be
    /// registered is logged and skipped so one bad row does not block startup.
    pub async fn reconcile(&self, active: &[AutomationSchedule]) -> Result<usize> {
        let wanted: HashSet<AutomationScheduleId> = active.iter().map(|s| s.id).collect();
        let stale: Vec<AutomationScheduleId> = self
            .handles
            .lock()
            .await
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        for id in stale {
            self.unregister(id).await?;
        }

        for schedule in active {
            if let Err(e) = self.register(schedule).await {
                warn!(schedule_id = %schedule.id, error = %e, "skipping schedule with bad trigger");
            }
        }

        let live = self.len().await;
        info!(live, "triggers reconciled");
        Ok(live)
    }

    /// Stop the scheduler. No timers fire afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        self.handles.lock().await.clear();
        let mut scheduler = self.scheduler.clone();
        scheduler
            .shutdown()
            .await
            .context("Failed to shut down job scheduler")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{MemberId, SiteId};
    use crate::domains::automation::models::{CreateAutomationSchedule, ScheduleKind};
    use std::time::Duration;

    fn schedule(cron: &str) -> AutomationSchedule {
        AutomationSchedule::new(
            CreateAutomationSchedule::builder()
                .owner_id(MemberId::new())
                .site_id(SiteId::new())
                .name("test")
                .kind(ScheduleKind::Custom)
                .cron_expression(cron)
                .timezone("UTC")
                .next_run_at(None)
                .build(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_replaces_existing_timer() {
        let (registry, _rx) = TriggerRegistry::start().await.unwrap();
        let s = schedule("0 0 * * * *");

        registry.register(&s).await.unwrap();
        registry.register(&s).await.unwrap();
        assert_eq!(registry.len().await, 1);

        assert!(registry.unregister(s.id).await.unwrap());
        assert!(!registry.unregister(s.id).await.unwrap());
        assert!(registry.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inactive_schedules_are_not_registered() {
        let (registry, _rx) = TriggerRegistry::start().await.unwrap();
        let mut s = schedule("0 0 * * * *");
        s.is_active = false;

        registry.register(&s).await.unwrap();
        assert!(!registry.contains(s.id).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconcile_matches_active_set() {
        let (registry, _rx) = TriggerRegistry::start().await.unwrap();
        let gone = schedule("0 0 * * * *");
        registry.register(&gone).await.unwrap();

        let active = vec![schedule("0 */5 * * * *"), schedule("0 0 9 * * Mon")];
        assert_eq!(registry.reconcile(&active).await.unwrap(), 2);
        assert!(!registry.contains(gone.id).await);
        for s in &active {
            assert!(registry.contains(s.id).await);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timers_send_schedule_ids() {
        let (registry, mut rx) = TriggerRegistry::start().await.unwrap();
        let s = schedule("* * * * * *");
        registry.register(&s).await.unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(fired, Some(s.id));
        registry.shutdown().await.unwrap();
    }
}
