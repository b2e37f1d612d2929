// ServerKernel - the running engine
//
// Owns the three managers built over one ServerDeps, performs startup
// recovery, and starts the background loops (dispatcher ticks and the
// automation fire loop). HTTP handlers reach the managers through it.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ServerDeps;
use crate::config::EngineConfig;
use crate::domains::automation::AutomationScheduleManager;
use crate::domains::bulk_operations::BulkOperationRunner;
use crate::domains::scheduled_posts::{DispatcherConfig, RetryPolicy, ScheduledPostDispatcher};

/// ServerKernel holds the managers and their shared dependencies
pub struct ServerKernel {
    pub deps: ServerDeps,
    pub bulk_runner: Arc<BulkOperationRunner>,
    pub dispatcher: Arc<ScheduledPostDispatcher>,
    pub automation: Arc<AutomationScheduleManager>,
    shutdown: CancellationToken,
}

impl ServerKernel {
    pub async fn new(deps: ServerDeps, config: &EngineConfig) -> Result<Self> {
        let bulk_runner = Arc::new(BulkOperationRunner::new(deps.clone(), config));
        let dispatcher = Arc::new(ScheduledPostDispatcher::new(
            deps.clone(),
            RetryPolicy::from_config(config),
            DispatcherConfig::from_engine(config),
        ));
        let automation = AutomationScheduleManager::new(deps.clone(), config).await?;

        Ok(Self {
            deps,
            bulk_runner,
            dispatcher,
            automation,
            shutdown: CancellationToken::new(),
        })
    }

    /// Recover state left by a previous process, then start the loops.
    ///
    /// Order matters: abandoned records are resolved before any timer or
    /// tick can touch them.
    pub async fn start(&self) -> Result<()> {
        let now = Utc::now();
        let bulk = self.bulk_runner.recover_abandoned().await?;
        let claims = self.dispatcher.recover_stale_claims(now).await?;
        let timers = self.automation.start(self.shutdown.child_token()).await?;

        tokio::spawn(Arc::clone(&self.dispatcher).run(self.shutdown.child_token()));

        info!(
            abandoned_bulk_operations = bulk,
            released_claims = claims,
            live_timers = timers,
            "engine started"
        );
        Ok(())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the dispatcher and fire loop and shut the cron scheduler down.
    /// Work already in flight is left to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.automation.shutdown().await?;
        info!("engine stopped");
        Ok(())
    }
}
