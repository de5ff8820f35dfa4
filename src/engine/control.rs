//! Control plane: discovery on a timer and on completion, dispatch, and
//! graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::context::SchedulerContext;
use super::discovery::discover;
use super::dispatch::Dispatcher;
use crate::backend::{Analyzer, DiscoverySource};
use crate::error::Result;

/// Configuration for the control plane.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between discovery passes while no dispatch completes.
    pub discovery_interval: Duration,
    /// Spacing between launches within one batch.
    pub launch_stagger: Duration,
    /// Extra rest for a slot whose credential was throttled.
    pub rate_limit_cooldown: Duration,
    pub transient_cooldown: Duration,
    /// Transient failures before an item becomes terminal.
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(5),
            launch_stagger: Duration::from_millis(200),
            rate_limit_cooldown: Duration::from_secs(60),
            transient_cooldown: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

/// The scheduler loop: discover pending items, dispatch them, drain on
/// shutdown.
#[derive(Clone)]
pub struct ControlPlane {
    ctx: SchedulerContext,
    source: Arc<dyn DiscoverySource>,
    dispatcher: Dispatcher,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl ControlPlane {
    pub fn new(
        ctx: SchedulerContext,
        source: Arc<dyn DiscoverySource>,
        analyzer: Arc<dyn Analyzer>,
        config: SchedulerConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            ctx.clone(),
            analyzer,
            Arc::clone(&source),
            config.clone(),
        );
        Self {
            ctx,
            source,
            dispatcher,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    /// Signal the control plane to shut down.
    ///
    /// No new batch starts after this. Analyses already running finish and
    /// record their outcome; tasks still waiting for a slot give up.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the control plane loop until shutdown, then wait for in-flight
    /// dispatches.
    pub async fn run(&self) -> Result<()> {
        info!(
            slots = self.ctx.pool.size(),
            interval_ms = self.config.discovery_interval.as_millis() as u64,
            "scheduler started"
        );

        let mut tasks = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.discovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // A finished dispatch frees a lock, so the next round starts then
        // instead of waiting for the ticker. The ticker still picks up new
        // candidates while every slot is idle.
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => reap(joined),
                _ = ticker.tick() => {}
            }

            while let Some(joined) = tasks.try_join_next() {
                reap(joined);
            }

            if let Err(e) = self.tick(&mut tasks).await {
                error!("discovery pass failed: {e}");
            }
        }

        info!(in_flight = tasks.len(), "scheduler shutting down, draining dispatches");
        while let Some(joined) = tasks.join_next().await {
            reap(joined);
        }
        info!("scheduler stopped");
        Ok(())
    }

    /// One discovery pass followed by one dispatch round. Returns how many
    /// items were launched.
    pub async fn tick(&self, tasks: &mut JoinSet<()>) -> Result<usize> {
        if self.shutdown.is_cancelled() {
            return Ok(0);
        }
        let batch = discover(self.source.as_ref(), &self.ctx.store, &self.ctx.locks).await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let pending = batch.len();
        let launched = self
            .dispatcher
            .dispatch(batch, tasks, &self.shutdown)
            .await;
        if launched > 0 {
            info!(pending, launched, in_flight = self.ctx.locks.len(), "dispatched batch");
        }
        Ok(launched)
    }
}

fn reap(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("dispatch task failed: {e}");
    }
}
