// Copyright 2024-2026 Runnerd Contributors
// SPDX-License-Identifier: Apache-2.0

//! Autoscaling control loop.
//!
//! Reads queue depth from the platform and pool occupancy locally, then
//! proposes additions and removals over a bounded channel. The controller
//! never mutates runners; the manager applies (or refuses) every decision.
//! Hysteresis comes from a cooldown window between scale actions; a
//! transient platform failure skips the tick without touching the window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Mode};
use crate::platform::PlatformClient;
use crate::pool::{Pool, PoolCounts};
use crate::telemetry;

/// Scaling decision thresholds and pacing.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub min_runners: usize,
    pub max_runners: usize,
    pub up_threshold: usize,
    pub down_threshold: usize,
    pub cooldown: Duration,
    pub check_interval: Duration,
}

impl Tunables {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_runners: config.min_runners,
            max_runners: config.max_runners,
            up_threshold: config.scale_up_threshold,
            down_threshold: config.scale_down_threshold,
            cooldown: config.scale_cooldown,
            check_interval: config.check_interval,
        }
    }
}

/// What the controller asks the manager to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleCommand {
    Add(usize),
    /// Remove this many oldest-idle runners.
    Remove(usize),
    /// Static-mode idle timeout or max-lifetime expiry: shut down.
    Shutdown,
}

/// Outcome of one scaling evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Hold,
    Add(usize),
    Remove(usize),
    /// Demand exists but the pool is at its maximum.
    AtCapacity,
}

/// Pure scaling arithmetic, evaluated once per tick.
pub fn decide(
    queue: usize,
    counts: PoolCounts,
    tunables: &Tunables,
    cooldown_active: bool,
) -> Decision {
    // Capacity pressure is reported every tick, cooldown or not.
    if queue > tunables.up_threshold && counts.total >= tunables.max_runners {
        return Decision::AtCapacity;
    }
    if cooldown_active {
        return Decision::Hold;
    }

    if queue > tunables.up_threshold && counts.total < tunables.max_runners {
        let to_add = queue
            .saturating_sub(counts.idle)
            .min(tunables.max_runners - counts.total);
        if to_add > 0 {
            return Decision::Add(to_add);
        }
    } else if queue <= tunables.down_threshold
        && counts.idle > 1
        && counts.total > tunables.min_runners
    {
        let to_remove = (counts.idle - 1).min(counts.total - tunables.min_runners);
        if to_remove > 0 {
            return Decision::Remove(to_remove);
        }
    }
    Decision::Hold
}

/// Tracks how long the queue has been continuously empty.
pub(crate) struct IdleTimer {
    timeout: Duration,
    since: Option<Instant>,
}

impl IdleTimer {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            since: None,
        }
    }

    /// Feed one queue observation; returns true once the queue has been
    /// empty for the full timeout.
    pub(crate) fn observe(&mut self, queue: usize, now: Instant) -> bool {
        if queue > 0 {
            self.since = None;
            return false;
        }
        match self.since {
            None => {
                tracing::info!("queue empty, idle timer started");
                self.since = Some(now);
                false
            }
            Some(since) => now.duration_since(since) >= self.timeout,
        }
    }
}

/// Long-running scaling loop.
pub struct ScalingController {
    platform: Arc<dyn PlatformClient>,
    pool: Arc<Pool>,
    tunables: Tunables,
    mode: Mode,
    /// Static-mode idle timeout; `None` disables the shutdown path.
    idle_timeout: Option<Duration>,
    /// Shut the process down once any runner has lived this long.
    max_lifetime: Option<Duration>,
    commands: mpsc::Sender<ScaleCommand>,
    cancel: CancellationToken,
}

impl ScalingController {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        pool: Arc<Pool>,
        config: &Config,
        commands: mpsc::Sender<ScaleCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            platform,
            pool,
            tunables: Tunables::from_config(config),
            mode: config.mode,
            idle_timeout: (!config.idle_timeout.is_zero()).then_some(config.idle_timeout),
            max_lifetime: (!config.max_lifetime.is_zero()).then_some(config.max_lifetime),
            commands,
            cancel,
        }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        tracing::info!(
            mode = ?self.mode,
            min = self.tunables.min_runners,
            max = self.tunables.max_runners,
            interval_secs = self.tunables.check_interval.as_secs(),
            "scaling controller started"
        );
        let mut ticker = tokio::time::interval(self.tunables.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; consume it so the
        // first evaluation happens one full period after startup.
        ticker.tick().await;

        let mut last_scale: Option<Instant> = None;
        let mut idle_timer = self.idle_timeout.map(IdleTimer::new);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tracing::info!("scaling controller stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if self.lifetime_expired() {
                let _ = self.commands.send(ScaleCommand::Shutdown).await;
                return;
            }

            match self.mode {
                Mode::Auto => {
                    if self.auto_tick(&mut last_scale, &mut idle_timer).await {
                        return;
                    }
                }
                Mode::Manual => {
                    if self.manual_tick(&mut idle_timer).await {
                        return;
                    }
                }
            }
        }
    }

    /// One autoscaling evaluation. Returns true to stop the loop.
    async fn auto_tick(
        &self,
        last_scale: &mut Option<Instant>,
        idle_timer: &mut Option<IdleTimer>,
    ) -> bool {
        let queue = match self.platform.pending_work().await {
            Ok(queue) => queue,
            Err(err) if err.is_transient() => {
                tracing::warn!(error = %err, "queue check failed, skipping tick");
                return false;
            }
            Err(err) => {
                tracing::error!(error = %err, "queue check failed permanently, skipping tick");
                return false;
            }
        };

        // The platform's busy flags are authoritative for idle vs. busy.
        match self.platform.list_runners().await {
            Ok(remote) => self.pool.reconcile(&remote),
            Err(err) => tracing::warn!(error = %err, "inventory check failed"),
        }

        let counts = self.pool.counts();
        telemetry::record_queue_depth(queue);
        telemetry::record_pool_size(counts.total, counts.idle);
        tracing::debug!(
            queue,
            total = counts.total,
            idle = counts.idle,
            busy = counts.busy,
            "scaling tick"
        );

        if let Some(timer) = idle_timer {
            if timer.observe(queue, Instant::now()) && counts.busy == 0 {
                tracing::info!("idle timeout reached, requesting shutdown");
                let _ = self.commands.send(ScaleCommand::Shutdown).await;
                return true;
            }
        }

        let cooldown_active = last_scale
            .map(|t| t.elapsed() < self.tunables.cooldown)
            .unwrap_or(false);

        match decide(queue, counts, &self.tunables, cooldown_active) {
            Decision::Hold => {}
            Decision::AtCapacity => {
                tracing::warn!(
                    queue,
                    max = self.tunables.max_runners,
                    "queue growing but pool is at maximum"
                );
            }
            Decision::Add(n) => {
                tracing::info!(count = n, queue, "scaling up");
                telemetry::record_scale_up(n);
                if self.commands.send(ScaleCommand::Add(n)).await.is_err() {
                    return true;
                }
                *last_scale = Some(Instant::now());
            }
            Decision::Remove(n) => {
                tracing::info!(count = n, "scaling down idle runners");
                telemetry::record_scale_down(n);
                if self.commands.send(ScaleCommand::Remove(n)).await.is_err() {
                    return true;
                }
                *last_scale = Some(Instant::now());
            }
        }
        false
    }

    /// Static pool: no scaling arithmetic, only the optional idle timeout.
    async fn manual_tick(&self, idle_timer: &mut Option<IdleTimer>) -> bool {
        let Some(timer) = idle_timer else {
            return false;
        };
        let queue = match self.platform.pending_work().await {
            Ok(queue) => queue,
            Err(err) => {
                tracing::warn!(error = %err, "queue check failed, skipping tick");
                return false;
            }
        };
        telemetry::record_queue_depth(queue);
        if timer.observe(queue, Instant::now()) {
            tracing::info!("idle timeout reached, requesting shutdown");
            let _ = self.commands.send(ScaleCommand::Shutdown).await;
            return true;
        }
        false
    }

    fn lifetime_expired(&self) -> bool {
        let Some(max_lifetime) = self.max_lifetime else {
            return false;
        };
        self.pool.ids().into_iter().any(|id| {
            self.pool
                .uptime(id)
                .map(|uptime| uptime >= max_lifetime)
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
#[path = "scaling_tests.rs"]
mod tests;
