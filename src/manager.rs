// Copyright 2024-2026 Runnerd Contributors
// SPDX-License-Identifier: Apache-2.0

//! Orchestrator manager.
//!
//! Owns every runner record and is the only writer of lifecycle state.
//! The scaling controller and the per-runner supervisors communicate with
//! it over bounded channels; the event loop is biased toward child-exit
//! events so state transitions observe reality before scaling decisions
//! are applied.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Arch, Config, DeploymentStrategy, Mode};
use crate::emulation::{EmulationError, EmulationProvisioner};
use crate::hardware::{gpu_labels, CpuInventory, GpuDescriptor, GpuInspector, Workload};
use crate::install::{Installer, CONFIG_SCRIPT};
use crate::platform::{ApiError, PlatformClient, RemoteRunner};
use crate::pool::{Pool, PoolEntry};
use crate::resources::{ResourcePlan, ResourcePlanner};
use crate::runner::{
    ChildExit, ResourceLimits, Runner, RunnerError, RunnerSettings, RunnerSnapshot, RunnerState,
};
use crate::scaling::{ScaleCommand, ScalingController};
use crate::telemetry;

/// Capacity of the supervisor and controller channels.
const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Download timeout for vendor archives.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Emulation(#[from] EmulationError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("monitor loop is already running")]
    AlreadyMonitoring,

    #[error("no runners registered; run `register` first")]
    NothingToStart,

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Why the monitor loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// SIGINT/SIGTERM received.
    Interrupted,
    /// Idle timeout or max lifetime reached; clean shutdown.
    Expired,
}

/// Top-level status view rendered by the `status` subcommand.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub platform: String,
    pub scope: String,
    pub mode: String,
    pub pool_total: usize,
    pub pool_idle: usize,
    pub queue: Option<usize>,
    pub runners: Vec<RunnerSnapshot>,
    pub remote_runners: Vec<RemoteRunner>,
}

/// Binds platform client, inspectors, planner, pool, and runners.
pub struct Manager {
    config: Config,
    platform: Arc<dyn PlatformClient>,
    installer: Installer,
    cpu: CpuInventory,
    /// GPUs eligible for assignment (inference-only filter applied).
    gpus: Vec<GpuDescriptor>,
    planner: Option<ResourcePlanner>,
    plan: Option<ResourcePlan>,
    pool: Arc<Pool>,
    runners: BTreeMap<u32, Runner>,
    next_id: u32,
    settings: Arc<RunnerSettings>,
    exits_tx: mpsc::Sender<ChildExit>,
    exits_rx: Option<mpsc::Receiver<ChildExit>>,
}

impl Manager {
    /// Construct the orchestrator: build the platform client, inventory the
    /// host, provision emulation for every configured architecture, and
    /// compute the resource plan.
    pub async fn new(config: Config) -> Result<Self, ManagerError> {
        let platform = crate::platform::create(&config)?;
        let installer = Installer::new(
            crate::platform::build_http(DOWNLOAD_TIMEOUT)?,
            config.version.clone(),
            config.fallback_version.clone(),
            config.version_check_timeout,
        );

        let cpu = CpuInventory::detect();
        tracing::info!(
            model = %cpu.model,
            physical = cpu.physical_cores,
            logical = cpu.logical_cores,
            avx512 = cpu.avx512_capable(),
            amx = cpu.amx_capable(),
            "host CPU"
        );

        let gpus = if config.enable_gpu {
            let detected = GpuInspector::new().detect_all().await;
            let usable: Vec<GpuDescriptor> = if config.inference_only {
                detected
                    .into_iter()
                    .filter(|g| g.inference_capable)
                    .collect()
            } else {
                detected
            };
            tracing::info!(count = usable.len(), "GPUs eligible for assignment");
            usable
        } else {
            Vec::new()
        };

        let emulation =
            EmulationProvisioner::new(&config.emulation_method, config.emulation_auto_install);
        if config.enable_emulation {
            for &arch in &config.target_archs {
                emulation.ensure_emulation(arch, config.host_arch).await?;
            }
        }

        let (planner, plan) = if config.enable_resource_optimization {
            let planner = ResourcePlanner::from_host(cpu.clone());
            // Plan for the largest pool this process may run, so slices
            // stay stable as the pool grows.
            let target = match config.mode {
                Mode::Manual => config.runner_count,
                Mode::Auto => config.max_runners,
            };
            let plan = planner.plan(target, gpus.len());
            (Some(planner), Some(plan))
        } else {
            (None, None)
        };

        let settings = Arc::new(RunnerSettings::from_config(&config));
        let (exits_tx, exits_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            platform,
            installer,
            cpu,
            gpus,
            planner,
            plan,
            pool: Arc::new(Pool::new()),
            runners: BTreeMap::new(),
            next_id: 1,
            settings,
            exits_tx,
            exits_rx: Some(exits_rx),
        })
    }

    pub fn pool(&self) -> Arc<Pool> {
        Arc::clone(&self.pool)
    }

    /// Register `runner_count` runners, distributed across the configured
    /// architectures with the remainder going to the earliest ones.
    pub async fn register_runners(&mut self) -> Result<(), ManagerError> {
        let archs = self.config.target_archs.clone();
        let count = self.config.runner_count;
        let per_arch = count / archs.len();
        let remainder = count % archs.len();

        tracing::info!(count, archs = ?archs, "registering runners");

        let mut remaining = count;
        for (arch_index, &arch) in archs.iter().enumerate() {
            let for_this_arch = per_arch + usize::from(arch_index < remainder);
            for _ in 0..for_this_arch {
                let id = self.allocate_id();
                let mut runner = self.build_runner(id, arch);
                runner
                    .register(&self.installer, self.platform.as_ref())
                    .await?;
                telemetry::record_registration();
                self.runners.insert(id, runner);

                remaining -= 1;
                if self.config.deployment_strategy == DeploymentStrategy::Sequential
                    && remaining > 0
                {
                    tracing::debug!(
                        stagger_secs = self.config.deployment_stagger.as_secs(),
                        "staggering next registration"
                    );
                    tokio::time::sleep(self.config.deployment_stagger).await;
                }
            }
        }
        tracing::info!("all runners registered");
        Ok(())
    }

    /// Start every registered runner and place it in the pool.
    pub fn start_runners(&mut self) -> Result<(), ManagerError> {
        if self.runners.is_empty() {
            return Err(ManagerError::NothingToStart);
        }
        let ids: Vec<u32> = self.runners.keys().copied().collect();
        for id in ids {
            self.start_runner(id)?;
        }
        tracing::info!("all runners started");
        Ok(())
    }

    fn start_runner(&mut self, id: u32) -> Result<(), ManagerError> {
        let Some(runner) = self.runners.get_mut(&id) else {
            return Ok(());
        };
        runner.start(self.exits_tx.clone())?;
        self.pool.add(PoolEntry {
            id,
            name: runner.name.clone(),
            labels: runner.labels.clone(),
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Run the event loop until a signal or the controller asks to stop.
    /// The caller is expected to `shutdown()` afterwards.
    pub async fn monitor(&mut self) -> Result<MonitorOutcome, ManagerError> {
        let Some(mut exits_rx) = self.exits_rx.take() else {
            return Err(ManagerError::AlreadyMonitoring);
        };

        let cancel = CancellationToken::new();
        let (commands_tx, mut commands_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let controller = ScalingController::new(
            Arc::clone(&self.platform),
            Arc::clone(&self.pool),
            &self.config,
            commands_tx,
            cancel.child_token(),
        );
        let controller_handle = controller.spawn();

        let mut sigterm = signal(SignalKind::terminate())?;
        tracing::info!(mode = ?self.config.mode, "monitoring runners");

        let outcome = loop {
            tokio::select! {
                // Child exits are observed before scaling commands so
                // decisions always see the real pool state.
                biased;
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received, shutting down");
                    break MonitorOutcome::Interrupted;
                }
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received, shutting down");
                    break MonitorOutcome::Interrupted;
                }
                Some(exit) = exits_rx.recv() => {
                    self.handle_child_exit(exit);
                }
                command = commands_rx.recv() => match command {
                    Some(ScaleCommand::Add(n)) => self.scale_up(n).await,
                    Some(ScaleCommand::Remove(n)) => self.scale_down(n).await,
                    Some(ScaleCommand::Shutdown) | None => {
                        break MonitorOutcome::Expired;
                    }
                }
            }
        };

        cancel.cancel();
        let _ = controller_handle.await;
        self.exits_rx = Some(exits_rx);
        Ok(outcome)
    }

    fn handle_child_exit(&mut self, exit: ChildExit) {
        let Some(runner) = self.runners.get_mut(&exit.id) else {
            return;
        };
        let was_pooled = runner.is_running();
        runner.on_child_exit(exit.status);
        if was_pooled {
            self.pool.remove(exit.id);
            // Not restarted here; the next scaling tick sees the reduced
            // pool and re-adds as demand requires.
        }
    }

    async fn scale_up(&mut self, count: usize) {
        for _ in 0..count {
            if let Err(err) = self.check_disk_space() {
                tracing::warn!(error = %err, "refusing runner addition");
                telemetry::record_disk_refusal();
                return;
            }
            match self.add_runner().await {
                Ok(id) => tracing::info!(id, "runner added"),
                Err(err) => {
                    tracing::error!(error = %err, "failed to add runner");
                    return;
                }
            }
        }
    }

    async fn scale_down(&mut self, count: usize) {
        for id in self.pool.oldest_idle(count) {
            if let Err(err) = self.remove_runner(id).await {
                tracing::error!(id, error = %err, "failed to remove runner");
            }
        }
    }

    /// Register and start one new runner, selected for the next
    /// architecture in round-robin order.
    pub async fn add_runner(&mut self) -> Result<u32, ManagerError> {
        let archs = &self.config.target_archs;
        let arch = archs[self.pool.counts().total % archs.len()];

        let id = self.allocate_id();
        let mut runner = self.build_runner(id, arch);
        runner
            .register(&self.installer, self.platform.as_ref())
            .await?;
        telemetry::record_registration();

        if let Err(err) = runner.start(self.exits_tx.clone()) {
            // Roll back the platform registration; the directory follows
            // the usual cleanup policy.
            if let Err(dereg) = runner.deregister(self.platform.as_ref()).await {
                tracing::warn!(runner = %runner.name, error = %dereg,
                    "rollback deregistration failed");
            }
            return Err(err.into());
        }

        self.pool.add(PoolEntry {
            id,
            name: runner.name.clone(),
            labels: runner.labels.clone(),
            started_at: Instant::now(),
        });
        self.runners.insert(id, runner);
        Ok(id)
    }

    /// Stop, deregister, and clean one runner.
    pub async fn remove_runner(&mut self, id: u32) -> Result<(), ManagerError> {
        let Some(mut runner) = self.runners.remove(&id) else {
            return Ok(());
        };
        self.pool.remove(id);
        tracing::info!(runner = %runner.name, "removing runner");

        runner.stop().await?;
        runner.deregister(self.platform.as_ref()).await?;
        telemetry::record_deregistration();
        runner.cleanup().await?;
        Ok(())
    }

    /// Full teardown: stop every worker, deregister in parallel (the
    /// platform calls are independent), then clean install directories.
    /// Partial failures are logged, never fatal.
    pub async fn shutdown(&mut self) {
        tracing::info!(count = self.runners.len(), "shutting down runners");
        let mut runners: Vec<Runner> = std::mem::take(&mut self.runners)
            .into_values()
            .collect();

        for runner in &mut runners {
            self.pool.remove(runner.id);
            if let Err(err) = runner.stop().await {
                tracing::warn!(runner = %runner.name, error = %err, "stop failed");
            }
        }

        let platform = self.platform.as_ref();
        futures::future::join_all(runners.iter_mut().map(|runner| async move {
            match runner.deregister(platform).await {
                Ok(()) => telemetry::record_deregistration(),
                Err(err) => {
                    // Left as an offline record; a later run with
                    // replace-existing reclaims the name.
                    tracing::warn!(runner = %runner.name, error = %err, "deregistration failed");
                }
            }
        }))
        .await;

        for runner in &mut runners {
            if runner.state() == RunnerState::Deregistered {
                if let Err(err) = runner.cleanup().await {
                    tracing::warn!(runner = %runner.name, error = %err, "cleanup failed");
                }
            }
        }

        if self.config.clean_docker {
            self.docker_cleanup().await;
        }
        tracing::info!("shutdown complete");
    }

    /// Deregister leftover installations from a previous process run.
    ///
    /// Restart is equivalent to re-registration, so `stop` walks the
    /// install root's siblings, adopts every directory that still has the
    /// vendor scripts, and detaches it from the platform.
    pub async fn deregister_installed(&mut self) -> Result<usize, ManagerError> {
        let mut removed = 0;
        for (id, name, arch, dir) in self.scan_installed().await {
            let mut runner = Runner::adopt(id, name, arch, dir, Arc::clone(&self.settings));
            match runner.deregister(self.platform.as_ref()).await {
                Ok(()) => {
                    telemetry::record_deregistration();
                    if let Err(err) = runner.cleanup().await {
                        tracing::warn!(runner = %runner.name, error = %err, "cleanup failed");
                    }
                    removed += 1;
                }
                Err(err) => {
                    tracing::warn!(runner = %runner.name, error = %err, "deregistration failed");
                }
            }
        }
        Ok(removed)
    }

    /// Adopt registered installations from a previous run into this
    /// process so `start` can supervise them.
    pub async fn adopt_installed(&mut self) -> usize {
        let mut adopted = 0;
        for (found_id, name, arch, dir) in self.scan_installed().await {
            if self.runners.values().any(|r| r.install_dir == dir) {
                continue;
            }
            let id = if found_id == 0 || self.runners.contains_key(&found_id) {
                self.allocate_id()
            } else {
                self.next_id = self.next_id.max(found_id + 1);
                found_id
            };
            let mut runner = Runner::adopt(id, name, arch, dir, Arc::clone(&self.settings));
            let mut labels = self.platform.default_labels();
            labels.extend(self.config.labels.iter().cloned());
            labels.push(arch.as_str().to_string());
            dedup_preserving_order(&mut labels);
            runner.labels = labels;
            tracing::info!(runner = %runner.name, "adopted installation");
            self.runners.insert(id, runner);
            adopted += 1;
        }
        adopted
    }

    /// Installation directories next to the configured install root that
    /// still carry the vendor scripts, as `(id, name, arch, path)`.
    async fn scan_installed(&self) -> Vec<(u32, String, Arch, PathBuf)> {
        let base = &self.config.install_dir;
        let parent = base
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let prefix = format!(
            "{}-",
            base.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );

        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&parent).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %parent.display(), error = %err, "cannot scan install root");
                return found;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) {
                continue;
            }
            let dir = entry.path();
            if !dir.join(CONFIG_SCRIPT).is_file() {
                continue;
            }
            let id = name.rsplit('-').next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let arch = name
                .rsplit('-')
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(self.config.host_arch);
            found.push((id, name, arch, dir));
        }
        found.sort_by_key(|(id, ..)| *id);
        found
    }

    /// Current status, merged with the platform's view of the inventory.
    pub async fn status(&self) -> StatusReport {
        let queue = match self.platform.pending_work().await {
            Ok(queue) => Some(queue),
            Err(err) => {
                tracing::warn!(error = %err, "queue check failed");
                None
            }
        };
        let remote_runners = match self.platform.list_runners().await {
            Ok(remote) => remote,
            Err(err) => {
                tracing::warn!(error = %err, "inventory check failed");
                Vec::new()
            }
        };
        let counts = self.pool.counts();
        let runners = self
            .runners
            .values()
            .map(|runner| {
                let mut snapshot = runner.snapshot();
                if let Some(remote) = remote_runners.iter().find(|r| r.name == snapshot.name) {
                    snapshot.remote_status = Some(format!("{:?}", remote.status).to_lowercase());
                    snapshot.remote_busy = Some(remote.busy);
                }
                snapshot
            })
            .collect();
        StatusReport {
            generated_at: chrono::Utc::now(),
            platform: self.platform.name().to_string(),
            scope: self.config.scope().to_string(),
            mode: match self.config.mode {
                Mode::Auto => "auto".to_string(),
                Mode::Manual => "manual".to_string(),
            },
            pool_total: counts.total,
            pool_idle: counts.idle,
            queue,
            runners,
            remote_runners,
        }
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Compose one runner from the arch, GPU assignment, labels, and plan.
    fn build_runner(&self, id: u32, arch: Arch) -> Runner {
        // Ceiling assignment: at most one GPU per runner. Runners beyond
        // the GPU count share round-robin; surplus GPUs stay idle.
        let gpu = if self.gpus.is_empty() {
            None
        } else {
            Some(self.gpus[(id as usize - 1) % self.gpus.len()].clone())
        };

        let mut labels = self.platform.default_labels();
        labels.extend(self.config.labels.iter().cloned());
        labels.push(arch.as_str().to_string());
        match &gpu {
            Some(gpu) => labels.extend(gpu_labels(gpu)),
            None => labels.extend(self.cpu_labels()),
        }
        dedup_preserving_order(&mut labels);

        let limits = match (&self.planner, &self.plan) {
            (Some(planner), Some(plan)) => ResourceLimits {
                cpu_cores: plan.per_runner_cores,
                memory_bytes: plan.per_runner_memory,
                cpu_affinity: if self.config.use_cpu_affinity {
                    planner.affinity(id, plan.per_runner_cores)
                } else {
                    Vec::new()
                },
            },
            _ => ResourceLimits::default(),
        };

        let name = format!("{}-{}-{}", self.config.name_prefix, arch, id);
        let install_dir = self.install_dir_for(arch, id);

        if let Some(gpu) = &gpu {
            tracing::info!(runner = %name, gpu = %gpu, "GPU assigned");
        }

        Runner::new(
            id,
            name,
            arch,
            install_dir,
            labels,
            gpu,
            limits,
            Arc::clone(&self.settings),
        )
    }

    /// CPU-derived capability tags for runners without a GPU.
    fn cpu_labels(&self) -> Vec<String> {
        let mut labels = Vec::new();
        if self.cpu.avx512_capable() {
            labels.push("avx512".to_string());
        }
        if self.cpu.amx_capable() {
            labels.push("amx".to_string());
        }
        if self.cpu.workload_fit(Workload::Inference) {
            labels.push("inference".to_string());
        }
        if self.cpu.workload_fit(Workload::Training) {
            labels.push("training".to_string());
        }
        labels
    }

    /// Exclusive install directory `<base>-<arch>-<id>`.
    fn install_dir_for(&self, arch: Arch, id: u32) -> PathBuf {
        let base = &self.config.install_dir;
        let name = format!(
            "{}-{}-{}",
            base.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            arch,
            id
        );
        base.parent()
            .map(|p| p.join(&name))
            .unwrap_or_else(|| PathBuf::from(name))
    }

    /// Refuse additions when the install root is low on space.
    fn check_disk_space(&self) -> Result<(), String> {
        let required_gb = self.config.disk_min_free_gb;
        if required_gb == 0 {
            return Ok(());
        }
        let Some(available) = free_space_for(&self.config.install_dir) else {
            return Ok(());
        };
        let available_gb = available / (1024 * 1024 * 1024);
        if available_gb < required_gb {
            return Err(format!(
                "{available_gb} GiB free on install root, {required_gb} GiB required"
            ));
        }
        Ok(())
    }

    /// Prune container images when disk is below the cleanup threshold.
    async fn docker_cleanup(&self) {
        if which::which("docker").is_err() {
            return;
        }
        let Some(available) = free_space_for(&self.config.install_dir) else {
            return;
        };
        let available_gb = available / (1024 * 1024 * 1024);
        if available_gb >= self.config.disk_cleanup_threshold_gb {
            tracing::debug!(available_gb, "disk space ok, skipping docker cleanup");
            return;
        }
        tracing::warn!(available_gb, "low disk space, pruning docker resources");
        match tokio::process::Command::new("docker")
            .args(["system", "prune", "-a", "-f"])
            .output()
            .await
        {
            Ok(output) if !output.status.success() => {
                tracing::warn!(
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "docker prune failed"
                );
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "docker prune failed"),
        }
    }
}

/// Free bytes on the filesystem holding `path`, by longest mount prefix.
fn free_space_for(path: &Path) -> Option<u64> {
    let absolute = path
        .canonicalize()
        .or_else(|_| std::env::current_dir().map(|d| d.join(path)))
        .ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| absolute.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

fn dedup_preserving_order(labels: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    labels.retain(|label| seen.insert(label.clone()));
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
