// Copyright 2024-2026 Runnerd Contributors
// SPDX-License-Identifier: Apache-2.0

//! Runner lifecycle state machine.
//!
//! One `Runner` owns one worker: an exclusive install directory, the
//! vendor-script invocations that attach it to the platform, and the
//! supervised child process. Transitions are monotone along
//! Uninstalled -> Installed -> Registered -> Running -> Draining ->
//! Deregistered -> Cleaned; the single backward edge is the recovery to
//! Uninstalled when a registered runner's install directory disappears.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::config::{Arch, Config};
use crate::hardware::GpuDescriptor;
use crate::install::{Installer, CONFIG_SCRIPT, RUN_SCRIPT};
use crate::platform::{ApiError, PlatformClient};
use crate::telemetry;

/// Grace period between SIGTERM and SIGKILL while draining.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Post-SIGKILL reap window.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunnerState {
    Uninstalled,
    Installed,
    Registered,
    Running,
    Draining,
    Deregistered,
    Cleaned,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerState::Uninstalled => "uninstalled",
            RunnerState::Installed => "installed",
            RunnerState::Registered => "registered",
            RunnerState::Running => "running",
            RunnerState::Draining => "draining",
            RunnerState::Deregistered => "deregistered",
            RunnerState::Cleaned => "cleaned",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("cannot {op} runner {name} while {state}")]
    InvalidTransition {
        op: &'static str,
        name: String,
        state: RunnerState,
    },

    #[error(transparent)]
    Install(#[from] crate::install::InstallError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("{script} exited with status {status}: {stderr}")]
    Script {
        script: &'static str,
        status: i32,
        stderr: String,
    },

    #[error("missing entry point: {0}")]
    MissingScript(PathBuf),

    #[error("spawn failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-runner resource ceilings. Zero / empty means unlimited.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    pub cpu_cores: usize,
    pub memory_bytes: u64,
    pub cpu_affinity: Vec<usize>,
}

/// Vendor-script options shared by every runner of one deployment.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub work_dir: String,
    pub ephemeral: bool,
    pub replace_existing: bool,
    pub disable_auto_update: bool,
    pub additional_flags: Vec<String>,
    pub clean_on_deregister: bool,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            ephemeral: config.ephemeral,
            replace_existing: config.replace_existing,
            disable_auto_update: config.disable_auto_update,
            additional_flags: config.additional_flags.clone(),
            clean_on_deregister: config.clean_on_deregister,
        }
    }
}

/// Delivered to the manager when a supervised child exits.
#[derive(Debug, Clone, Copy)]
pub struct ChildExit {
    pub id: u32,
    /// Exit code, `None` when killed by signal.
    pub status: Option<i32>,
}

/// Handle to the supervised child process.
///
/// The `tokio::process::Child` itself lives in the supervisor task; this
/// handle carries the pid for signalling and a watch channel that flips
/// when the child has been reaped.
struct ChildHandle {
    pid: i32,
    exited: watch::Receiver<bool>,
}

impl ChildHandle {
    fn signal(&self, signal: i32) {
        // Best-effort; ESRCH just means the child already exited.
        unsafe {
            libc::kill(self.pid, signal);
        }
    }

    async fn wait_exited(&mut self) {
        let _ = self.exited.wait_for(|exited| *exited).await;
    }
}

/// One managed worker.
pub struct Runner {
    pub id: u32,
    pub name: String,
    pub target_arch: Arch,
    pub install_dir: PathBuf,
    pub labels: Vec<String>,
    pub gpu: Option<GpuDescriptor>,
    pub limits: ResourceLimits,
    settings: Arc<RunnerSettings>,
    state: RunnerState,
    child: Option<ChildHandle>,
    start_time: Option<Instant>,
}

/// Serializable snapshot for status output.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerSnapshot {
    pub id: u32,
    pub name: String,
    pub arch: String,
    pub state: String,
    pub install_dir: String,
    pub labels: Vec<String>,
    pub pid: Option<i32>,
    pub uptime_secs: Option<u64>,
    pub gpu: Option<String>,
    /// Platform-side view, filled in by the manager's status merge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_busy: Option<bool>,
}

impl Runner {
    pub fn new(
        id: u32,
        name: String,
        target_arch: Arch,
        install_dir: PathBuf,
        labels: Vec<String>,
        gpu: Option<GpuDescriptor>,
        limits: ResourceLimits,
        settings: Arc<RunnerSettings>,
    ) -> Self {
        Self {
            id,
            name,
            target_arch,
            install_dir,
            labels,
            gpu,
            limits,
            settings,
            state: RunnerState::Uninstalled,
            child: None,
            start_time: None,
        }
    }

    /// Adopt an installation left behind by a previous process run.
    ///
    /// The runner starts out `Registered` so it can be deregistered and
    /// cleaned through the normal transitions.
    pub fn adopt(
        id: u32,
        name: String,
        target_arch: Arch,
        install_dir: PathBuf,
        settings: Arc<RunnerSettings>,
    ) -> Self {
        let mut runner = Self::new(
            id,
            name,
            target_arch,
            install_dir,
            Vec::new(),
            None,
            ResourceLimits::default(),
            settings,
        );
        runner.state = RunnerState::Registered;
        runner
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunnerState::Running | RunnerState::Draining)
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    /// The single permitted backward edge: a registered runner whose
    /// install directory vanished drops back to Uninstalled.
    pub fn reconcile_install_dir(&mut self) {
        if self.state == RunnerState::Registered && !self.install_dir.exists() {
            tracing::warn!(
                runner = %self.name,
                dir = %self.install_dir.display(),
                "install directory lost, reverting to uninstalled"
            );
            self.state = RunnerState::Uninstalled;
        }
    }

    /// Install the vendor archive and attach to the platform.
    ///
    /// Failures after installation leave the runner `Installed` so the
    /// caller may retry registration without re-downloading.
    pub async fn register(
        &mut self,
        installer: &Installer,
        platform: &dyn PlatformClient,
    ) -> Result<(), RunnerError> {
        if !matches!(
            self.state,
            RunnerState::Uninstalled | RunnerState::Installed
        ) {
            return Err(self.invalid("register"));
        }

        tracing::info!(runner = %self.name, arch = %self.target_arch, "registering runner");
        installer.install(self.target_arch, &self.install_dir).await?;
        self.state = RunnerState::Installed;

        let token = platform.registration_token().await?;

        let mut args: Vec<String> = vec![
            "--url".into(),
            platform.registration_url(),
            "--token".into(),
            token.token,
            "--name".into(),
            self.name.clone(),
            "--labels".into(),
            self.labels.join(","),
            "--work".into(),
            self.settings.work_dir.clone(),
            "--unattended".into(),
        ];
        if self.settings.replace_existing {
            args.push("--replace".into());
        }
        if self.settings.ephemeral {
            args.push("--ephemeral".into());
        }
        if self.settings.disable_auto_update {
            args.push("--disableupdate".into());
        }
        args.extend(self.settings.additional_flags.iter().cloned());

        self.run_config_script(&args).await?;
        self.state = RunnerState::Registered;
        tracing::info!(runner = %self.name, "runner registered");
        Ok(())
    }

    /// Spawn the worker under the configured resource limits.
    pub fn start(&mut self, exits: mpsc::Sender<ChildExit>) -> Result<(), RunnerError> {
        if self.state != RunnerState::Registered {
            return Err(self.invalid("start"));
        }
        let run_script = self.install_dir.join(RUN_SCRIPT);
        if !run_script.is_file() {
            return Err(RunnerError::MissingScript(run_script));
        }

        let mut cmd = Command::new(&run_script);
        cmd.current_dir(&self.install_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.apply_limits(&mut cmd);

        let mut child = cmd.spawn()?;
        let pid = child.id().map(|p| p as i32).unwrap_or(-1);

        // Worker output is forwarded for observability, never parsed.
        if let Some(stdout) = child.stdout.take() {
            forward_output(self.name.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(self.name.clone(), "stderr", stderr);
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        let id = self.id;
        let name = self.name.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = status.as_ref().ok().and_then(|s| s.code());
            tracing::info!(runner = %name, code = ?code, "worker process exited");
            let _ = exited_tx.send(true);
            let _ = exits.send(ChildExit { id, status: code }).await;
        });

        self.child = Some(ChildHandle {
            pid,
            exited: exited_rx,
        });
        self.start_time = Some(Instant::now());
        self.state = RunnerState::Running;
        tracing::info!(runner = %self.name, pid, "runner started");
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn apply_limits(&self, cmd: &mut Command) {
        let affinity = self.limits.cpu_affinity.clone();
        let memory = self.limits.memory_bytes;
        if affinity.is_empty() && memory == 0 {
            return;
        }
        unsafe {
            cmd.pre_exec(move || {
                if !affinity.is_empty() {
                    let mut set: libc::cpu_set_t = std::mem::zeroed();
                    libc::CPU_ZERO(&mut set);
                    for cpu in &affinity {
                        libc::CPU_SET(*cpu, &mut set);
                    }
                    if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
                        != 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if memory > 0 {
                    let limit = libc::rlimit {
                        rlim_cur: memory as libc::rlim_t,
                        rlim_max: memory as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_limits(&self, _cmd: &mut Command) {
        if !self.limits.cpu_affinity.is_empty() || self.limits.memory_bytes > 0 {
            tracing::debug!(runner = %self.name, "resource limits unsupported on this OS");
        }
    }

    /// SIGTERM the worker and drain; escalate to SIGKILL after 30 s.
    /// A runner without a child is a no-op.
    pub async fn stop(&mut self) -> Result<(), RunnerError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        self.state = RunnerState::Draining;
        tracing::info!(runner = %self.name, pid = child.pid, "stopping runner");

        child.signal(libc::SIGTERM);
        if tokio::time::timeout(DRAIN_TIMEOUT, child.wait_exited())
            .await
            .is_err()
        {
            tracing::warn!(runner = %self.name, "drain timed out, sending SIGKILL");
            child.signal(libc::SIGKILL);
            let _ = tokio::time::timeout(REAP_TIMEOUT, child.wait_exited()).await;
        }

        self.state = RunnerState::Registered;
        self.start_time = None;
        tracing::info!(runner = %self.name, "runner stopped");
        Ok(())
    }

    /// Record that the supervised child exited on its own.
    pub fn on_child_exit(&mut self, status: Option<i32>) {
        if !self.is_running() {
            // stop() already reconciled this exit.
            return;
        }
        let clean = status == Some(0);
        if !clean {
            tracing::warn!(runner = %self.name, status = ?status, "worker crashed");
        }
        telemetry::record_child_exit(clean);
        self.child = None;
        self.start_time = None;
        self.state = RunnerState::Registered;
    }

    /// Detach from the platform.
    ///
    /// Best-effort reconciliation: when the platform is unreachable but the
    /// install directory is already gone there is nothing left to remove
    /// locally, so the runner counts as deregistered.
    pub async fn deregister(
        &mut self,
        platform: &dyn PlatformClient,
    ) -> Result<(), RunnerError> {
        if self.state != RunnerState::Registered {
            return Err(self.invalid("deregister"));
        }

        let config_script = self.install_dir.join(CONFIG_SCRIPT);
        if !config_script.is_file() {
            tracing::warn!(runner = %self.name, "config script missing, skipping deregistration");
            self.state = RunnerState::Deregistered;
            return Ok(());
        }

        let token = match platform.removal_token().await {
            Ok(token) => token,
            Err(err) if !self.install_dir.exists() => {
                tracing::warn!(runner = %self.name, error = %err,
                    "platform unreachable and install dir gone, treating as deregistered");
                self.state = RunnerState::Deregistered;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        self.run_config_script(&["remove".into(), "--token".into(), token])
            .await?;
        self.state = RunnerState::Deregistered;
        tracing::info!(runner = %self.name, "runner deregistered");
        Ok(())
    }

    /// Remove the install directory when the cleanup policy allows it.
    pub async fn cleanup(&mut self) -> Result<(), RunnerError> {
        if self.state != RunnerState::Deregistered {
            return Err(self.invalid("cleanup"));
        }
        if self.settings.clean_on_deregister && self.install_dir.exists() {
            tracing::info!(runner = %self.name, dir = %self.install_dir.display(),
                "removing install directory");
            tokio::fs::remove_dir_all(&self.install_dir).await?;
        }
        self.state = RunnerState::Cleaned;
        Ok(())
    }

    pub fn snapshot(&self) -> RunnerSnapshot {
        RunnerSnapshot {
            id: self.id,
            name: self.name.clone(),
            arch: self.target_arch.to_string(),
            state: self.state.to_string(),
            install_dir: self.install_dir.display().to_string(),
            labels: self.labels.clone(),
            pid: self.child.as_ref().map(|c| c.pid),
            uptime_secs: self.start_time.map(|t| t.elapsed().as_secs()),
            gpu: self.gpu.as_ref().map(|g| g.to_string()),
            remote_status: None,
            remote_busy: None,
        }
    }

    async fn run_config_script(&self, args: &[String]) -> Result<(), RunnerError> {
        let script = self.install_dir.join(CONFIG_SCRIPT);
        if !script.is_file() {
            return Err(RunnerError::MissingScript(script));
        }
        let output = Command::new(&script)
            .args(args)
            .current_dir(&self.install_dir)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(RunnerError::Script {
                script: CONFIG_SCRIPT,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn invalid(&self, op: &'static str) -> RunnerError {
        RunnerError::InvalidTransition {
            op,
            name: self.name.clone(),
            state: self.state,
        }
    }
}

fn forward_output<R>(name: String, stream: &'static str, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(runner = %name, stream, "{line}");
        }
    });
}

#[cfg(test)]
#[path = "fsm_tests.rs"]
mod tests;
