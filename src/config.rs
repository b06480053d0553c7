// Copyright 2024-2026 Runnerd Contributors
// SPDX-License-Identifier: Apache-2.0

//! Orchestrator configuration.
//!
//! Options are read from the process environment merged over a `.env` file;
//! the environment always wins (dotenv never overrides a variable that is
//! already set). `Config::load` cannot fail; `validate` reports everything
//! that is missing or inconsistent before a subcommand runs.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// CPU architecture in vendor-archive naming.
///
/// Parsing accepts the kernel aliases (`x86_64`/`amd64`, `aarch64`) so that
/// `uname -m` output and user configuration normalize to the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X64,
    Arm64,
    Riscv64,
}

impl Arch {
    /// Architecture of the machine this process runs on.
    pub fn host() -> Self {
        match std::env::consts::ARCH {
            "aarch64" => Arch::Arm64,
            "riscv64" => Arch::Riscv64,
            _ => Arch::X64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::Arm64 => "arm64",
            Arch::Riscv64 => "riscv64",
        }
    }

    /// QEMU user-mode binary suffix (`qemu-<this>`).
    pub fn qemu_name(&self) -> &'static str {
        match self {
            Arch::X64 => "x86_64",
            Arch::Arm64 => "aarch64",
            Arch::Riscv64 => "riscv64",
        }
    }

    /// OCI platform tag used for emulation verification containers.
    pub fn platform_tag(&self) -> &'static str {
        match self {
            Arch::X64 => "linux/amd64",
            Arch::Arm64 => "linux/arm64",
            Arch::Riscv64 => "linux/riscv64",
        }
    }

    /// Machine string `uname -m` reports on this architecture.
    pub fn machine_name(&self) -> &'static str {
        self.qemu_name()
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x64" | "x86_64" | "amd64" => Ok(Arch::X64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "riscv64" => Ok(Arch::Riscv64),
            other => Err(format!("unknown architecture: {other}")),
        }
    }
}

/// Which platform implementation backs the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformKind {
    Github,
    Gitlab,
    Gitea,
}

impl PlatformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Github => "github",
            PlatformKind::Gitlab => "gitlab",
            PlatformKind::Gitea => "gitea",
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(PlatformKind::Github),
            "gitlab" => Ok(PlatformKind::Gitlab),
            "gitea" => Ok(PlatformKind::Gitea),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

/// Lifecycle mode: autoscaling or fixed pool with idle timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Auto,
    Manual,
}

/// How multiple runners are brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStrategy {
    Sequential,
    Parallel,
}

/// Complete orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // Platform
    pub platform: PlatformKind,
    pub api_url: String,
    pub repository: String,
    pub project_id: String,
    pub token: String,

    // Runner identity
    pub name_prefix: String,
    pub labels: Vec<String>,
    pub work_dir: String,

    // Lifecycle
    pub mode: Mode,
    pub idle_timeout: Duration,
    pub check_interval: Duration,
    pub max_lifetime: Duration,

    // Pool
    pub runner_count: usize,
    pub min_runners: usize,
    pub max_runners: usize,
    pub scale_up_threshold: usize,
    pub scale_down_threshold: usize,
    pub scale_cooldown: Duration,
    pub deployment_strategy: DeploymentStrategy,
    pub deployment_stagger: Duration,

    // Installation
    pub install_dir: PathBuf,
    pub version: String,
    pub fallback_version: String,

    // Architectures
    pub host_arch: Arch,
    pub target_archs: Vec<Arch>,
    pub enable_emulation: bool,
    pub emulation_auto_install: bool,
    pub emulation_method: String,

    // Hardware
    pub enable_gpu: bool,
    pub inference_only: bool,
    pub enable_resource_optimization: bool,
    pub use_cpu_affinity: bool,

    // Vendor flags
    pub ephemeral: bool,
    pub replace_existing: bool,
    pub disable_auto_update: bool,
    pub additional_flags: Vec<String>,

    // Cleanup
    pub clean_on_deregister: bool,
    pub clean_docker: bool,
    pub disk_cleanup_threshold_gb: u64,
    pub disk_min_free_gb: u64,

    // Timeouts
    pub api_timeout: Duration,
    pub version_check_timeout: Duration,

    // Logging
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the environment, after merging a `.env` file
    /// when one is present in the working directory.
    pub fn load() -> Self {
        // dotenvy only sets variables that are not already in the
        // environment, which gives env-over-file precedence for free.
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env file");
        }
        Self::from_env()
    }

    /// Build the configuration from the current process environment only.
    pub fn from_env() -> Self {
        let host_arch = env_str("RUNNER_ARCH", "")
            .parse()
            .unwrap_or_else(|_| Arch::host());

        let default_prefix = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .map(|h| format!("{h}-runner"))
            .unwrap_or_else(|| "runnerd".to_string());

        Self {
            platform: env_str("RUNNER_PLATFORM", "github")
                .parse()
                .unwrap_or(PlatformKind::Github),
            api_url: env_str("RUNNER_API_URL", ""),
            repository: env_str("RUNNER_REPOSITORY", ""),
            project_id: env_str("RUNNER_PROJECT_ID", ""),
            token: env_str("RUNNER_TOKEN", ""),

            name_prefix: env_str("RUNNER_NAME_PREFIX", &default_prefix),
            labels: env_list("RUNNER_LABELS"),
            work_dir: env_str("RUNNER_WORK_DIR", "_work"),

            mode: match env_str("RUNNER_MODE", "auto").as_str() {
                "manual" => Mode::Manual,
                _ => Mode::Auto,
            },
            idle_timeout: Duration::from_secs(env_parse("RUNNER_IDLE_TIMEOUT", 300)),
            check_interval: Duration::from_secs(env_parse("RUNNER_CHECK_INTERVAL", 30)),
            max_lifetime: Duration::from_secs(env_parse("RUNNER_MAX_LIFETIME", 0)),

            runner_count: env_parse("RUNNER_COUNT", 1),
            min_runners: env_parse("RUNNER_MIN_RUNNERS", 1),
            max_runners: env_parse("RUNNER_MAX_RUNNERS", 10),
            scale_up_threshold: env_parse("RUNNER_SCALE_UP_THRESHOLD", 2),
            scale_down_threshold: env_parse("RUNNER_SCALE_DOWN_THRESHOLD", 0),
            scale_cooldown: Duration::from_secs(env_parse("RUNNER_SCALE_COOLDOWN", 60)),
            deployment_strategy: match env_str("RUNNER_DEPLOYMENT_STRATEGY", "sequential").as_str()
            {
                "parallel" => DeploymentStrategy::Parallel,
                _ => DeploymentStrategy::Sequential,
            },
            deployment_stagger: Duration::from_secs(env_parse("RUNNER_DEPLOYMENT_STAGGER", 5)),

            install_dir: PathBuf::from(env_str("RUNNER_INSTALL_DIR", "./actions-runner")),
            version: env_str("RUNNER_VERSION", "latest"),
            fallback_version: env_str("RUNNER_FALLBACK_VERSION", "2.319.0"),

            host_arch,
            target_archs: {
                let archs: Vec<Arch> = env_str("RUNNER_TARGET_ARCHITECTURES", "")
                    .split(',')
                    .filter_map(|s| s.trim().parse().ok())
                    .collect();
                if archs.is_empty() {
                    vec![host_arch]
                } else {
                    archs
                }
            },
            enable_emulation: env_bool("RUNNER_ENABLE_EMULATION", true),
            emulation_auto_install: env_bool("RUNNER_EMULATION_AUTO_INSTALL", false),
            emulation_method: env_str("RUNNER_EMULATION_METHOD", "auto"),

            enable_gpu: env_bool("RUNNER_ENABLE_GPU", false),
            inference_only: env_bool("RUNNER_INFERENCE_ONLY", false),
            enable_resource_optimization: env_bool("RUNNER_ENABLE_RESOURCE_OPTIMIZATION", false),
            use_cpu_affinity: env_bool("RUNNER_USE_CPU_AFFINITY", false),

            ephemeral: env_bool("RUNNER_EPHEMERAL", false),
            replace_existing: env_bool("RUNNER_REPLACE_EXISTING", false),
            disable_auto_update: env_bool("RUNNER_DISABLE_AUTO_UPDATE", false),
            additional_flags: env_str("RUNNER_ADDITIONAL_FLAGS", "")
                .split_whitespace()
                .map(str::to_string)
                .collect(),

            clean_on_deregister: env_bool("RUNNER_CLEAN_ON_DEREGISTER", true),
            clean_docker: env_bool("RUNNER_CLEAN_DOCKER", false),
            disk_cleanup_threshold_gb: env_parse("RUNNER_DISK_CLEANUP_THRESHOLD_GB", 10),
            disk_min_free_gb: env_parse("RUNNER_DISK_MIN_FREE_GB", 20),

            api_timeout: Duration::from_secs(env_parse("RUNNER_API_TIMEOUT", 30)),
            version_check_timeout: Duration::from_secs(env_parse("RUNNER_VERSION_CHECK_TIMEOUT", 10)),

            log_file: {
                let path = env_str("RUNNER_LOG_FILE", "");
                if path.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(path))
                }
            },
        }
    }

    /// The repository or project identifier used to scope API calls.
    pub fn scope(&self) -> &str {
        match self.platform {
            PlatformKind::Gitlab => &self.project_id,
            _ => &self.repository,
        }
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.token.is_empty() {
            errors.push("RUNNER_TOKEN is required".to_string());
        }
        match self.platform {
            PlatformKind::Gitlab => {
                if self.project_id.is_empty() {
                    errors.push("RUNNER_PROJECT_ID is required for gitlab".to_string());
                }
            }
            _ => {
                if self.repository.is_empty() {
                    errors.push("RUNNER_REPOSITORY is required".to_string());
                }
            }
        }
        if self.runner_count < 1 {
            errors.push(format!(
                "RUNNER_COUNT must be >= 1 (got {})",
                self.runner_count
            ));
        }
        if self.min_runners > self.max_runners {
            errors.push(format!(
                "RUNNER_MIN_RUNNERS ({}) exceeds RUNNER_MAX_RUNNERS ({})",
                self.min_runners, self.max_runners
            ));
        }
        if self.check_interval.is_zero() {
            errors.push("RUNNER_CHECK_INTERVAL must be > 0".to_string());
        }

        errors
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
