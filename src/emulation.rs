// Copyright 2024-2026 Runnerd Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cross-architecture emulation provisioning.
//!
//! Non-native runner architectures need the kernel's binfmt_misc registry
//! to dispatch foreign binaries to QEMU. The provisioner checks the
//! registry, provisions handlers through a container runtime (the
//! `multiarch/qemu-user-static` image registers them system-wide), falls
//! back to a native package install when permitted, and verifies the result
//! by running `uname -m` inside a minimal container for the target
//! platform. The registry is process-wide and additive, so every step is
//! safe to repeat.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use crate::config::Arch;

const PROVISION_IMAGE: &str = "multiarch/qemu-user-static";
const VERIFY_IMAGE: &str = "alpine:latest";
const PROVISION_TIMEOUT: Duration = Duration::from_secs(120);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(90);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum EmulationError {
    #[error("emulation unavailable for {arch}: {reason}")]
    Unavailable { arch: Arch, reason: String },
}

impl EmulationError {
    fn unavailable(arch: Arch, reason: impl Into<String>) -> Self {
        EmulationError::Unavailable {
            arch,
            reason: reason.into(),
        }
    }
}

/// Container runtime used for provisioning and verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    pub fn command(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }

    /// First runtime found on PATH, docker preferred.
    pub fn detect() -> Option<Self> {
        for runtime in [ContainerRuntime::Docker, ContainerRuntime::Podman] {
            if which::which(runtime.command()).is_ok() {
                return Some(runtime);
            }
        }
        None
    }
}

/// Provisions binfmt_misc handlers for foreign architectures.
pub struct EmulationProvisioner {
    runtime: Option<ContainerRuntime>,
    auto_install: bool,
}

impl EmulationProvisioner {
    /// `method` selects the runtime: `docker`, `podman`, `qemu` (native
    /// only), or `auto` to probe PATH.
    pub fn new(method: &str, auto_install: bool) -> Self {
        let runtime = match method {
            "docker" => Some(ContainerRuntime::Docker),
            "podman" => Some(ContainerRuntime::Podman),
            "qemu" => None,
            _ => ContainerRuntime::detect(),
        };
        if let Some(rt) = runtime {
            tracing::info!(runtime = rt.command(), "emulation via container runtime");
        } else {
            tracing::info!("emulation via native QEMU only");
        }
        Self {
            runtime,
            auto_install,
        }
    }

    /// Whether `target` requires emulation on `host`, after normalizing the
    /// architecture aliases (x64 == amd64 == x86_64, arm64 == aarch64).
    pub fn is_emulation_needed(target: Arch, host: Arch) -> bool {
        target != host
    }

    /// Ensure binfmt handlers for `target` are registered and working.
    ///
    /// No-op when the target is native. Idempotent: a second call on a
    /// provisioned host stops at the registry probe and issues no
    /// package-manager or container commands.
    pub async fn ensure_emulation(&self, target: Arch, host: Arch) -> Result<(), EmulationError> {
        if !Self::is_emulation_needed(target, host) {
            tracing::debug!(%target, %host, "no emulation needed");
            return Ok(());
        }

        tracing::info!(%target, %host, "checking emulation support");

        if self.binfmt_enabled(target).await {
            tracing::info!(%target, "binfmt handler already registered");
            return Ok(());
        }

        if let Some(runtime) = self.runtime {
            self.provision_via_container(runtime, target).await?;
        } else if self.auto_install {
            self.provision_via_package(target).await?;
        } else {
            return Err(EmulationError::unavailable(
                target,
                "no binfmt handler, no container runtime, and auto-install disabled",
            ));
        }

        self.verify(target).await
    }

    /// Probe the kernel registry for an enabled qemu handler.
    async fn binfmt_enabled(&self, target: Arch) -> bool {
        let path = format!("/proc/sys/fs/binfmt_misc/qemu-{}", target.qemu_name());
        match tokio::fs::read_to_string(Path::new(&path)).await {
            Ok(content) => content.lines().next() == Some("enabled"),
            Err(_) => false,
        }
    }

    /// Register handlers system-wide with the well-known provisioning image.
    async fn provision_via_container(
        &self,
        runtime: ContainerRuntime,
        target: Arch,
    ) -> Result<(), EmulationError> {
        tracing::info!(runtime = runtime.command(), %target, "registering binfmt handlers");
        let output = run_command(
            runtime.command(),
            &[
                "run", "--rm", "--privileged", PROVISION_IMAGE, "--reset", "-p", "yes",
            ],
            PROVISION_TIMEOUT,
        )
        .await
        .map_err(|e| EmulationError::unavailable(target, e))?;

        if !output.status.success() {
            return Err(EmulationError::unavailable(
                target,
                format!(
                    "provisioning image failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }

    /// Install the QEMU user-static package and enable the handler natively.
    async fn provision_via_package(&self, target: Arch) -> Result<(), EmulationError> {
        if which::which("apt-get").is_err() {
            return Err(EmulationError::unavailable(
                target,
                "no supported package manager found",
            ));
        }
        tracing::info!(%target, "installing qemu-user-static");

        for args in [
            vec!["apt-get", "update"],
            vec!["apt-get", "install", "-y", "qemu-user-static", "binfmt-support"],
        ] {
            let mut cmd = vec!["sudo"];
            cmd.extend(args);
            let output = run_command(cmd[0], &cmd[1..], INSTALL_TIMEOUT)
                .await
                .map_err(|e| EmulationError::unavailable(target, e))?;
            if !output.status.success() {
                return Err(EmulationError::unavailable(
                    target,
                    format!(
                        "package install failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                ));
            }
        }

        let enable = run_command(
            "sudo",
            &[
                "update-binfmts",
                "--enable",
                &format!("qemu-{}", target.qemu_name()),
            ],
            Duration::from_secs(10),
        )
        .await
        .map_err(|e| EmulationError::unavailable(target, e))?;
        if !enable.status.success() {
            return Err(EmulationError::unavailable(
                target,
                "update-binfmts --enable failed",
            ));
        }
        Ok(())
    }

    /// Run `uname -m` for the target platform and compare the machine name.
    ///
    /// Without a container runtime the registry probe is the best evidence
    /// available, so a successful probe passes verification.
    async fn verify(&self, target: Arch) -> Result<(), EmulationError> {
        let Some(runtime) = self.runtime else {
            if self.binfmt_enabled(target).await {
                return Ok(());
            }
            return Err(EmulationError::unavailable(
                target,
                "binfmt handler not registered after provisioning",
            ));
        };

        tracing::info!(%target, platform = target.platform_tag(), "verifying emulation");
        let output = run_command(
            runtime.command(),
            &[
                "run",
                "--rm",
                "--platform",
                target.platform_tag(),
                VERIFY_IMAGE,
                "uname",
                "-m",
            ],
            VERIFY_TIMEOUT,
        )
        .await
        .map_err(|e| EmulationError::unavailable(target, e))?;

        if !output.status.success() {
            return Err(EmulationError::unavailable(
                target,
                format!(
                    "verification container failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        let machine = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if machine != target.machine_name() {
            return Err(EmulationError::unavailable(
                target,
                format!(
                    "verification reported '{machine}', expected '{}'",
                    target.machine_name()
                ),
            ));
        }
        tracing::info!(%target, %machine, "emulation verified");
        Ok(())
    }
}

async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<std::process::Output, String> {
    let result = tokio::time::timeout(
        timeout,
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output(),
    )
    .await;
    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(format!("{program} failed to start: {err}")),
        Err(_) => Err(format!("{program} timed out after {timeout:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_architectures_need_no_emulation() {
        assert!(!EmulationProvisioner::is_emulation_needed(
            Arch::X64,
            Arch::X64
        ));
        assert!(!EmulationProvisioner::is_emulation_needed(
            Arch::Arm64,
            Arch::Arm64
        ));
        assert!(EmulationProvisioner::is_emulation_needed(
            Arch::Arm64,
            Arch::X64
        ));
        assert!(EmulationProvisioner::is_emulation_needed(
            Arch::Riscv64,
            Arch::X64
        ));
    }

    #[test]
    fn alias_equivalence_is_handled_at_parse_time() {
        // "amd64" and "x86_64" both normalize to X64, so the needed-check
        // sees them as the same architecture.
        let amd64: Arch = "amd64".parse().unwrap();
        let x86_64: Arch = "x86_64".parse().unwrap();
        assert!(!EmulationProvisioner::is_emulation_needed(amd64, x86_64));

        let aarch64: Arch = "aarch64".parse().unwrap();
        assert!(!EmulationProvisioner::is_emulation_needed(
            aarch64,
            Arch::Arm64
        ));
    }

    #[tokio::test]
    async fn native_target_is_a_noop() {
        let provisioner = EmulationProvisioner::new("qemu", false);
        provisioner
            .ensure_emulation(Arch::X64, Arch::X64)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unprovisioned_host_without_fallbacks_fails() {
        // "qemu" method with auto-install off leaves only the registry
        // probe. Skip when the host actually has a riscv64 handler.
        if std::path::Path::new("/proc/sys/fs/binfmt_misc/qemu-riscv64").exists() {
            return;
        }
        let provisioner = EmulationProvisioner::new("qemu", false);
        let err = provisioner.ensure_emulation(Arch::Riscv64, Arch::X64).await;
        assert!(matches!(err, Err(EmulationError::Unavailable { .. })));
    }
}
