// Copyright 2024-2026 Runnerd Contributors
// SPDX-License-Identifier: Apache-2.0

//! Vendor runner archive installation.
//!
//! Downloads and unpacks the vendor-supplied runner tarball into a
//! per-runner directory. Installation is idempotent: a directory that
//! already contains the entry-point scripts is left untouched. On any
//! failure the directory is removed entirely so a retry starts clean.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use serde::Deserialize;
use thiserror::Error;

use crate::config::Arch;

/// Script the vendor archive must provide for registration.
pub const CONFIG_SCRIPT: &str = "config.sh";
/// Script the vendor archive must provide as the worker entry point.
pub const RUN_SCRIPT: &str = "run.sh";

const RELEASE_FEED: &str = "https://api.github.com/repos/actions/runner/releases/latest";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("download failed: {0}")]
    Download(String),

    #[error("archive unpack failed: {0}")]
    Unpack(String),

    #[error("archive is missing entry point {0}")]
    MissingEntryPoint(PathBuf),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Deserialize)]
struct LatestRelease {
    tag_name: String,
}

/// Downloads and unpacks vendor runner archives.
pub struct Installer {
    http: reqwest::Client,
    version: String,
    fallback_version: String,
    version_check_timeout: Duration,
}

impl Installer {
    pub fn new(
        http: reqwest::Client,
        version: String,
        fallback_version: String,
        version_check_timeout: Duration,
    ) -> Self {
        Self {
            http,
            version,
            fallback_version,
            version_check_timeout,
        }
    }

    /// Archive URL for a version/architecture pair.
    ///
    /// The vendor publishes no riscv64 build; those runners get the x64
    /// archive and rely on emulation being provisioned before start.
    fn archive_url(version: &str, arch: Arch) -> String {
        let arch_tag = match arch {
            Arch::X64 | Arch::Riscv64 => "x64",
            Arch::Arm64 => "arm64",
        };
        format!(
            "https://github.com/actions/runner/releases/download/v{version}/actions-runner-linux-{arch_tag}-{version}.tar.gz"
        )
    }

    /// Resolve `"latest"` against the release feed, falling back to the
    /// compiled-in known-good version on any failure.
    pub async fn resolve_version(&self) -> String {
        if self.version != "latest" {
            return self.version.clone();
        }
        let lookup = async {
            let resp = self.http.get(RELEASE_FEED).send().await?;
            resp.error_for_status()?.json::<LatestRelease>().await
        };
        match tokio::time::timeout(self.version_check_timeout, lookup).await {
            Ok(Ok(release)) => release.tag_name.trim_start_matches('v').to_string(),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, fallback = %self.fallback_version,
                    "latest-version lookup failed, using fallback");
                self.fallback_version.clone()
            }
            Err(_) => {
                tracing::warn!(fallback = %self.fallback_version,
                    "latest-version lookup timed out, using fallback");
                self.fallback_version.clone()
            }
        }
    }

    /// Whether a directory already holds a usable installation.
    pub fn is_installed(install_dir: &Path) -> bool {
        install_dir.join(CONFIG_SCRIPT).is_file() && install_dir.join(RUN_SCRIPT).is_file()
    }

    /// Install the runner archive for `arch` into `install_dir`.
    pub async fn install(&self, arch: Arch, install_dir: &Path) -> Result<(), InstallError> {
        if Self::is_installed(install_dir) {
            tracing::info!(dir = %install_dir.display(), "runner already installed");
            return Ok(());
        }

        let result = self.install_fresh(arch, install_dir).await;
        if result.is_err() && install_dir.exists() {
            if let Err(cleanup) = tokio::fs::remove_dir_all(install_dir).await {
                tracing::warn!(dir = %install_dir.display(), error = %cleanup,
                    "failed to remove partial installation");
            }
        }
        result
    }

    async fn install_fresh(&self, arch: Arch, install_dir: &Path) -> Result<(), InstallError> {
        tokio::fs::create_dir_all(install_dir).await?;

        let version = self.resolve_version().await;
        let url = Self::archive_url(&version, arch);
        tracing::info!(%version, %arch, %url, "downloading runner archive");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| InstallError::Download(e.to_string()))?;
        let resp = resp
            .error_for_status()
            .map_err(|e| InstallError::Download(e.to_string()))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| InstallError::Download(e.to_string()))?;

        let dir = install_dir.to_path_buf();
        tokio::task::spawn_blocking(move || unpack(&bytes, &dir))
            .await
            .map_err(|e| InstallError::Unpack(e.to_string()))??;

        for script in [CONFIG_SCRIPT, RUN_SCRIPT] {
            let path = install_dir.join(script);
            if !path.is_file() {
                return Err(InstallError::MissingEntryPoint(path));
            }
        }

        tracing::info!(dir = %install_dir.display(), "runner installation complete");
        Ok(())
    }
}

fn unpack(bytes: &[u8], dest: &Path) -> Result<(), InstallError> {
    let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(bytes)));
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .map_err(|e| InstallError::Unpack(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_url_per_arch() {
        let url = Installer::archive_url("2.319.0", Arch::Arm64);
        assert!(url.contains("actions-runner-linux-arm64-2.319.0.tar.gz"));
        assert!(url.contains("v2.319.0"));
    }

    #[test]
    fn riscv64_substitutes_x64_archive() {
        let url = Installer::archive_url("2.319.0", Arch::Riscv64);
        assert!(url.contains("linux-x64"));
    }

    #[tokio::test]
    async fn pinned_version_skips_feed_lookup() {
        let installer = Installer::new(
            reqwest::Client::new(),
            "2.300.1".to_string(),
            "2.319.0".to_string(),
            Duration::from_secs(1),
        );
        assert_eq!(installer.resolve_version().await, "2.300.1");
    }

    #[tokio::test]
    async fn existing_installation_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("runner-x64-1");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(CONFIG_SCRIPT), "#!/bin/sh\n").unwrap();
        std::fs::write(root.join(RUN_SCRIPT), "#!/bin/sh\n").unwrap();
        let marker = root.join("sentinel");
        std::fs::write(&marker, "untouched").unwrap();

        let installer = Installer::new(
            reqwest::Client::new(),
            "2.319.0".to_string(),
            "2.319.0".to_string(),
            Duration::from_secs(1),
        );
        installer.install(Arch::X64, &root).await.unwrap();
        // Second call is equally a no-op.
        installer.install(Arch::X64, &root).await.unwrap();
        assert_eq!(std::fs::read_to_string(marker).unwrap(), "untouched");
    }

    #[test]
    fn unpack_round_trips_a_tarball() {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let payload = b"#!/bin/sh\necho ok\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "config.sh", payload.as_slice())
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        unpack(&bytes, dir.path()).unwrap();
        assert!(dir.path().join("config.sh").is_file());
    }
}
