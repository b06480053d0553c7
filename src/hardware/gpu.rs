// Copyright 2024-2026 Runnerd Contributors
// SPDX-License-Identifier: Apache-2.0

//! GPU enumeration and capability classification.
//!
//! Each vendor's inventory tool is tried first (nvidia-smi, rocm-smi,
//! xpu-smi, sysctl); PCI enumeration via lspci is the fallback when the
//! tool is absent. Classification is table-driven per vendor, then gated
//! by minimum memory: 4 GiB for inference, 8 GiB for training. Devices
//! whose memory the fallback path cannot read skip the gate.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::process::Command;

const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

const GIB: u64 = 1024 * 1024 * 1024;
const MIN_INFERENCE_MEMORY: u64 = 4 * GIB;
const MIN_TRAINING_MEMORY: u64 = 8 * GIB;

/// NVIDIA compute-capability floors.
const NVIDIA_MIN_INFERENCE_CC: (u32, u32) = (6, 0);
const NVIDIA_MIN_TRAINING_CC: (u32, u32) = (7, 0);

/// NVIDIA models known to be training-grade regardless of reported CC.
const NVIDIA_TRAINING_MODELS: &[&str] = &["V100", "A100", "H100", "H200", "A10", "L40"];

/// AMD datacenter parts: inference and training capable.
const AMD_DATACENTER_MODELS: &[&str] = &["MI210", "MI250", "MI300", "Instinct"];
/// AMD professional parts: both capable above the memory floor.
const AMD_PRO_MODELS: &[&str] = &["Radeon Pro", "W6800", "W7800", "W7900"];
/// AMD consumer RDNA2+ series: training capable with enough memory.
const AMD_RDNA2_MODELS: &[&str] = &["RX 6", "RX 7"];

/// Intel discrete series; integrated parts classify as neither.
const INTEL_DISCRETE_MODELS: &[&str] = &["Arc", "Flex", "Max"];

const APPLE_CHIPS: &[&str] = &["M1", "M2", "M3", "M4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
}

impl GpuVendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpuVendor::Nvidia => "nvidia",
            GpuVendor::Amd => "amd",
            GpuVendor::Intel => "intel",
            GpuVendor::Apple => "apple",
        }
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected GPU. Immutable after construction.
#[derive(Debug, Clone, Serialize)]
pub struct GpuDescriptor {
    pub vendor: GpuVendor,
    pub model: String,
    pub index: usize,
    pub memory_bytes: u64,
    /// NVIDIA compute capability, when reported.
    pub compute_capability: Option<(u32, u32)>,
    pub pci_id: String,
    pub inference_capable: bool,
    pub training_capable: bool,
}

impl fmt::Display for GpuDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({} MiB)",
            self.vendor,
            self.model,
            self.memory_bytes / (1024 * 1024)
        )
    }
}

/// Enumerates GPUs through vendor tools with PCI fallback.
pub struct GpuInspector;

impl GpuInspector {
    pub fn new() -> Self {
        Self
    }

    /// Detect every GPU on the host, classified and ready for labeling.
    pub async fn detect_all(&self) -> Vec<GpuDescriptor> {
        let mut gpus = Vec::new();
        gpus.extend(self.detect_nvidia().await);
        gpus.extend(self.detect_amd().await);
        gpus.extend(self.detect_intel().await);
        if let Some(apple) = self.detect_apple().await {
            gpus.push(apple);
        }
        for gpu in &mut gpus {
            classify(gpu);
            tracing::info!(
                gpu = %gpu,
                inference = gpu.inference_capable,
                training = gpu.training_capable,
                "detected GPU"
            );
        }
        gpus
    }

    async fn detect_nvidia(&self) -> Vec<GpuDescriptor> {
        let Some(output) = run_tool(
            "nvidia-smi",
            &[
                "--query-gpu=index,name,memory.total,compute_cap,pci.bus_id",
                "--format=csv,noheader,nounits",
            ],
        )
        .await
        else {
            return Vec::new();
        };

        output
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.split(',').map(str::trim).collect();
                if parts.len() < 4 {
                    return None;
                }
                Some(GpuDescriptor {
                    vendor: GpuVendor::Nvidia,
                    model: parts[1].to_string(),
                    index: parts[0].parse().ok()?,
                    memory_bytes: parts[2].parse::<f64>().ok()? as u64 * 1024 * 1024,
                    compute_capability: parse_compute_cap(parts[3]),
                    pci_id: parts.get(4).unwrap_or(&"").to_string(),
                    inference_capable: false,
                    training_capable: false,
                })
            })
            .collect()
    }

    async fn detect_amd(&self) -> Vec<GpuDescriptor> {
        if let Some(output) = run_tool("rocm-smi", &["--showproductname"]).await {
            let pattern = Regex::new(r"(?:Card series|GPU\[\d+\]).*?:\s*(.+)").ok();
            let mut gpus = Vec::new();
            if let Some(re) = pattern {
                for caps in output.lines().filter_map(|l| re.captures(l)) {
                    gpus.push(bare_descriptor(
                        GpuVendor::Amd,
                        caps[1].trim().to_string(),
                        gpus.len(),
                    ));
                }
            }
            if !gpus.is_empty() {
                return gpus;
            }
        }
        self.detect_via_lspci(GpuVendor::Amd, "AMD", None).await
    }

    async fn detect_intel(&self) -> Vec<GpuDescriptor> {
        if let Some(output) = run_tool("xpu-smi", &["discovery"]).await {
            let pattern = Regex::new(r"Device Name:\s*(.+)").ok();
            let mut gpus = Vec::new();
            if let Some(re) = pattern {
                for caps in output.lines().filter_map(|l| re.captures(l)) {
                    gpus.push(bare_descriptor(
                        GpuVendor::Intel,
                        caps[1].trim().to_string(),
                        gpus.len(),
                    ));
                }
            }
            if !gpus.is_empty() {
                return gpus;
            }
        }
        // Only discrete Xe-class parts are worth reporting from lspci.
        self.detect_via_lspci(GpuVendor::Intel, "Intel", Some(&["Arc", "Flex", "Max", "Xe"]))
            .await
    }

    async fn detect_via_lspci(
        &self,
        vendor: GpuVendor,
        vendor_tag: &str,
        required_any: Option<&[&str]>,
    ) -> Vec<GpuDescriptor> {
        let Some(output) = run_tool("lspci", &[]).await else {
            return Vec::new();
        };
        let re = match Regex::new(&format!(r"(?:VGA|Display|3D).*{vendor_tag}[^:]*:\s*(.+)")) {
            Ok(re) => re,
            Err(_) => return Vec::new(),
        };
        let mut gpus = Vec::new();
        for line in output.lines() {
            if !line.contains(vendor_tag) {
                continue;
            }
            if !(line.contains("VGA") || line.contains("Display") || line.contains("3D")) {
                continue;
            }
            if let Some(required) = required_any {
                if !required.iter().any(|r| line.contains(r)) {
                    continue;
                }
            }
            let model = re
                .captures(line)
                .map(|c| c[1].trim().to_string())
                .unwrap_or_else(|| line.trim().to_string());
            let pci_id = line.split_whitespace().next().unwrap_or("").to_string();
            let mut gpu = bare_descriptor(vendor, model, gpus.len());
            gpu.pci_id = pci_id;
            gpus.push(gpu);
        }
        gpus
    }

    async fn detect_apple(&self) -> Option<GpuDescriptor> {
        if !(cfg!(target_os = "macos") && std::env::consts::ARCH == "aarch64") {
            return None;
        }
        let output = run_tool("sysctl", &["-n", "machdep.cpu.brand_string"]).await?;
        let brand = output.trim();
        let chip = APPLE_CHIPS.iter().find(|c| brand.contains(*c))?;
        let memory_bytes = run_tool("sysctl", &["-n", "hw.memsize"])
            .await
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        Some(GpuDescriptor {
            vendor: GpuVendor::Apple,
            model: format!("Apple {chip} GPU"),
            index: 0,
            // Unified memory: the GPU shares the machine's full capacity.
            memory_bytes,
            compute_capability: None,
            pci_id: String::new(),
            inference_capable: false,
            training_capable: false,
        })
    }
}

impl Default for GpuInspector {
    fn default() -> Self {
        Self::new()
    }
}

fn bare_descriptor(vendor: GpuVendor, model: String, index: usize) -> GpuDescriptor {
    GpuDescriptor {
        vendor,
        model,
        index,
        memory_bytes: 0,
        compute_capability: None,
        pci_id: String::new(),
        inference_capable: false,
        training_capable: false,
    }
}

fn parse_compute_cap(s: &str) -> Option<(u32, u32)> {
    let (major, minor) = s.split_once('.')?;
    Some((major.trim().parse().ok()?, minor.trim().parse().ok()?))
}

/// Apply the per-vendor classification tables, then the memory gates.
pub fn classify(gpu: &mut GpuDescriptor) {
    match gpu.vendor {
        GpuVendor::Nvidia => {
            if let Some(cc) = gpu.compute_capability {
                gpu.inference_capable = cc >= NVIDIA_MIN_INFERENCE_CC;
                gpu.training_capable = cc >= NVIDIA_MIN_TRAINING_CC;
            }
            if NVIDIA_TRAINING_MODELS.iter().any(|m| gpu.model.contains(m)) {
                gpu.inference_capable = true;
                gpu.training_capable = true;
            }
        }
        GpuVendor::Amd => {
            if AMD_DATACENTER_MODELS.iter().any(|m| gpu.model.contains(m)) {
                gpu.inference_capable = true;
                gpu.training_capable = true;
            } else if AMD_PRO_MODELS.iter().any(|m| gpu.model.contains(m)) {
                gpu.inference_capable = true;
                gpu.training_capable =
                    gpu.memory_bytes == 0 || gpu.memory_bytes >= MIN_TRAINING_MEMORY;
            } else {
                gpu.inference_capable = true;
                gpu.training_capable = AMD_RDNA2_MODELS.iter().any(|m| gpu.model.contains(m))
                    && gpu.memory_bytes >= MIN_TRAINING_MEMORY;
            }
        }
        GpuVendor::Intel => {
            let discrete = INTEL_DISCRETE_MODELS.iter().any(|m| gpu.model.contains(m));
            gpu.inference_capable = discrete;
            gpu.training_capable = discrete;
        }
        GpuVendor::Apple => {
            gpu.inference_capable = true;
            gpu.training_capable = true;
        }
    }

    // Minimum-memory gates; unknown memory (0) skips them.
    if gpu.memory_bytes > 0 {
        gpu.inference_capable &= gpu.memory_bytes >= MIN_INFERENCE_MEMORY;
        gpu.training_capable &= gpu.memory_bytes >= MIN_TRAINING_MEMORY;
    }
}

/// Capability labels advertised for a runner that owns this GPU.
pub fn gpu_labels(gpu: &GpuDescriptor) -> Vec<String> {
    let mut labels = vec!["self-hosted".to_string(), "gpu".to_string()];
    labels.push(gpu.vendor.as_str().to_string());
    if gpu.inference_capable {
        labels.push("inference".to_string());
    }
    if gpu.training_capable {
        labels.push("training".to_string());
    }

    match gpu.vendor {
        GpuVendor::Nvidia => {
            if gpu.model.contains("T4") {
                labels.push("t4".to_string());
            } else if gpu.model.contains("A100") || gpu.model.contains("A10") {
                labels.push("ampere".to_string());
            } else if gpu.model.contains("V100") {
                labels.push("volta".to_string());
            } else if gpu.model.contains("H100") || gpu.model.contains("H200") {
                labels.push("hopper".to_string());
            } else if gpu.model.contains("L4") || gpu.model.contains("L40") {
                labels.push("ada".to_string());
            }
        }
        GpuVendor::Amd => {
            if gpu.model.contains("MI") {
                labels.push("mi-series".to_string());
            }
        }
        GpuVendor::Intel => {
            if gpu.model.contains("Arc") {
                labels.push("arc".to_string());
            } else if gpu.model.contains("Flex") {
                labels.push("flex".to_string());
            } else if gpu.model.contains("Max") {
                labels.push("max".to_string());
            }
        }
        GpuVendor::Apple => {
            if let Some(chip) = APPLE_CHIPS.iter().find(|c| gpu.model.contains(*c)) {
                labels.push(chip.to_lowercase());
            }
        }
    }

    labels
}

async fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    let result = tokio::time::timeout(
        TOOL_TIMEOUT,
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output(),
    )
    .await;
    match result {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(output)) => {
            tracing::debug!(program, status = ?output.status.code(), "inventory tool failed");
            None
        }
        Ok(Err(_)) => None, // not installed
        Err(_) => {
            tracing::warn!(program, "inventory tool timed out");
            None
        }
    }
}
