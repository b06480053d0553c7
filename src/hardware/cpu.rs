// Copyright 2024-2026 Runnerd Contributors
// SPDX-License-Identifier: Apache-2.0

//! CPU topology and capability inspection.
//!
//! Reads `/proc/cpuinfo` once at startup (with an Apple-silicon sysctl
//! branch on macOS) and derives workload fitness from a compile-time
//! microarchitecture table: a workload fits when the microarchitecture's
//! release year meets the workload's floor and the feature flags cover its
//! requirements.

use std::collections::BTreeSet;

use regex::Regex;

/// Workload classes runners can be labeled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    Inference,
    Training,
}

struct FitnessRule {
    min_year: u16,
    required_flags: &'static [&'static str],
}

const INFERENCE_RULE: FitnessRule = FitnessRule {
    min_year: 2013,
    required_flags: &["avx2"],
};

const TRAINING_RULE: FitnessRule = FitnessRule {
    min_year: 2017,
    required_flags: &["avx2", "fma"],
};

/// Identified microarchitecture generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Microarch {
    pub generation: &'static str,
    pub release_year: u16,
}

/// Model-substring table; every listed substring must match (lowercased).
/// Ordered most-specific first.
const MICROARCH_TABLE: &[(&[&str], &str, u16)] = &[
    (&["apple m4"], "apple-m4", 2024),
    (&["apple m3"], "apple-m3", 2023),
    (&["apple m2"], "apple-m2", 2022),
    (&["apple m1"], "apple-m1", 2020),
    (&["xeon", "v4"], "broadwell", 2016),
    (&["xeon", "v3"], "haswell", 2014),
    (&["xeon", "v2"], "ivy-bridge", 2013),
    (&["xeon", "platinum"], "skylake-sp", 2017),
    (&["xeon", "gold"], "skylake-sp", 2017),
    (&["xeon", "silver"], "skylake-sp", 2017),
    (&["xeon", "bronze"], "skylake-sp", 2017),
    (&["epyc 9"], "zen4", 2022),
    (&["core", "14th"], "raptor-lake", 2023),
    (&["core", "13th"], "raptor-lake", 2022),
    (&["core", "12th"], "alder-lake", 2021),
];

/// Generations with a performance/efficiency core split.
const HYBRID_GENERATIONS: &[&str] = &[
    "alder-lake",
    "raptor-lake",
    "apple-m1",
    "apple-m2",
    "apple-m3",
    "apple-m4",
];

/// Immutable CPU inventory taken once at startup.
#[derive(Debug, Clone)]
pub struct CpuInventory {
    pub model: String,
    pub physical_cores: usize,
    pub logical_cores: usize,
    pub threads_per_core: usize,
    pub flags: BTreeSet<String>,
    pub microarch: Option<Microarch>,
    pub apple_silicon: bool,
}

impl CpuInventory {
    /// Inspect the host.
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            return Self::detect_apple();
        }
        match std::fs::read_to_string("/proc/cpuinfo") {
            Ok(cpuinfo) => Self::parse(&cpuinfo),
            Err(err) => {
                tracing::warn!(error = %err, "could not read /proc/cpuinfo");
                Self::fallback()
            }
        }
    }

    /// Parse a `/proc/cpuinfo` dump. Split out for testability.
    pub fn parse(cpuinfo: &str) -> Self {
        let mut model = String::new();
        let mut flags = BTreeSet::new();
        let mut logical = 0usize;
        // (physical id, core id) pairs identify physical cores across
        // sockets; both default to 0 for single-socket /proc layouts that
        // omit them.
        let mut cores = BTreeSet::new();
        let mut physical_id = 0usize;

        for line in cpuinfo.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "processor" => logical += 1,
                "model name" if model.is_empty() => model = value.to_string(),
                "physical id" => physical_id = value.parse().unwrap_or(0),
                "core id" => {
                    let core_id: usize = value.parse().unwrap_or(0);
                    cores.insert((physical_id, core_id));
                }
                // x86 exposes "flags", arm64 exposes "Features".
                "flags" | "Features" if flags.is_empty() => {
                    flags = value.split_whitespace().map(str::to_string).collect();
                }
                _ => {}
            }
        }

        let logical = logical.max(1);
        let physical = if cores.is_empty() {
            num_cpus::get_physical()
        } else {
            cores.len()
        }
        .max(1);

        Self::assemble(model, physical, logical, flags, false)
    }

    fn detect_apple() -> Self {
        let model = std::process::Command::new("sysctl")
            .args(["-n", "machdep.cpu.brand_string"])
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_else(|| "Apple Silicon".to_string());
        let apple = std::env::consts::ARCH == "aarch64";
        Self::assemble(
            model,
            num_cpus::get_physical().max(1),
            num_cpus::get().max(1),
            BTreeSet::new(),
            apple,
        )
    }

    fn fallback() -> Self {
        Self::assemble(
            String::new(),
            num_cpus::get_physical().max(1),
            num_cpus::get().max(1),
            BTreeSet::new(),
            false,
        )
    }

    fn assemble(
        model: String,
        physical_cores: usize,
        logical_cores: usize,
        flags: BTreeSet<String>,
        apple_silicon: bool,
    ) -> Self {
        let microarch = identify_microarch(&model);
        let apple_silicon = apple_silicon
            || microarch
                .map(|m| m.generation.starts_with("apple"))
                .unwrap_or(false);
        Self {
            threads_per_core: (logical_cores / physical_cores).max(1),
            model,
            physical_cores,
            logical_cores,
            flags,
            microarch,
            apple_silicon,
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    pub fn avx512_capable(&self) -> bool {
        self.flags.iter().any(|f| f.starts_with("avx512"))
    }

    pub fn amx_capable(&self) -> bool {
        self.flags.iter().any(|f| f.starts_with("amx"))
    }

    /// Physical cores usable for compute. Hybrid designs only count the
    /// performance half; efficiency cores stay with the host.
    pub fn performance_cores(&self) -> usize {
        if self.is_hybrid() {
            (self.physical_cores / 2).max(1)
        } else {
            self.physical_cores
        }
    }

    pub fn is_hybrid(&self) -> bool {
        self.microarch
            .map(|m| HYBRID_GENERATIONS.contains(&m.generation))
            .unwrap_or(false)
    }

    /// Dual-socket Xeon E5-2660 v3/v4 family gets a dedicated planner cap.
    pub fn is_xeon_e5_2660(&self) -> bool {
        let model = self.model.to_lowercase();
        model.contains("e5-2660") && (model.contains("v3") || model.contains("v4"))
    }

    /// Whether this CPU is fit for the given workload class.
    pub fn workload_fit(&self, workload: Workload) -> bool {
        let rule = match workload {
            Workload::Inference => &INFERENCE_RULE,
            Workload::Training => &TRAINING_RULE,
        };
        let Some(microarch) = self.microarch else {
            return false;
        };
        if microarch.release_year < rule.min_year {
            return false;
        }
        if self.apple_silicon {
            // No x86 flags; the NEON/AMX units are implied by the chip.
            return true;
        }
        rule.required_flags.iter().all(|f| self.flags.contains(*f))
    }
}

fn identify_microarch(model: &str) -> Option<Microarch> {
    let model = model.to_lowercase();
    for (patterns, generation, year) in MICROARCH_TABLE {
        if patterns.iter().all(|p| model.contains(p)) {
            return Some(Microarch {
                generation,
                release_year: *year,
            });
        }
    }
    // EPYC 7xx1/7xx2/7xx3 encode the Zen generation in the last digit.
    if let Some(caps) = Regex::new(r"epyc 7\d{2}(\d)").ok()?.captures(&model) {
        return match &caps[1] {
            "1" => Some(Microarch { generation: "zen", release_year: 2017 }),
            "2" => Some(Microarch { generation: "zen2", release_year: 2019 }),
            "3" => Some(Microarch { generation: "zen3", release_year: 2021 }),
            _ => None,
        };
    }
    // Ryzen series number leads the 4-digit model.
    if let Some(caps) = Regex::new(r"ryzen \d (\d)\d{3}").ok()?.captures(&model) {
        return match &caps[1] {
            "1" => Some(Microarch { generation: "zen", release_year: 2017 }),
            "2" => Some(Microarch { generation: "zen+", release_year: 2018 }),
            "3" => Some(Microarch { generation: "zen2", release_year: 2019 }),
            "5" => Some(Microarch { generation: "zen3", release_year: 2020 }),
            "7" => Some(Microarch { generation: "zen4", release_year: 2022 }),
            "9" => Some(Microarch { generation: "zen5", release_year: 2024 }),
            _ => None,
        };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const XEON_CPUINFO: &str = "\
processor\t: 0
model name\t: Intel(R) Xeon(R) CPU E5-2660 v4 @ 2.00GHz
physical id\t: 0
core id\t: 0
flags\t\t: fpu vme sse sse2 avx avx2 fma
processor\t: 1
model name\t: Intel(R) Xeon(R) CPU E5-2660 v4 @ 2.00GHz
physical id\t: 0
core id\t: 1
flags\t\t: fpu vme sse sse2 avx avx2 fma
processor\t: 2
model name\t: Intel(R) Xeon(R) CPU E5-2660 v4 @ 2.00GHz
physical id\t: 0
core id\t: 0
flags\t\t: fpu vme sse sse2 avx avx2 fma
processor\t: 3
model name\t: Intel(R) Xeon(R) CPU E5-2660 v4 @ 2.00GHz
physical id\t: 0
core id\t: 1
flags\t\t: fpu vme sse sse2 avx avx2 fma
";

    #[test]
    fn parses_topology_with_hyperthreading() {
        let inventory = CpuInventory::parse(XEON_CPUINFO);
        assert_eq!(inventory.logical_cores, 4);
        assert_eq!(inventory.physical_cores, 2);
        assert_eq!(inventory.threads_per_core, 2);
        assert!(inventory.has_flag("avx2"));
        assert!(!inventory.avx512_capable());
        assert!(inventory.is_xeon_e5_2660());
    }

    #[test]
    fn broadwell_xeon_fits_both_workloads_except_training_year() {
        let inventory = CpuInventory::parse(XEON_CPUINFO);
        let microarch = inventory.microarch.unwrap();
        assert_eq!(microarch.generation, "broadwell");
        assert!(inventory.workload_fit(Workload::Inference));
        // 2016 release predates the 2017 training floor.
        assert!(!inventory.workload_fit(Workload::Training));
    }

    #[test]
    fn epyc_generation_from_model_number() {
        let microarch = identify_microarch("AMD EPYC 7542 32-Core Processor").unwrap();
        assert_eq!(microarch.generation, "zen2");
        let microarch = identify_microarch("AMD EPYC 7763 64-Core Processor").unwrap();
        assert_eq!(microarch.generation, "zen3");
        let microarch = identify_microarch("AMD EPYC 9654 96-Core Processor").unwrap();
        assert_eq!(microarch.generation, "zen4");
    }

    #[test]
    fn ryzen_generation_from_series_number() {
        let microarch = identify_microarch("AMD Ryzen 9 5950X 16-Core Processor").unwrap();
        assert_eq!(microarch.generation, "zen3");
        assert_eq!(microarch.release_year, 2020);
    }

    #[test]
    fn training_fit_requires_flags_and_year() {
        let cpuinfo = "\
processor\t: 0
model name\t: AMD EPYC 7542 32-Core Processor
physical id\t: 0
core id\t: 0
flags\t\t: fpu sse sse2 avx avx2 fma
";
        let inventory = CpuInventory::parse(cpuinfo);
        assert!(inventory.workload_fit(Workload::Training));

        let no_fma = cpuinfo.replace(" fma", "");
        let inventory = CpuInventory::parse(&no_fma);
        assert!(!inventory.workload_fit(Workload::Training));
    }

    #[test]
    fn apple_silicon_waives_flag_requirements() {
        let inventory = CpuInventory::assemble(
            "Apple M2 Pro".to_string(),
            10,
            10,
            BTreeSet::new(),
            true,
        );
        assert!(inventory.apple_silicon);
        assert!(inventory.is_hybrid());
        assert!(inventory.workload_fit(Workload::Inference));
        assert!(inventory.workload_fit(Workload::Training));
        assert_eq!(inventory.performance_cores(), 5);
    }

    #[test]
    fn unknown_microarch_fits_nothing() {
        let inventory = CpuInventory::assemble(
            "Mystery CPU 9000".to_string(),
            4,
            4,
            BTreeSet::new(),
            false,
        );
        assert!(inventory.microarch.is_none());
        assert!(!inventory.workload_fit(Workload::Inference));
    }

    #[test]
    fn hybrid_counts_performance_cores_only() {
        let inventory = CpuInventory::assemble(
            "12th Gen Intel(R) Core(TM) i7-12700K".to_string(),
            12,
            20,
            BTreeSet::from(["avx2".to_string(), "fma".to_string()]),
            false,
        );
        assert!(inventory.is_hybrid());
        assert_eq!(inventory.performance_cores(), 6);
    }
}
