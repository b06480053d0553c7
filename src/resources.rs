// Copyright 2024-2026 Runnerd Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-runner resource planning.
//!
//! Divides host CPU cores and memory across the pool while reserving a
//! budget for the host itself, computes deterministic CPU-affinity sets,
//! and flags infeasible plans with warnings instead of failing outright.

use crate::hardware::CpuInventory;

pub const MIN_HOST_CORES: usize = 2;
pub const HOST_CPU_PCT: f64 = 0.20;

const GIB: u64 = 1024 * 1024 * 1024;
pub const MIN_HOST_MEMORY: u64 = 2 * GIB;
pub const HOST_MEM_PCT: f64 = 0.15;

/// Per-runner core cap for the dual-socket Xeon E5-2660 v3/v4 family,
/// keeping affinity sets inside one socket.
const XEON_E5_2660_CORE_CAP: usize = 4;

/// Resource slice assigned to each runner in a pool.
#[derive(Debug, Clone)]
pub struct ResourcePlan {
    pub pool_size: usize,
    pub host_reserved_cores: usize,
    pub host_reserved_memory: u64,
    /// Cores per runner; 0 means unlimited (optimization disabled).
    pub per_runner_cores: usize,
    /// Memory ceiling per runner in bytes; 0 means unlimited.
    pub per_runner_memory: u64,
    /// Reported only; physical assignment is integer round-robin.
    pub per_runner_gpu_fraction: f64,
    /// Feasibility warnings. Empty means the plan fits the host.
    pub warnings: Vec<String>,
}

impl ResourcePlan {
    /// Plan with no limits, used when resource optimization is disabled.
    pub fn unlimited(pool_size: usize) -> Self {
        Self {
            pool_size,
            host_reserved_cores: 0,
            host_reserved_memory: 0,
            per_runner_cores: 0,
            per_runner_memory: 0,
            per_runner_gpu_fraction: 0.0,
            warnings: Vec::new(),
        }
    }

    pub fn is_feasible(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Computes resource plans and affinity sets from the host inventory.
pub struct ResourcePlanner {
    cpu: CpuInventory,
    total_memory: u64,
}

impl ResourcePlanner {
    pub fn new(cpu: CpuInventory, total_memory: u64) -> Self {
        Self { cpu, total_memory }
    }

    /// Build a planner from the live host.
    pub fn from_host(cpu: CpuInventory) -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        Self::new(cpu, system.total_memory())
    }

    pub fn cpu(&self) -> &CpuInventory {
        &self.cpu
    }

    /// Compute the slice each of `pool_size` runners receives.
    pub fn plan(&self, pool_size: usize, gpu_count: usize) -> ResourcePlan {
        let pool_size = pool_size.max(1);

        let host_reserved_cores = host_reserved_cores(self.cpu.physical_cores);
        let host_reserved_memory = MIN_HOST_MEMORY
            .max((self.total_memory as f64 * HOST_MEM_PCT) as u64);

        // Hybrid designs contribute only their performance cores.
        let compute_cores = self.cpu.performance_cores();
        let available_cores = compute_cores.saturating_sub(host_reserved_cores).max(1);
        let available_memory = self
            .total_memory
            .saturating_sub(host_reserved_memory)
            .max(GIB);

        let mut per_runner_cores = (available_cores / pool_size).max(1);
        if self.cpu.is_xeon_e5_2660() {
            per_runner_cores = per_runner_cores.min(XEON_E5_2660_CORE_CAP);
            tracing::info!(
                cores = per_runner_cores,
                "dual-socket Xeon core cap applied"
            );
        }
        let per_runner_memory = (available_memory / pool_size as u64).max(GIB);

        let mut plan = ResourcePlan {
            pool_size,
            host_reserved_cores,
            host_reserved_memory,
            per_runner_cores,
            per_runner_memory,
            per_runner_gpu_fraction: gpu_count as f64 / pool_size as f64,
            warnings: Vec::new(),
        };
        plan.warnings = self.validate(&plan);

        tracing::info!(
            total_cores = self.cpu.physical_cores,
            host_cores = plan.host_reserved_cores,
            per_runner_cores = plan.per_runner_cores,
            per_runner_memory_gib = plan.per_runner_memory / GIB,
            "resource plan computed"
        );
        for warning in &plan.warnings {
            tracing::warn!(%warning, "resource plan");
        }
        plan
    }

    /// Logical CPU IDs runner `runner_id` (1-indexed) may execute on.
    ///
    /// Physical cores are numbered `0..physical`; the host owns the first
    /// `host_reserved_cores`, runner k owns the next `cores_per_runner`
    /// block. With two threads per core the sibling logical IDs (offset by
    /// the physical count) join the set, so the set size stays a multiple
    /// of threads-per-core and never intersects the host block.
    pub fn affinity(&self, runner_id: u32, cores_per_runner: usize) -> Vec<usize> {
        if cores_per_runner == 0 {
            return Vec::new();
        }
        let host_cores = host_reserved_cores(self.cpu.physical_cores);
        let start = host_cores + (runner_id as usize - 1) * cores_per_runner;
        let end = (start + cores_per_runner).min(self.cpu.physical_cores);

        let mut cpus: Vec<usize> = (start..end).collect();
        if self.cpu.threads_per_core == 2 {
            let siblings: Vec<usize> =
                cpus.iter().map(|c| c + self.cpu.physical_cores).collect();
            cpus.extend(siblings);
        }
        cpus
    }

    fn validate(&self, plan: &ResourcePlan) -> Vec<String> {
        let mut warnings = Vec::new();

        let cores_needed = plan.per_runner_cores * plan.pool_size + plan.host_reserved_cores;
        if cores_needed > self.cpu.physical_cores {
            warnings.push(format!(
                "CPU over-allocation: {cores_needed} cores needed, {} available",
                self.cpu.physical_cores
            ));
        }

        let memory_needed =
            plan.per_runner_memory * plan.pool_size as u64 + plan.host_reserved_memory;
        if memory_needed > self.total_memory {
            warnings.push(format!(
                "memory over-allocation: {:.1} GiB needed, {:.1} GiB available",
                memory_needed as f64 / GIB as f64,
                self.total_memory as f64 / GIB as f64
            ));
        }

        warnings
    }
}

fn host_reserved_cores(physical_cores: usize) -> usize {
    MIN_HOST_CORES.max((physical_cores as f64 * HOST_CPU_PCT) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn xeon_2660_v4() -> CpuInventory {
        // Dual socket: 20 physical cores, 40 threads.
        let cpuinfo: String = (0..40)
            .map(|i| {
                format!(
                    "processor\t: {i}\nmodel name\t: Intel(R) Xeon(R) CPU E5-2660 v4 @ 2.00GHz\nphysical id\t: {}\ncore id\t: {}\nflags\t\t: avx2 fma\n",
                    i / 20,
                    i % 10,
                )
            })
            .collect();
        CpuInventory::parse(&cpuinfo)
    }

    fn plain_cpu(physical: usize, logical: usize) -> CpuInventory {
        let cpuinfo: String = (0..logical)
            .map(|i| {
                format!(
                    "processor\t: {i}\nmodel name\t: AMD EPYC 7542 32-Core Processor\nphysical id\t: 0\ncore id\t: {}\nflags\t\t: avx2 fma\n",
                    i % physical,
                )
            })
            .collect();
        CpuInventory::parse(&cpuinfo)
    }

    const TOTAL_MEMORY: u64 = 64 * GIB;

    #[test]
    fn host_reservation_respects_minimums() {
        let planner = ResourcePlanner::new(plain_cpu(4, 4), 4 * GIB);
        let plan = planner.plan(1, 0);
        // 20% of 4 cores rounds below the 2-core minimum.
        assert_eq!(plan.host_reserved_cores, 2);
        // 15% of 4 GiB is below the 2 GiB minimum.
        assert_eq!(plan.host_reserved_memory, 2 * GIB);
    }

    #[test]
    fn per_runner_division_with_reservation() {
        let planner = ResourcePlanner::new(plain_cpu(32, 64), TOTAL_MEMORY);
        let plan = planner.plan(4, 0);
        // host = max(2, 32*0.2) = 6, available = 26, 26/4 = 6.
        assert_eq!(plan.host_reserved_cores, 6);
        assert_eq!(plan.per_runner_cores, 6);
        assert!(plan.is_feasible());
        // feasibility: 6*4 + 6 = 30 <= 32.
    }

    #[test]
    fn xeon_family_caps_cores_per_runner() {
        let planner = ResourcePlanner::new(xeon_2660_v4(), TOTAL_MEMORY);
        let plan = planner.plan(2, 0);
        // available = 20 - 4 = 16, 16/2 = 8, capped to 4.
        assert_eq!(plan.per_runner_cores, 4);
    }

    #[test]
    fn oversized_pool_yields_warnings() {
        let planner = ResourcePlanner::new(plain_cpu(4, 4), 4 * GIB);
        let plan = planner.plan(8, 0);
        // 1 core and 1 GiB per runner minimums push past the host.
        assert!(!plan.is_feasible());
        assert!(plan.warnings.iter().any(|w| w.contains("CPU")));
        assert!(plan.warnings.iter().any(|w| w.contains("memory")));
    }

    #[test]
    fn feasible_plan_satisfies_core_inequality() {
        let planner = ResourcePlanner::new(plain_cpu(16, 32), TOTAL_MEMORY);
        for pool_size in 1..=6 {
            let plan = planner.plan(pool_size, 0);
            if plan.is_feasible() {
                assert!(
                    plan.per_runner_cores * pool_size + plan.host_reserved_cores <= 16,
                    "pool_size {pool_size}"
                );
            }
        }
    }

    #[test]
    fn gpu_fraction_is_reported() {
        let planner = ResourcePlanner::new(plain_cpu(16, 32), TOTAL_MEMORY);
        let plan = planner.plan(4, 2);
        assert!((plan.per_runner_gpu_fraction - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn affinity_blocks_are_disjoint_and_skip_host_cores() {
        let planner = ResourcePlanner::new(xeon_2660_v4(), TOTAL_MEMORY);
        let plan = planner.plan(4, 0);
        let host_cores = plan.host_reserved_cores;

        let mut seen = BTreeSet::new();
        for runner_id in 1..=4u32 {
            let cpus = planner.affinity(runner_id, plan.per_runner_cores);
            // Multiple of threads-per-core.
            assert_eq!(cpus.len() % 2, 0);
            for cpu in cpus {
                // Never the host block (nor its hyperthread siblings).
                assert!(cpu >= host_cores);
                assert!(!(20..20 + host_cores).contains(&cpu));
                assert!(seen.insert(cpu), "cpu {cpu} assigned twice");
            }
        }
    }

    #[test]
    fn affinity_includes_hyperthread_siblings() {
        let planner = ResourcePlanner::new(xeon_2660_v4(), TOTAL_MEMORY);
        let cpus = planner.affinity(1, 2);
        // host = 4, runner 1 owns physical 4..6 plus siblings 24..26.
        assert_eq!(cpus, vec![4, 5, 24, 25]);
    }

    #[test]
    fn unlimited_plan_has_no_affinity() {
        let planner = ResourcePlanner::new(plain_cpu(8, 8), TOTAL_MEMORY);
        assert!(planner.affinity(1, 0).is_empty());
        let plan = ResourcePlan::unlimited(3);
        assert_eq!(plan.per_runner_cores, 0);
        assert_eq!(plan.per_runner_memory, 0);
        assert!(plan.is_feasible());
    }

    #[test]
    fn hybrid_cpu_counts_performance_cores_only() {
        let mut cpuinfo = String::new();
        for i in 0..12 {
            cpuinfo.push_str(&format!(
                "processor\t: {i}\nmodel name\t: 12th Gen Intel(R) Core(TM) i7-12700\nphysical id\t: 0\ncore id\t: {i}\nflags\t\t: avx2 fma\n",
            ));
        }
        let planner = ResourcePlanner::new(CpuInventory::parse(&cpuinfo), TOTAL_MEMORY);
        let plan = planner.plan(2, 0);
        // 12 physical, 6 performance, host takes 2, 4/2 = 2 per runner.
        assert_eq!(plan.per_runner_cores, 2);
    }
}
