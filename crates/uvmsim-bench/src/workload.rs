//! Benchmark workloads
//!
//! Each workload builds its own simulator instance, drives the public
//! manager API, and harvests the performance counters into a results row.

use std::sync::atomic::Ordering;
use std::time::Instant;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, Level};

use uvmsim_core::{ReplacementPolicyKind, VmConfig, VmManager};

use crate::csv::ResultRow;

const PAGE_SIZE: usize = 64 * 1024;
const RNG_SEED: u64 = 42;

/// Shared workload parameters.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub working_set_bytes: usize,
    pub gpu_memory_bytes: usize,
    pub accesses: usize,
    pub policy: ReplacementPolicyKind,
    pub log_level: Level,
}

impl WorkloadConfig {
    fn vm_config(&self) -> VmConfig {
        // The host pool holds the whole working set plus slack, so only the
        // device tier is ever the bottleneck.
        let cpu_memory = (2 * self.working_set_bytes).max(64 * 1024 * 1024);
        VmConfig::default()
            .page_size(PAGE_SIZE)
            .cpu_memory(cpu_memory)
            .gpu_memory(self.gpu_memory_bytes)
            .replacement_policy(self.policy)
            .use_gpu_simulator(true)
            .log_level(self.log_level)
    }

    fn num_pages(&self) -> usize {
        self.working_set_bytes / PAGE_SIZE
    }
}

fn harvest(
    name: &str,
    config: &WorkloadConfig,
    vm: &VmManager,
    accesses: usize,
    elapsed_us: u64,
) -> ResultRow {
    let snap = vm.perf_snapshot();
    let elapsed_us = elapsed_us.max(1);
    ResultRow {
        benchmark: name.to_string(),
        working_set_mb: (config.working_set_bytes / (1024 * 1024)) as u64,
        gpu_memory_mb: (config.gpu_memory_bytes / (1024 * 1024)) as u64,
        page_faults: snap.total_page_faults,
        migrations: snap.total_migrations(),
        migrated_mb: snap.total_bytes_migrated as f64 / (1024.0 * 1024.0),
        total_time_us: elapsed_us,
        throughput_pages_sec: accesses as f64 * 1e6 / elapsed_us as f64,
        fault_rate_per_sec: snap.total_page_faults as f64 * 1e6 / elapsed_us as f64,
    }
}

/// Uniformly random page touches, alternating reads and writes.
pub fn random_access(config: &WorkloadConfig) -> Result<ResultRow> {
    info!(?config, "running random page access workload");
    let vm = VmManager::with_config(config.vm_config())?;

    let vaddr = vm
        .allocate(config.working_set_bytes, false)
        .context("failed to allocate working set")?;
    let num_pages = config.num_pages();
    let mut rng = StdRng::seed_from_u64(RNG_SEED);

    // Warm a fraction of the set before measuring.
    for _ in 0..(config.accesses / 10).min(1000) {
        let page = rng.gen_range(0..num_pages);
        vm.touch_page(vaddr + (page * PAGE_SIZE) as u64, false);
    }
    vm.reset_counters();

    let start = Instant::now();
    for i in 0..config.accesses {
        let page = rng.gen_range(0..num_pages);
        vm.touch_page(vaddr + (page * PAGE_SIZE) as u64, i % 2 == 0);
    }
    let elapsed_us = start.elapsed().as_micros() as u64;

    let row = harvest("Random Page Access", config, &vm, config.accesses, elapsed_us);
    vm.free(vaddr);
    vm.shutdown();
    Ok(row)
}

/// Sequential sweeps over the working set.
pub fn sequential_sweep(config: &WorkloadConfig) -> Result<ResultRow> {
    info!(?config, "running sequential sweep workload");
    let vm = VmManager::with_config(config.vm_config())?;

    let vaddr = vm
        .allocate(config.working_set_bytes, false)
        .context("failed to allocate working set")?;
    let num_pages = config.num_pages();
    let passes = (config.accesses / num_pages).max(1);
    vm.reset_counters();

    let start = Instant::now();
    for pass in 0..passes {
        for page in 0..num_pages {
            vm.touch_page(vaddr + (page * PAGE_SIZE) as u64, pass % 2 == 1);
        }
    }
    let elapsed_us = start.elapsed().as_micros() as u64;

    let row = harvest(
        "Sequential Page Access",
        config,
        &vm,
        passes * num_pages,
        elapsed_us,
    );
    vm.free(vaddr);
    vm.shutdown();
    Ok(row)
}

/// Device oversubscription: every page is repeatedly mapped to a device
/// tier smaller than the working set, with one simulated kernel launch per
/// sweep. Exercises eviction and write-back continuously.
pub fn oversubscribe(config: &WorkloadConfig) -> Result<ResultRow> {
    info!(?config, "running oversubscription workload");
    let vm = VmManager::with_config(config.vm_config())?;

    let vaddr = vm
        .allocate(config.working_set_bytes, true)
        .context("failed to allocate working set")?;
    let num_pages = config.num_pages();
    let passes = (config.accesses / num_pages).clamp(1, 8);
    vm.reset_counters();

    let start = Instant::now();
    for _ in 0..passes {
        for page in 0..num_pages {
            let addr = vaddr + (page * PAGE_SIZE) as u64;
            vm.prefetch_to_gpu(addr);
            vm.touch_page(addr, true);
        }
        vm.perf_counters().kernel_launches.fetch_add(1, Ordering::Relaxed);
        vm.sync_all_migrations();
    }
    let elapsed_us = start.elapsed().as_micros() as u64;

    let row = harvest(
        "GPU Oversubscription",
        config,
        &vm,
        passes * num_pages,
        elapsed_us,
    );
    vm.free(vaddr);
    vm.shutdown();
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> WorkloadConfig {
        WorkloadConfig {
            working_set_bytes: 8 * 1024 * 1024,
            gpu_memory_bytes: 2 * 1024 * 1024,
            accesses: 512,
            policy: ReplacementPolicyKind::Lru,
            log_level: Level::ERROR,
        }
    }

    #[test]
    fn random_access_produces_a_row() {
        let row = random_access(&small_config()).unwrap();
        assert_eq!(row.benchmark, "Random Page Access");
        assert_eq!(row.working_set_mb, 8);
        assert_eq!(row.gpu_memory_mb, 2);
        assert!(row.total_time_us >= 1);
    }

    #[test]
    fn sequential_sweep_touches_every_page() {
        let row = sequential_sweep(&small_config()).unwrap();
        assert!(row.throughput_pages_sec > 0.0);
    }

    #[test]
    fn oversubscription_migrates_and_evicts() {
        let row = oversubscribe(&small_config()).unwrap();
        // 128 pages cycling through a 32-page device tier must migrate.
        assert!(row.migrations > 0);
        assert!(row.migrated_mb > 0.0);
    }
}
