//! Performance counters
//!
//! Monotonic atomic counters shared by every subsystem. They may be read
//! without any lock; a snapshot is only eventually consistent with respect
//! to in-flight operations.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic performance counters for one manager instance.
///
/// All fields are incremented with relaxed ordering; the values are
/// statistics, not synchronization.
#[derive(Debug, Default)]
pub struct PerfCounters {
    pub total_page_faults: AtomicU64,
    pub cpu_to_gpu_migrations: AtomicU64,
    pub gpu_to_cpu_migrations: AtomicU64,
    pub total_bytes_migrated: AtomicU64,
    pub total_migration_time_us: AtomicU64,
    pub tlb_hits: AtomicU64,
    pub tlb_misses: AtomicU64,
    pub evictions: AtomicU64,
    pub kernel_launches: AtomicU64,
    pub page_prefetches: AtomicU64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.total_page_faults.store(0, Ordering::Relaxed);
        self.cpu_to_gpu_migrations.store(0, Ordering::Relaxed);
        self.gpu_to_cpu_migrations.store(0, Ordering::Relaxed);
        self.total_bytes_migrated.store(0, Ordering::Relaxed);
        self.total_migration_time_us.store(0, Ordering::Relaxed);
        self.tlb_hits.store(0, Ordering::Relaxed);
        self.tlb_misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.kernel_launches.store(0, Ordering::Relaxed);
        self.page_prefetches.store(0, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of every counter.
    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            total_page_faults: self.total_page_faults.load(Ordering::Relaxed),
            cpu_to_gpu_migrations: self.cpu_to_gpu_migrations.load(Ordering::Relaxed),
            gpu_to_cpu_migrations: self.gpu_to_cpu_migrations.load(Ordering::Relaxed),
            total_bytes_migrated: self.total_bytes_migrated.load(Ordering::Relaxed),
            total_migration_time_us: self.total_migration_time_us.load(Ordering::Relaxed),
            tlb_hits: self.tlb_hits.load(Ordering::Relaxed),
            tlb_misses: self.tlb_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            kernel_launches: self.kernel_launches.load(Ordering::Relaxed),
            page_prefetches: self.page_prefetches.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of the counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfSnapshot {
    pub total_page_faults: u64,
    pub cpu_to_gpu_migrations: u64,
    pub gpu_to_cpu_migrations: u64,
    pub total_bytes_migrated: u64,
    pub total_migration_time_us: u64,
    pub tlb_hits: u64,
    pub tlb_misses: u64,
    pub evictions: u64,
    pub kernel_launches: u64,
    pub page_prefetches: u64,
}

impl PerfSnapshot {
    /// Total migrations in either direction.
    pub fn total_migrations(&self) -> u64 {
        self.cpu_to_gpu_migrations + self.gpu_to_cpu_migrations
    }

    /// TLB hit rate over all lookups, 0.0 when no lookups happened.
    pub fn tlb_hit_rate(&self) -> f64 {
        let lookups = self.tlb_hits + self.tlb_misses;
        if lookups == 0 {
            0.0
        } else {
            self.tlb_hits as f64 / lookups as f64
        }
    }
}

impl std::fmt::Display for PerfSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Performance Counters ===")?;
        writeln!(f, "Page Faults:                 {}", self.total_page_faults)?;
        writeln!(f, "CPU->GPU Migrations:         {}", self.cpu_to_gpu_migrations)?;
        writeln!(f, "GPU->CPU Migrations:         {}", self.gpu_to_cpu_migrations)?;
        writeln!(f, "Total Bytes Migrated:        {}", self.total_bytes_migrated)?;
        writeln!(f, "Total Migration Time (us):   {}", self.total_migration_time_us)?;
        if self.total_bytes_migrated > 0 && self.total_migration_time_us > 0 {
            let gb_per_s = self.total_bytes_migrated as f64
                / self.total_migration_time_us as f64
                * 1e6
                / 1e9;
            writeln!(f, "Migration Bandwidth (GB/s):  {gb_per_s:.2}")?;
        }
        writeln!(f, "TLB Hits:                    {}", self.tlb_hits)?;
        writeln!(f, "TLB Misses:                  {}", self.tlb_misses)?;
        writeln!(f, "Total TLB Lookups:           {}", self.tlb_hits + self.tlb_misses)?;
        if self.tlb_hits + self.tlb_misses > 0 {
            writeln!(f, "TLB Hit Rate (%):            {:.2}", self.tlb_hit_rate() * 100.0)?;
        }
        writeln!(f, "Page Evictions:              {}", self.evictions)?;
        writeln!(f, "Kernel Launches:             {}", self.kernel_launches)?;
        write!(f, "Page Prefetches:             {}", self.page_prefetches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_reset() {
        let counters = PerfCounters::new();
        counters.total_page_faults.fetch_add(3, Ordering::Relaxed);
        counters.tlb_hits.fetch_add(9, Ordering::Relaxed);
        counters.tlb_misses.fetch_add(1, Ordering::Relaxed);

        let snap = counters.snapshot();
        assert_eq!(snap.total_page_faults, 3);
        assert_eq!(snap.tlb_hit_rate(), 0.9);

        counters.reset();
        assert_eq!(counters.snapshot(), PerfSnapshot::default());
    }

    #[test]
    fn display_contains_every_counter() {
        let snap = PerfSnapshot {
            total_page_faults: 1,
            kernel_launches: 42,
            ..Default::default()
        };
        let text = snap.to_string();
        assert!(text.contains("Page Faults"));
        assert!(text.contains("Kernel Launches:             42"));
    }
}
