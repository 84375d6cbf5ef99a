//! Tier-to-tier page migration
//!
//! Synchronous copies run on the caller's thread and report elapsed
//! wall-clock microseconds. Asynchronous copies go through a FIFO drained
//! by a bounded pool of long-lived workers; `wait_for_migrations` polls the
//! queue empty. Shutdown raises a flag, wakes every worker, joins them, and
//! discards whatever is still queued.
//!
//! A migration whose page was freed in the meantime is a no-op returning 0,
//! as is one handed a missing address.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::allocator::PageAllocator;
use crate::page_table::PageTable;
use crate::types::{timestamp_us, Vpn};

/// Configuration for [`MigrationManager`].
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Spawn the worker pool and accept queued migrations.
    pub async_migration: bool,
    /// Worker count; also the queue's drain parallelism.
    pub max_concurrent_migrations: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            async_migration: true,
            max_concurrent_migrations: 4,
        }
    }
}

/// A queued page copy.
enum MigrationJob {
    CpuToGpu {
        vpn: Vpn,
        cpu_addr: NonNull<u8>,
        gpu_addr: u64,
        page_size: usize,
    },
    GpuToCpu {
        vpn: Vpn,
        gpu_addr: u64,
        cpu_addr: NonNull<u8>,
        page_size: usize,
    },
}

// Safety: the host pointers are non-owning handles into the allocator's
// pool, which outlives the worker pool (workers are joined before the
// shared Arcs are released).
unsafe impl Send for MigrationJob {}

struct MigrationShared {
    page_table: Arc<PageTable>,
    allocator: Arc<PageAllocator>,
    queue: Mutex<VecDeque<MigrationJob>>,
    work_available: Condvar,
    shutdown: AtomicBool,
}

impl MigrationShared {
    /// Copy host → device and flip residency. Returns elapsed microseconds,
    /// or 0 when the request refers to a missing address or freed page.
    fn migrate_cpu_to_gpu(
        &self,
        vpn: Vpn,
        cpu_addr: Option<NonNull<u8>>,
        gpu_addr: u64,
        page_size: usize,
    ) -> u64 {
        let Some(src) = cpu_addr else { return 0 };
        if gpu_addr == 0 || !self.page_table.contains(vpn) {
            return 0;
        }

        let start = timestamp_us();
        // Safety: src is a live host page of at least page_size bytes; the
        // destination is bounds-checked inside the allocator.
        unsafe { self.allocator.copy_page_to_device(gpu_addr, src, page_size) };
        self.page_table.mark_migrated_to_gpu(vpn, gpu_addr);
        let elapsed = timestamp_us().saturating_sub(start);

        trace!(vpn, gpu_addr, page_size, elapsed, "migrated page CPU->GPU");
        elapsed
    }

    /// Copy device → host and flip residency. Does not clear the dirty
    /// bit. Returns elapsed microseconds, or 0 on a missing address or
    /// freed page.
    fn migrate_gpu_to_cpu(
        &self,
        vpn: Vpn,
        gpu_addr: u64,
        cpu_addr: Option<NonNull<u8>>,
        page_size: usize,
    ) -> u64 {
        let Some(dst) = cpu_addr else { return 0 };
        if gpu_addr == 0 || !self.page_table.contains(vpn) {
            return 0;
        }

        let start = timestamp_us();
        // Safety: dst is a live host page of at least page_size bytes.
        unsafe { self.allocator.copy_page_from_device(gpu_addr, dst, page_size) };
        self.page_table.mark_migrated_to_cpu(vpn, dst);
        let elapsed = timestamp_us().saturating_sub(start);

        trace!(vpn, gpu_addr, page_size, elapsed, "migrated page GPU->CPU");
        elapsed
    }

    fn run(&self, job: MigrationJob) {
        match job {
            MigrationJob::CpuToGpu {
                vpn,
                cpu_addr,
                gpu_addr,
                page_size,
            } => {
                self.migrate_cpu_to_gpu(vpn, Some(cpu_addr), gpu_addr, page_size);
            }
            MigrationJob::GpuToCpu {
                vpn,
                gpu_addr,
                cpu_addr,
                page_size,
            } => {
                self.migrate_gpu_to_cpu(vpn, gpu_addr, Some(cpu_addr), page_size);
            }
        }
    }
}

fn worker_loop(shared: Arc<MigrationShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                shared.work_available.wait(&mut queue);
            }
        };
        shared.run(job);
    }
}

/// Sync and async page copies over a bounded worker pool.
pub struct MigrationManager {
    shared: Arc<MigrationShared>,
    workers: Vec<JoinHandle<()>>,
}

impl MigrationManager {
    pub fn new(
        page_table: Arc<PageTable>,
        allocator: Arc<PageAllocator>,
        config: MigrationConfig,
    ) -> Self {
        let shared = Arc::new(MigrationShared {
            page_table,
            allocator,
            queue: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let workers = if config.async_migration {
            (0..config.max_concurrent_migrations)
                .map(|i| {
                    let shared = Arc::clone(&shared);
                    std::thread::Builder::new()
                        .name(format!("uvm-migrate-{i}"))
                        .spawn(move || worker_loop(shared))
                        .expect("failed to spawn migration worker")
                })
                .collect()
        } else {
            Vec::new()
        };

        debug!(workers = workers.len(), "migration manager started");
        Self { shared, workers }
    }

    /// Synchronously copy a page host → device. Returns elapsed
    /// microseconds; 0 means the request was a no-op.
    pub fn migrate_cpu_to_gpu(
        &self,
        vpn: Vpn,
        cpu_addr: Option<NonNull<u8>>,
        gpu_addr: u64,
        page_size: usize,
    ) -> u64 {
        self.shared.migrate_cpu_to_gpu(vpn, cpu_addr, gpu_addr, page_size)
    }

    /// Synchronously copy a page device → host. Returns elapsed
    /// microseconds; 0 means the request was a no-op.
    pub fn migrate_gpu_to_cpu(
        &self,
        vpn: Vpn,
        gpu_addr: u64,
        cpu_addr: Option<NonNull<u8>>,
        page_size: usize,
    ) -> u64 {
        self.shared.migrate_gpu_to_cpu(vpn, gpu_addr, cpu_addr, page_size)
    }

    /// Queue a host → device copy and return immediately.
    pub fn async_migrate_cpu_to_gpu(
        &self,
        vpn: Vpn,
        cpu_addr: NonNull<u8>,
        gpu_addr: u64,
        page_size: usize,
    ) {
        self.enqueue(MigrationJob::CpuToGpu {
            vpn,
            cpu_addr,
            gpu_addr,
            page_size,
        });
    }

    /// Queue a device → host copy and return immediately.
    pub fn async_migrate_gpu_to_cpu(
        &self,
        vpn: Vpn,
        gpu_addr: u64,
        cpu_addr: NonNull<u8>,
        page_size: usize,
    ) {
        self.enqueue(MigrationJob::GpuToCpu {
            vpn,
            gpu_addr,
            cpu_addr,
            page_size,
        });
    }

    fn enqueue(&self, job: MigrationJob) {
        if self.workers.is_empty() {
            // No pool: run on the caller, keeping the operation's effect.
            self.shared.run(job);
            return;
        }
        self.shared.queue.lock().push_back(job);
        self.shared.work_available.notify_one();
    }

    /// Block until the queue is empty. 1 ms polling.
    pub fn wait_for_migrations(&self) {
        loop {
            if self.shared.queue.lock().is_empty() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Queue length at this instant.
    pub fn pending_migrations(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Drop for MigrationManager {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        // Whatever is still queued is discarded.
        let dropped = {
            let mut queue = self.shared.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        if dropped > 0 {
            debug!(dropped, "discarded queued migrations at shutdown");
        }
    }
}
