//! Virtual memory manager
//!
//! Single entry point of the engine: owns the page table, the physical
//! pools, the TLB, the replacement policy, and the migration manager, and
//! orchestrates allocation, fault resolution, eviction, and counters.
//!
//! Public operations take the manager's writer lock for their whole
//! duration, so a fault-resolution sequence never observes concurrent
//! reshaping. Counters are atomics and may be read without any lock.
//!
//! Lock order below this one: page table, then TLB / allocator / policy /
//! migration queue. No component acquires a higher lock while holding a
//! lower one.

use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::allocator::{AllocatorConfig, PageAllocator};
use crate::config::VmConfig;
use crate::counters::{PerfCounters, PerfSnapshot};
use crate::error::Result;
use crate::migration::{MigrationConfig, MigrationManager};
use crate::page_table::PageTable;
use crate::policy::{build_policy, ReplacementPolicy};
use crate::tlb::{Tlb, TlbConfig, TlbEntry};
use crate::types::{align_to_page, vaddr_to_vpn, vpn_to_vaddr, Address, Vpn};

/// One live allocation: its starting VPN and exact page count.
#[derive(Debug, Clone, Copy)]
struct AllocationSpan {
    start_vpn: Vpn,
    num_pages: u32,
}

impl AllocationSpan {
    fn contains(&self, vpn: Vpn) -> bool {
        vpn >= self.start_vpn && vpn < self.start_vpn + self.num_pages as u64
    }
}

/// Everything owned by an initialized manager.
///
/// Fields drop top-down: the migration workers must join before the
/// structures they reference are torn down, mirroring reverse construction
/// order.
struct ManagerState {
    migration: MigrationManager,
    policy: Box<dyn ReplacementPolicy>,
    tlb: Tlb,
    allocator: Arc<PageAllocator>,
    page_table: Arc<PageTable>,
    config: VmConfig,
    /// Monotonic VPN reservation cursor.
    next_vpn: Vpn,
    /// vaddr → allocation span, one entry per live allocation.
    allocations: HashMap<Address, AllocationSpan>,
    /// Mirror of the page table's device-residency bits.
    gpu_resident: HashSet<Vpn>,
}

/// Orchestrator for the two-tier paged address space.
///
/// Create one uninitialized, call [`initialize`](Self::initialize), use the
/// access operations, and [`shutdown`](Self::shutdown) (or drop) when done.
/// A second `initialize` on a live instance logs a warning and is ignored.
pub struct VmManager {
    state: RwLock<Option<ManagerState>>,
    counters: PerfCounters,
}

impl Default for VmManager {
    fn default() -> Self {
        Self::new()
    }
}

impl VmManager {
    /// An uninitialized manager. Every operation warns and no-ops until
    /// [`initialize`](Self::initialize) succeeds.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
            counters: PerfCounters::new(),
        }
    }

    /// Convenience: build and initialize in one step.
    pub fn with_config(config: VmConfig) -> Result<Self> {
        let manager = Self::new();
        manager.initialize(config)?;
        Ok(manager)
    }

    /// Construct every subsystem. Idempotent with a warning: a second call
    /// on a live instance changes nothing.
    pub fn initialize(&self, config: VmConfig) -> Result<()> {
        let mut guard = self.state.write();
        if guard.is_some() {
            warn!("virtual memory manager already initialized");
            return Ok(());
        }

        config.validate()?;

        info!(
            page_size = config.page_size,
            virtual_address_space = config.virtual_address_space,
            cpu_memory = config.cpu_memory,
            gpu_memory = config.gpu_memory,
            tlb_size = config.tlb_size,
            policy = %config.replacement_policy,
            simulator = config.use_gpu_simulator,
            log_level = %config.log_level,
            "initializing virtual memory manager"
        );

        let page_table = Arc::new(PageTable::new(config.page_size, config.virtual_address_space));
        let allocator = Arc::new(PageAllocator::new(AllocatorConfig {
            page_size: config.page_size,
            cpu_pool_bytes: config.cpu_memory,
            gpu_pool_bytes: config.gpu_memory,
            use_pinned_memory: config.use_pinned_memory,
            use_gpu_simulator: config.use_gpu_simulator,
        })?);
        let tlb = Tlb::new(TlbConfig {
            tlb_size: config.tlb_size,
            associativity: config.tlb_associativity,
        });
        let migration = MigrationManager::new(
            Arc::clone(&page_table),
            Arc::clone(&allocator),
            MigrationConfig::default(),
        );
        let policy = build_policy(config.replacement_policy, allocator.total_cpu_pages());

        *guard = Some(ManagerState {
            migration,
            policy,
            tlb,
            allocator,
            page_table,
            config,
            next_vpn: 0,
            allocations: HashMap::new(),
            gpu_resident: HashSet::new(),
        });

        info!("virtual memory manager initialized");
        Ok(())
    }

    /// Tear down every subsystem (workers join first) and return to the
    /// uninitialized state. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let mut guard = self.state.write();
        if let Some(state) = guard.take() {
            info!("shutting down virtual memory manager");
            drop(state);
            info!("virtual memory manager shutdown complete");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().is_some()
    }

    /// Page size of the running instance.
    pub fn page_size(&self) -> Option<usize> {
        self.state.read().as_ref().map(|s| s.config.page_size)
    }

    // -----------------------------------------------------------------
    // Allocation lifecycle
    // -----------------------------------------------------------------

    /// Reserve a contiguous virtual range of at least `bytes` bytes
    /// (rounded up to whole pages; zero rounds up to one page), backed by
    /// host pages. With `prefetch_to_gpu`, each page is also migrated to
    /// the device tier, best effort.
    ///
    /// Returns the starting virtual address, or None when the host pool or
    /// the address space is exhausted; partial progress is unwound.
    pub fn allocate(&self, bytes: usize, prefetch_to_gpu: bool) -> Option<Address> {
        let mut guard = self.state.write();
        let Some(state) = guard.as_mut() else {
            error!("virtual memory manager not initialized");
            return None;
        };

        let page_size = state.config.page_size;
        let num_pages = (align_to_page(bytes, page_size) / page_size).max(1) as u32;
        let start_vpn = state.next_vpn;

        if start_vpn + num_pages as u64 > state.page_table.capacity_pages() {
            warn!(bytes, "virtual address space exhausted");
            return None;
        }
        if !state.page_table.allocate_vpn_range(start_vpn, num_pages) {
            error!(start_vpn, num_pages, "failed to reserve VPN range");
            return None;
        }

        let mut cpu_pages: Vec<NonNull<u8>> = Vec::with_capacity(num_pages as usize);
        for i in 0..num_pages as u64 {
            let vpn = start_vpn + i;
            let Some(cpu_page) = state.allocator.allocate_cpu_page() else {
                error!(vpn, "host pool exhausted; unwinding partial allocation");
                for page in cpu_pages.drain(..) {
                    state.allocator.deallocate_cpu_page(page);
                }
                state.page_table.deallocate_vpn_range(start_vpn, num_pages);
                return None;
            };
            cpu_pages.push(cpu_page);
            state.page_table.set_cpu_resident(vpn, cpu_page);
            state.page_table.update_access_time(vpn);
            state.policy.on_page_allocated(vpn);
        }

        if prefetch_to_gpu {
            if state.config.enable_prefetch {
                for i in 0..num_pages as u64 {
                    let vpn = start_vpn + i;
                    let Some(gpu_addr) = state.allocator.allocate_gpu_page() else {
                        warn!(vpn, "device pool exhausted; prefetch skipped for page");
                        continue;
                    };
                    state.page_table.set_gpu_resident(vpn, gpu_addr);
                    state.gpu_resident.insert(vpn);

                    let elapsed = state.migration.migrate_cpu_to_gpu(
                        vpn,
                        Some(cpu_pages[i as usize]),
                        gpu_addr,
                        page_size,
                    );
                    self.record_migration(&self.counters.cpu_to_gpu_migrations, page_size, elapsed);
                    self.counters.page_prefetches.fetch_add(1, Ordering::Relaxed);
                }
            } else {
                debug!("prefetch disabled by configuration; request ignored");
            }
        }

        let vaddr = vpn_to_vaddr(start_vpn, page_size);
        state.allocations.insert(
            vaddr,
            AllocationSpan {
                start_vpn,
                num_pages,
            },
        );
        state.next_vpn += num_pages as u64;

        debug!(vaddr, bytes, num_pages, "allocated virtual range");
        Some(vaddr)
    }

    /// Release every page of the allocation starting at `vaddr`: physical
    /// pages on both tiers, policy tracking, TLB entries, and the page
    /// table range. An unmapped address warns and does nothing.
    pub fn free(&self, vaddr: Address) {
        let mut guard = self.state.write();
        let Some(state) = guard.as_mut() else {
            error!("virtual memory manager not initialized");
            return;
        };

        let Some(span) = state.allocations.remove(&vaddr) else {
            warn!(vaddr, "freeing unmapped virtual address");
            return;
        };

        for i in 0..span.num_pages as u64 {
            let vpn = span.start_vpn + i;
            if let Some(entry) = state.page_table.lookup_entry(vpn) {
                if let Some(cpu_addr) = entry.cpu_address {
                    state.allocator.deallocate_cpu_page(cpu_addr);
                }
                if entry.gpu_address != 0 {
                    state.allocator.deallocate_gpu_page(entry.gpu_address);
                }
            }
            state.gpu_resident.remove(&vpn);
            state.policy.on_page_freed(vpn);
            state.tlb.invalidate(vpn);
        }

        state.page_table.deallocate_vpn_range(span.start_vpn, span.num_pages);
        debug!(vaddr, num_pages = span.num_pages, "freed virtual range");
    }

    // -----------------------------------------------------------------
    // Access operations
    // -----------------------------------------------------------------

    /// Record an access to the page containing `vaddr`, faulting it to the
    /// host tier if needed. A write access marks the page dirty.
    pub fn touch_page(&self, vaddr: Address, is_write: bool) {
        let mut guard = self.state.write();
        let Some(state) = guard.as_mut() else {
            error!("virtual memory manager not initialized");
            return;
        };

        let vpn = vaddr_to_vpn(vaddr, state.config.page_size);
        self.consult_tlb(state, vpn);

        match state.page_table.lookup_entry(vpn) {
            None => {
                self.counters.total_page_faults.fetch_add(1, Ordering::Relaxed);
                self.resolve_page_fault(state, vpn, false);
            }
            Some(entry) if !entry.resident_on_cpu => {
                self.resolve_page_fault(state, vpn, false);
            }
            Some(_) => {}
        }

        state.page_table.update_access_time(vpn);
        if is_write {
            state.page_table.mark_dirty(vpn);
        }
        state.policy.on_page_access(vpn);
        self.refresh_tlb(state, vpn);
    }

    /// Copy `buf.len()` bytes starting at `vaddr` into `buf`, paging each
    /// touched page onto the host tier first.
    pub fn read_from_vaddr(&self, vaddr: Address, buf: &mut [u8]) {
        let mut guard = self.state.write();
        let Some(state) = guard.as_mut() else {
            error!("virtual memory manager not initialized");
            return;
        };

        let page_size = state.config.page_size;
        let mut offset = 0usize;
        while offset < buf.len() {
            let addr = vaddr + offset as u64;
            let vpn = vaddr_to_vpn(addr, page_size);
            let page_offset = (addr % page_size as u64) as usize;
            let chunk = (page_size - page_offset).min(buf.len() - offset);

            self.consult_tlb(state, vpn);
            let Some(cpu_addr) = self.ensure_host_copy(state, vpn) else {
                error!(vpn, "read from unresolvable virtual address");
                return;
            };
            // Safety: cpu_addr points at a live page of page_size bytes and
            // page_offset + chunk never crosses its end.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    cpu_addr.as_ptr().add(page_offset),
                    buf.as_mut_ptr().add(offset),
                    chunk,
                );
            }
            state.page_table.update_access_time(vpn);
            self.refresh_tlb(state, vpn);
            offset += chunk;
        }
    }

    /// Copy `data` to the virtual range starting at `vaddr`, paging each
    /// touched page onto the host tier first and marking it dirty.
    pub fn write_to_vaddr(&self, vaddr: Address, data: &[u8]) {
        let mut guard = self.state.write();
        let Some(state) = guard.as_mut() else {
            error!("virtual memory manager not initialized");
            return;
        };

        let page_size = state.config.page_size;
        let mut offset = 0usize;
        while offset < data.len() {
            let addr = vaddr + offset as u64;
            let vpn = vaddr_to_vpn(addr, page_size);
            let page_offset = (addr % page_size as u64) as usize;
            let chunk = (page_size - page_offset).min(data.len() - offset);

            self.consult_tlb(state, vpn);
            let Some(cpu_addr) = self.ensure_host_copy(state, vpn) else {
                error!(vpn, "write to unresolvable virtual address");
                return;
            };
            // Safety: as in read_from_vaddr.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(offset),
                    cpu_addr.as_ptr().add(page_offset),
                    chunk,
                );
            }
            state.page_table.mark_dirty(vpn);
            state.page_table.update_access_time(vpn);
            self.refresh_tlb(state, vpn);
            offset += chunk;
        }
    }

    /// Ensure the page containing `vaddr` is host-resident. With
    /// `prefetch`, the rest of its allocation is pulled host-side too.
    pub fn map_to_cpu(&self, vaddr: Address, prefetch: bool) {
        let mut guard = self.state.write();
        let Some(state) = guard.as_mut() else {
            error!("virtual memory manager not initialized");
            return;
        };

        let vpn = vaddr_to_vpn(vaddr, state.config.page_size);
        if state.page_table.lookup_entry(vpn).is_none() {
            return;
        }
        self.resolve_page_fault(state, vpn, false);

        if prefetch {
            let span = state
                .allocations
                .values()
                .find(|span| span.contains(vpn))
                .copied();
            if let Some(span) = span {
                for i in 0..span.num_pages as u64 {
                    let other = span.start_vpn + i;
                    if other != vpn {
                        self.resolve_page_fault(state, other, false);
                    }
                }
            }
        }
    }

    /// Ensure the page containing `vaddr` is device-resident, evicting a
    /// victim if the device pool is full.
    pub fn map_to_gpu(&self, vaddr: Address) {
        let mut guard = self.state.write();
        let Some(state) = guard.as_mut() else {
            error!("virtual memory manager not initialized");
            return;
        };

        let vpn = vaddr_to_vpn(vaddr, state.config.page_size);
        if state.page_table.lookup_entry(vpn).is_none() {
            return;
        }
        self.resolve_page_fault(state, vpn, true);
    }

    /// Residency hint; identical to [`map_to_gpu`](Self::map_to_gpu).
    pub fn prefetch_to_gpu(&self, vaddr: Address) {
        self.map_to_gpu(vaddr);
    }

    /// Block until the asynchronous migration queue drains.
    pub fn sync_all_migrations(&self) {
        let guard = self.state.read();
        if let Some(state) = guard.as_ref() {
            state.migration.wait_for_migrations();
            debug!("all migrations completed");
        }
    }

    // -----------------------------------------------------------------
    // Counters and statistics
    // -----------------------------------------------------------------

    /// The live atomic counters. Readable without any lock.
    pub fn perf_counters(&self) -> &PerfCounters {
        &self.counters
    }

    /// Point-in-time copy of the counters.
    pub fn perf_snapshot(&self) -> PerfSnapshot {
        self.counters.snapshot()
    }

    /// Zero every counter.
    pub fn reset_counters(&self) {
        self.counters.reset();
    }

    /// Device pages currently holding a resident copy.
    pub fn gpu_pages_used(&self) -> usize {
        self.state
            .read()
            .as_ref()
            .map(|s| s.gpu_resident.len())
            .unwrap_or(0)
    }

    /// Free pages remaining in the device pool.
    pub fn gpu_pages_available(&self) -> usize {
        self.state
            .read()
            .as_ref()
            .map(|s| s.allocator.available_gpu_pages())
            .unwrap_or(0)
    }

    /// Host pages currently drawn from the pool.
    pub fn cpu_pages_used(&self) -> usize {
        self.state
            .read()
            .as_ref()
            .map(|s| s.allocator.total_cpu_pages() - s.allocator.available_cpu_pages())
            .unwrap_or(0)
    }

    /// Human-readable dump of counters, TLB statistics, and pool usage.
    pub fn print_stats(&self) {
        let guard = self.state.read();
        println!("{}", self.counters.snapshot());
        if let Some(state) = guard.as_ref() {
            println!();
            println!("=== TLB Statistics ===");
            println!("TLB Hits:         {}", state.tlb.hits());
            println!("TLB Misses:       {}", state.tlb.misses());
            println!("TLB Hit Rate (%): {:.2}", state.tlb.hit_rate() * 100.0);
            println!();
            println!("=== Memory Usage ===");
            println!("GPU Pages Used:      {}", state.gpu_resident.len());
            println!("GPU Pages Available: {}", state.allocator.available_gpu_pages());
        }
    }

    // -----------------------------------------------------------------
    // Fault resolution and eviction
    // -----------------------------------------------------------------

    /// Resolve residency for `vpn` on the requested tier, materializing the
    /// entry if needed, drawing a physical page, and migrating the bytes
    /// from the other tier when a copy exists there.
    fn resolve_page_fault(&self, state: &mut ManagerState, vpn: Vpn, target_is_gpu: bool) {
        let page_size = state.config.page_size;
        let entry = state.page_table.get_or_create(vpn);

        if target_is_gpu {
            if entry.resident_on_gpu {
                return;
            }

            let mut gpu_addr = entry.gpu_address;
            if gpu_addr == 0 {
                gpu_addr = match state.allocator.allocate_gpu_page() {
                    Some(addr) => addr,
                    None => {
                        self.evict_page_from_gpu(state);
                        match state.allocator.allocate_gpu_page() {
                            Some(addr) => addr,
                            None => {
                                warn!(vpn, "device pool still exhausted after eviction");
                                return;
                            }
                        }
                    }
                };
            }

            if entry.resident_on_cpu {
                let elapsed =
                    state
                        .migration
                        .migrate_cpu_to_gpu(vpn, entry.cpu_address, gpu_addr, page_size);
                self.record_migration(&self.counters.cpu_to_gpu_migrations, page_size, elapsed);
            }
            state.page_table.set_gpu_resident(vpn, gpu_addr);
            state.gpu_resident.insert(vpn);
        } else {
            if entry.resident_on_cpu {
                return;
            }

            let cpu_addr = match entry.cpu_address {
                Some(addr) => addr,
                None => match state.allocator.allocate_cpu_page() {
                    Some(addr) => addr,
                    None => {
                        error!(vpn, "host pool exhausted during fault resolution");
                        return;
                    }
                },
            };

            if entry.resident_on_gpu {
                let elapsed = state.migration.migrate_gpu_to_cpu(
                    vpn,
                    entry.gpu_address,
                    Some(cpu_addr),
                    page_size,
                );
                self.record_migration(&self.counters.gpu_to_cpu_migrations, page_size, elapsed);
            }
            state.page_table.set_cpu_resident(vpn, cpu_addr);
        }
    }

    /// Release one device page. The policy proposes a victim; a proposal
    /// that is not device-resident (the policy tracks every allocated page)
    /// or is pinned falls back to an arbitrary evictable member of the
    /// resident set so eviction always makes progress. A dirty,
    /// host-resident victim is written back first.
    fn evict_page_from_gpu(&self, state: &mut ManagerState) {
        if state.gpu_resident.is_empty() {
            return;
        }

        let evictable = |vpn: Vpn| {
            state.gpu_resident.contains(&vpn)
                && !state
                    .page_table
                    .lookup_entry(vpn)
                    .map(|entry| entry.pinned)
                    .unwrap_or(false)
        };

        let proposed = state.policy.select_victim();
        let victim = match proposed {
            Some(vpn) if evictable(vpn) => vpn,
            _ => match state.gpu_resident.iter().copied().find(|&vpn| evictable(vpn)) {
                Some(vpn) => vpn,
                None => {
                    warn!("every device-resident page is pinned; nothing to evict");
                    return;
                }
            },
        };

        let Some(entry) = state.page_table.lookup_entry(victim) else {
            state.gpu_resident.remove(&victim);
            return;
        };

        let page_size = state.config.page_size;
        if entry.dirty && entry.resident_on_cpu {
            let elapsed = state.migration.migrate_gpu_to_cpu(
                victim,
                entry.gpu_address,
                entry.cpu_address,
                page_size,
            );
            self.record_migration(&self.counters.gpu_to_cpu_migrations, page_size, elapsed);
        }

        if entry.gpu_address != 0 {
            state.allocator.deallocate_gpu_page(entry.gpu_address);
        }
        state.page_table.clear_gpu_residency(victim);
        state.gpu_resident.remove(&victim);
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        state.tlb.invalidate(victim);

        debug!(victim, "evicted page from device tier");
    }

    // -----------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------

    /// Resolve a host copy for `vpn` and return its pointer.
    fn ensure_host_copy(&self, state: &mut ManagerState, vpn: Vpn) -> Option<NonNull<u8>> {
        let resident = state
            .page_table
            .lookup_entry(vpn)
            .map(|entry| entry.resident_on_cpu)
            .unwrap_or(false);
        if !resident {
            self.resolve_page_fault(state, vpn, false);
        }
        state.page_table.lookup_entry(vpn)?.cpu_address
    }

    fn consult_tlb(&self, state: &ManagerState, vpn: Vpn) {
        if state.tlb.lookup(vpn).is_some() {
            self.counters.tlb_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.tlb_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn refresh_tlb(&self, state: &ManagerState, vpn: Vpn) {
        if let Some(entry) = state.page_table.lookup_entry(vpn) {
            state
                .tlb
                .insert(vpn, TlbEntry::new(vpn, entry.cpu_address, entry.gpu_address));
        }
    }

    fn record_migration(&self, direction: &AtomicU64, page_size: usize, elapsed_us: u64) {
        direction.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_bytes_migrated
            .fetch_add(page_size as u64, Ordering::Relaxed);
        self.counters
            .total_migration_time_us
            .fetch_add(elapsed_us, Ordering::Relaxed);
    }
}

impl Drop for VmManager {
    fn drop(&mut self) {
        if self.state.get_mut().is_some() {
            self.shutdown();
        }
    }
}
