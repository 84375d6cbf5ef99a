//! VPN → page entry mapping
//!
//! A sparse hash map of per-page residency state under a reader/writer
//! lock. Lookups hand out copies of entries; all mutation goes through
//! named setters that are no-ops for absent VPNs. Consistency across a
//! lookup-then-mutate sequence is the caller's job; the manager holds its
//! exclusive lock across the whole fault path.

use std::collections::HashMap;
use std::ptr::NonNull;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::types::{timestamp_us, PageResidency, Vpn};

/// Per-page residency record.
#[derive(Debug, Clone, Copy)]
pub struct PageEntry {
    /// Only valid entries are returned by lookups.
    pub valid: bool,
    /// Host copy present.
    pub resident_on_cpu: bool,
    /// Non-owning pointer into the host pool; Some iff a host page is held.
    pub cpu_address: Option<NonNull<u8>>,
    /// Accelerator copy present.
    pub resident_on_gpu: bool,
    /// Synthetic device address; 0 means no device page is held.
    pub gpu_address: u64,
    /// Host copy written since the last tier sync.
    pub dirty: bool,
    /// Eviction must never select this page. Reserved.
    pub pinned: bool,
    pub access_timestamp_us: u64,
    pub access_count: u32,
    /// Advisory mirror of the CLOCK reference bit; the policy owns the
    /// canonical one.
    pub clock_ref: u8,
}

impl Default for PageEntry {
    fn default() -> Self {
        Self {
            valid: false,
            resident_on_cpu: false,
            cpu_address: None,
            resident_on_gpu: false,
            gpu_address: 0,
            dirty: false,
            pinned: false,
            access_timestamp_us: 0,
            access_count: 0,
            clock_ref: 0,
        }
    }
}

impl PageEntry {
    fn fresh() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    /// Which tier(s) hold this page.
    pub fn residency(&self) -> PageResidency {
        match (self.resident_on_cpu, self.resident_on_gpu) {
            (true, true) => PageResidency::Both,
            (true, false) => PageResidency::HostOnly,
            (false, true) => PageResidency::DeviceOnly,
            (false, false) => PageResidency::Unallocated,
        }
    }
}

/// Sparse VPN → [`PageEntry`] table.
pub struct PageTable {
    page_size: usize,
    /// Upper bound on the VPN count; the table is never densely built.
    capacity_pages: u64,
    entries: RwLock<HashMap<Vpn, PageEntry>>,
}

// Safety: the only non-Send/Sync field inside the entries is the host page
// pointer, a non-owning handle into the allocator's pool. All map access is
// serialized by the RwLock; byte access through the handles is serialized
// by the manager.
unsafe impl Send for PageTable {}
unsafe impl Sync for PageTable {}

impl PageTable {
    /// Record the address-space capacity. No entries are materialized.
    pub fn new(page_size: usize, virtual_space_bytes: usize) -> Self {
        let capacity_pages = (virtual_space_bytes / page_size) as u64;
        debug!(capacity_pages, page_size, "page table initialized");
        Self {
            page_size,
            capacity_pages,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert fresh valid entries for `[start, start + count)`.
    ///
    /// Fails without touching the table if any VPN in the range already
    /// exists.
    pub fn allocate_vpn_range(&self, start: Vpn, count: u32) -> bool {
        let mut entries = self.entries.write();
        for i in 0..count as u64 {
            if entries.contains_key(&(start + i)) {
                warn!(vpn = start + i, "VPN already allocated");
                return false;
            }
        }
        for i in 0..count as u64 {
            entries.insert(start + i, PageEntry::fresh());
        }
        debug!(start, count, "allocated VPN range");
        true
    }

    /// Remove every present entry in `[start, start + count)`. Missing
    /// entries are tolerated.
    pub fn deallocate_vpn_range(&self, start: Vpn, count: u32) {
        let mut entries = self.entries.write();
        for i in 0..count as u64 {
            entries.remove(&(start + i));
        }
        debug!(start, count, "deallocated VPN range");
    }

    /// Read-only lookup; never materializes an entry.
    pub fn lookup_entry(&self, vpn: Vpn) -> Option<PageEntry> {
        self.entries.read().get(&vpn).copied()
    }

    /// True when `vpn` has an entry.
    pub fn contains(&self, vpn: Vpn) -> bool {
        self.entries.read().contains_key(&vpn)
    }

    /// Fetch the entry for `vpn`, materializing an empty valid one if
    /// absent. Only fault-resolution paths that intend to populate the
    /// entry may call this.
    pub fn get_or_create(&self, vpn: Vpn) -> PageEntry {
        *self
            .entries
            .write()
            .entry(vpn)
            .or_insert_with(PageEntry::fresh)
    }

    fn with_entry_mut(&self, vpn: Vpn, mutate: impl FnOnce(&mut PageEntry)) {
        if let Some(entry) = self.entries.write().get_mut(&vpn) {
            mutate(entry);
        }
    }

    /// Install a host page and mark the host copy resident.
    pub fn set_cpu_resident(&self, vpn: Vpn, cpu_addr: NonNull<u8>) {
        self.with_entry_mut(vpn, |entry| {
            entry.resident_on_cpu = true;
            entry.cpu_address = Some(cpu_addr);
            entry.access_timestamp_us = timestamp_us();
        });
    }

    /// Install a device page and mark the accelerator copy resident.
    pub fn set_gpu_resident(&self, vpn: Vpn, gpu_addr: u64) {
        self.with_entry_mut(vpn, |entry| {
            entry.resident_on_gpu = true;
            entry.gpu_address = gpu_addr;
            entry.access_timestamp_us = timestamp_us();
        });
    }

    /// Drop the accelerator copy: residency cleared, address back to the
    /// absent sentinel.
    pub fn clear_gpu_residency(&self, vpn: Vpn) {
        self.with_entry_mut(vpn, |entry| {
            entry.resident_on_gpu = false;
            entry.gpu_address = 0;
        });
    }

    /// Migration completion, host → device: the copies are now identical.
    pub fn mark_migrated_to_gpu(&self, vpn: Vpn, gpu_addr: u64) {
        self.with_entry_mut(vpn, |entry| {
            entry.resident_on_gpu = true;
            entry.gpu_address = gpu_addr;
            entry.dirty = false;
        });
    }

    /// Migration completion, device → host. Does not touch the dirty bit.
    pub fn mark_migrated_to_cpu(&self, vpn: Vpn, cpu_addr: NonNull<u8>) {
        self.with_entry_mut(vpn, |entry| {
            entry.resident_on_cpu = true;
            entry.cpu_address = Some(cpu_addr);
        });
    }

    /// Pin or unpin a page; pinned pages are exempt from device eviction.
    pub fn set_pinned(&self, vpn: Vpn, pinned: bool) {
        self.with_entry_mut(vpn, |entry| entry.pinned = pinned);
    }

    pub fn mark_dirty(&self, vpn: Vpn) {
        self.with_entry_mut(vpn, |entry| entry.dirty = true);
    }

    pub fn clear_dirty(&self, vpn: Vpn) {
        self.with_entry_mut(vpn, |entry| entry.dirty = false);
    }

    /// Refresh the access timestamp and bump the access count.
    pub fn update_access_time(&self, vpn: Vpn) {
        self.with_entry_mut(vpn, |entry| {
            entry.access_timestamp_us = timestamp_us();
            entry.access_count += 1;
        });
    }

    /// Snapshot of every valid entry.
    pub fn valid_entries(&self) -> Vec<(Vpn, PageEntry)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.valid)
            .map(|(&vpn, &entry)| (vpn, entry))
            .collect()
    }

    /// Number of present entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn capacity_pages(&self) -> u64 {
        self.capacity_pages
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
