//! Set-associative translation cache
//!
//! VPNs hash (FNV-1a) into `tlb_size / associativity` sets; each set holds
//! up to `associativity` entries and evicts its least recently used entry
//! (smallest timestamp) on overflow. One mutex covers the whole structure;
//! the hit/miss counters live under it.

use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::debug;

use crate::types::{hash_vpn, timestamp_us, Vpn};

/// Cached translation for one VPN.
#[derive(Debug, Clone, Copy)]
pub struct TlbEntry {
    pub vpn: Vpn,
    /// Host pointer at the time of caching; None if not host-resident.
    pub cpu_address: Option<NonNull<u8>>,
    /// Device address at the time of caching; 0 if not device-resident.
    pub gpu_address: u64,
    pub timestamp_us: u64,
    pub valid: bool,
}

impl TlbEntry {
    pub fn new(vpn: Vpn, cpu_address: Option<NonNull<u8>>, gpu_address: u64) -> Self {
        Self {
            vpn,
            cpu_address,
            gpu_address,
            timestamp_us: 0,
            valid: true,
        }
    }
}

/// Geometry of the cache.
#[derive(Debug, Clone)]
pub struct TlbConfig {
    /// Total entry capacity.
    pub tlb_size: usize,
    /// Entries per set.
    pub associativity: usize,
}

impl Default for TlbConfig {
    fn default() -> Self {
        Self {
            tlb_size: crate::config::DEFAULT_TLB_SIZE,
            associativity: crate::config::DEFAULT_TLB_ASSOCIATIVITY,
        }
    }
}

struct TlbState {
    sets: Vec<Vec<TlbEntry>>,
    hits: u64,
    misses: u64,
}

/// Set-associative VPN → translation cache with per-set LRU.
pub struct Tlb {
    associativity: usize,
    num_sets: usize,
    state: Mutex<TlbState>,
}

// Safety: the cached host pointers are non-owning handles; all access to
// the structure goes through the mutex.
unsafe impl Send for Tlb {}
unsafe impl Sync for Tlb {}

impl Tlb {
    pub fn new(config: TlbConfig) -> Self {
        let num_sets = (config.tlb_size / config.associativity).max(1);
        debug!(num_sets, associativity = config.associativity, "TLB initialized");
        Self {
            associativity: config.associativity,
            num_sets,
            state: Mutex::new(TlbState {
                sets: vec![Vec::with_capacity(config.associativity); num_sets],
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn set_index(&self, vpn: Vpn) -> usize {
        hash_vpn(vpn) as usize % self.num_sets
    }

    /// Look up a translation. A hit refreshes the entry's timestamp.
    pub fn lookup(&self, vpn: Vpn) -> Option<TlbEntry> {
        let set_idx = self.set_index(vpn);
        let mut state = self.state.lock();

        let found = state.sets[set_idx]
            .iter_mut()
            .find(|entry| entry.valid && entry.vpn == vpn)
            .map(|entry| {
                entry.timestamp_us = timestamp_us();
                *entry
            });

        match found {
            Some(entry) => {
                state.hits += 1;
                Some(entry)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Insert or refresh a translation. A full set evicts its least
    /// recently used entry first.
    pub fn insert(&self, vpn: Vpn, entry: TlbEntry) {
        let set_idx = self.set_index(vpn);
        let mut state = self.state.lock();
        let set = &mut state.sets[set_idx];

        let mut fresh = entry;
        fresh.vpn = vpn;
        fresh.valid = true;
        fresh.timestamp_us = timestamp_us();

        if let Some(existing) = set.iter_mut().find(|e| e.vpn == vpn) {
            *existing = fresh;
            return;
        }

        if set.len() >= self.associativity {
            if let Some(lru_idx) = set
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.timestamp_us)
                .map(|(i, _)| i)
            {
                set.remove(lru_idx);
            }
        }
        set.push(fresh);
    }

    /// Drop the translation for `vpn`, if cached.
    pub fn invalidate(&self, vpn: Vpn) {
        let set_idx = self.set_index(vpn);
        let mut state = self.state.lock();
        state.sets[set_idx].retain(|entry| entry.vpn != vpn);
    }

    /// Drop every cached translation. Counters are unaffected.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        for set in state.sets.iter_mut() {
            set.clear();
        }
    }

    pub fn hits(&self) -> u64 {
        self.state.lock().hits
    }

    pub fn misses(&self) -> u64 {
        self.state.lock().misses
    }

    /// Hit rate over all lookups so far, 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        if lookups == 0 {
            0.0
        } else {
            state.hits as f64 / lookups as f64
        }
    }

    pub fn reset_stats(&self) {
        let mut state = self.state.lock();
        state.hits = 0;
        state.misses = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tlb() -> Tlb {
        Tlb::new(TlbConfig {
            tlb_size: 1024,
            associativity: 8,
        })
    }

    #[test]
    fn insert_and_lookup() {
        let tlb = small_tlb();
        tlb.insert(100, TlbEntry::new(100, None, 0x1_0000_0000));

        let entry = tlb.lookup(100).unwrap();
        assert_eq!(entry.vpn, 100);
        assert_eq!(entry.gpu_address, 0x1_0000_0000);
    }

    #[test]
    fn hit_and_miss_counters() {
        let tlb = small_tlb();
        for vpn in 0..10 {
            tlb.insert(vpn, TlbEntry::new(vpn, None, 0));
        }
        for vpn in 0..10 {
            assert!(tlb.lookup(vpn).is_some());
        }
        assert!(tlb.lookup(999).is_none());

        assert_eq!(tlb.hits(), 10);
        assert_eq!(tlb.misses(), 1);
        assert!((tlb.hit_rate() - 10.0 / 11.0).abs() < 1e-9);
    }

    #[test]
    fn reinsert_overwrites_in_place() {
        let tlb = small_tlb();
        tlb.insert(5, TlbEntry::new(5, None, 0x1_0000_0000));
        tlb.insert(5, TlbEntry::new(5, None, 0x1_0001_0000));

        let entry = tlb.lookup(5).unwrap();
        assert_eq!(entry.gpu_address, 0x1_0001_0000);
    }

    #[test]
    fn invalidate_removes_entry() {
        let tlb = small_tlb();
        tlb.insert(200, TlbEntry::new(200, None, 0));
        assert!(tlb.lookup(200).is_some());

        tlb.invalidate(200);
        tlb.reset_stats();
        assert!(tlb.lookup(200).is_none());
        assert_eq!(tlb.misses(), 1);
    }

    #[test]
    fn full_set_evicts_least_recently_used() {
        // One set: every VPN collides.
        let tlb = Tlb::new(TlbConfig {
            tlb_size: 2,
            associativity: 2,
        });
        tlb.insert(1, TlbEntry::new(1, None, 0));
        std::thread::sleep(std::time::Duration::from_millis(2));
        tlb.insert(2, TlbEntry::new(2, None, 0));
        std::thread::sleep(std::time::Duration::from_millis(2));

        // Touch 1 so 2 becomes the LRU entry.
        assert!(tlb.lookup(1).is_some());
        std::thread::sleep(std::time::Duration::from_millis(2));

        tlb.insert(3, TlbEntry::new(3, None, 0));
        assert!(tlb.lookup(1).is_some());
        assert!(tlb.lookup(2).is_none());
        assert!(tlb.lookup(3).is_some());
    }

    #[test]
    fn flush_clears_entries_but_not_counters() {
        let tlb = small_tlb();
        tlb.insert(1, TlbEntry::new(1, None, 0));
        assert!(tlb.lookup(1).is_some());

        tlb.flush();
        assert!(tlb.lookup(1).is_none());
        assert_eq!(tlb.hits(), 1);
        assert_eq!(tlb.misses(), 1);
    }
}
