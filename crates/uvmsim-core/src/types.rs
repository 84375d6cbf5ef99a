//! Address arithmetic and shared scalar types
//!
//! Virtual addresses are plain 64-bit integers handed out by the manager;
//! they index a synthetic address space and are never dereferenced directly.

use std::time::{SystemTime, UNIX_EPOCH};

/// Virtual page number: `vaddr / page_size`.
pub type Vpn = u64;

/// Virtual address within the simulated address space.
pub type Address = u64;

/// Base of the synthetic accelerator address range. Device page addresses
/// are `GPU_ADDRESS_BASE + index * page_size`; address 0 is the "absent"
/// sentinel.
pub const GPU_ADDRESS_BASE: u64 = 0x1_0000_0000;

/// Which tier(s) currently hold a valid copy of a page's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageResidency {
    /// No entry, or an entry holding no physical page on either tier.
    Unallocated,
    /// Host copy only.
    HostOnly,
    /// Accelerator copy only.
    DeviceOnly,
    /// Synchronized (or host-dirty) replicas on both tiers.
    Both,
}

impl std::fmt::Display for PageResidency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageResidency::Unallocated => write!(f, "Unallocated"),
            PageResidency::HostOnly => write!(f, "HostOnly"),
            PageResidency::DeviceOnly => write!(f, "DeviceOnly"),
            PageResidency::Both => write!(f, "Both"),
        }
    }
}

/// Compute the virtual page number containing `vaddr`.
#[inline]
pub fn vaddr_to_vpn(vaddr: Address, page_size: usize) -> Vpn {
    vaddr / page_size as u64
}

/// Compute the first virtual address of `vpn`.
#[inline]
pub fn vpn_to_vaddr(vpn: Vpn, page_size: usize) -> Address {
    vpn * page_size as u64
}

/// Round `bytes` up to a whole number of pages, in bytes.
#[inline]
pub fn align_to_page(bytes: usize, page_size: usize) -> usize {
    bytes.div_ceil(page_size) * page_size
}

/// Wall-clock microseconds since the Unix epoch.
#[inline]
pub fn timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// 32-bit FNV-1a over the 8 little-endian bytes of a VPN.
///
/// This is the TLB set index function; changing it reshuffles every set.
#[inline]
pub fn hash_vpn(vpn: Vpn) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in vpn.to_le_bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpn_round_trip() {
        let page_size = 64 * 1024;
        assert_eq!(vaddr_to_vpn(0, page_size), 0);
        assert_eq!(vaddr_to_vpn(page_size as u64 - 1, page_size), 0);
        assert_eq!(vaddr_to_vpn(page_size as u64, page_size), 1);
        assert_eq!(vpn_to_vaddr(7, page_size), 7 * page_size as u64);
    }

    #[test]
    fn page_alignment() {
        let page_size = 64 * 1024;
        assert_eq!(align_to_page(0, page_size), 0);
        assert_eq!(align_to_page(1, page_size), page_size);
        assert_eq!(align_to_page(page_size, page_size), page_size);
        assert_eq!(align_to_page(page_size + 1, page_size), 2 * page_size);
    }

    #[test]
    fn fnv_hash_is_stable() {
        // Pinned values: the set index function must not drift.
        assert_eq!(hash_vpn(0), hash_vpn(0));
        assert_ne!(hash_vpn(1), hash_vpn(2));
        // FNV-1a of eight zero bytes.
        let mut expected: u32 = 2_166_136_261;
        for _ in 0..8 {
            expected = expected.wrapping_mul(16_777_619);
        }
        assert_eq!(hash_vpn(0), expected);
    }

    #[test]
    fn timestamps_are_monotonic_enough() {
        let a = timestamp_us();
        let b = timestamp_us();
        assert!(b >= a);
    }
}
