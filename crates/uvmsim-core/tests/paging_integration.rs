//! Cross-component scenarios exercised through the public manager API.

use uvmsim_core::{ReplacementPolicyKind, VmConfig, VmManager};

const PAGE: usize = 64 * 1024;

fn simulator_config() -> VmConfig {
    VmConfig::default()
        .page_size(PAGE)
        .cpu_memory(64 * 1024 * 1024)
        .gpu_memory(16 * 1024 * 1024)
        .use_gpu_simulator(true)
}

#[test]
fn allocate_free_round_trip() {
    let vm = VmManager::with_config(simulator_config()).unwrap();

    let used_before = vm.cpu_pages_used();
    let vaddr = vm.allocate(4 * 1024 * 1024, false).unwrap();
    assert_eq!(vm.cpu_pages_used(), used_before + 64);

    vm.free(vaddr);
    assert_eq!(vm.cpu_pages_used(), used_before);
}

#[test]
fn write_read_integrity_8_mib() {
    let vm = VmManager::with_config(simulator_config()).unwrap();

    let bytes = 8 * 1024 * 1024;
    let vaddr = vm.allocate(bytes, false).unwrap();

    let pattern: Vec<u32> = (0..bytes as u32 / 4).map(|i| i ^ 0xDEAD_BEEF).collect();
    let raw: Vec<u8> = pattern.iter().flat_map(|v| v.to_le_bytes()).collect();
    vm.write_to_vaddr(vaddr, &raw);

    let mut readback = vec![0u8; bytes];
    vm.read_from_vaddr(vaddr, &mut readback);
    assert_eq!(readback, raw);

    vm.free(vaddr);
}

#[test]
fn zero_byte_allocation_claims_one_page() {
    let vm = VmManager::with_config(simulator_config()).unwrap();

    let vaddr = vm.allocate(0, false).unwrap();
    assert_eq!(vm.cpu_pages_used(), 1);

    // The next allocation starts one page later.
    let next = vm.allocate(PAGE, false).unwrap();
    assert_eq!(next, vaddr + PAGE as u64);
}

#[test]
fn oversubscribed_prefetch_is_host_complete_device_partial() {
    // 16 MiB of device memory = 256 pages; ask for 300 with prefetch.
    let vm = VmManager::with_config(simulator_config()).unwrap();

    let vaddr = vm.allocate(300 * PAGE, true).unwrap();
    let snap = vm.perf_snapshot();

    assert_eq!(vm.cpu_pages_used(), 300);
    assert_eq!(vm.gpu_pages_used(), 256);
    assert_eq!(snap.page_prefetches, 256);

    vm.free(vaddr);
}

#[test]
fn working_set_overflow_forces_evictions() {
    // 8 MiB device pool = 128 pages; a 512-page working set mapped through
    // it must evict at least the difference.
    let config = VmConfig::default()
        .page_size(PAGE)
        .cpu_memory(64 * 1024 * 1024)
        .gpu_memory(8 * 1024 * 1024)
        .use_gpu_simulator(true);
    let vm = VmManager::with_config(config).unwrap();

    let working_set = 512usize;
    let vaddr = vm.allocate(working_set * PAGE, true).unwrap();
    for i in 0..working_set as u64 {
        vm.prefetch_to_gpu(vaddr + i * PAGE as u64);
        vm.touch_page(vaddr + i * PAGE as u64, i % 2 == 0);
    }

    let snap = vm.perf_snapshot();
    assert!(snap.evictions >= (working_set - 128) as u64);
    assert!(vm.gpu_pages_used() <= 128);

    // Byte identity over every migration path, eviction write-back included.
    assert_eq!(
        snap.total_bytes_migrated,
        PAGE as u64 * (snap.cpu_to_gpu_migrations + snap.gpu_to_cpu_migrations)
    );

    vm.free(vaddr);
}

#[test]
fn overflow_with_clock_policy() {
    let config = VmConfig::default()
        .page_size(PAGE)
        .cpu_memory(32 * 1024 * 1024)
        .gpu_memory(4 * 1024 * 1024)
        .use_gpu_simulator(true)
        .replacement_policy(ReplacementPolicyKind::Clock);
    let vm = VmManager::with_config(config).unwrap();

    let working_set = 256usize; // device pool holds 64
    let vaddr = vm.allocate(working_set * PAGE, false).unwrap();
    for i in 0..working_set as u64 {
        vm.map_to_gpu(vaddr + i * PAGE as u64);
    }

    let snap = vm.perf_snapshot();
    assert!(snap.evictions >= (working_set - 64) as u64);
    assert!(vm.gpu_pages_used() <= 64);

    vm.free(vaddr);
}

#[test]
fn data_survives_device_round_trips_and_eviction() {
    let config = VmConfig::default()
        .page_size(PAGE)
        .cpu_memory(32 * 1024 * 1024)
        .gpu_memory(2 * 1024 * 1024) // 32 device pages
        .use_gpu_simulator(true);
    let vm = VmManager::with_config(config).unwrap();

    let pages = 64usize;
    let vaddr = vm.allocate(pages * PAGE, false).unwrap();

    // Distinct byte per page.
    for i in 0..pages {
        let data = vec![(i + 1) as u8; PAGE];
        vm.write_to_vaddr(vaddr + (i * PAGE) as u64, &data);
    }

    // Sweep everything through the device tier twice; clean evictions must
    // never disturb the host copies.
    for _ in 0..2 {
        for i in 0..pages {
            vm.map_to_gpu(vaddr + (i * PAGE) as u64);
        }
    }

    for i in 0..pages {
        let mut readback = vec![0u8; PAGE];
        vm.read_from_vaddr(vaddr + (i * PAGE) as u64, &mut readback);
        assert!(
            readback.iter().all(|&b| b == (i + 1) as u8),
            "page {i} corrupted"
        );
    }

    vm.free(vaddr);
}

#[test]
fn freeing_everything_clears_both_pools() {
    let vm = VmManager::with_config(simulator_config()).unwrap();
    let total_gpu = vm.gpu_pages_available();

    let a = vm.allocate(10 * PAGE, true).unwrap();
    let b = vm.allocate(5 * PAGE, false).unwrap();
    let c = vm.allocate(7 * PAGE, true).unwrap();
    vm.map_to_gpu(b);
    vm.touch_page(a, true);

    vm.free(b);
    vm.free(a);
    vm.free(c);

    assert_eq!(vm.cpu_pages_used(), 0);
    assert_eq!(vm.gpu_pages_used(), 0);
    assert_eq!(vm.gpu_pages_available(), total_gpu);
}

#[test]
fn free_with_multiple_live_allocations_releases_exact_ranges() {
    let vm = VmManager::with_config(simulator_config()).unwrap();

    let a = vm.allocate(3 * PAGE, false).unwrap();
    let b = vm.allocate(4 * PAGE, false).unwrap();
    assert_eq!(vm.cpu_pages_used(), 7);

    // Freeing the first allocation must not touch the second.
    vm.free(a);
    assert_eq!(vm.cpu_pages_used(), 4);

    let marker = [0xABu8; 16];
    vm.write_to_vaddr(b, &marker);
    let mut readback = [0u8; 16];
    vm.read_from_vaddr(b, &mut readback);
    assert_eq!(readback, marker);

    vm.free(b);
    assert_eq!(vm.cpu_pages_used(), 0);
}

#[test]
fn touch_twice_counts_one_fault_and_two_accesses() {
    let vm = VmManager::with_config(simulator_config()).unwrap();
    let vaddr = vm.allocate(PAGE, false).unwrap();
    vm.free(vaddr);

    vm.reset_counters();
    vm.touch_page(vaddr, false);
    vm.touch_page(vaddr, false);

    assert_eq!(vm.perf_snapshot().total_page_faults, 1);
}

#[test]
fn map_to_gpu_is_idempotent() {
    let vm = VmManager::with_config(simulator_config()).unwrap();
    let vaddr = vm.allocate(PAGE, false).unwrap();

    vm.map_to_gpu(vaddr);
    let first = vm.perf_snapshot().total_migrations();
    vm.map_to_gpu(vaddr);
    let second = vm.perf_snapshot().total_migrations();

    assert_eq!(first, second);
    vm.free(vaddr);
}

#[test]
fn randomized_access_storm_preserves_pool_accounting() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let config = VmConfig::default()
        .page_size(PAGE)
        .cpu_memory(32 * 1024 * 1024)
        .gpu_memory(4 * 1024 * 1024)
        .use_gpu_simulator(true);
    let vm = VmManager::with_config(config).unwrap();
    let total_gpu = vm.gpu_pages_available();

    let pages = 128usize;
    let vaddr = vm.allocate(pages * PAGE, false).unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..2000 {
        let addr = vaddr + (rng.gen_range(0..pages) * PAGE) as u64;
        match rng.gen_range(0..4) {
            0 => vm.touch_page(addr, rng.gen_bool(0.5)),
            1 => vm.map_to_gpu(addr),
            2 => vm.map_to_cpu(addr, false),
            _ => {
                let mut buf = [0u8; 32];
                vm.read_from_vaddr(addr, &mut buf);
            }
        }
    }

    // Residency mirror and bitmap must agree at all times.
    assert_eq!(vm.gpu_pages_used(), total_gpu - vm.gpu_pages_available());
    assert!(vm.gpu_pages_used() <= 64);
    assert_eq!(vm.cpu_pages_used(), pages);

    vm.free(vaddr);
    assert_eq!(vm.gpu_pages_available(), total_gpu);
    assert_eq!(vm.cpu_pages_used(), 0);
}

#[test]
fn lifecycle_shutdown_and_reinitialize() {
    let vm = VmManager::with_config(simulator_config()).unwrap();
    vm.allocate(4 * PAGE, true).unwrap();

    vm.shutdown();
    assert!(!vm.is_initialized());

    vm.initialize(simulator_config()).unwrap();
    let vaddr = vm.allocate(PAGE, false).unwrap();
    assert_eq!(vaddr, 0);
    assert_eq!(vm.cpu_pages_used(), 1);
}
